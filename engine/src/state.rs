//! Run lifecycle states.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};

/// State of one reconciliation run.
///
/// ```text
/// Idle -> Fetching -> Diffing -> [AwaitingConfirmation] -> Applying -> Verifying -> Done
///                        \-> Done (dry run)
/// any non-terminal state -> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunState {
    Idle,
    Fetching,
    Diffing,
    AwaitingConfirmation,
    Applying,
    Verifying,
    Done,
    Failed,
}

impl RunState {
    /// `Done` and `Failed` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    /// Check whether a transition is allowed.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, Fetching)
            | (Fetching, Diffing)
            | (Diffing, AwaitingConfirmation)
            | (Diffing, Applying)
            | (Diffing, Done)
            | (AwaitingConfirmation, Applying)
            | (Applying, Verifying)
            | (Verifying, Done) => true,
            _ => false,
        }
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Fetching => "fetching",
            RunState::Diffing => "diffing",
            RunState::AwaitingConfirmation => "awaitingConfirmation",
            RunState::Applying => "applying",
            RunState::Verifying => "verifying",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}
