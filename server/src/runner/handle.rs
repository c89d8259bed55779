//! Shared view of a run in progress.

use converge_engine::{ReconciliationReport, RunState, Timestamp};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handle through which callers observe and steer a running reconciliation.
///
/// The reconciler writes into the report as it goes; readers take clones.
pub struct RunHandle {
    id: Uuid,
    report: Mutex<ReconciliationReport>,
    state: watch::Sender<RunState>,
    confirmation: watch::Sender<Option<String>>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub fn new(id: Uuid, report: ReconciliationReport) -> Arc<Self> {
        let (state, _) = watch::channel(report.state);
        let (confirmation, _) = watch::channel(None);
        Arc::new(Self {
            id,
            report: Mutex::new(report),
            state,
            confirmation,
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Copy of the report as it stands.
    pub fn report(&self) -> ReconciliationReport {
        self.lock().clone()
    }

    /// When the run finished, if it has.
    pub fn finished_at(&self) -> Option<Timestamp> {
        self.lock().finished_at
    }

    /// Mutate the report in place.
    pub fn update<R>(&self, f: impl FnOnce(&mut ReconciliationReport) -> R) -> R {
        let mut report = self.lock();
        let result = f(&mut report);
        self.state.send_replace(report.state);
        result
    }

    /// Move the run to `next`.
    pub fn transition(&self, next: RunState) -> converge_engine::error::Result<()> {
        self.update(|report| report.state.transition(next))
    }

    /// Supply the confirmation token for a plan awaiting confirmation.
    pub fn confirm(&self, token: impl Into<String>) {
        self.confirmation.send_replace(Some(token.into()));
    }

    pub fn watch_confirmation(&self) -> watch::Receiver<Option<String>> {
        self.confirmation.subscribe()
    }

    /// Request cancellation; honored between operations.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ReconciliationReport> {
        self.report.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
