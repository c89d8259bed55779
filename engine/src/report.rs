//! Reconciliation reports.
//!
//! The report is the only artifact a run leaves behind. Entries are appended
//! as operations are attempted, so a report captured mid-run is an accurate
//! record of everything applied so far.

use crate::{
    error::Result, EntityKind, Error, Operation, Orphan, PlanCounts, RunState, Timestamp,
};
use serde::{Deserialize, Serialize};

/// What happened to one planned operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Outcome {
    /// Applied successfully, not yet verified
    Applied,
    /// Nothing to do
    SkippedNoop,
    /// Dry run: would have been applied
    Planned,
    /// Apply failed after all permitted attempts
    Failed { reason: String, transient: bool },
    /// Applied and confirmed by re-reading actual state
    Verified,
    /// Applied, but actual state does not match desired state
    VerificationMismatch { detail: String },
}

impl Outcome {
    /// Whether target state was (most likely) changed.
    pub fn changed_target(&self) -> bool {
        matches!(
            self,
            Outcome::Applied | Outcome::Verified | Outcome::VerificationMismatch { .. }
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

/// One operation and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEntry {
    pub operation: Operation,
    pub outcome: Outcome,
    /// Sink calls made; zero for no-ops and dry runs
    pub attempts: u32,
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    FetchFailure,
    AmbiguousSource,
    UnconfirmedDestructivePlan,
    ApplyHalted,
    Cancelled,
    InvalidRequest,
}

/// Failure details attached to a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Whether it is safe to simply re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Disposition {
    /// No target state was changed; re-running is safe
    NothingChanged,
    /// Every attempted operation succeeded and the run finished
    Completed,
    /// Some changes were applied, then the run stopped or had failures
    PartiallyApplied,
}

/// Outcome tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeCounts {
    pub applied: usize,
    pub skipped_noop: usize,
    pub planned: usize,
    pub failed: usize,
    pub verified: usize,
    pub verification_mismatch: usize,
}

/// Accumulated outcome of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub run_id: String,
    pub kinds: Vec<EntityKind>,
    pub desired_origin: String,
    pub actual_origin: String,
    pub started_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    pub elapsed_ms: u64,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    /// Fingerprint of the plan, once diffing has completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Operation counts of the full plan
    pub planned: PlanCounts,
    pub blast_radius: f64,
    pub entries: Vec<ReportEntry>,
    pub orphans: Vec<Orphan>,
}

impl ReconciliationReport {
    /// Create an empty report for a run that is about to start.
    pub fn new(
        run_id: impl Into<String>,
        kinds: Vec<EntityKind>,
        desired_origin: impl Into<String>,
        actual_origin: impl Into<String>,
        started_at: Timestamp,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            kinds,
            desired_origin: desired_origin.into(),
            actual_origin: actual_origin.into(),
            started_at,
            finished_at: None,
            elapsed_ms: 0,
            state: RunState::Idle,
            failure: None,
            fingerprint: None,
            planned: PlanCounts::default(),
            blast_radius: 0.0,
            entries: Vec::new(),
            orphans: Vec::new(),
        }
    }

    /// Append an outcome; returns the entry index.
    pub fn record(&mut self, operation: Operation, outcome: Outcome, attempts: u32) -> usize {
        self.entries.push(ReportEntry {
            operation,
            outcome,
            attempts,
        });
        self.entries.len() - 1
    }

    /// Replace the outcome of an existing entry (used by verification).
    pub fn set_outcome(&mut self, index: usize, outcome: Outcome) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.outcome = outcome;
        }
    }

    /// Mark the run as failed.
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) {
        self.state = RunState::Failed;
        self.failure = Some(RunFailure {
            kind,
            message: message.into(),
        });
    }

    /// Stamp the end of the run.
    pub fn finish(&mut self, finished_at: Timestamp) {
        self.finished_at = Some(finished_at);
        self.elapsed_ms = finished_at.saturating_sub(self.started_at);
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for entry in &self.entries {
            match entry.outcome {
                Outcome::Applied => counts.applied += 1,
                Outcome::SkippedNoop => counts.skipped_noop += 1,
                Outcome::Planned => counts.planned += 1,
                Outcome::Failed { .. } => counts.failed += 1,
                Outcome::Verified => counts.verified += 1,
                Outcome::VerificationMismatch { .. } => counts.verification_mismatch += 1,
            }
        }
        counts
    }

    /// Whether any operation changed target state.
    pub fn changes_applied(&self) -> bool {
        self.entries.iter().any(|e| e.outcome.changed_target())
    }

    /// Whether every entry is a no-op or verified change.
    pub fn is_converged(&self) -> bool {
        self.state == RunState::Done
            && self
                .entries
                .iter()
                .all(|e| matches!(e.outcome, Outcome::SkippedNoop | Outcome::Verified))
    }

    pub fn disposition(&self) -> Disposition {
        if !self.changes_applied() {
            Disposition::NothingChanged
        } else if self.state == RunState::Done && !self.entries.iter().any(|e| e.outcome.is_failed())
        {
            Disposition::Completed
        } else {
            Disposition::PartiallyApplied
        }
    }

    /// Render as JSON lines: a run header, one line per entry, one per orphan.
    pub fn to_json_lines(&self) -> Result<String> {
        let mut out = String::new();
        push_line(&mut out, &self.header_line())?;
        for (seq, entry) in self.entries.iter().enumerate() {
            push_line(&mut out, &ReportLine::entry(seq, entry))?;
        }
        for orphan in &self.orphans {
            push_line(
                &mut out,
                &ReportLine::Orphan {
                    kind: &orphan.kind,
                    identity: orphan.identity.as_str(),
                },
            )?;
        }
        Ok(out)
    }

    fn header_line(&self) -> ReportLine<'_> {
        ReportLine::Run {
            run_id: &self.run_id,
            kinds: &self.kinds,
            desired_origin: &self.desired_origin,
            actual_origin: &self.actual_origin,
            state: self.state,
            disposition: self.disposition(),
            failure: self.failure.as_ref(),
            fingerprint: self.fingerprint.as_deref(),
            elapsed_ms: self.elapsed_ms,
            counts: self.counts(),
        }
    }
}

/// One JSON line of the audit rendering.
#[derive(Serialize)]
#[serde(tag = "line", rename_all = "camelCase")]
pub enum ReportLine<'a> {
    #[serde(rename_all = "camelCase")]
    Run {
        run_id: &'a str,
        kinds: &'a [EntityKind],
        desired_origin: &'a str,
        actual_origin: &'a str,
        state: RunState,
        disposition: Disposition,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure: Option<&'a RunFailure>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fingerprint: Option<&'a str>,
        elapsed_ms: u64,
        counts: OutcomeCounts,
    },
    #[serde(rename_all = "camelCase")]
    Entry {
        seq: usize,
        op: &'static str,
        kind: &'a str,
        identity: &'a str,
        outcome: &'a Outcome,
        attempts: u32,
        operation: &'a Operation,
    },
    Orphan {
        kind: &'a str,
        identity: &'a str,
    },
}

impl<'a> ReportLine<'a> {
    /// The line for a single entry.
    pub fn entry(seq: usize, entry: &'a ReportEntry) -> Self {
        ReportLine::Entry {
            seq,
            op: entry.operation.name(),
            kind: entry.operation.kind(),
            identity: entry.operation.identity().as_str(),
            outcome: &entry.outcome,
            attempts: entry.attempts,
            operation: &entry.operation,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

fn push_line(out: &mut String, line: &ReportLine<'_>) -> Result<()> {
    out.push_str(&line.to_json()?);
    out.push('\n');
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CreateOp, DeleteOp, Identity, NoOp, Record};
    use serde_json::json;

    fn create(id: i64) -> Operation {
        Operation::Create(CreateOp::new(
            Record::from_value("user", "id", json!({"id": id})).unwrap(),
        ))
    }

    fn report() -> ReconciliationReport {
        ReconciliationReport::new("run-1", vec!["user".into()], "dev", "prod", 1000)
    }

    #[test]
    fn nothing_changed_when_only_noops() {
        let mut report = report();
        report.record(
            Operation::NoOp(NoOp::new("user", Identity::from("1"))),
            Outcome::SkippedNoop,
            0,
        );
        report.state = RunState::Done;

        assert_eq!(report.disposition(), Disposition::NothingChanged);
        assert!(report.is_converged());
    }

    #[test]
    fn partial_when_halted_after_changes() {
        let mut report = report();
        report.record(create(1), Outcome::Applied, 1);
        report.record(
            Operation::Delete(DeleteOp::new("user", Identity::from("9"))),
            Outcome::Failed {
                reason: "constraint".into(),
                transient: false,
            },
            1,
        );
        report.fail(FailureKind::ApplyHalted, "delete failed");

        assert_eq!(report.disposition(), Disposition::PartiallyApplied);
        assert!(!report.is_converged());
        assert_eq!(report.counts().failed, 1);
    }

    #[test]
    fn completed_after_verification() {
        let mut report = report();
        let index = report.record(create(1), Outcome::Applied, 2);
        report.set_outcome(index, Outcome::Verified);
        report.state = RunState::Done;

        assert_eq!(report.disposition(), Disposition::Completed);
        assert_eq!(report.counts().verified, 1);
        assert_eq!(report.entries[0].attempts, 2);
    }

    #[test]
    fn finish_computes_elapsed() {
        let mut report = report();
        report.finish(1750);
        assert_eq!(report.finished_at, Some(1750));
        assert_eq!(report.elapsed_ms, 750);
    }

    #[test]
    fn json_lines_one_line_per_outcome() {
        let mut report = report();
        report.record(create(1), Outcome::Applied, 1);
        report.record(create(2), Outcome::Applied, 1);
        report.orphans.push(Orphan {
            kind: "user".into(),
            identity: Identity::from("3"),
        });

        let text = report.to_json_lines().unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("\"line\":\"run\""));
        assert!(lines[1].contains("\"seq\":0"));
        assert!(lines[1].contains("\"status\":\"applied\""));
        assert!(lines[3].contains("\"line\":\"orphan\""));

        for line in lines {
            let _: serde_json::Value = serde_json::from_str(line).unwrap();
        }
    }

    #[test]
    fn report_serialization_roundtrip() {
        let mut report = report();
        report.record(create(1), Outcome::Planned, 0);
        report.fingerprint = Some("abcd".into());

        let json = serde_json::to_string(&report).unwrap();
        let parsed: ReconciliationReport = serde_json::from_str(&json).unwrap();
        assert_eq!(report, parsed);
    }
}
