//! The run state machine.
//!
//! Fetch both sides per kind, diff, gate on confirmation, apply in plan
//! order, then verify. Every transition goes through the run handle so
//! observers see the report evolve.

use super::{
    ApplyExecutor, Execution, RunError, RunHandle, RunRequest, RunSettings, Touched,
    VerificationProbe,
};
use crate::adapters::{now_millis, with_timeout, AdapterError, StateSink, StateSource};
use crate::journal::Journal;
use converge_engine::{
    Catalog, DiffEngine, EntitySchema, Error, FailureKind, Operation, Origin, Outcome, Plan,
    ReconciliationReport, RunState, Snapshot,
};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};

/// How the apply phase ended.
#[derive(Debug, PartialEq)]
enum ApplyEnd {
    Completed,
    Halted(String),
    Cancelled,
}

pub struct Reconciler<'a> {
    catalog: &'a Catalog,
    desired: &'a dyn StateSource,
    actual: &'a dyn StateSink,
    settings: &'a RunSettings,
    handle: &'a RunHandle,
    journal: Option<&'a Journal>,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        catalog: &'a Catalog,
        desired: &'a dyn StateSource,
        actual: &'a dyn StateSink,
        settings: &'a RunSettings,
        handle: &'a RunHandle,
    ) -> Self {
        Self {
            catalog,
            desired,
            actual,
            settings,
            handle,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: &'a Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Execute the run and return its final report.
    ///
    /// Fetch failures and ambiguous snapshots are returned as errors (the
    /// handle still holds a failed report); every other failure is recorded
    /// in the returned report.
    pub async fn run(&self, request: &RunRequest) -> Result<ReconciliationReport, RunError> {
        let run_id = self.handle.id();
        tracing::info!(
            %run_id,
            kinds = ?request.entity_kinds,
            desired = %self.desired.name(),
            actual = %self.actual.name(),
            destructive = request.destructive,
            dry_run = request.dry_run,
            "run started"
        );

        let result = self.drive(request).await;

        self.handle.update(|report| report.finish(now_millis()));
        let report = self.handle.report();
        if let Some(journal) = self.journal {
            if let Err(err) = journal.finish(&report).await {
                tracing::warn!(%run_id, error = %err, "failed to write final report to journal");
            }
        }

        let counts = report.counts();
        tracing::info!(
            %run_id,
            state = %report.state,
            disposition = ?report.disposition(),
            applied = counts.applied,
            verified = counts.verified,
            failed = counts.failed,
            mismatched = counts.verification_mismatch,
            elapsed_ms = report.elapsed_ms,
            "run finished"
        );

        result.map(|()| report)
    }

    async fn drive(&self, request: &RunRequest) -> Result<(), RunError> {
        if let Err(err) = request.validate(self.catalog) {
            self.fail(FailureKind::InvalidRequest, err.to_string());
            return Ok(());
        }
        let kinds = self.catalog.order(&request.entity_kinds)?;

        self.enter(RunState::Fetching)?;
        let mut snapshots = Vec::with_capacity(kinds.len());
        for kind in &kinds {
            let schema = self.catalog.get(kind)?;
            let desired = self.fetch(self.desired, schema, request, Origin::Desired).await?;
            let actual = self
                .fetch(self.actual.as_source(), schema, request, Origin::Actual)
                .await?;
            snapshots.push((schema, desired, actual));
        }

        self.enter(RunState::Diffing)?;
        let plan = self.plan(request, &snapshots)?;
        drop(snapshots);

        let fingerprint = plan.fingerprint();
        let counts = plan.counts();
        self.handle.update(|report| {
            report.kinds = kinds.clone();
            report.fingerprint = Some(fingerprint.clone());
            report.planned = counts;
            report.blast_radius = plan.blast_radius();
            report.orphans = plan.orphans().to_vec();
        });
        tracing::info!(
            run_id = %self.handle.id(),
            %fingerprint,
            creates = counts.creates,
            updates = counts.updates,
            deletes = counts.deletes,
            noops = counts.noops,
            orphans = plan.orphans().len(),
            blast_radius = plan.blast_radius(),
            "plan assembled"
        );

        if request.dry_run {
            self.handle.update(|report| {
                for op in plan.operations() {
                    let outcome = if op.is_mutation() {
                        Outcome::Planned
                    } else {
                        Outcome::SkippedNoop
                    };
                    report.record(op.clone(), outcome, 0);
                }
            });
            return self.enter(RunState::Done);
        }

        if plan.requires_confirmation(request.blast_radius_threshold) {
            self.enter(RunState::AwaitingConfirmation)?;
            if !self.await_confirmation(request, &fingerprint).await {
                if self.handle.is_cancelled() {
                    self.fail(FailureKind::Cancelled, "cancelled while awaiting confirmation");
                } else {
                    let message = format!(
                        "plan {fingerprint} deletes {} record(s) and touches {:.1}% of {} existing; \
                         confirm with its fingerprint",
                        counts.deletes,
                        plan.blast_radius() * 100.0,
                        plan.actual_count()
                    );
                    self.fail(FailureKind::UnconfirmedDestructivePlan, message);
                }
                return Ok(());
            }
        }

        self.enter(RunState::Applying)?;
        match self.apply(plan.into_operations(), request).await {
            ApplyEnd::Completed => {}
            ApplyEnd::Halted(reason) => {
                self.fail(FailureKind::ApplyHalted, reason);
                return Ok(());
            }
            ApplyEnd::Cancelled => {
                self.fail(FailureKind::Cancelled, "cancelled between operations");
                return Ok(());
            }
        }

        self.enter(RunState::Verifying)?;
        self.verify().await;
        self.enter(RunState::Done)
    }

    /// Fetch one side of one kind, retrying transient failures.
    async fn fetch(
        &self,
        source: &dyn StateSource,
        schema: &EntitySchema,
        request: &RunRequest,
        origin: Origin,
    ) -> Result<Snapshot, RunError> {
        let filter = request.filter_for(&schema.kind);
        let policy = self.settings.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = with_timeout(
                self.settings.call_timeout,
                source.fetch(schema, &filter, origin),
            )
            .await;

            match result {
                Ok(snapshot) => {
                    if let Err(err) = conforms(schema, &snapshot) {
                        return Err(self.fetch_failed(schema, source, err));
                    }
                    tracing::debug!(
                        run_id = %self.handle.id(),
                        kind = %schema.kind,
                        origin = %source.name(),
                        records = snapshot.len(),
                        "snapshot captured"
                    );
                    return Ok(snapshot);
                }
                Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy
                        .backoff(attempt)
                        .max(err.retry_after().unwrap_or_default());
                    tracing::warn!(
                        run_id = %self.handle.id(),
                        kind = %schema.kind,
                        origin = %source.name(),
                        attempt,
                        error = %err,
                        "transient fetch failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(self.fetch_failed(schema, source, err)),
            }
        }
    }

    fn fetch_failed(
        &self,
        schema: &EntitySchema,
        source: &dyn StateSource,
        err: AdapterError,
    ) -> RunError {
        let err = RunError::FetchFailure {
            kind: schema.kind.clone(),
            origin: source.name().to_string(),
            source: err,
        };
        self.fail(FailureKind::FetchFailure, err.to_string());
        err
    }

    fn plan(
        &self,
        request: &RunRequest,
        snapshots: &[(&EntitySchema, Snapshot, Snapshot)],
    ) -> Result<Plan, RunError> {
        let engine = DiffEngine::new(request.destructive);
        let mut diffs = Vec::with_capacity(snapshots.len());

        for (schema, desired, actual) in snapshots {
            match engine.diff(schema, desired, actual) {
                Ok(diff) => diffs.push(diff),
                Err(Error::AmbiguousSource { kind, identity }) => {
                    let err = RunError::AmbiguousSource { kind, identity };
                    self.fail(FailureKind::AmbiguousSource, err.to_string());
                    return Err(err);
                }
                Err(other) => {
                    let err = RunError::FetchFailure {
                        kind: schema.kind.clone(),
                        origin: self.actual.name().to_string(),
                        source: AdapterError::Malformed(other.to_string()),
                    };
                    self.fail(FailureKind::FetchFailure, err.to_string());
                    return Err(err);
                }
            }
        }

        Ok(Plan::assemble(self.catalog, diffs)?)
    }

    /// Wait for the plan's fingerprint, either up front or through the handle.
    async fn await_confirmation(&self, request: &RunRequest, fingerprint: &str) -> bool {
        if request.confirmation_token.as_deref() == Some(fingerprint) {
            return true;
        }
        if let Some(token) = &request.confirmation_token {
            tracing::warn!(
                run_id = %self.handle.id(),
                %token,
                %fingerprint,
                "confirmation token does not match plan"
            );
        }

        let mut confirmations = self.handle.watch_confirmation();
        if confirmations.borrow_and_update().as_deref() == Some(fingerprint) {
            return true;
        }
        if self.settings.confirmation_timeout.is_zero() {
            return false;
        }

        tracing::info!(
            run_id = %self.handle.id(),
            %fingerprint,
            timeout = ?self.settings.confirmation_timeout,
            "awaiting confirmation"
        );
        let cancel = self.handle.cancellation();
        let wait = async {
            while confirmations.changed().await.is_ok() {
                if confirmations.borrow_and_update().as_deref() == Some(fingerprint) {
                    return true;
                }
            }
            false
        };

        tokio::select! {
            confirmed = tokio::time::timeout(self.settings.confirmation_timeout, wait) => {
                confirmed.unwrap_or(false)
            }
            _ = cancel.cancelled() => false,
        }
    }

    async fn apply(&self, operations: Vec<Operation>, request: &RunRequest) -> ApplyEnd {
        let executor = ApplyExecutor::new(self.settings.retry, self.settings.call_timeout);
        let workers = request.parallel_creates.unwrap_or(1);
        let mut rest = operations.as_slice();

        while let Some(op) = rest.first() {
            if self.handle.is_cancelled() {
                return ApplyEnd::Cancelled;
            }

            let schema = match self.catalog.get(op.kind()) {
                Ok(schema) => schema,
                Err(err) => return ApplyEnd::Halted(err.to_string()),
            };

            let batch_len = if workers > 1 && op.is_create() && self.actual.independent_creates(schema)
            {
                rest.iter()
                    .take_while(|o| o.is_create() && o.kind() == op.kind())
                    .count()
            } else {
                1
            };
            let (batch, tail) = rest.split_at(batch_len);
            rest = tail;

            let failure = if batch.len() > 1 {
                self.apply_concurrently(&executor, schema, batch, workers, request)
                    .await
            } else {
                let execution = executor.execute(self.actual, schema, op).await;
                self.record(op, execution).await
            };

            if let Some(reason) = failure {
                if !request.continue_on_error {
                    return ApplyEnd::Halted(reason);
                }
            }
        }

        ApplyEnd::Completed
    }

    /// Apply independent creates with bounded concurrency. After a failure
    /// (without `continue_on_error`) or cancellation no new creates start;
    /// the ones in flight finish and are recorded.
    async fn apply_concurrently(
        &self,
        executor: &ApplyExecutor,
        schema: &EntitySchema,
        batch: &[Operation],
        workers: usize,
        request: &RunRequest,
    ) -> Option<String> {
        let sink = self.actual;
        let mut pending = batch.iter();
        let mut inflight: FuturesUnordered<BoxFuture<'_, (&Operation, Execution)>> =
            FuturesUnordered::new();
        let mut stopped = false;
        let mut first_failure = None;

        loop {
            while inflight.len() < workers && !stopped && !self.handle.is_cancelled() {
                let Some(op) = pending.next() else { break };
                inflight.push(
                    async move { (op, executor.execute(sink, schema, op).await) }.boxed(),
                );
            }

            let Some((op, execution)) = inflight.next().await else {
                break;
            };
            if let Some(reason) = self.record(op, execution).await {
                if !request.continue_on_error {
                    stopped = true;
                }
                first_failure.get_or_insert(reason);
            }
        }

        first_failure
    }

    /// Append an execution to the report; returns a failure description.
    async fn record(&self, op: &Operation, execution: Execution) -> Option<String> {
        let Execution { result, attempts } = execution;
        let (outcome, failure) = match (&result, op) {
            (_, Operation::NoOp(_)) => (Outcome::SkippedNoop, None),
            (Ok(()), _) => (Outcome::Applied, None),
            (Err(err), _) => (
                Outcome::Failed {
                    reason: err.to_string(),
                    transient: err.is_transient(),
                },
                Some(format!(
                    "{} of {} {} failed after {attempts} attempt(s): {err}",
                    op.name(),
                    op.kind(),
                    op.identity()
                )),
            ),
        };

        let (seq, entry) = self.handle.update(|report| {
            let seq = report.record(op.clone(), outcome, attempts);
            (seq, report.entries[seq].clone())
        });

        if let Some(journal) = self.journal {
            if let Err(err) = journal.entry(seq, &entry).await {
                tracing::warn!(run_id = %self.handle.id(), error = %err, "journal write failed");
            }
        }

        match &failure {
            Some(reason) => tracing::warn!(
                run_id = %self.handle.id(),
                op = op.name(),
                kind = %op.kind(),
                identity = %op.identity(),
                attempts,
                %reason,
                "operation failed"
            ),
            None if op.is_mutation() => tracing::debug!(
                run_id = %self.handle.id(),
                op = op.name(),
                kind = %op.kind(),
                identity = %op.identity(),
                attempts,
                "operation applied"
            ),
            None => {}
        }

        failure
    }

    async fn verify(&self) {
        let report = self.handle.report();
        let touched: Vec<Touched<'_>> = report
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.outcome == Outcome::Applied)
            .map(|(index, entry)| Touched {
                index,
                operation: &entry.operation,
            })
            .collect();
        if touched.is_empty() {
            return;
        }

        let probe = VerificationProbe::new(self.settings.verify_batch_size, self.settings.call_timeout);
        let outcomes = probe.verify(self.catalog, self.actual, &touched).await;

        let mismatched = outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, Outcome::VerificationMismatch { .. }))
            .count();
        if mismatched > 0 {
            tracing::warn!(run_id = %self.handle.id(), mismatched, "verification found mismatches");
        }

        self.handle.update(|report| {
            for (index, outcome) in outcomes {
                report.set_outcome(index, outcome);
            }
        });
    }

    fn enter(&self, next: RunState) -> Result<(), RunError> {
        tracing::debug!(run_id = %self.handle.id(), from = %self.handle.state(), to = %next, "transition");
        Ok(self.handle.transition(next)?)
    }

    fn fail(&self, kind: FailureKind, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(run_id = %self.handle.id(), ?kind, %message, "run failed");
        self.handle.update(|report| report.fail(kind, message));
    }
}

/// Every record of a fetched snapshot must satisfy its schema.
fn conforms(schema: &EntitySchema, snapshot: &Snapshot) -> Result<(), AdapterError> {
    for record in snapshot.records() {
        schema.validate(record).map_err(|err| {
            AdapterError::Malformed(format!("{} {}: {err}", schema.kind, record.identity))
        })?;
    }
    Ok(())
}
