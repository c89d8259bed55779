//! In-process registry of runs, keyed by run id.
//!
//! Active runs are always kept. Finished runs stay inspectable until more
//! than the retention limit have accumulated; the longest-finished go first.

use crate::runner::RunHandle;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Finished runs kept when no limit is configured.
pub const DEFAULT_RETAINED_RUNS: usize = 100;

pub struct RunRegistry {
    runs: DashMap<Uuid, Arc<RunHandle>>,
    retained: usize,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_RUNS)
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retained: usize) -> Self {
        Self {
            runs: DashMap::new(),
            retained,
        }
    }

    /// Track a new run, evicting surplus finished runs.
    pub fn register(&self, handle: Arc<RunHandle>) {
        self.runs.insert(handle.id(), handle);
        let evicted = self.evict_finished();
        if evicted > 0 {
            tracing::debug!(evicted, retained = self.retained, "evicted finished runs");
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<RunHandle>> {
        self.runs.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Runs that have not reached a terminal state.
    pub fn active(&self) -> usize {
        self.runs
            .iter()
            .filter(|entry| !entry.value().state().is_terminal())
            .count()
    }

    fn evict_finished(&self) -> usize {
        let mut finished: Vec<(Uuid, u64)> = self
            .runs
            .iter()
            .filter(|entry| entry.value().state().is_terminal())
            .map(|entry| (*entry.key(), entry.value().finished_at().unwrap_or_default()))
            .collect();
        if finished.len() <= self.retained {
            return 0;
        }

        finished.sort_by_key(|(_, finished_at)| *finished_at);
        let excess = finished.len() - self.retained;
        for (id, _) in &finished[..excess] {
            self.runs.remove(id);
        }
        excess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_engine::{ReconciliationReport, RunState};

    fn handle() -> Arc<RunHandle> {
        let id = Uuid::new_v4();
        RunHandle::new(
            id,
            ReconciliationReport::new(id.to_string(), vec![], "a", "b", 0),
        )
    }

    fn finished(at: u64) -> Arc<RunHandle> {
        let handle = handle();
        handle.update(|report| {
            report.fail(converge_engine::FailureKind::Cancelled, "stopped");
            report.finish(at);
        });
        handle
    }

    #[test]
    fn register_and_get() {
        let registry = RunRegistry::new();
        let handle = handle();
        registry.register(handle.clone());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.active(), 1);
        assert!(registry.get(&handle.id()).is_some());
        assert!(registry.get(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn oldest_finished_runs_are_evicted() {
        let registry = RunRegistry::with_retention(2);
        let running = handle();
        let oldest = finished(10);
        let middle = finished(20);
        let newest = finished(30);

        registry.register(running.clone());
        registry.register(middle.clone());
        registry.register(oldest.clone());
        assert_eq!(registry.len(), 3);

        registry.register(newest.clone());

        assert_eq!(registry.len(), 3);
        assert!(registry.get(&oldest.id()).is_none());
        assert!(registry.get(&middle.id()).is_some());
        assert!(registry.get(&newest.id()).is_some());
        assert_eq!(running.state(), RunState::Idle);
        assert!(registry.get(&running.id()).is_some());
    }

    #[test]
    fn active_runs_are_never_evicted() {
        let registry = RunRegistry::with_retention(0);
        let running = handle();
        registry.register(running.clone());
        registry.register(finished(5));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.active(), 1);
        assert!(registry.get(&running.id()).is_some());
    }
}
