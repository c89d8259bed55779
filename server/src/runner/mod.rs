//! Reconciliation runs: request, settings and orchestration.

mod executor;
mod handle;
mod probe;
mod reconciler;

pub use executor::*;
pub use handle::*;
pub use probe::*;
pub use reconciler::*;

use crate::adapters::{now_millis, AdapterError, Origins};
use crate::journal::Journal;
use converge_engine::{Catalog, EntityKind, Filter, ReconciliationReport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Blast radius above which a plan needs confirmation when no threshold is given.
pub const DEFAULT_BLAST_RADIUS_THRESHOLD: f64 = 0.25;

/// Parameters of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub entity_kinds: Vec<EntityKind>,
    pub desired_origin: String,
    pub actual_origin: String,
    /// Whether records missing from desired state are deleted
    #[serde(default)]
    pub destructive: bool,
    #[serde(default = "default_threshold")]
    pub blast_radius_threshold: f64,
    #[serde(default)]
    pub continue_on_error: bool,
    /// Fingerprint of the plan the caller has reviewed
    #[serde(default)]
    pub confirmation_token: Option<String>,
    /// Per-kind scoping, applied identically to both sides
    #[serde(default)]
    pub filters: BTreeMap<EntityKind, Filter>,
    /// Concurrent creates for kinds whose creates are independent
    #[serde(default)]
    pub parallel_creates: Option<usize>,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_threshold() -> f64 {
    DEFAULT_BLAST_RADIUS_THRESHOLD
}

impl RunRequest {
    pub fn new(
        entity_kinds: Vec<EntityKind>,
        desired_origin: impl Into<String>,
        actual_origin: impl Into<String>,
    ) -> Self {
        Self {
            entity_kinds,
            desired_origin: desired_origin.into(),
            actual_origin: actual_origin.into(),
            destructive: false,
            blast_radius_threshold: DEFAULT_BLAST_RADIUS_THRESHOLD,
            continue_on_error: false,
            confirmation_token: None,
            filters: BTreeMap::new(),
            parallel_creates: None,
            dry_run: false,
        }
    }

    pub fn destructive(mut self, destructive: bool) -> Self {
        self.destructive = destructive;
        self
    }

    pub fn blast_radius_threshold(mut self, threshold: f64) -> Self {
        self.blast_radius_threshold = threshold;
        self
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn confirmation_token(mut self, token: impl Into<String>) -> Self {
        self.confirmation_token = Some(token.into());
        self
    }

    pub fn filter(mut self, kind: impl Into<EntityKind>, filter: Filter) -> Self {
        self.filters.insert(kind.into(), filter);
        self
    }

    pub fn parallel_creates(mut self, workers: usize) -> Self {
        self.parallel_creates = Some(workers);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Filter for one kind; unscoped kinds match everything.
    pub fn filter_for(&self, kind: &str) -> Filter {
        self.filters.get(kind).cloned().unwrap_or_default()
    }

    /// Check the request against a catalog before anything is fetched.
    pub fn validate(&self, catalog: &Catalog) -> Result<(), RunError> {
        if self.entity_kinds.is_empty() {
            return Err(RunError::InvalidRequest("no entity kinds given".into()));
        }
        if !(0.0..=1.0).contains(&self.blast_radius_threshold) {
            return Err(RunError::InvalidRequest(format!(
                "blast radius threshold {} is outside 0..=1",
                self.blast_radius_threshold
            )));
        }
        if self.parallel_creates == Some(0) {
            return Err(RunError::InvalidRequest(
                "parallel creates must be at least 1".into(),
            ));
        }
        if self.desired_origin == self.actual_origin {
            return Err(RunError::InvalidRequest(format!(
                "desired and actual origin are both {}",
                self.desired_origin
            )));
        }
        catalog
            .order(&self.entity_kinds)
            .map_err(|e| RunError::InvalidRequest(e.to_string()))?;
        for kind in self.filters.keys() {
            if !self.entity_kinds.contains(kind) {
                return Err(RunError::InvalidRequest(format!(
                    "filter given for {kind}, which is not part of the run"
                )));
            }
        }
        Ok(())
    }
}

/// Errors that end a run without a usable report.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid run request: {0}")]
    InvalidRequest(String),

    #[error("unknown origin: {0}")]
    UnknownOrigin(String),

    #[error("fetching {kind} from {origin} failed: {source}")]
    FetchFailure {
        kind: EntityKind,
        origin: String,
        source: AdapterError,
    },

    #[error("identity {identity} of {kind} appears more than once in one snapshot")]
    AmbiguousSource { kind: EntityKind, identity: String },

    #[error(transparent)]
    Engine(#[from] converge_engine::Error),
}

/// Timeouts and limits shared by all runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSettings {
    /// Deadline for each single fetch or apply call
    pub call_timeout: Duration,
    /// How long a plan waits for a late confirmation
    pub confirmation_timeout: Duration,
    pub retry: RetryPolicy,
    pub verify_batch_size: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            confirmation_timeout: Duration::ZERO,
            retry: RetryPolicy::default(),
            verify_batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Starts runs against the configured origins.
#[derive(Clone)]
pub struct Runner {
    catalog: Arc<Catalog>,
    origins: Arc<Origins>,
    settings: RunSettings,
    journal_dir: Option<PathBuf>,
}

impl Runner {
    pub fn new(catalog: Arc<Catalog>, origins: Arc<Origins>, settings: RunSettings) -> Self {
        Self {
            catalog,
            origins,
            settings,
            journal_dir: None,
        }
    }

    pub fn with_journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Validate a request and create the handle for its run.
    pub fn prepare(&self, request: &RunRequest) -> Result<Arc<RunHandle>, RunError> {
        request.validate(&self.catalog)?;
        for origin in [&request.desired_origin, &request.actual_origin] {
            if self.origins.get(origin).is_none() {
                return Err(RunError::UnknownOrigin(origin.clone()));
            }
        }

        let id = Uuid::new_v4();
        let report = ReconciliationReport::new(
            id.to_string(),
            self.catalog.order(&request.entity_kinds)?,
            request.desired_origin.clone(),
            request.actual_origin.clone(),
            now_millis(),
        );
        Ok(RunHandle::new(id, report))
    }

    /// Drive a prepared run to completion.
    pub async fn run(
        &self,
        handle: &RunHandle,
        request: &RunRequest,
    ) -> Result<ReconciliationReport, RunError> {
        let desired = self
            .origins
            .get(&request.desired_origin)
            .ok_or_else(|| RunError::UnknownOrigin(request.desired_origin.clone()))?;
        let actual = self
            .origins
            .get(&request.actual_origin)
            .ok_or_else(|| RunError::UnknownOrigin(request.actual_origin.clone()))?;

        let journal = match &self.journal_dir {
            Some(dir) => match Journal::open(dir, &handle.id().to_string()).await {
                Ok(journal) => Some(journal),
                Err(err) => {
                    tracing::warn!(run_id = %handle.id(), error = %err, "journal unavailable");
                    None
                }
            },
            None => None,
        };

        let mut reconciler = Reconciler::new(
            &self.catalog,
            desired.as_source(),
            actual.as_ref(),
            &self.settings,
            handle,
        );
        if let Some(journal) = &journal {
            reconciler = reconciler.with_journal(journal);
        }
        reconciler.run(request).await
    }

    /// Prepare and run in one step.
    pub async fn reconcile(&self, request: &RunRequest) -> Result<ReconciliationReport, RunError> {
        let handle = self.prepare(request)?;
        self.run(&handle, request).await
    }
}
