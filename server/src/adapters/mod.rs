//! State source and sink adapters.
//!
//! The reconciliation core only ever talks to these traits. Each backing
//! system (in-memory store, PostgreSQL, scheduling provider) supplies one
//! adapter implementing both sides.

mod memory;
mod provider;

pub use memory::*;
pub use provider::*;

use async_trait::async_trait;
use converge_engine::{
    EntitySchema, FieldMap, Filter, Identity, Origin, Record, Snapshot, Timestamp,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Failure of a single adapter call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    #[error("call timed out")]
    Timeout,

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl AdapterError {
    /// Network, timeout and rate-limit failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Timeout | AdapterError::Unavailable(_) | AdapterError::RateLimited { .. }
        )
    }

    /// Minimum delay the backend asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdapterError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<converge_engine::Error> for AdapterError {
    fn from(err: converge_engine::Error) -> Self {
        use converge_engine::Error;
        match err {
            Error::MissingIdentity { .. }
            | Error::InvalidIdentity(_)
            | Error::NotAnObject
            | Error::MixedEntityKinds { .. }
            | Error::Serialization(_) => AdapterError::Malformed(err.to_string()),
            Error::UnknownEntity(_) => AdapterError::NotConfigured(err.to_string()),
            other => AdapterError::Rejected(other.to_string()),
        }
    }
}

/// Result type for adapter calls.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Read-only access to one backing system.
#[async_trait]
pub trait StateSource: Send + Sync {
    /// Origin name, for logs and reports.
    fn name(&self) -> &str;

    /// Capture all records of `schema.kind` matching `filter`.
    async fn fetch(&self, schema: &EntitySchema, filter: &Filter, origin: Origin)
        -> Result<Snapshot>;
}

/// Writable counterpart of a [`StateSource`].
#[async_trait]
pub trait StateSink: StateSource {
    /// View this sink as a plain source.
    fn as_source(&self) -> &dyn StateSource;

    async fn apply_create(&self, schema: &EntitySchema, record: &Record) -> Result<()>;

    async fn apply_update(
        &self,
        schema: &EntitySchema,
        identity: &Identity,
        changed: &FieldMap,
    ) -> Result<()>;

    async fn apply_delete(&self, schema: &EntitySchema, identity: &Identity) -> Result<()>;

    /// Whether creates of distinct identities of this kind may run concurrently.
    fn independent_creates(&self, _schema: &EntitySchema) -> bool {
        false
    }
}

/// Run a call with a deadline; an elapsed deadline is a transient failure.
pub async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout),
    }
}

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

/// Named origins available to runs.
#[derive(Default, Clone)]
pub struct Origins {
    sinks: HashMap<String, Arc<dyn StateSink>>,
}

impl Origins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name.
    pub fn insert(&mut self, sink: Arc<dyn StateSink>) {
        self.sinks.insert(sink.name().to_string(), sink);
    }

    /// Builder-style registration.
    pub fn with(mut self, sink: Arc<dyn StateSink>) -> Self {
        self.insert(sink);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StateSink>> {
        self.sinks.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.sinks.keys()
    }
}
