//! Shared fixtures for server integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use converge_engine::{
    Catalog, EntitySchema, FieldDef, FieldMap, FieldType, Filter, Identity, Origin, Record,
    Snapshot,
};
use converge_server::adapters::{
    AdapterError, MemoryAdapter, Origins, Result, StateSink, StateSource,
};
use converge_server::runner::{RetryPolicy, RunSettings, Runner};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn team_schema() -> EntitySchema {
    EntitySchema::new(
        "team",
        "slug",
        vec![FieldDef::optional("title", FieldType::String)],
    )
}

pub fn user_schema() -> EntitySchema {
    EntitySchema::new(
        "user",
        "id",
        vec![
            FieldDef::optional("name", FieldType::String),
            FieldDef::optional("balance", FieldType::Decimal),
            FieldDef::optional("team", FieldType::String),
        ],
    )
    .with_independent_creates(true)
}

/// Teams before users.
pub fn catalog() -> Catalog {
    Catalog::new(vec![team_schema(), user_schema()])
}

pub fn memory(name: &str, kind: &str, values: Vec<serde_json::Value>) -> MemoryAdapter {
    let adapter = MemoryAdapter::new(name, catalog());
    adapter.seed(kind, values).unwrap();
    adapter
}

/// Fast settings: no backoff, no confirmation window.
pub fn settings() -> RunSettings {
    RunSettings {
        call_timeout: Duration::from_secs(2),
        confirmation_timeout: Duration::ZERO,
        retry: RetryPolicy::immediate(3),
        verify_batch_size: 7,
    }
}

pub fn runner(
    desired: Arc<dyn StateSink>,
    actual: Arc<dyn StateSink>,
    settings: RunSettings,
) -> Runner {
    let origins = Origins::new().with(desired).with(actual);
    Runner::new(Arc::new(catalog()), Arc::new(origins), settings)
}

/// Sink wrapper that injects scripted failures and records every call.
pub struct ScriptedSink {
    inner: MemoryAdapter,
    apply_errors: Mutex<HashMap<(String, String), VecDeque<AdapterError>>>,
    fetch_errors: Mutex<VecDeque<AdapterError>>,
    calls: Mutex<Vec<String>>,
    swallow_updates: bool,
    delay: Option<Duration>,
}

impl ScriptedSink {
    pub fn new(inner: MemoryAdapter) -> Self {
        Self {
            inner,
            apply_errors: Mutex::new(HashMap::new()),
            fetch_errors: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            swallow_updates: false,
            delay: None,
        }
    }

    /// Accept updates without applying them.
    pub fn swallowing_updates(mut self) -> Self {
        self.swallow_updates = true;
        self
    }

    /// Sleep inside every apply call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next calls of `op` ("create", "update", "delete") on `identity`.
    pub fn fail_apply(&self, op: &str, identity: &str, errors: Vec<AdapterError>) {
        self.apply_errors
            .lock()
            .unwrap()
            .entry((op.to_string(), identity.to_string()))
            .or_default()
            .extend(errors);
    }

    pub fn fail_fetches(&self, errors: Vec<AdapterError>) {
        self.fetch_errors.lock().unwrap().extend(errors);
    }

    /// Calls so far, as `op:kind:identity`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn records(&self, kind: &str) -> Vec<Record> {
        self.inner.records(kind)
    }

    pub fn get(&self, kind: &str, identity: &str) -> Option<Record> {
        self.inner.get(kind, &Identity::from(identity))
    }

    async fn before_apply(&self, op: &str, kind: &str, identity: &Identity) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{op}:{kind}:{identity}"));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .apply_errors
            .lock()
            .unwrap()
            .get_mut(&(op.to_string(), identity.to_string()))
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StateSource for ScriptedSink {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch(
        &self,
        schema: &EntitySchema,
        filter: &Filter,
        origin: Origin,
    ) -> Result<Snapshot> {
        let scripted = self.fetch_errors.lock().unwrap().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }
        self.inner.fetch(schema, filter, origin).await
    }
}

#[async_trait]
impl StateSink for ScriptedSink {
    fn as_source(&self) -> &dyn StateSource {
        self
    }

    async fn apply_create(&self, schema: &EntitySchema, record: &Record) -> Result<()> {
        self.before_apply("create", &schema.kind, &record.identity)
            .await?;
        self.inner.apply_create(schema, record).await
    }

    async fn apply_update(
        &self,
        schema: &EntitySchema,
        identity: &Identity,
        changed: &FieldMap,
    ) -> Result<()> {
        self.before_apply("update", &schema.kind, identity).await?;
        if self.swallow_updates {
            return Ok(());
        }
        self.inner.apply_update(schema, identity, changed).await
    }

    async fn apply_delete(&self, schema: &EntitySchema, identity: &Identity) -> Result<()> {
        self.before_apply("delete", &schema.kind, identity).await?;
        self.inner.apply_delete(schema, identity).await
    }

    fn independent_creates(&self, schema: &EntitySchema) -> bool {
        schema.independent_creates
    }
}
