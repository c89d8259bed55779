//! In-memory adapter backed by [`MemoryStore`].

use super::{now_millis, AdapterError, Result, StateSink, StateSource};
use async_trait::async_trait;
use converge_engine::{
    Catalog, EntitySchema, FieldMap, Filter, Identity, MemoryStore, Origin, Record, Snapshot,
};
use std::sync::{Mutex, MutexGuard};

/// Adapter over an in-process store.
///
/// Used for fixture-driven desired state and for tests. Creates never
/// contend, so every kind accepts concurrent creates.
pub struct MemoryAdapter {
    name: String,
    store: Mutex<MemoryStore>,
}

impl MemoryAdapter {
    pub fn new(name: impl Into<String>, catalog: Catalog) -> Self {
        Self::from_store(name, MemoryStore::new(catalog))
    }

    pub fn from_store(name: impl Into<String>, store: MemoryStore) -> Self {
        Self {
            name: name.into(),
            store: Mutex::new(store),
        }
    }

    /// Seed records of one kind from raw JSON objects.
    pub fn seed(&self, kind: &str, values: Vec<serde_json::Value>) -> Result<()> {
        self.lock()?.seed(kind, values)?;
        Ok(())
    }

    /// Copy of the current records of a kind, for inspection.
    pub fn records(&self, kind: &str) -> Vec<Record> {
        self.lock()
            .map(|store| {
                store
                    .collection(kind)
                    .map(|c| c.records().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, kind: &str, identity: &Identity) -> Option<Record> {
        self.lock().ok()?.get(kind, identity).cloned()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryStore>> {
        self.store
            .lock()
            .map_err(|_| AdapterError::Unavailable(format!("store {} is poisoned", self.name)))
    }
}

#[async_trait]
impl StateSource for MemoryAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        schema: &EntitySchema,
        filter: &Filter,
        origin: Origin,
    ) -> Result<Snapshot> {
        let snapshot = self
            .lock()?
            .fetch(&schema.kind, filter, origin, now_millis())?;
        Ok(snapshot)
    }
}

#[async_trait]
impl StateSink for MemoryAdapter {
    fn as_source(&self) -> &dyn StateSource {
        self
    }

    async fn apply_create(&self, _schema: &EntitySchema, record: &Record) -> Result<()> {
        self.lock()?.create(record)?;
        Ok(())
    }

    async fn apply_update(
        &self,
        schema: &EntitySchema,
        identity: &Identity,
        changed: &FieldMap,
    ) -> Result<()> {
        self.lock()?.update(&schema.kind, identity, changed)?;
        Ok(())
    }

    async fn apply_delete(&self, schema: &EntitySchema, identity: &Identity) -> Result<()> {
        self.lock()?.delete(&schema.kind, identity)?;
        Ok(())
    }

    fn independent_creates(&self, _schema: &EntitySchema) -> bool {
        true
    }
}
