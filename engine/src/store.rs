//! MemoryStore - an in-memory entity store.
//!
//! Holds records per entity kind in insertion order and applies operations
//! with the same semantics the real backends are expected to have. It backs
//! the in-memory adapter and doubles as a reference target in tests.

use crate::{
    error::Result, Catalog, EntityKind, Error, FieldMap, Filter, Identity, Operation, Origin,
    Record, Snapshot, Timestamp,
};
use std::collections::HashMap;

/// All records of one kind, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    records: Vec<Record>,
}

impl Collection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Get a record by identity.
    pub fn get(&self, identity: &Identity) -> Option<&Record> {
        self.records.iter().find(|r| &r.identity == identity)
    }

    fn position(&self, identity: &Identity) -> Option<usize> {
        self.records.iter().position(|r| &r.identity == identity)
    }

    /// Check if a record exists.
    pub fn contains(&self, identity: &Identity) -> bool {
        self.position(identity).is_some()
    }

    /// All records in insertion order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// The in-memory store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    catalog: Catalog,
    collections: HashMap<EntityKind, Collection>,
}

impl MemoryStore {
    /// Create a store with an empty collection for every catalog kind.
    pub fn new(catalog: Catalog) -> Self {
        let collections = catalog
            .kinds()
            .map(|kind| (kind.clone(), Collection::new()))
            .collect();

        Self {
            catalog,
            collections,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Seed records from raw JSON objects, bypassing the create checks.
    ///
    /// Duplicates are allowed on purpose so tests can build ambiguous state.
    pub fn seed(&mut self, kind: &str, values: Vec<serde_json::Value>) -> Result<()> {
        let schema = self.catalog.get(kind)?.clone();
        let collection = self.collection_mut(kind)?;
        for value in values {
            collection.records.push(schema.record(value)?);
        }
        Ok(())
    }

    /// Get a collection by kind.
    pub fn collection(&self, kind: &str) -> Option<&Collection> {
        self.collections.get(kind)
    }

    fn collection_mut(&mut self, kind: &str) -> Result<&mut Collection> {
        self.collections
            .get_mut(kind)
            .ok_or_else(|| Error::UnknownEntity(kind.to_string()))
    }

    /// Get a record by kind and identity.
    pub fn get(&self, kind: &str, identity: &Identity) -> Option<&Record> {
        self.collections.get(kind).and_then(|c| c.get(identity))
    }

    /// Capture the records of a kind that match `filter`.
    pub fn fetch(
        &self,
        kind: &str,
        filter: &Filter,
        origin: Origin,
        captured_at: Timestamp,
    ) -> Result<Snapshot> {
        let collection = self
            .collections
            .get(kind)
            .ok_or_else(|| Error::UnknownEntity(kind.to_string()))?;

        let records = collection
            .records()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        Snapshot::new(kind, origin, captured_at, records)
    }

    /// Apply an operation.
    pub fn apply(&mut self, op: &Operation) -> Result<()> {
        match op {
            Operation::Create(create) => self.create(&create.record),
            Operation::Update(update) => {
                self.update(&update.kind, &update.identity, &update.changed_fields)
            }
            Operation::Delete(delete) => self.delete(&delete.kind, &delete.identity),
            Operation::NoOp(_) => Ok(()),
        }
    }

    /// Insert a new record; the identity must not exist yet.
    pub fn create(&mut self, record: &Record) -> Result<()> {
        self.catalog.get(&record.kind)?.validate(record)?;

        let collection = self.collection_mut(&record.kind)?;
        if collection.contains(&record.identity) {
            return Err(Error::RecordAlreadyExists(record.identity.to_string()));
        }
        collection.records.push(record.clone());
        Ok(())
    }

    /// Merge changed fields into an existing record.
    pub fn update(&mut self, kind: &str, identity: &Identity, changed: &FieldMap) -> Result<()> {
        let schema = self.catalog.get(kind)?.clone();
        let collection = self.collection_mut(kind)?;

        let position = collection
            .position(identity)
            .ok_or_else(|| Error::RecordNotFound(identity.to_string()))?;

        let mut updated = collection.records[position].clone();
        updated.merge(&schema.identity_field, changed)?;
        schema.validate(&updated)?;
        collection.records[position] = updated;
        Ok(())
    }

    /// Remove a record. Deleting an absent identity succeeds.
    pub fn delete(&mut self, kind: &str, identity: &Identity) -> Result<()> {
        let collection = self.collection_mut(kind)?;
        collection.records.retain(|r| &r.identity != identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CreateOp, DeleteOp, EntitySchema, FieldDef, FieldType, UpdateOp};
    use serde_json::json;

    fn store() -> MemoryStore {
        MemoryStore::new(Catalog::new(vec![EntitySchema::new(
            "user",
            "email",
            vec![FieldDef::required("name", FieldType::String)],
        )]))
    }

    fn user(email: &str, name: &str) -> Record {
        Record::from_value("user", "email", json!({"email": email, "name": name})).unwrap()
    }

    #[test]
    fn create_and_fetch() {
        let mut store = store();
        store.create(&user("a@x.io", "A")).unwrap();
        store.create(&user("b@x.io", "B")).unwrap();

        let snapshot = store
            .fetch("user", &Filter::all(), Origin::Actual, 1000)
            .unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.records()[0].identity.as_str(), "a@x.io");
        assert_eq!(snapshot.origin(), Origin::Actual);
    }

    #[test]
    fn create_rejects_existing_identity() {
        let mut store = store();
        store.create(&user("a@x.io", "A")).unwrap();
        let result = store.create(&user("a@x.io", "A2"));
        assert!(matches!(result, Err(Error::RecordAlreadyExists(id)) if id == "a@x.io"));
    }

    #[test]
    fn create_validates_schema() {
        let mut store = store();
        let record = Record::from_value("user", "email", json!({"email": "a@x.io"})).unwrap();
        assert!(matches!(
            store.create(&record),
            Err(Error::MissingRequiredField(_))
        ));
    }

    #[test]
    fn update_merges_fields() {
        let mut store = store();
        store
            .seed(
                "user",
                vec![json!({"email": "a@x.io", "name": "A", "createdAt": 7})],
            )
            .unwrap();

        let mut changed = FieldMap::new();
        changed.insert("name".into(), json!("A2"));
        store
            .apply(&Operation::Update(UpdateOp::new(
                "user",
                Identity::from("a@x.io"),
                changed,
            )))
            .unwrap();

        let record = store.get("user", &Identity::from("a@x.io")).unwrap();
        assert_eq!(record.get("name"), Some(&json!("A2")));
        assert_eq!(record.get("createdAt"), Some(&json!(7)));
    }

    #[test]
    fn update_missing_record() {
        let mut store = store();
        let result = store.update("user", &Identity::from("nobody"), &FieldMap::new());
        assert!(matches!(result, Err(Error::RecordNotFound(_))));
    }

    #[test]
    fn delete_is_idempotent() {
        let mut store = store();
        store
            .apply(&Operation::Create(CreateOp::new(user("a@x.io", "A"))))
            .unwrap();

        let delete = Operation::Delete(DeleteOp::new("user", Identity::from("a@x.io")));
        store.apply(&delete).unwrap();
        store.apply(&delete).unwrap();

        assert!(store.collection("user").unwrap().is_empty());
    }

    #[test]
    fn fetch_unknown_kind() {
        let store = store();
        let result = store.fetch("ghost", &Filter::all(), Origin::Actual, 0);
        assert!(matches!(result, Err(Error::UnknownEntity(k)) if k == "ghost"));
    }

    #[test]
    fn fetch_applies_filter() {
        let mut store = store();
        store.create(&user("a@x.io", "A")).unwrap();
        store.create(&user("b@x.io", "B")).unwrap();

        let filter = Filter::all().where_eq("name", json!("B"));
        let snapshot = store.fetch("user", &filter, Origin::Actual, 0).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.records()[0].identity.as_str(), "b@x.io");
    }
}
