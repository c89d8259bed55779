//! Snapshot types: immutable captures of one entity kind.
//!
//! A snapshot is produced once per fetch and never mutated afterwards. The
//! diff engine only ever reads snapshots through [`Snapshot::index`], which is
//! where duplicate identities are caught.

use crate::{error::Result, EntityKind, EntitySchema, Error, Identity, Record, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which side of a reconciliation a snapshot represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// The state we want
    Desired,
    /// The state that is persisted right now
    Actual,
}

/// A point-in-time capture of all records of one entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    kind: EntityKind,
    origin: Origin,
    captured_at: Timestamp,
    records: Vec<Record>,
}

impl Snapshot {
    /// Create a snapshot, rejecting records of any other kind.
    pub fn new(
        kind: impl Into<EntityKind>,
        origin: Origin,
        captured_at: Timestamp,
        records: Vec<Record>,
    ) -> Result<Self> {
        let kind = kind.into();
        if let Some(stray) = records.iter().find(|r| r.kind != kind) {
            return Err(Error::MixedEntityKinds {
                expected: kind,
                got: stray.kind.clone(),
            });
        }

        Ok(Self {
            kind,
            origin,
            captured_at,
            records,
        })
    }

    /// Create a snapshot from raw JSON objects using a schema's identity field.
    pub fn from_values(
        schema: &EntitySchema,
        origin: Origin,
        captured_at: Timestamp,
        values: Vec<serde_json::Value>,
    ) -> Result<Self> {
        let records = values
            .into_iter()
            .map(|v| schema.record(v))
            .collect::<Result<Vec<_>>>()?;
        Self::new(schema.kind.clone(), origin, captured_at, records)
    }

    /// An empty snapshot.
    pub fn empty(kind: impl Into<EntityKind>, origin: Origin, captured_at: Timestamp) -> Self {
        Self {
            kind: kind.into(),
            origin,
            captured_at,
            records: Vec::new(),
        }
    }

    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn captured_at(&self) -> Timestamp {
        self.captured_at
    }

    /// Records in capture order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Build the identity -> record index.
    ///
    /// Fails on the first duplicate identity: there is no safe way to pick
    /// one of two records claiming the same identity.
    pub fn index(&self) -> Result<HashMap<&Identity, &Record>> {
        let mut index = HashMap::with_capacity(self.records.len());
        for record in &self.records {
            if index.insert(&record.identity, record).is_some() {
                return Err(Error::AmbiguousSource {
                    kind: self.kind.clone(),
                    identity: record.identity.to_string(),
                });
            }
        }
        Ok(index)
    }

    /// Summary without the records.
    pub fn metadata(&self) -> SnapshotMetadata {
        SnapshotMetadata::from(self)
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub kind: EntityKind,
    pub origin: Origin,
    pub captured_at: Timestamp,
    pub record_count: usize,
}

impl From<&Snapshot> for SnapshotMetadata {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            kind: snapshot.kind.clone(),
            origin: snapshot.origin,
            captured_at: snapshot.captured_at,
            record_count: snapshot.records.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldDef, FieldType};
    use serde_json::json;

    fn user_schema() -> EntitySchema {
        EntitySchema::new(
            "user",
            "email",
            vec![FieldDef::optional("name", FieldType::String)],
        )
    }

    #[test]
    fn create_snapshot() {
        let snapshot = Snapshot::from_values(
            &user_schema(),
            Origin::Desired,
            1000,
            vec![json!({"email": "a@x.io"}), json!({"email": "b@x.io"})],
        )
        .unwrap();

        assert_eq!(snapshot.kind(), "user");
        assert_eq!(snapshot.origin(), Origin::Desired);
        assert_eq!(snapshot.captured_at(), 1000);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.records()[1].identity.as_str(), "b@x.io");
    }

    #[test]
    fn reject_mixed_kinds() {
        let user = Record::from_value("user", "id", json!({"id": 1})).unwrap();
        let slot = Record::from_value("slot", "id", json!({"id": 1})).unwrap();

        let result = Snapshot::new("user", Origin::Actual, 1000, vec![user, slot]);
        assert!(matches!(
            result,
            Err(Error::MixedEntityKinds { expected, got }) if expected == "user" && got == "slot"
        ));
    }

    #[test]
    fn duplicate_identity_is_ambiguous() {
        let snapshot = Snapshot::from_values(
            &user_schema(),
            Origin::Actual,
            1000,
            vec![
                json!({"email": "a@x.io", "name": "A"}),
                json!({"email": "a@x.io", "name": "A2"}),
            ],
        )
        .unwrap();

        let result = snapshot.index();
        assert!(matches!(
            result,
            Err(Error::AmbiguousSource { identity, .. }) if identity == "a@x.io"
        ));
    }

    #[test]
    fn index_lookup() {
        let snapshot = Snapshot::from_values(
            &user_schema(),
            Origin::Actual,
            1000,
            vec![json!({"email": "a@x.io", "name": "A"})],
        )
        .unwrap();

        let index = snapshot.index().unwrap();
        let record = index.get(&Identity::from("a@x.io")).unwrap();
        assert_eq!(record.get("name"), Some(&json!("A")));
    }

    #[test]
    fn snapshot_metadata() {
        let snapshot = Snapshot::empty("user", Origin::Actual, 42);
        let metadata = snapshot.metadata();
        assert_eq!(metadata.kind, "user");
        assert_eq!(metadata.captured_at, 42);
        assert_eq!(metadata.record_count, 0);
    }

    #[test]
    fn origin_serialization() {
        assert_eq!(serde_json::to_string(&Origin::Desired).unwrap(), "\"desired\"");
        let parsed: Origin = serde_json::from_str("\"actual\"").unwrap();
        assert_eq!(parsed, Origin::Actual);
    }
}
