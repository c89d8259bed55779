//! Operation types for expressing corrective actions.
//!
//! Every operation carries enough data to be applied without re-reading
//! source state, and always refers to an identity that exists in either the
//! desired or the actual snapshot.

use crate::{EntityKind, FieldMap, Identity, Record};
use serde::{Deserialize, Serialize};

/// Create a record that exists only in desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOp {
    /// Target entity kind
    pub kind: EntityKind,
    /// Full desired record
    pub record: Record,
}

/// Bring an existing record in line with desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOp {
    /// Target entity kind
    pub kind: EntityKind,
    /// Record to update
    pub identity: Identity,
    /// Only the fields that differ; never the identity field
    pub changed_fields: FieldMap,
}

/// Remove a record that exists only in actual state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOp {
    /// Target entity kind
    pub kind: EntityKind,
    /// Record to delete
    pub identity: Identity,
}

/// A record that already matches desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoOp {
    /// Entity kind
    pub kind: EntityKind,
    /// Record that needs nothing
    pub identity: Identity,
}

/// A planned corrective action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    Create(CreateOp),
    Update(UpdateOp),
    Delete(DeleteOp),
    NoOp(NoOp),
}

impl Operation {
    /// Get the entity kind this operation targets.
    pub fn kind(&self) -> &EntityKind {
        match self {
            Operation::Create(op) => &op.kind,
            Operation::Update(op) => &op.kind,
            Operation::Delete(op) => &op.kind,
            Operation::NoOp(op) => &op.kind,
        }
    }

    /// Get the identity this operation targets.
    pub fn identity(&self) -> &Identity {
        match self {
            Operation::Create(op) => &op.record.identity,
            Operation::Update(op) => &op.identity,
            Operation::Delete(op) => &op.identity,
            Operation::NoOp(op) => &op.identity,
        }
    }

    /// Short lowercase name, as used in logs and the JSON tag.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create(_) => "create",
            Operation::Update(_) => "update",
            Operation::Delete(_) => "delete",
            Operation::NoOp(_) => "noop",
        }
    }

    /// Whether applying this operation changes target state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Operation::NoOp(_))
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Delete(_))
    }

    pub fn is_create(&self) -> bool {
        matches!(self, Operation::Create(_))
    }
}

impl CreateOp {
    /// Create a new create operation.
    pub fn new(record: Record) -> Self {
        Self {
            kind: record.kind.clone(),
            record,
        }
    }
}

impl UpdateOp {
    /// Create a new update operation.
    pub fn new(kind: impl Into<EntityKind>, identity: Identity, changed_fields: FieldMap) -> Self {
        Self {
            kind: kind.into(),
            identity,
            changed_fields,
        }
    }
}

impl DeleteOp {
    /// Create a new delete operation.
    pub fn new(kind: impl Into<EntityKind>, identity: Identity) -> Self {
        Self {
            kind: kind.into(),
            identity,
        }
    }
}

impl NoOp {
    /// Create a new no-op entry.
    pub fn new(kind: impl Into<EntityKind>, identity: Identity) -> Self {
        Self {
            kind: kind.into(),
            identity,
        }
    }
}
