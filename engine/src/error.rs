//! Error types for the Converge engine.

use crate::{EntityKind, RunState};
use thiserror::Error;

/// All possible errors from the Converge engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Source data errors
    #[error("duplicate identity '{identity}' in {kind} snapshot")]
    AmbiguousSource { kind: EntityKind, identity: String },

    #[error("snapshot of kind '{expected}' cannot hold a '{got}' record")]
    MixedEntityKinds { expected: EntityKind, got: EntityKind },

    #[error("cannot diff '{desired}' against '{actual}'")]
    KindMismatch {
        desired: EntityKind,
        actual: EntityKind,
    },

    #[error("record of kind '{kind}' has no identity field '{field}'")]
    MissingIdentity { kind: EntityKind, field: String },

    #[error("invalid identity value: {0}")]
    InvalidIdentity(String),

    #[error("record must be a JSON object")]
    NotAnObject,

    // Schema errors
    #[error("unknown entity kind: {0}")]
    UnknownEntity(EntityKind),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Apply errors (in-memory store)
    #[error("record already exists: {0}")]
    RecordAlreadyExists(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("identity field '{0}' cannot be changed by an update")]
    IdentityMutation(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    // State machine errors
    #[error("illegal run transition: {from:?} -> {to:?}")]
    IllegalTransition { from: RunState, to: RunState },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
