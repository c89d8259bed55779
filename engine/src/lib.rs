//! # Converge Engine
//!
//! A deterministic state reconciliation engine.
//!
//! This crate compares a desired state against an actual state, computes the
//! minimal set of corrective operations, and describes the outcome of applying
//! them. It never performs the apply itself: fetching and writing state is the
//! job of the adapters in `converge-server`.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of databases, network, or files
//! - **Deterministic**: Same snapshots always produce the same plan
//! - **Fail fast**: Ambiguous source data is an error, never a guess
//! - **Non-destructive by default**: Deletions require an explicit opt-in
//!
//! ## Core Concepts
//!
//! ### Records and Snapshots
//!
//! A [`Record`] is a JSON object of fields with one designated identity field.
//! A [`Snapshot`] is an immutable, timestamped capture of all records of one
//! entity kind, tagged as [`Origin::Desired`] or [`Origin::Actual`].
//!
//! ### Operations
//!
//! The [`DiffEngine`] turns a desired/actual snapshot pair into operations:
//! - [`CreateOp`] - Identity present only in desired
//! - [`UpdateOp`] - Identity in both, carrying only the changed fields
//! - [`DeleteOp`] - Identity present only in actual (destructive runs only)
//! - [`NoOp`] - Identity in both and already equivalent
//!
//! ### Plans
//!
//! A [`Plan`] merges per-kind diffs in the caller's dependency order and
//! knows its own blast radius and confirmation fingerprint.
//!
//! ## Quick Start
//!
//! ```rust
//! use converge_engine::{
//!     Catalog, DiffEngine, EntitySchema, FieldDef, FieldType, Filter, MemoryStore, Origin,
//!     Plan, Snapshot,
//! };
//! use serde_json::json;
//!
//! // 1. Describe the entity kind
//! let schema = EntitySchema::new(
//!     "user",
//!     "id",
//!     vec![FieldDef::required("name", FieldType::String)],
//! );
//! let catalog = Catalog::new(vec![schema.clone()]);
//!
//! // 2. Capture desired and actual state
//! let desired = Snapshot::from_values(
//!     &schema,
//!     Origin::Desired,
//!     1_706_745_600_000,
//!     vec![json!({"id": 1, "name": "A"})],
//! )
//! .unwrap();
//! let store = MemoryStore::new(catalog.clone());
//! let actual = store
//!     .fetch("user", &Filter::all(), Origin::Actual, 1_706_745_600_000)
//!     .unwrap();
//!
//! // 3. Diff and plan
//! let diff = DiffEngine::new(false).diff(&schema, &desired, &actual).unwrap();
//! let plan = Plan::assemble(&catalog, vec![diff]).unwrap();
//!
//! assert_eq!(plan.counts().creates, 1);
//! assert!(!plan.requires_confirmation(0.5));
//! ```
//!
//! ## Reports
//!
//! [`ReconciliationReport`] is the only persisted artifact of a run. It is
//! serializable to JSON and to one-line-per-outcome JSON lines for audit logs.

pub mod diff;
pub mod error;
pub mod filter;
pub mod operation;
pub mod record;
pub mod report;
pub mod schema;
pub mod snapshot;
pub mod state;
pub mod store;

// Re-export main types at crate root
pub use diff::{Diff, DiffEngine, Orphan, Plan, PlanCounts};
pub use error::Error;
pub use filter::{Filter, Predicate};
pub use operation::{CreateOp, DeleteOp, NoOp, Operation, UpdateOp};
pub use record::{Identity, Record};
pub use report::{
    Disposition, FailureKind, Outcome, OutcomeCounts, ReconciliationReport, ReportEntry,
    ReportLine, RunFailure,
};
pub use schema::{Catalog, Comparator, EntitySchema, FieldDef, FieldType};
pub use snapshot::{Origin, Snapshot, SnapshotMetadata};
pub use state::RunState;
pub use store::MemoryStore;

/// Type aliases for clarity
pub type EntityKind = String;
pub type FieldName = String;
pub type FieldMap = serde_json::Map<String, serde_json::Value>;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
