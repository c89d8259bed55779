//! Diffing desired state against actual state.
//!
//! This is the core of determinism. Given a desired and an actual snapshot
//! of one entity kind, the [`DiffEngine`] produces the complete ordered list
//! of operations that would make actual match desired.
//!
//! # Algorithm
//!
//! 1. Index both snapshots by identity (duplicates are a hard error)
//! 2. Walk desired in order: missing in actual -> Create, present -> Update
//!    with the field-level delta, or NoOp when the delta is empty
//! 3. Walk actual in reverse order: missing in desired -> Delete when the
//!    engine is destructive, otherwise record an orphan
//!
//! A [`Plan`] then merges per-kind diffs in the catalog's dependency order:
//! creates and updates parent-first, deletes child-first.

use crate::{
    error::Result, Catalog, CreateOp, DeleteOp, EntityKind, EntitySchema, Error, Identity, NoOp,
    Operation, Snapshot, UpdateOp,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A record present in actual state but absent from desired state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Orphan {
    pub kind: EntityKind,
    pub identity: Identity,
}

/// Diff of a single entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diff {
    /// Entity kind
    pub kind: EntityKind,
    /// Operations in apply order for this kind
    pub operations: Vec<Operation>,
    /// Actual-only identities not scheduled for deletion
    pub orphans: Vec<Orphan>,
    /// Number of records in the actual snapshot
    pub actual_count: usize,
}

/// Produces operations from snapshot pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffEngine {
    destructive: bool,
}

impl DiffEngine {
    /// Create a diff engine. Non-destructive engines never emit deletes.
    pub fn new(destructive: bool) -> Self {
        Self { destructive }
    }

    pub fn is_destructive(&self) -> bool {
        self.destructive
    }

    /// Diff one kind. The whole operation list is built before returning.
    pub fn diff(
        &self,
        schema: &EntitySchema,
        desired: &Snapshot,
        actual: &Snapshot,
    ) -> Result<Diff> {
        for kind in [desired.kind(), actual.kind()] {
            if *kind != schema.kind {
                return Err(Error::KindMismatch {
                    desired: schema.kind.clone(),
                    actual: kind.clone(),
                });
            }
        }

        let desired_index = desired.index()?;
        let actual_index = actual.index()?;

        let mut operations = Vec::with_capacity(desired.len());
        for wanted in desired.records() {
            let op = match actual_index.get(&wanted.identity) {
                None => Operation::Create(CreateOp::new(wanted.clone())),
                Some(current) => {
                    let changed = schema.delta(wanted, current);
                    if changed.is_empty() {
                        Operation::NoOp(NoOp::new(&schema.kind, wanted.identity.clone()))
                    } else {
                        Operation::Update(UpdateOp::new(
                            &schema.kind,
                            wanted.identity.clone(),
                            changed,
                        ))
                    }
                }
            };
            operations.push(op);
        }

        let mut orphans = Vec::new();
        for current in actual.records() {
            if !desired_index.contains_key(&current.identity) {
                orphans.push(Orphan {
                    kind: schema.kind.clone(),
                    identity: current.identity.clone(),
                });
            }
        }

        if self.destructive {
            operations.extend(
                orphans
                    .drain(..)
                    .rev()
                    .map(|o| Operation::Delete(DeleteOp::new(o.kind, o.identity))),
            );
        }

        Ok(Diff {
            kind: schema.kind.clone(),
            operations,
            orphans,
            actual_count: actual.len(),
        })
    }
}

/// Operation counts of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanCounts {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub noops: usize,
}

impl PlanCounts {
    /// Operations that change target state.
    pub fn mutations(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

/// The full, dependency-ordered operation sequence of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    operations: Vec<Operation>,
    orphans: Vec<Orphan>,
    actual_count: usize,
}

impl Plan {
    /// Merge per-kind diffs using the catalog's kind order.
    ///
    /// Creates, updates and no-ops come parent-first; deletes come after all
    /// of them, child-first.
    pub fn assemble(catalog: &Catalog, mut diffs: Vec<Diff>) -> Result<Self> {
        let mut ranked = Vec::with_capacity(diffs.len());
        for diff in diffs.drain(..) {
            let rank = catalog
                .rank(&diff.kind)
                .ok_or_else(|| Error::UnknownEntity(diff.kind.clone()))?;
            ranked.push((rank, diff));
        }
        ranked.sort_by_key(|(rank, _)| *rank);

        let actual_count = ranked.iter().map(|(_, d)| d.actual_count).sum();
        let mut operations = Vec::new();
        let mut deletes: Vec<Vec<Operation>> = Vec::new();
        let mut orphans = Vec::new();

        for (_, diff) in ranked {
            let (kind_deletes, rest): (Vec<_>, Vec<_>) =
                diff.operations.into_iter().partition(Operation::is_delete);
            operations.extend(rest);
            deletes.push(kind_deletes);
            orphans.extend(diff.orphans);
        }
        operations.extend(deletes.into_iter().rev().flatten());

        Ok(Self {
            operations,
            orphans,
            actual_count,
        })
    }

    /// Operations in apply order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }

    pub fn orphans(&self) -> &[Orphan] {
        &self.orphans
    }

    /// Total records across the actual snapshots.
    pub fn actual_count(&self) -> usize {
        self.actual_count
    }

    pub fn counts(&self) -> PlanCounts {
        let mut counts = PlanCounts::default();
        for op in &self.operations {
            match op {
                Operation::Create(_) => counts.creates += 1,
                Operation::Update(_) => counts.updates += 1,
                Operation::Delete(_) => counts.deletes += 1,
                Operation::NoOp(_) => counts.noops += 1,
            }
        }
        counts
    }

    pub fn has_deletes(&self) -> bool {
        self.operations.iter().any(Operation::is_delete)
    }

    /// Fraction of actual records this plan modifies or deletes.
    pub fn blast_radius(&self) -> f64 {
        if self.actual_count == 0 {
            return 0.0;
        }
        let counts = self.counts();
        (counts.updates + counts.deletes) as f64 / self.actual_count as f64
    }

    /// Whether the plan must be confirmed before applying.
    pub fn requires_confirmation(&self, blast_radius_threshold: f64) -> bool {
        self.has_deletes() || self.blast_radius() > blast_radius_threshold
    }

    /// Short, stable digest of the operation sequence.
    ///
    /// Doubles as the confirmation token for this exact plan.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for op in &self.operations {
            // Plain JSON maps always serialize.
            if let Ok(bytes) = serde_json::to_vec(op) {
                hasher.update(&bytes);
            }
            hasher.update(b"\n");
        }
        let digest = hex::encode(hasher.finalize());
        digest[..16].to_string()
    }
}
