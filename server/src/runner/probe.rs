//! Post-apply verification.
//!
//! Re-reads every touched identity from the actual side, in batches, and
//! checks that the applied change is visible.

use crate::adapters::{with_timeout, StateSink};
use converge_engine::{Catalog, EntitySchema, Filter, Identity, Operation, Origin, Outcome, Record};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// An applied operation awaiting verification, keyed by its report index.
#[derive(Debug, Clone)]
pub struct Touched<'a> {
    pub index: usize,
    pub operation: &'a Operation,
}

#[derive(Debug, Clone, Copy)]
pub struct VerificationProbe {
    batch_size: usize,
    call_timeout: Duration,
}

impl VerificationProbe {
    pub fn new(batch_size: usize, call_timeout: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            call_timeout,
        }
    }

    /// Verify each touched operation; returns `(index, outcome)` pairs.
    pub async fn verify(
        &self,
        catalog: &Catalog,
        sink: &dyn StateSink,
        touched: &[Touched<'_>],
    ) -> Vec<(usize, Outcome)> {
        let mut outcomes = Vec::with_capacity(touched.len());

        for (kind, items) in group_by_kind(touched) {
            let schema = match catalog.get(kind) {
                Ok(schema) => schema,
                Err(err) => {
                    outcomes.extend(items.iter().map(|t| (t.index, mismatch(err.to_string()))));
                    continue;
                }
            };

            for batch in items.chunks(self.batch_size) {
                let found = self.read_back(schema, sink, batch).await;
                for item in batch {
                    let outcome = match &found {
                        Ok(records) => check(schema, item.operation, records.get(item.operation.identity())),
                        Err(detail) => mismatch(detail.clone()),
                    };
                    outcomes.push((item.index, outcome));
                }
            }
        }

        outcomes
    }

    async fn read_back(
        &self,
        schema: &EntitySchema,
        sink: &dyn StateSink,
        batch: &[&Touched<'_>],
    ) -> Result<HashMap<Identity, Record>, String> {
        let filter = Filter::identities(
            &schema.identity_field,
            batch.iter().map(|t| t.operation.identity()),
        );
        let snapshot = with_timeout(
            self.call_timeout,
            sink.fetch(schema, &filter, Origin::Actual),
        )
        .await
        .map_err(|e| format!("verification read failed: {e}"))?;

        let mut records = HashMap::with_capacity(snapshot.len());
        for record in snapshot.records() {
            if records
                .insert(record.identity.clone(), record.clone())
                .is_some()
            {
                return Err(format!("identity {} appears more than once", record.identity));
            }
        }
        Ok(records)
    }
}

fn group_by_kind<'t, 'a>(touched: &'t [Touched<'a>]) -> Vec<(&'a str, Vec<&'t Touched<'a>>)> {
    let mut groups: Vec<(&'a str, Vec<&'t Touched<'a>>)> = Vec::new();
    for item in touched {
        let kind = item.operation.kind().as_str();
        match groups.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, items)) => items.push(item),
            None => groups.push((kind, vec![item])),
        }
    }
    groups
}

fn mismatch(detail: impl Into<String>) -> Outcome {
    Outcome::VerificationMismatch {
        detail: detail.into(),
    }
}

/// Compare what the operation intended with what was read back.
fn check(schema: &EntitySchema, operation: &Operation, found: Option<&Record>) -> Outcome {
    match (operation, found) {
        (Operation::Delete(_), None) => Outcome::Verified,
        (Operation::Delete(_), Some(_)) => mismatch("record still present after delete"),
        (Operation::Create(_) | Operation::Update(_), None) => {
            mismatch(format!("record missing after {}", operation.name()))
        }
        (Operation::Create(op), Some(actual)) => {
            differing(schema.delta(&op.record, actual).keys().cloned().collect())
        }
        (Operation::Update(op), Some(actual)) => differing(
            op.changed_fields
                .iter()
                .filter(|(name, wanted)| {
                    let current = actual.get(name).unwrap_or(&serde_json::Value::Null);
                    !schema.equivalent(name, wanted, current)
                })
                .map(|(name, _)| name.clone())
                .collect(),
        ),
        (Operation::NoOp(_), _) => Outcome::SkippedNoop,
    }
}

fn differing(fields: Vec<String>) -> Outcome {
    if fields.is_empty() {
        Outcome::Verified
    } else {
        mismatch(format!("fields differ: {}", fields.join(", ")))
    }
}
