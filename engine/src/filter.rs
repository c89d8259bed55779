//! Record filters.
//!
//! Deliberately not a query language: a conjunction of equality, membership
//! and containment predicates is something both a relational store and an
//! HTTP catalog can evaluate.

use crate::{Identity, Record};
use serde::{Deserialize, Serialize};

/// A single predicate over one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Predicate {
    /// Field equals value
    Eq {
        field: String,
        value: serde_json::Value,
    },
    /// Field equals one of the values
    In {
        field: String,
        values: Vec<serde_json::Value>,
    },
    /// String field contains a substring, or array field contains an element
    Contains {
        field: String,
        value: serde_json::Value,
    },
}

impl Predicate {
    /// The field this predicate inspects.
    pub fn field(&self) -> &str {
        match self {
            Predicate::Eq { field, .. } => field,
            Predicate::In { field, .. } => field,
            Predicate::Contains { field, .. } => field,
        }
    }

    /// Evaluate against a record.
    pub fn matches(&self, record: &Record) -> bool {
        let Some(current) = record.get(self.field()) else {
            return false;
        };
        match self {
            Predicate::Eq { value, .. } => loosely_equal(current, value),
            Predicate::In { values, .. } => values.iter().any(|v| loosely_equal(current, v)),
            Predicate::Contains { value, .. } => match (current, value) {
                (serde_json::Value::String(haystack), serde_json::Value::String(needle)) => {
                    haystack.contains(needle.as_str())
                }
                (serde_json::Value::Array(items), needle) => {
                    items.iter().any(|item| loosely_equal(item, needle))
                }
                _ => false,
            },
        }
    }
}

/// Compare scalars by their canonical identity text so `1` matches `"1"`.
fn loosely_equal(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    if a == b {
        return true;
    }
    match (Identity::from_value(a), Identity::from_value(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

/// A conjunction of predicates. The empty filter matches everything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    #[serde(default)]
    pub predicates: Vec<Predicate>,
}

impl Filter {
    /// Filter that matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter selecting the given identities.
    pub fn identities<'a>(
        identity_field: &str,
        identities: impl IntoIterator<Item = &'a Identity>,
    ) -> Self {
        Self::all().with(Predicate::In {
            field: identity_field.to_string(),
            values: identities
                .into_iter()
                .map(|i| serde_json::Value::String(i.to_string()))
                .collect(),
        })
    }

    /// Add a predicate.
    pub fn with(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Add an equality predicate.
    pub fn where_eq(self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.with(Predicate::Eq {
            field: field.into(),
            value,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Evaluate against a record.
    pub fn matches(&self, record: &Record) -> bool {
        self.predicates.iter().all(|p| p.matches(record))
    }
}
