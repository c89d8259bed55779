//! Record types: a field map with one designated identity.

use crate::{error::Result, EntityKind, Error, FieldMap};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical string form of an identity field value.
///
/// Identities compare as strings so that `1` in a relational row and `"1"`
/// in a provider payload refer to the same logical record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Create an identity from an already-canonical string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derive an identity from a JSON field value.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(s) if !s.is_empty() => Ok(Self(s.clone())),
            serde_json::Value::Number(n) => Ok(Self(n.to_string())),
            serde_json::Value::Bool(b) => Ok(Self(b.to_string())),
            other => Err(Error::InvalidIdentity(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A record of one entity kind.
///
/// `fields` always contains the identity field as well; `identity` is its
/// canonical form, cached so indexes never have to re-derive it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Entity kind this record belongs to
    pub kind: EntityKind,
    /// Canonical identity
    pub identity: Identity,
    /// All fields, identity included
    pub fields: FieldMap,
}

impl Record {
    /// Build a record from its fields, extracting the identity.
    pub fn from_fields(
        kind: impl Into<EntityKind>,
        identity_field: &str,
        fields: FieldMap,
    ) -> Result<Self> {
        let kind = kind.into();
        let value = fields
            .get(identity_field)
            .ok_or_else(|| Error::MissingIdentity {
                kind: kind.clone(),
                field: identity_field.to_string(),
            })?;
        let identity = Identity::from_value(value)?;

        Ok(Self {
            kind,
            identity,
            fields,
        })
    }

    /// Build a record from a JSON value, which must be an object.
    pub fn from_value(
        kind: impl Into<EntityKind>,
        identity_field: &str,
        value: serde_json::Value,
    ) -> Result<Self> {
        match value {
            serde_json::Value::Object(fields) => Self::from_fields(kind, identity_field, fields),
            _ => Err(Error::NotAnObject),
        }
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }

    /// Merge changed fields into this record.
    ///
    /// Fields not mentioned in `changed` are left untouched.
    pub fn merge(&mut self, identity_field: &str, changed: &FieldMap) -> Result<()> {
        if changed.contains_key(identity_field) {
            return Err(Error::IdentityMutation(identity_field.to_string()));
        }
        for (name, value) in changed {
            self.fields.insert(name.clone(), value.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(value: serde_json::Value) -> Record {
        Record::from_value("user", "id", value).unwrap()
    }

    #[test]
    fn numeric_and_string_identities_agree() {
        let a = user(json!({"id": 1, "name": "A"}));
        let b = user(json!({"id": "1", "name": "A"}));
        assert_eq!(a.identity, b.identity);
        assert_eq!(a.identity.as_str(), "1");
    }

    #[test]
    fn missing_identity_is_rejected() {
        let result = Record::from_value("user", "id", json!({"name": "A"}));
        assert!(matches!(result, Err(Error::MissingIdentity { field, .. }) if field == "id"));
    }

    #[test]
    fn null_and_empty_identities_are_rejected() {
        assert!(matches!(
            Record::from_value("user", "id", json!({"id": null})),
            Err(Error::InvalidIdentity(_))
        ));
        assert!(matches!(
            Record::from_value("user", "id", json!({"id": ""})),
            Err(Error::InvalidIdentity(_))
        ));
        assert!(matches!(
            Record::from_value("user", "id", json!({"id": [1]})),
            Err(Error::InvalidIdentity(_))
        ));
    }

    #[test]
    fn non_object_is_rejected() {
        let result = Record::from_value("user", "id", json!([1, 2]));
        assert!(matches!(result, Err(Error::NotAnObject)));
    }

    #[test]
    fn merge_keeps_untouched_fields() {
        let mut record = user(json!({"id": 2, "name": "B-old", "createdAt": 5}));
        let mut changed = FieldMap::new();
        changed.insert("name".into(), json!("B"));

        record.merge("id", &changed).unwrap();

        assert_eq!(record.get("name"), Some(&json!("B")));
        assert_eq!(record.get("createdAt"), Some(&json!(5)));
    }

    #[test]
    fn merge_refuses_identity_change() {
        let mut record = user(json!({"id": 2, "name": "B"}));
        let mut changed = FieldMap::new();
        changed.insert("id".into(), json!(3));

        let result = record.merge("id", &changed);
        assert!(matches!(result, Err(Error::IdentityMutation(f)) if f == "id"));
        assert_eq!(record.identity.as_str(), "2");
    }

    #[test]
    fn serialization_roundtrip() {
        let record = user(json!({"id": "u-1", "email": "a@example.com"}));
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"identity\":\"u-1\""));
        let parsed: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(record, parsed);
    }
}
