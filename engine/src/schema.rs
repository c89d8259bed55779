//! Entity schemas, field comparators and the entity catalog.
//!
//! Schemas describe the fields of an entity kind, validate records, and
//! decide when two field values are equivalent for diffing purposes.

use crate::{error::Result, EntityKind, Error, FieldMap, Record};
use serde::{Deserialize, Serialize};

/// Default tolerance for decimal (monetary) fields: half a cent.
pub const DEFAULT_DECIMAL_TOLERANCE: f64 = 0.005;

/// Float noise allowed on top of a tolerance so that `10.00` vs `10.005`
/// still counts as within half a cent.
const TOLERANCE_SLACK: f64 = 1e-9;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    /// Monetary or fixed-point value; may arrive as a number or a numeric string
    Decimal,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Decimal => write!(f, "Decimal"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// How two values of a field are compared.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum Comparator {
    /// Values must be equal (numbers compare numerically)
    Exact,
    /// Numeric values within `epsilon` of each other are equal
    Tolerance { epsilon: f64 },
}

impl Comparator {
    /// Check whether two values are equivalent under this comparator.
    pub fn equivalent(&self, a: &serde_json::Value, b: &serde_json::Value) -> bool {
        match self {
            Comparator::Exact => exact_eq(a, b),
            Comparator::Tolerance { epsilon } => match (numeric(a), numeric(b)) {
                (Some(x), Some(y)) => (x - y).abs() <= epsilon + TOLERANCE_SLACK,
                _ => exact_eq(a, b),
            },
        }
    }
}

fn exact_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a, b) {
        (serde_json::Value::Number(x), serde_json::Value::Number(y)) => {
            x == y || matches!((x.as_f64(), y.as_f64()), (Some(x), Some(y)) if x == y)
        }
        _ => a == b,
    }
}

fn numeric(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Definition of a field in an entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    #[serde(default)]
    pub required: bool,
    /// Comparator override; defaults by type when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparator: Option<Comparator>,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            comparator: None,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            comparator: None,
        }
    }

    /// Override the comparator used for this field.
    pub fn with_comparator(mut self, comparator: Comparator) -> Self {
        self.comparator = Some(comparator);
        self
    }

    /// The comparator in effect for this field.
    pub fn comparator(&self) -> Comparator {
        match (self.comparator, self.field_type) {
            (Some(comparator), _) => comparator,
            (None, FieldType::Decimal) => Comparator::Tolerance {
                epsilon: DEFAULT_DECIMAL_TOLERANCE,
            },
            (None, _) => Comparator::Exact,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None | Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Decimal => numeric(value).is_some(),
            FieldType::Bool => value.is_boolean(),
            // Epoch millis or an RFC 3339 string
            FieldType::Timestamp => value.is_u64() || value.is_i64() || value.is_string(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Schema for one entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySchema {
    /// Entity kind tag
    pub kind: EntityKind,
    /// Field whose value identifies a record
    pub identity_field: String,
    /// Declared fields (the identity field need not be listed)
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    /// Whether creates of distinct identities may run concurrently
    #[serde(default)]
    pub independent_creates: bool,
}

impl EntitySchema {
    /// Create a new entity schema.
    pub fn new(
        kind: impl Into<EntityKind>,
        identity_field: impl Into<String>,
        fields: Vec<FieldDef>,
    ) -> Self {
        Self {
            kind: kind.into(),
            identity_field: identity_field.into(),
            fields,
            independent_creates: false,
        }
    }

    /// Builder-style toggle for concurrent creates.
    pub fn with_independent_creates(mut self, independent: bool) -> Self {
        self.independent_creates = independent;
        self
    }

    /// Get a field definition by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Build a record of this kind from a JSON object.
    pub fn record(&self, value: serde_json::Value) -> Result<Record> {
        Record::from_value(self.kind.clone(), &self.identity_field, value)
    }

    /// Validate a record against this schema.
    pub fn validate(&self, record: &Record) -> Result<()> {
        if record.kind != self.kind {
            return Err(Error::MixedEntityKinds {
                expected: self.kind.clone(),
                got: record.kind.clone(),
            });
        }

        for field in &self.fields {
            field.validate(record.get(&field.name))?;
        }

        Ok(())
    }

    /// Check whether a single field's values are equivalent.
    pub fn equivalent(&self, field: &str, a: &serde_json::Value, b: &serde_json::Value) -> bool {
        self.field(field)
            .map(FieldDef::comparator)
            .unwrap_or(Comparator::Exact)
            .equivalent(a, b)
    }

    /// Compute the fields of `desired` that `actual` does not already match.
    ///
    /// The identity field is never part of the delta, and fields that only
    /// exist on `actual` are ignored.
    pub fn delta(&self, desired: &Record, actual: &Record) -> FieldMap {
        let mut changed = FieldMap::new();

        for (name, wanted) in &desired.fields {
            if *name == self.identity_field {
                continue;
            }
            let matches = match actual.get(name) {
                Some(current) => self.equivalent(name, wanted, current),
                None => wanted.is_null(),
            };
            if !matches {
                changed.insert(name.clone(), wanted.clone());
            }
        }

        changed
    }
}

/// Registry of entity schemas in dependency order (parents first).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    entities: Vec<EntitySchema>,
}

impl Catalog {
    /// Create a catalog; the vector order is the topological kind order.
    pub fn new(entities: Vec<EntitySchema>) -> Self {
        Self { entities }
    }

    /// Get a schema by kind.
    pub fn get(&self, kind: &str) -> Result<&EntitySchema> {
        self.entities
            .iter()
            .find(|e| e.kind == kind)
            .ok_or_else(|| Error::UnknownEntity(kind.to_string()))
    }

    /// Position of a kind in the dependency order.
    pub fn rank(&self, kind: &str) -> Option<usize> {
        self.entities.iter().position(|e| e.kind == kind)
    }

    /// All kinds in dependency order.
    pub fn kinds(&self) -> impl Iterator<Item = &EntityKind> {
        self.entities.iter().map(|e| &e.kind)
    }

    /// Sort the given kinds into dependency order.
    pub fn order(&self, kinds: &[EntityKind]) -> Result<Vec<EntityKind>> {
        let mut ranked = kinds
            .iter()
            .map(|k| {
                self.rank(k)
                    .map(|r| (r, k.clone()))
                    .ok_or_else(|| Error::UnknownEntity(k.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        ranked.sort_by_key(|(rank, _)| *rank);
        ranked.dedup_by_key(|(rank, _)| *rank);
        Ok(ranked.into_iter().map(|(_, k)| k).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session_schema() -> EntitySchema {
        EntitySchema::new(
            "session",
            "id",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::required("price", FieldType::Decimal),
                FieldDef::optional("seats", FieldType::Int),
            ],
        )
    }

    #[test]
    fn validate_valid_record() {
        let schema = session_schema();
        let record = schema
            .record(json!({"id": 1, "title": "Yoga", "price": "12.50"}))
            .unwrap();
        assert!(schema.validate(&record).is_ok());
    }

    #[test]
    fn validate_missing_required_field() {
        let schema = session_schema();
        let record = schema.record(json!({"id": 1, "price": 10})).unwrap();
        let result = schema.validate(&record);
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "title"));
    }

    #[test]
    fn validate_wrong_type() {
        let schema = session_schema();
        let record = schema
            .record(json!({"id": 1, "title": "Yoga", "price": 10, "seats": "ten"}))
            .unwrap();
        let result = schema.validate(&record);
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "seats"));
    }

    #[test]
    fn validate_foreign_kind() {
        let schema = session_schema();
        let record = Record::from_value("user", "id", json!({"id": 1})).unwrap();
        assert!(matches!(
            schema.validate(&record),
            Err(Error::MixedEntityKinds { .. })
        ));
    }

    #[test]
    fn decimal_tolerance() {
        let schema = session_schema();
        assert!(schema.equivalent("price", &json!(10.00), &json!("10.004")));
        assert!(schema.equivalent("price", &json!("12.50"), &json!(12.5)));
        assert!(schema.equivalent("price", &json!(10.00), &json!(10.005)));
        assert!(!schema.equivalent("price", &json!(10.00), &json!(10.02)));
    }

    #[test]
    fn exact_comparison_is_numeric_for_numbers() {
        let schema = session_schema();
        assert!(schema.equivalent("seats", &json!(3), &json!(3.0)));
        assert!(!schema.equivalent("title", &json!("a"), &json!("A")));
        // Undeclared fields compare exactly
        assert!(!schema.equivalent("notes", &json!("x"), &json!("y")));
    }

    #[test]
    fn comparator_override() {
        let field = FieldDef::required("lat", FieldType::Float)
            .with_comparator(Comparator::Tolerance { epsilon: 0.1 });
        assert!(field.comparator().equivalent(&json!(1.0), &json!(1.05)));
    }

    #[test]
    fn delta_carries_only_changed_fields() {
        let schema = session_schema();
        let desired = schema
            .record(json!({"id": 2, "title": "B", "price": 10, "seats": 4}))
            .unwrap();
        let actual = schema
            .record(json!({"id": 2, "title": "B-old", "price": "10.001", "seats": 4, "updatedAt": 99}))
            .unwrap();

        let delta = schema.delta(&desired, &actual);

        assert_eq!(delta.len(), 1);
        assert_eq!(delta.get("title"), Some(&json!("B")));
        assert!(!delta.contains_key("id"));
        assert!(!delta.contains_key("updatedAt"));
    }

    #[test]
    fn delta_treats_missing_as_null() {
        let schema = session_schema();
        let desired = schema
            .record(json!({"id": 2, "title": "B", "price": 1, "seats": null}))
            .unwrap();
        let actual = schema.record(json!({"id": 2, "title": "B", "price": 1})).unwrap();
        assert!(schema.delta(&desired, &actual).is_empty());
    }

    #[test]
    fn catalog_orders_kinds() {
        let catalog = Catalog::new(vec![
            EntitySchema::new("user", "email", vec![]),
            EntitySchema::new("profile", "userEmail", vec![]),
            EntitySchema::new("slot", "id", vec![]),
        ]);

        let ordered = catalog
            .order(&["slot".to_string(), "user".to_string(), "user".to_string()])
            .unwrap();
        assert_eq!(ordered, vec!["user".to_string(), "slot".to_string()]);

        assert!(matches!(
            catalog.order(&["ghost".to_string()]),
            Err(Error::UnknownEntity(k)) if k == "ghost"
        ));
    }

    #[test]
    fn schema_serialization() {
        let schema = session_schema().with_independent_creates(true);
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains("\"identityField\":\"id\""));
        let parsed: EntitySchema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, parsed);
    }
}
