//! Schema definition and validation.
//!
//! A schema names every user collection, its known fields, its secondary
//! indexes, the conflict strategy the sync engine applies to it and the
//! endpoint it syncs with. Payloads are validated before any write happens.

use crate::{error::Result, reconcile::ConflictStrategy, CollectionName, Error, SchemaVersion};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Collection holding the sync queue.
pub const SYNC_QUEUE: &str = "sync_queue";
/// Collection holding the audit trail.
pub const AUDIT_TRAILS: &str = "audit_trails";
/// Holding area for conflicts awaiting a human decision.
pub const SYNC_CONFLICTS: &str = "sync_conflicts";
/// Engine bookkeeping (identity seeds, counters).
pub const META: &str = "_meta";

/// Names user schemas may not claim.
pub const RESERVED_COLLECTIONS: [&str; 4] = [SYNC_QUEUE, AUDIT_TRAILS, SYNC_CONFLICTS, META];

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// ISO-8601 string
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
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value
                .as_str()
                .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
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

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// How a collection's data originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    /// Captured in the field, pushed to the authority
    #[default]
    FieldData,
    /// Owned by the authority, pulled at the start of every sync pass
    Reference,
}

/// Schema for a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    /// Collection name
    pub name: CollectionName,
    /// Known field definitions (unknown fields are allowed)
    pub fields: Vec<FieldDef>,
    /// Fields with a secondary index
    #[serde(default)]
    pub indexes: Vec<String>,
    /// Conflict policy applied on a 409
    #[serde(default)]
    pub strategy: ConflictStrategy,
    /// Field data or reference data
    #[serde(default)]
    pub kind: CollectionKind,
    /// Endpoint path on the authority, `/api/<name>` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl CollectionSchema {
    /// Create a new field-data collection schema using `manual_merge`.
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
            indexes: Vec::new(),
            strategy: ConflictStrategy::default(),
            kind: CollectionKind::FieldData,
            endpoint: None,
        }
    }

    /// Declare a secondary index on a field.
    pub fn with_index(mut self, field: impl Into<String>) -> Self {
        self.indexes.push(field.into());
        self
    }

    /// Set the conflict strategy.
    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Mark as authority-owned reference data.
    pub fn reference(mut self) -> Self {
        self.kind = CollectionKind::Reference;
        self
    }

    /// Override the endpoint path.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Endpoint path on the remote authority.
    pub fn endpoint_path(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("/api/{}", self.name))
    }

    /// Whether `field` has a secondary index.
    pub fn is_indexed(&self, field: &str) -> bool {
        self.indexes.iter().any(|f| f == field)
    }

    /// Whether this collection is pulled as reference data.
    pub fn is_reference(&self) -> bool {
        self.kind == CollectionKind::Reference
    }

    /// Validate a complete payload (create).
    pub fn validate_payload(&self, payload: &Map<String, Value>) -> Result<()> {
        for field in &self.fields {
            field.validate(payload.get(&field.name))?;
        }
        Ok(())
    }

    /// Validate the fields present in a partial payload (update).
    pub fn validate_partial(&self, partial: &Map<String, Value>) -> Result<()> {
        for field in &self.fields {
            if let Some(value) = partial.get(&field.name) {
                field.validate(Some(value))?;
            }
        }
        Ok(())
    }
}

/// Schema for the entire store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version for migrations
    pub version: SchemaVersion,
    /// Collection schemas by name
    pub collections: BTreeMap<CollectionName, CollectionSchema>,
}

impl Schema {
    /// Create a new schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            collections: BTreeMap::new(),
        }
    }

    /// Add a collection to the schema.
    pub fn add_collection(&mut self, collection: CollectionSchema) -> &mut Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    /// Builder-style method to add a collection.
    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.add_collection(collection);
        self
    }

    /// Get a collection schema by name.
    pub fn get_collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }

    /// Get a collection schema or fail with [`Error::CollectionNotFound`].
    pub fn collection(&self, name: &str) -> Result<&CollectionSchema> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    /// Conflict strategy for a collection. Unknown collections get `manual_merge`.
    pub fn strategy_for(&self, name: &str) -> ConflictStrategy {
        self.collections
            .get(name)
            .map(|c| c.strategy)
            .unwrap_or_default()
    }

    /// Collections pulled as reference data, in name order.
    pub fn reference_collections(&self) -> impl Iterator<Item = &CollectionSchema> {
        self.collections.values().filter(|c| c.is_reference())
    }

    /// Check names and indexes before the schema is handed to storage.
    pub fn validate(&self) -> Result<()> {
        for (name, collection) in &self.collections {
            if RESERVED_COLLECTIONS.contains(&name.as_str()) {
                return Err(Error::InvalidSchema(format!(
                    "collection name '{name}' is reserved"
                )));
            }
            if name != &collection.name {
                return Err(Error::InvalidSchema(format!(
                    "collection registered as '{name}' is named '{}'",
                    collection.name
                )));
            }
            if !is_identifier(name) {
                return Err(Error::InvalidSchema(format!(
                    "collection name '{name}' must match [A-Za-z0-9_]+"
                )));
            }
            for field in &collection.indexes {
                if !is_identifier(field) {
                    return Err(Error::InvalidSchema(format!(
                        "index field '{field}' on '{name}' must match [A-Za-z0-9_]+"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
