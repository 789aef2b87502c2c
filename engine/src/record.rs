//! Record types for storing data.
//!
//! Every domain entity is a [`Record`]: the base bookkeeping fields shared by
//! all collections plus a flat map of business fields. On the wire and on disk
//! a record is a single camelCase JSON object with the business fields inlined.

use crate::{error::Result, DeviceId, Error, RecordId, SessionId, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Names of the base fields every record carries. These are owned by the
/// store and never treated as business data.
pub const BASE_FIELDS: [&str; 8] = [
    "id",
    "version",
    "syncStatus",
    "createdAt",
    "updatedAt",
    "deviceId",
    "collectorId",
    "integrityHash",
];

/// Replication state of a record or queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Written locally, not yet confirmed by the remote authority
    #[default]
    Pending,
    /// The remote authority accepted this exact version
    Synced,
    /// Pushing failed and will not be retried automatically
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Pending => write!(f, "pending"),
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Error => write!(f, "error"),
        }
    }
}

/// A versioned data record in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Client-generated, immutable identifier
    pub id: RecordId,
    /// Starts at 1, incremented on every local write
    pub version: Version,
    /// Replication state
    pub sync_status: SyncStatus,
    /// Creation time (client clock)
    pub created_at: DateTime<Utc>,
    /// Last write time (client clock)
    pub updated_at: DateTime<Utc>,
    /// Install that created the record
    pub device_id: DeviceId,
    /// Collection session that created the record
    pub collector_id: SessionId,
    /// Checksum of the business fields
    pub integrity_hash: String,
    /// Entity-specific fields, inlined when serialized
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create a fresh record at version 1, pending sync.
    pub fn new(
        id: impl Into<RecordId>,
        fields: Map<String, Value>,
        device_id: impl Into<DeviceId>,
        collector_id: impl Into<SessionId>,
        now: DateTime<Utc>,
    ) -> Self {
        let integrity_hash = integrity_hash(&fields);
        Self {
            id: id.into(),
            version: 1,
            sync_status: SyncStatus::Pending,
            created_at: now,
            updated_at: now,
            device_id: device_id.into(),
            collector_id: collector_id.into(),
            integrity_hash,
            fields,
        }
    }

    /// Merge a partial set of business fields into this record.
    ///
    /// Bumps the version, marks the record pending and restamps the hash.
    pub fn apply_update(&mut self, partial: Map<String, Value>, now: DateTime<Utc>) {
        for (key, value) in partial {
            self.fields.insert(key, value);
        }
        self.version += 1;
        self.sync_status = SyncStatus::Pending;
        self.updated_at = now;
        self.rehash();
    }

    /// Recompute the integrity hash from the current business fields.
    pub fn rehash(&mut self) {
        self.integrity_hash = integrity_hash(&self.fields);
    }

    /// Check the stored hash against the business fields.
    ///
    /// Returns the recomputed hash on mismatch.
    pub fn integrity_mismatch(&self) -> Option<String> {
        let actual = integrity_hash(&self.fields);
        (actual != self.integrity_hash).then_some(actual)
    }

    /// Fail with [`Error::Integrity`] if the record was corrupted at rest.
    pub fn verify_integrity(&self, collection: &str) -> Result<()> {
        match self.integrity_mismatch() {
            None => Ok(()),
            Some(actual) => Err(Error::Integrity {
                collection: collection.to_string(),
                id: self.id.clone(),
                expected: self.integrity_hash.clone(),
                actual,
            }),
        }
    }

    /// Get a business field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Parse a record from its stored JSON form.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Serialize to the stored JSON form.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Drop base fields from caller-supplied data, leaving business fields only.
pub fn business_fields(mut data: Map<String, Value>) -> Map<String, Value> {
    for name in BASE_FIELDS {
        if data.remove(name).is_some() {
            tracing::debug!(field = name, "ignoring store-owned field in payload");
        }
    }
    data
}

/// Checksum of a set of business fields.
///
/// Keys are hashed in sorted order so the result does not depend on map
/// ordering. This detects corruption at rest; it is not a signature.
pub fn integrity_hash(fields: &Map<String, Value>) -> String {
    let mut buf = Vec::with_capacity(128);
    write_canonical_object(fields, &mut buf);
    blake3::hash(&buf).to_hex().to_string()
}

/// Checksum of an arbitrary JSON value (used for queue and audit entries).
pub fn value_hash(value: &Value) -> String {
    let mut buf = Vec::with_capacity(128);
    write_canonical(value, &mut buf);
    blake3::hash(&buf).to_hex().to_string()
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => write_canonical_object(map, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}

fn write_canonical_object(map: &Map<String, Value>, out: &mut Vec<u8>) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    out.push(b'{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        out.extend_from_slice(Value::from(key.as_str()).to_string().as_bytes());
        out.push(b':');
        write_canonical(&map[key], out);
    }
    out.push(b'}');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn household() -> Record {
        Record::new(
            "hh-1",
            fields(json!({"headName": "Amina", "village": "Kisumu"})),
            "device-1",
            "session-1",
            Utc::now(),
        )
    }

    #[test]
    fn create_record() {
        let record = household();

        assert_eq!(record.id, "hh-1");
        assert_eq!(record.version, 1);
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.created_at, record.updated_at);
        assert!(record.verify_integrity("households").is_ok());
    }

    #[test]
    fn update_record() {
        let mut record = household();
        let before = record.integrity_hash.clone();
        record.sync_status = SyncStatus::Synced;

        record.apply_update(fields(json!({"village": "Kakamega"})), Utc::now());

        assert_eq!(record.version, 2);
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.field("village"), Some(&json!("Kakamega")));
        assert_eq!(record.field("headName"), Some(&json!("Amina")));
        assert_ne!(record.integrity_hash, before);
        assert!(record.verify_integrity("households").is_ok());
    }

    #[test]
    fn hash_ignores_key_order_and_timestamps() {
        let a = fields(json!({"a": 1, "b": {"y": true, "x": [1, 2]}}));
        let mut b = Map::new();
        b.insert("b".into(), json!({"x": [1, 2], "y": true}));
        b.insert("a".into(), json!(1));
        assert_eq!(integrity_hash(&a), integrity_hash(&b));

        let mut record = household();
        let hash = record.integrity_hash.clone();
        record.updated_at = Utc::now() + chrono::Duration::hours(1);
        record.rehash();
        assert_eq!(record.integrity_hash, hash);
    }

    #[test]
    fn tampered_record_fails_integrity() {
        let mut record = household();
        record
            .fields
            .insert("village".into(), json!("somewhere else"));

        let err = record.verify_integrity("households").unwrap_err();
        assert!(matches!(err, Error::Integrity { id, .. } if id == "hh-1"));
    }

    #[test]
    fn business_fields_strips_base_fields() {
        let data = fields(json!({
            "id": "forged",
            "version": 99,
            "syncStatus": "synced",
            "integrityHash": "x",
            "headName": "Amina"
        }));
        let cleaned = business_fields(data);
        assert_eq!(cleaned.len(), 1);
        assert!(cleaned.contains_key("headName"));
    }

    #[test]
    fn serialized_form_is_flat_camel_case() {
        let record = household();
        let value = record.to_value().unwrap();

        assert_eq!(value["syncStatus"], "pending");
        assert_eq!(value["headName"], "Amina");
        assert!(value.get("fields").is_none());
        assert!(value.get("deviceId").is_some());

        let parsed = Record::from_value(value).unwrap();
        assert_eq!(parsed, record);
    }
}
