//! The audit trail.
//!
//! Append-only record of every local mutation, every pull overwrite and every
//! conflict resolution. Entries are written in the same batch as the change
//! they describe and are never updated or deleted afterwards.
//!
//! The [`AuditTrail`] view is for diagnostics and export. Nothing in the
//! engine reads it back to make decisions.

use crate::error::Result;
use crate::mutation::{MutationContext, Stamp};
use crate::queue::QueueOperation;
use crate::record::value_hash;
use crate::schema::AUDIT_TRAILS;
use crate::store::LocalStore;
use crate::{CollectionName, DeviceId, RecordId, SessionId, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub use crate::reconcile::ConflictNote;

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOperation {
    Create,
    Update,
    Delete,
    /// Local copy overwritten by the authority during a pull
    Sync,
    /// A conflict was resolved or deferred
    Conflict,
}

impl From<QueueOperation> for AuditOperation {
    fn from(op: QueueOperation) -> Self {
        match op {
            QueueOperation::Create => AuditOperation::Create,
            QueueOperation::Update => AuditOperation::Update,
            QueueOperation::Delete => AuditOperation::Delete,
        }
    }
}

/// A GPS fix attached to captured data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsLocation {
    pub latitude: f64,
    pub longitude: f64,
    /// Metres
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

impl GpsLocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
            captured_at: None,
        }
    }

    pub fn with_accuracy(mut self, metres: f64) -> Self {
        self.accuracy = Some(metres);
        self
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub device_id: DeviceId,
    pub collector_id: SessionId,
    /// Checksum over the operation and both values
    pub integrity_hash: String,
    /// Store-wide write order
    pub sequence: u64,
    pub object_store: CollectionName,
    pub record_id: RecordId,
    pub operation: AuditOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps_location: Option<GpsLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictNote>,
}

impl AuditEntry {
    pub(crate) fn new(
        stamp: &Stamp,
        object_store: impl Into<CollectionName>,
        record_id: impl Into<RecordId>,
        operation: AuditOperation,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            version: 1,
            created_at: stamp.now,
            updated_at: stamp.now,
            device_id: stamp.device_id.clone(),
            collector_id: stamp.session_id.clone(),
            integrity_hash: String::new(),
            sequence: stamp.sequence,
            object_store: object_store.into(),
            record_id: record_id.into(),
            operation,
            old_value: None,
            new_value: None,
            user_id: stamp.user_id.clone(),
            session_id: stamp.session_id.clone(),
            gps_location: None,
            reason: None,
            conflict: None,
        }
    }

    pub(crate) fn with_values(mut self, old_value: Option<Value>, new_value: Option<Value>) -> Self {
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }

    pub(crate) fn with_context(mut self, ctx: &MutationContext) -> Self {
        if ctx.user_id.is_some() {
            self.user_id = ctx.user_id.clone();
        }
        self.gps_location = ctx.gps_location;
        self.reason = ctx.reason.clone();
        self
    }

    pub(crate) fn with_conflict(mut self, note: ConflictNote) -> Self {
        self.conflict = Some(note);
        self
    }

    /// Stamp the integrity hash. Call last.
    pub(crate) fn seal(mut self) -> Self {
        self.integrity_hash = self.content_hash();
        self
    }

    fn content_hash(&self) -> String {
        value_hash(&json!({
            "operation": self.operation,
            "oldValue": self.old_value,
            "newValue": self.new_value,
            "conflict": self.conflict,
        }))
    }

    /// Whether the entry still matches its hash.
    pub fn is_intact(&self) -> bool {
        self.integrity_hash == self.content_hash()
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Read-only view over the `audit_trails` collection of a [`LocalStore`].
#[derive(Debug, Clone, Copy)]
pub struct AuditTrail<'a> {
    store: &'a LocalStore,
}

impl<'a> AuditTrail<'a> {
    pub(crate) fn new(store: &'a LocalStore) -> Self {
        Self { store }
    }

    /// Every entry in write order.
    pub async fn entries(&self) -> Result<Vec<AuditEntry>> {
        self.store.ensure_open()?;
        let values = self.store.backend().get_all(AUDIT_TRAILS).await?;
        parse_sorted(values)
    }

    /// Entries about one record, in write order.
    pub async fn entries_for(&self, collection: &str, record_id: &str) -> Result<Vec<AuditEntry>> {
        self.store.ensure_open()?;
        let values = self
            .store
            .backend()
            .scan_index(AUDIT_TRAILS, "recordId", &Value::from(record_id))
            .await?;
        let mut entries = parse_sorted(values)?;
        entries.retain(|e| e.object_store == collection);
        Ok(entries)
    }

    /// The whole trail as a JSON array, for compliance export.
    pub async fn export_json(&self) -> Result<String> {
        let entries = self.entries().await?;
        Ok(serde_json::to_string_pretty(&entries)?)
    }
}

fn parse_sorted(values: Vec<Value>) -> Result<Vec<AuditEntry>> {
    let mut entries = values
        .into_iter()
        .map(AuditEntry::from_value)
        .collect::<Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.sequence);
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{ConflictResolution, ConflictStrategy, Winner};

    fn stamp() -> Stamp {
        Stamp {
            now: Utc::now(),
            device_id: "device-1".into(),
            session_id: "session-1".into(),
            sequence: 7,
            user_id: Some("default-user".into()),
        }
    }

    #[test]
    fn context_overrides_default_user_and_adds_gps() {
        let ctx = MutationContext::new()
            .with_user("supervisor")
            .with_gps(GpsLocation::new(-0.1, 34.7).with_accuracy(5.0))
            .with_reason("correction");

        let entry = AuditEntry::new(&stamp(), "samples", "s-1", AuditOperation::Update)
            .with_context(&ctx)
            .seal();

        assert_eq!(entry.user_id.as_deref(), Some("supervisor"));
        assert_eq!(entry.gps_location.unwrap().accuracy, Some(5.0));
        assert_eq!(entry.reason.as_deref(), Some("correction"));
        assert_eq!(entry.session_id, "session-1");
        assert!(entry.is_intact());
    }

    #[test]
    fn conflict_entries_carry_the_note() {
        let entry = AuditEntry::new(&stamp(), "participants", "p-1", AuditOperation::Conflict)
            .with_values(Some(json!({"v": 1})), Some(json!({"v": 2})))
            .with_conflict(ConflictNote {
                strategy: ConflictStrategy::ClientWins,
                resolution: ConflictResolution::Resolved,
                winner: Some(Winner::Local),
            })
            .seal();

        let value = entry.to_value().unwrap();
        assert_eq!(value["operation"], "CONFLICT");
        assert_eq!(value["conflict"]["resolution"], "resolved");
        assert_eq!(value["conflict"]["winner"], "local");
    }

    #[test]
    fn tampering_breaks_the_hash() {
        let mut entry = AuditEntry::new(&stamp(), "households", "hh-1", AuditOperation::Delete)
            .with_values(Some(json!({"headName": "Amina"})), None)
            .seal();
        assert!(entry.is_intact());

        entry.old_value = Some(json!({"headName": "someone else"}));
        assert!(!entry.is_intact());
    }

    #[test]
    fn queue_operations_map_onto_audit_operations() {
        assert_eq!(AuditOperation::from(QueueOperation::Create), AuditOperation::Create);
        assert_eq!(AuditOperation::from(QueueOperation::Delete), AuditOperation::Delete);
    }
}
