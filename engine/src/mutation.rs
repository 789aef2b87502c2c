//! Local mutations.
//!
//! A [`Mutation`] is the one unit every create, update and delete goes
//! through. Building one always yields the record write, its sync queue entry
//! and its audit entry, and [`Mutation::into_batch`] hands all three to the
//! storage backend as a single atomic [`WriteBatch`].

use crate::audit::{AuditEntry, AuditOperation, GpsLocation};
use crate::error::{Error, Result};
use crate::queue::{QueueOperation, SyncQueueItem};
use crate::reconcile::ConflictStrategy;
use crate::record::Record;
use crate::schema::{AUDIT_TRAILS, SYNC_QUEUE};
use crate::storage::WriteBatch;
use crate::{CollectionName, DeviceId, RecordId, SessionId};
use chrono::{DateTime, Utc};
use serde_json::json;

/// Caller-supplied context attached to a mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationContext {
    /// Acting user, overrides the store-wide default
    pub user_id: Option<String>,
    /// Where the data was captured
    pub gps_location: Option<GpsLocation>,
    /// Free-text justification, recorded in the audit trail
    pub reason: Option<String>,
    /// Overrides the collection's conflict strategy for this write's queue entry
    pub conflict_resolution: Option<ConflictStrategy>,
    /// Queue priority, lower drains first
    pub priority: i32,
}

impl MutationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_gps(mut self, location: GpsLocation) -> Self {
        self.gps_location = Some(location);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_conflict_resolution(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_resolution = Some(strategy);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Who and when, shared by every bookkeeping entry written in one step.
#[derive(Debug, Clone)]
pub(crate) struct Stamp {
    pub now: DateTime<Utc>,
    pub device_id: DeviceId,
    pub session_id: SessionId,
    /// Store-wide ordering key
    pub sequence: u64,
    /// Store-wide default user
    pub user_id: Option<String>,
}

/// A local write together with its bookkeeping.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub collection: CollectionName,
    pub record_id: RecordId,
    pub operation: QueueOperation,
    /// Record after the write, `None` for deletes
    pub record: Option<Record>,
    pub queue_item: SyncQueueItem,
    pub audit_entry: AuditEntry,
}

impl Mutation {
    /// A freshly created record.
    pub(crate) fn create(
        collection: &str,
        record: Record,
        stamp: &Stamp,
        ctx: &MutationContext,
        max_retries: u32,
    ) -> Result<Self> {
        Self::build(
            QueueOperation::Create,
            collection,
            None,
            Some(record),
            stamp,
            ctx,
            max_retries,
        )
    }

    /// An update from `before` to `after`.
    pub(crate) fn update(
        collection: &str,
        before: &Record,
        after: Record,
        stamp: &Stamp,
        ctx: &MutationContext,
        max_retries: u32,
    ) -> Result<Self> {
        Self::build(
            QueueOperation::Update,
            collection,
            Some(before),
            Some(after),
            stamp,
            ctx,
            max_retries,
        )
    }

    /// Removal of `before`.
    pub(crate) fn delete(
        collection: &str,
        before: &Record,
        stamp: &Stamp,
        ctx: &MutationContext,
        max_retries: u32,
    ) -> Result<Self> {
        Self::build(
            QueueOperation::Delete,
            collection,
            Some(before),
            None,
            stamp,
            ctx,
            max_retries,
        )
    }

    fn build(
        operation: QueueOperation,
        collection: &str,
        before: Option<&Record>,
        after: Option<Record>,
        stamp: &Stamp,
        ctx: &MutationContext,
        max_retries: u32,
    ) -> Result<Self> {
        let old_value = before.map(Record::to_value).transpose()?;
        let new_value = after.as_ref().map(Record::to_value).transpose()?;

        let subject = after
            .as_ref()
            .or(before)
            .ok_or_else(|| Error::InvalidPayload("mutation without a record".into()))?;
        let (record_id, record_version) = (subject.id.clone(), subject.version);

        // Deletes carry just the id.
        let data = match &new_value {
            Some(value) => value.clone(),
            None => json!({ "id": record_id }),
        };

        let mut queue_item = SyncQueueItem::new(
            stamp,
            operation,
            collection,
            record_id.clone(),
            record_version,
            data,
            max_retries,
        );
        queue_item.priority = ctx.priority;
        queue_item.conflict_resolution = ctx.conflict_resolution;
        queue_item.rehash();

        let audit_entry =
            AuditEntry::new(stamp, collection, record_id.clone(), AuditOperation::from(operation))
                .with_values(old_value, new_value)
                .with_context(ctx)
                .seal();

        Ok(Self {
            collection: collection.to_string(),
            record_id,
            operation,
            record: after,
            queue_item,
            audit_entry,
        })
    }

    /// Record write, queue write and audit write, in that order.
    pub fn into_batch(self) -> Result<WriteBatch> {
        let mut batch = WriteBatch::new();
        match &self.record {
            Some(record) => batch.put(&self.collection, &self.record_id, record.to_value()?),
            None => batch.delete(&self.collection, &self.record_id),
        }
        batch.put(SYNC_QUEUE, &self.queue_item.id, self.queue_item.to_value()?);
        batch.put(AUDIT_TRAILS, &self.audit_entry.id, self.audit_entry.to_value()?);
        Ok(batch)
    }
}
