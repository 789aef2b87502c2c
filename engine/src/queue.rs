//! The sync queue.
//!
//! Every local mutation appends one [`SyncQueueItem`] holding a full snapshot
//! of the record at enqueue time. The queue lives in the `sync_queue`
//! collection of the local store and is drained in `(priority, sequence)`
//! order by the [`SyncEngine`](crate::SyncEngine).
//!
//! Lifecycle of an item:
//!
//! ```text
//! pending ──push ok──────────────▶ synced   (terminal, prunable)
//!    │
//!    ├──failure, retries left───▶ pending  (retry_count + 1)
//!    ├──failure, retries spent──▶ error    (until retry())
//!    └──manual_merge conflict───▶ pending + held (until resolve_conflict())
//! ```

use crate::error::{Error, Result};
use crate::mutation::Stamp;
use crate::reconcile::{updated_at_of, ConflictStatus, ConflictStrategy};
use crate::record::{value_hash, SyncStatus};
use crate::schema::{SYNC_CONFLICTS, SYNC_QUEUE};
use crate::storage::WriteBatch;
use crate::store::LocalStore;
use crate::{CollectionName, DeviceId, RecordId, SessionId, Version};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

/// Default attempt ceiling for a queue item.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Note left on items an operator gave up on.
pub const DISCARDED_NOTE: &str = "discarded by operator";

/// Kind of change a queue item replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueOperation {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for QueueOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueOperation::Create => write!(f, "CREATE"),
            QueueOperation::Update => write!(f, "UPDATE"),
            QueueOperation::Delete => write!(f, "DELETE"),
        }
    }
}

/// One not-yet-confirmed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: String,
    /// Bumped on every bookkeeping change to the item itself
    pub version: Version,
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub device_id: DeviceId,
    pub collector_id: SessionId,
    /// Checksum of `data`
    pub integrity_hash: String,
    /// Store-wide enqueue order
    pub sequence: u64,
    pub operation: QueueOperation,
    pub object_store: CollectionName,
    pub record_id: RecordId,
    /// Version of the record this write produced
    pub record_version: Version,
    /// Full record snapshot (just the id for deletes)
    pub data: Value,
    /// Lower drains first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Overrides the collection's strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_resolution: Option<ConflictStrategy>,
    /// Push with the override flag on the next pass
    #[serde(default)]
    pub force_override: bool,
    /// Holding-area entry freezing this item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<String>,
}

impl SyncQueueItem {
    pub(crate) fn new(
        stamp: &Stamp,
        operation: QueueOperation,
        object_store: impl Into<CollectionName>,
        record_id: impl Into<RecordId>,
        record_version: Version,
        data: Value,
        max_retries: u32,
    ) -> Self {
        let integrity_hash = value_hash(&data);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            version: 1,
            sync_status: SyncStatus::Pending,
            created_at: stamp.now,
            updated_at: stamp.now,
            device_id: stamp.device_id.clone(),
            collector_id: stamp.session_id.clone(),
            integrity_hash,
            sequence: stamp.sequence,
            operation,
            object_store: object_store.into(),
            record_id: record_id.into(),
            record_version,
            data,
            priority: 0,
            retry_count: 0,
            max_retries,
            last_attempt: None,
            error_message: None,
            conflict_resolution: None,
            force_override: false,
            conflict_id: None,
        }
    }

    /// Drain order.
    pub fn order_key(&self) -> (i32, u64) {
        (self.priority, self.sequence)
    }

    /// Pending, whether or not a conflict holds it.
    pub fn is_live(&self) -> bool {
        self.sync_status == SyncStatus::Pending
    }

    /// Frozen by a `manual_merge` conflict.
    pub fn is_held(&self) -> bool {
        self.conflict_id.is_some()
    }

    /// Eligible for the next automatic drain.
    pub fn is_ready(&self) -> bool {
        self.is_live() && !self.is_held()
    }

    /// When the local side of this change happened.
    pub fn local_updated_at(&self) -> DateTime<Utc> {
        match self.operation {
            QueueOperation::Delete => self.created_at,
            _ => updated_at_of(&self.data).unwrap_or(self.created_at),
        }
    }

    pub fn rehash(&mut self) {
        self.integrity_hash = value_hash(&self.data);
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }

    pub(crate) fn mark_synced(&mut self, now: DateTime<Utc>) {
        self.sync_status = SyncStatus::Synced;
        self.conflict_id = None;
        self.force_override = false;
        self.last_attempt = Some(now);
        self.touch(now);
    }

    /// Count a failed attempt. Returns true once retries are exhausted.
    pub(crate) fn record_failure(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> bool {
        self.retry_count += 1;
        self.last_attempt = Some(now);
        self.error_message = Some(message.into());
        if self.retry_count >= self.max_retries {
            self.sync_status = SyncStatus::Error;
        }
        self.touch(now);
        self.sync_status == SyncStatus::Error
    }

    pub(crate) fn hold(&mut self, conflict_id: impl Into<String>, now: DateTime<Utc>) {
        self.conflict_id = Some(conflict_id.into());
        self.last_attempt = Some(now);
        self.touch(now);
    }

    pub(crate) fn release(&mut self, force_override: bool, now: DateTime<Utc>) {
        self.conflict_id = None;
        self.force_override = force_override;
        self.touch(now);
    }

    pub(crate) fn reset(&mut self, now: DateTime<Utc>) {
        self.sync_status = SyncStatus::Pending;
        self.retry_count = 0;
        self.error_message = None;
        self.touch(now);
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn record_key(item: &SyncQueueItem) -> (CollectionName, RecordId) {
    (item.object_store.clone(), item.record_id.clone())
}

/// Keep each record's entries in enqueue order even when a later entry
/// carries a higher priority.
fn in_record_order(items: Vec<SyncQueueItem>) -> Vec<SyncQueueItem> {
    let keys: Vec<_> = items.iter().map(record_key).collect();
    let mut groups: HashMap<(CollectionName, RecordId), VecDeque<SyncQueueItem>> = HashMap::new();
    for item in items {
        groups.entry(record_key(&item)).or_default().push_back(item);
    }
    for group in groups.values_mut() {
        group.make_contiguous().sort_by_key(|item| item.sequence);
    }
    keys.into_iter()
        .filter_map(|key| groups.get_mut(&key).and_then(VecDeque::pop_front))
        .collect()
}

fn sorted(mut items: Vec<SyncQueueItem>) -> Vec<SyncQueueItem> {
    items.sort_by_key(SyncQueueItem::order_key);
    items
}

fn parse_all(values: Vec<Value>) -> Result<Vec<SyncQueueItem>> {
    values.into_iter().map(SyncQueueItem::from_value).collect()
}

/// Counts per queue state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Waiting for the next drain
    pub pending: usize,
    /// Frozen by an unresolved conflict
    pub held: usize,
    /// Out of retries
    pub failed: usize,
    /// Confirmed, awaiting pruning
    pub synced: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.held + self.failed + self.synced
    }
}

/// View over the `sync_queue` collection of a [`LocalStore`].
#[derive(Debug, Clone, Copy)]
pub struct SyncQueue<'a> {
    store: &'a LocalStore,
}

impl<'a> SyncQueue<'a> {
    pub(crate) fn new(store: &'a LocalStore) -> Self {
        Self { store }
    }

    async fn by_status(&self, status: SyncStatus) -> Result<Vec<SyncQueueItem>> {
        self.store.ensure_open()?;
        let values = self
            .store
            .backend()
            .scan_index(SYNC_QUEUE, "syncStatus", &Value::from(status.to_string()))
            .await?;
        parse_all(values)
    }

    /// Items the next drain will push, in drain order.
    ///
    /// An entry queued behind a held or failed entry for the same record
    /// waits until that entry is resolved, retried, or discarded.
    pub async fn list_pending(&self) -> Result<Vec<SyncQueueItem>> {
        let pending = self.by_status(SyncStatus::Pending).await?;
        let failed = self.by_status(SyncStatus::Error).await?;

        let mut stuck: HashMap<(CollectionName, RecordId), u64> = HashMap::new();
        for item in pending.iter().filter(|i| i.is_held()).chain(&failed) {
            stuck
                .entry(record_key(item))
                .and_modify(|seq| *seq = (*seq).min(item.sequence))
                .or_insert(item.sequence);
        }

        let ready = pending
            .into_iter()
            .filter(SyncQueueItem::is_ready)
            .filter(|item| {
                stuck
                    .get(&record_key(item))
                    .map_or(true, |seq| item.sequence < *seq)
            })
            .collect();
        Ok(in_record_order(sorted(ready)))
    }

    /// Items frozen by a `manual_merge` conflict.
    pub async fn list_held(&self) -> Result<Vec<SyncQueueItem>> {
        let items = self.by_status(SyncStatus::Pending).await?;
        Ok(sorted(items.into_iter().filter(SyncQueueItem::is_held).collect()))
    }

    /// Items that ran out of retries.
    pub async fn list_failed(&self) -> Result<Vec<SyncQueueItem>> {
        Ok(sorted(self.by_status(SyncStatus::Error).await?))
    }

    /// Every item, in drain order.
    pub async fn list_all(&self) -> Result<Vec<SyncQueueItem>> {
        self.store.ensure_open()?;
        let values = self.store.backend().get_all(SYNC_QUEUE).await?;
        Ok(sorted(parse_all(values)?))
    }

    pub async fn get(&self, queue_id: &str) -> Result<Option<SyncQueueItem>> {
        self.store.ensure_open()?;
        self.store.load_queue_item(queue_id).await
    }

    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.list_pending().await?.len())
    }

    /// Terminal success.
    ///
    /// The record itself becomes `synced` when it is still at the version the
    /// item pushed.
    pub async fn mark_synced(&self, queue_id: &str) -> Result<SyncQueueItem> {
        self.store.finish_push(queue_id, None, false, None).await
    }

    /// Count a failed attempt.
    ///
    /// Once `retry_count` reaches `max_retries` the item turns `error` and
    /// leaves the automatic drain, and the record it pushed turns `error`
    /// too.
    pub async fn mark_error(&self, queue_id: &str, message: &str) -> Result<SyncQueueItem> {
        self.store.fail_push(queue_id, message, None).await
    }

    /// Put a failed item back into the automatic drain.
    pub async fn retry(&self, queue_id: &str) -> Result<SyncQueueItem> {
        let _guard = self.store.lock().await;
        self.store.ensure_open()?;
        let mut item = self.store.require_queue_item(queue_id).await?;
        if item.sync_status != SyncStatus::Error {
            return Err(Error::InvalidPayload(format!(
                "queue item {queue_id} is {}, only failed items can be retried",
                item.sync_status
            )));
        }

        let mut batch = WriteBatch::new();
        item.reset(Utc::now());
        if let Some(mut record) = self.store.record_at_version(&item).await? {
            record.sync_status = SyncStatus::Pending;
            batch.put(&item.object_store, &record.id, record.to_value()?);
        }
        batch.put(SYNC_QUEUE, &item.id, item.to_value()?);
        self.store.backend().commit(batch).await?;

        tracing::info!(queue_id = %item.id, "queue item re-armed");
        Ok(item)
    }

    /// Give up on an item. It becomes terminal `synced` with a note, the
    /// record it pushed is flagged `error`, and any conflict holding it is
    /// closed.
    pub async fn discard(&self, queue_id: &str) -> Result<SyncQueueItem> {
        let _guard = self.store.lock().await;
        self.store.ensure_open()?;
        let mut item = self.store.require_queue_item(queue_id).await?;
        let now = Utc::now();

        let mut batch = WriteBatch::new();
        if item.is_live() {
            if let Some(mut record) = self.store.record_at_version(&item).await? {
                record.sync_status = SyncStatus::Error;
                batch.put(&item.object_store, &record.id, record.to_value()?);
            }
        }
        if let Some(conflict_id) = &item.conflict_id {
            if let Some(mut conflict) = self.store.load_conflict(conflict_id).await? {
                conflict.status = ConflictStatus::Resolved;
                conflict.resolved_at = Some(now);
                conflict.updated_at = now;
                conflict.version += 1;
                batch.put(SYNC_CONFLICTS, &conflict.id, serde_json::to_value(&conflict)?);
            }
        }

        item.mark_synced(now);
        item.error_message = Some(DISCARDED_NOTE.to_string());
        batch.put(SYNC_QUEUE, &item.id, item.to_value()?);
        self.store.backend().commit(batch).await?;

        tracing::info!(queue_id = %item.id, record_id = %item.record_id, "queue item discarded");
        Ok(item)
    }

    /// Delete `synced` items last touched before `now - older_than`.
    pub async fn prune_synced(&self, older_than: Duration) -> Result<usize> {
        let _guard = self.store.lock().await;
        let cutoff = Utc::now() - older_than;
        let stale: Vec<_> = self
            .by_status(SyncStatus::Synced)
            .await?
            .into_iter()
            .filter(|item| item.updated_at <= cutoff)
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::new();
        for item in &stale {
            batch.delete(SYNC_QUEUE, &item.id);
        }
        self.store.backend().commit(batch).await?;

        tracing::info!(pruned = stale.len(), "pruned synced queue items");
        Ok(stale.len())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for item in self.list_all().await? {
            match item.sync_status {
                SyncStatus::Pending if item.is_held() => stats.held += 1,
                SyncStatus::Pending => stats.pending += 1,
                SyncStatus::Error => stats.failed += 1,
                SyncStatus::Synced => stats.synced += 1,
            }
        }
        Ok(stats)
    }
}
