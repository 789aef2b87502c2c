//! The local store.
//!
//! [`LocalStore`] is the service every caller goes through: generic CRUD over
//! the collections a [`Schema`] declares, with id generation, version bumps
//! and integrity stamping owned by the store. Every mutation is a
//! [`Mutation`] committed as one batch, so the record, its queue entry and
//! its audit entry land together or not at all.
//!
//! Read-modify-write sequences run under one async write lock. Reads never
//! take it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard};

use crate::audit::{AuditEntry, AuditOperation, AuditTrail};
use crate::config::StoreOptions;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::mutation::{Mutation, MutationContext, Stamp};
use crate::queue::{QueueOperation, SyncQueue, SyncQueueItem};
use crate::reconcile::{
    ConflictNote, ConflictRecord, ConflictResolution, ConflictStatus, ConflictStrategy,
    ManualResolution, Winner,
};
use crate::record::{business_fields, Record, SyncStatus};
use crate::schema::{Schema, AUDIT_TRAILS, SYNC_CONFLICTS, SYNC_QUEUE};
use crate::storage::{StorageBackend, WriteBatch};
use crate::{CollectionName, RecordId};

/// Audit reason on entries re-enqueued by crash recovery.
pub const RECOVERY_REASON: &str = "recovered after interrupted write";

/// Audit reason on the write produced by a manual merge.
pub const MERGE_REASON: &str = "manual conflict merge";

/// Equality filter on a declared secondary index.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// A record whose stored hash no longer matches its business fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityViolation {
    pub collection: CollectionName,
    pub id: RecordId,
    pub expected: String,
    pub actual: String,
}

/// Both sides of a version conflict, carried into the audit trail.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConflictContext {
    pub strategy: ConflictStrategy,
    pub local: Value,
    pub server: Value,
}

/// Offline-first local store.
#[derive(Debug)]
pub struct LocalStore {
    backend: Arc<dyn StorageBackend>,
    schema: Schema,
    identity: Identity,
    options: StoreOptions,
    /// Last sequence number handed out
    sequence: AtomicU64,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl LocalStore {
    /// Open a store over `backend`.
    ///
    /// Prepares storage for the schema, loads the device identity, starts a
    /// new session and re-enqueues pending records that lost their queue
    /// entry. Opening twice over the same data is harmless.
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        schema: Schema,
        options: StoreOptions,
    ) -> Result<Self> {
        schema.validate()?;
        backend.prepare(&schema).await?;

        let identity = Identity::load_or_create(backend.as_ref()).await?;
        let sequence = last_sequence(backend.as_ref()).await?;

        let store = Self {
            backend,
            schema,
            identity,
            options,
            sequence: AtomicU64::new(sequence),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        };

        let recovered = store.recover_interrupted_writes().await?;
        tracing::info!(
            device_id = %store.identity.device_id,
            session_id = %store.identity.session_id,
            collections = store.schema.collections.len(),
            recovered,
            "local store opened"
        );
        Ok(store)
    }

    /// Close the store. Waits for an in-flight mutation to finish.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.backend.close().await?;
        tracing::info!(session_id = %self.identity.session_id, "local store closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// The sync queue.
    pub fn queue(&self) -> SyncQueue<'_> {
        SyncQueue::new(self)
    }

    /// The audit trail.
    pub fn audit(&self) -> AuditTrail<'_> {
        AuditTrail::new(self)
    }

    // ---- CRUD ----

    /// Create a record from business fields.
    pub async fn create(&self, collection: &str, data: Value) -> Result<Record> {
        self.create_with(collection, data, &MutationContext::default())
            .await
    }

    pub async fn create_with(
        &self,
        collection: &str,
        data: Value,
        ctx: &MutationContext,
    ) -> Result<Record> {
        self.ensure_open()?;
        let schema = self.schema.collection(collection)?;
        let fields = business_fields(into_object(data)?);
        schema.validate_payload(&fields)?;

        let _guard = self.lock().await;
        self.ensure_open()?;
        let stamp = self.stamp();
        let record = Record::new(
            uuid::Uuid::new_v4().to_string(),
            fields,
            self.identity.device_id.clone(),
            self.identity.session_id.clone(),
            stamp.now,
        );

        let mutation = Mutation::create(
            collection,
            record.clone(),
            &stamp,
            ctx,
            self.options.max_retries,
        )?;
        self.backend.commit(mutation.into_batch()?).await?;

        tracing::debug!(collection, record_id = %record.id, "record created");
        Ok(record)
    }

    /// Merge `partial` into an existing record.
    pub async fn update(&self, collection: &str, id: &str, partial: Value) -> Result<Record> {
        self.update_with(collection, id, partial, &MutationContext::default())
            .await
    }

    pub async fn update_with(
        &self,
        collection: &str,
        id: &str,
        partial: Value,
        ctx: &MutationContext,
    ) -> Result<Record> {
        self.ensure_open()?;
        let schema = self.schema.collection(collection)?;
        let partial = business_fields(into_object(partial)?);
        schema.validate_partial(&partial)?;

        let _guard = self.lock().await;
        self.ensure_open()?;
        let before = self
            .load_record(collection, id)
            .await?
            .ok_or_else(|| Error::not_found(collection, id))?;
        before.verify_integrity(collection)?;

        let stamp = self.stamp();
        let mut after = before.clone();
        after.apply_update(partial, stamp.now);

        let mutation = Mutation::update(
            collection,
            &before,
            after.clone(),
            &stamp,
            ctx,
            self.options.max_retries,
        )?;
        self.backend.commit(mutation.into_batch()?).await?;

        tracing::debug!(collection, record_id = id, version = after.version, "record updated");
        Ok(after)
    }

    /// Remove a record. Deleting a missing id is a no-op and returns `None`.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        self.delete_with(collection, id, &MutationContext::default())
            .await
    }

    pub async fn delete_with(
        &self,
        collection: &str,
        id: &str,
        ctx: &MutationContext,
    ) -> Result<Option<Record>> {
        self.ensure_open()?;
        self.schema.collection(collection)?;

        let _guard = self.lock().await;
        self.ensure_open()?;
        let Some(before) = self.load_record(collection, id).await? else {
            tracing::debug!(collection, record_id = id, "delete of missing record ignored");
            return Ok(None);
        };

        let stamp = self.stamp();
        let mutation = Mutation::delete(collection, &before, &stamp, ctx, self.options.max_retries)?;
        self.backend.commit(mutation.into_batch()?).await?;

        tracing::debug!(collection, record_id = id, "record deleted");
        Ok(Some(before))
    }

    /// Read one record.
    pub async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        self.ensure_open()?;
        self.schema.collection(collection)?;
        let record = self.load_record(collection, id).await?;
        if let Some(record) = &record {
            record.verify_integrity(collection)?;
        }
        Ok(record)
    }

    /// Read a collection, optionally narrowed by a secondary index.
    ///
    /// Results are ordered by creation time.
    pub async fn get_all(&self, collection: &str, filter: Option<&Filter>) -> Result<Vec<Record>> {
        self.ensure_open()?;
        let schema = self.schema.collection(collection)?;

        let values = match filter {
            Some(filter) => {
                if !schema.is_indexed(&filter.field) {
                    return Err(Error::IndexNotFound {
                        collection: collection.to_string(),
                        field: filter.field.clone(),
                    });
                }
                self.backend
                    .scan_index(collection, &filter.field, &filter.value)
                    .await?
            }
            None => self.backend.get_all(collection).await?,
        };

        let mut records = values
            .into_iter()
            .map(Record::from_value)
            .collect::<Result<Vec<_>>>()?;
        for record in &records {
            record.verify_integrity(collection)?;
        }
        records.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(records)
    }

    /// Scan a collection for records whose hash does not match. Nothing is
    /// repaired.
    pub async fn verify_integrity(&self, collection: &str) -> Result<Vec<IntegrityViolation>> {
        self.ensure_open()?;
        self.schema.collection(collection)?;

        let mut violations = Vec::new();
        for value in self.backend.get_all(collection).await? {
            let record = Record::from_value(value)?;
            if let Some(actual) = record.integrity_mismatch() {
                tracing::warn!(collection, record_id = %record.id, "integrity violation");
                violations.push(IntegrityViolation {
                    collection: collection.to_string(),
                    id: record.id,
                    expected: record.integrity_hash,
                    actual,
                });
            }
        }
        Ok(violations)
    }

    // ---- Holding area ----

    /// Unresolved conflicts, oldest first.
    pub async fn list_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.ensure_open()?;
        let values = self
            .backend
            .scan_index(SYNC_CONFLICTS, "status", &Value::from("unresolved"))
            .await?;
        let mut conflicts = values
            .into_iter()
            .map(|v| serde_json::from_value::<ConflictRecord>(v).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        conflicts.sort_by_key(|c| c.created_at);
        Ok(conflicts)
    }

    pub async fn get_conflict(&self, conflict_id: &str) -> Result<Option<ConflictRecord>> {
        self.ensure_open()?;
        self.load_conflict(conflict_id).await
    }

    /// Apply a human decision to a held conflict.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: ManualResolution,
    ) -> Result<ConflictRecord> {
        let _guard = self.lock().await;
        self.ensure_open()?;

        let mut conflict = self
            .load_conflict(conflict_id)
            .await?
            .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))?;
        if !conflict.is_unresolved() {
            return Err(Error::ConflictAlreadyResolved(conflict_id.to_string()));
        }
        let mut item = self
            .load_queue_item(&conflict.queue_id)
            .await?
            .ok_or_else(|| Error::QueueItemNotFound(conflict.queue_id.clone()))?;

        let collection = conflict.object_store.clone();
        let winner = resolution.winner();
        let now = Utc::now();
        let mut batch = WriteBatch::new();

        match resolution {
            ManualResolution::KeepLocal => item.release(true, now),
            ManualResolution::KeepServer => {
                let record = server_copy(&conflict.server_value)?;
                if !self.has_newer_write(&item).await? {
                    batch.put(&collection, &record.id, record.to_value()?);
                }
                item.mark_synced(now);
            }
            ManualResolution::Merged(fields) => {
                let fields = business_fields(fields);
                self.schema.collection(&collection)?.validate_payload(&fields)?;

                let current = self.load_record(&collection, &conflict.record_id).await?;
                let before = match &current {
                    Some(record) => record.clone(),
                    None => Record::from_value(conflict.server_value.clone())
                        .or_else(|_| Record::from_value(conflict.local_value.clone()))?,
                };
                let server_version = version_of(&conflict.server_value);
                let local_version = before.version.max(version_of(&conflict.local_value));

                let stamp = self.stamp();
                let mut merged = before.clone();
                merged.fields = fields;
                merged.version = local_version.max(server_version) + 1;
                merged.sync_status = SyncStatus::Pending;
                merged.updated_at = stamp.now;
                merged.rehash();

                let ctx = MutationContext::new().with_reason(MERGE_REASON);
                let mutation = Mutation::update(
                    &collection,
                    &before,
                    merged,
                    &stamp,
                    &ctx,
                    self.options.max_retries,
                )?;
                batch.extend(mutation.into_batch()?);
                item.mark_synced(now);
            }
        }

        conflict.status = ConflictStatus::Resolved;
        conflict.winner = Some(winner);
        conflict.resolved_at = Some(now);
        conflict.updated_at = now;
        conflict.version += 1;

        let context = ConflictContext {
            strategy: conflict.strategy,
            local: conflict.local_value.clone(),
            server: conflict.server_value.clone(),
        };
        let audit = self.conflict_entry(&item, &context, ConflictResolution::Resolved, Some(winner));

        batch.put(SYNC_QUEUE, &item.id, item.to_value()?);
        batch.put(SYNC_CONFLICTS, &conflict.id, serde_json::to_value(&conflict)?);
        batch.put(AUDIT_TRAILS, &audit.id, audit.to_value()?);
        self.backend.commit(batch).await?;

        tracing::info!(
            conflict_id,
            record_id = %conflict.record_id,
            winner = ?winner,
            "conflict resolved manually"
        );
        Ok(conflict)
    }

    // ---- Sync engine paths ----

    /// Confirm a push.
    ///
    /// The record becomes `synced` when it is still at the version the item
    /// pushed. A forced push may come back with a higher version; the record
    /// adopts it. With `conflict` set, a resolved `CONFLICT` entry is written
    /// in the same batch.
    pub(crate) async fn finish_push(
        &self,
        queue_id: &str,
        accepted: Option<&Value>,
        forced: bool,
        conflict: Option<(&ConflictContext, Winner)>,
    ) -> Result<SyncQueueItem> {
        let _guard = self.lock().await;
        self.ensure_open()?;
        let mut item = self.require_queue_item(queue_id).await?;
        let now = Utc::now();
        let mut batch = WriteBatch::new();

        if let Some(mut record) = self.record_at_version(&item).await? {
            if forced || item.force_override {
                if let Some(version) = accepted
                    .map(version_of)
                    .filter(|v| *v > record.version)
                {
                    tracing::debug!(
                        record_id = %record.id,
                        from = record.version,
                        to = version,
                        "adopting authority version after forced push"
                    );
                    record.version = version;
                }
            }
            record.sync_status = SyncStatus::Synced;
            batch.put(&item.object_store, &record.id, record.to_value()?);
        }

        if let Some((context, winner)) = conflict {
            let audit = self.conflict_entry(&item, context, ConflictResolution::Resolved, Some(winner));
            batch.put(AUDIT_TRAILS, &audit.id, audit.to_value()?);
        }

        item.mark_synced(now);
        batch.put(SYNC_QUEUE, &item.id, item.to_value()?);
        self.backend.commit(batch).await?;

        tracing::debug!(queue_id, record_id = %item.record_id, "queue item synced");
        Ok(item)
    }

    /// Count a failed push attempt.
    ///
    /// Once the item runs out of retries it turns `error`, and so does the
    /// record it pushed. With `conflict` set, a failed `CONFLICT` entry is
    /// written in the same batch.
    pub(crate) async fn fail_push(
        &self,
        queue_id: &str,
        message: &str,
        conflict: Option<&ConflictContext>,
    ) -> Result<SyncQueueItem> {
        let _guard = self.lock().await;
        self.ensure_open()?;
        let mut item = self.require_queue_item(queue_id).await?;
        let mut batch = WriteBatch::new();

        if item.record_failure(message, Utc::now()) {
            tracing::warn!(
                queue_id,
                record_id = %item.record_id,
                retries = item.retry_count,
                "queue item exhausted its retries"
            );
            if let Some(mut record) = self.record_at_version(&item).await? {
                record.sync_status = SyncStatus::Error;
                batch.put(&item.object_store, &record.id, record.to_value()?);
            }
        } else {
            tracing::warn!(queue_id, retry = item.retry_count, error = message, "push failed, will retry");
        }

        if let Some(context) = conflict {
            let audit = self.conflict_entry(&item, context, ConflictResolution::Failed, None);
            batch.put(AUDIT_TRAILS, &audit.id, audit.to_value()?);
        }

        batch.put(SYNC_QUEUE, &item.id, item.to_value()?);
        self.backend.commit(batch).await?;
        Ok(item)
    }

    /// Resolve a conflict in the authority's favour: its copy overwrites the
    /// local record and the queue item is done.
    ///
    /// A local write queued after `queue_id` is left in place; it goes out
    /// on its own and meets the server copy there.
    pub(crate) async fn accept_server(
        &self,
        queue_id: &str,
        context: &ConflictContext,
    ) -> Result<SyncQueueItem> {
        let record = server_copy(&context.server)?;

        let _guard = self.lock().await;
        self.ensure_open()?;
        let mut item = self.require_queue_item(queue_id).await?;
        let audit = self.conflict_entry(&item, context, ConflictResolution::Resolved, Some(Winner::Server));

        let mut batch = WriteBatch::new();
        if self.has_newer_write(&item).await? {
            tracing::debug!(queue_id, record_id = %item.record_id, "newer local write queued, record left as is");
        } else {
            batch.put(&item.object_store, &record.id, record.to_value()?);
        }
        item.mark_synced(Utc::now());
        batch.put(SYNC_QUEUE, &item.id, item.to_value()?);
        batch.put(AUDIT_TRAILS, &audit.id, audit.to_value()?);
        self.backend.commit(batch).await?;

        tracing::info!(queue_id, record_id = %item.record_id, "conflict resolved, server copy kept");
        Ok(item)
    }

    /// Park a conflict in the holding area and freeze its queue item.
    pub(crate) async fn hold_conflict(
        &self,
        queue_id: &str,
        context: &ConflictContext,
    ) -> Result<ConflictRecord> {
        let _guard = self.lock().await;
        self.ensure_open()?;
        let mut item = self.require_queue_item(queue_id).await?;
        let now = Utc::now();

        let conflict = ConflictRecord {
            id: uuid::Uuid::new_v4().to_string(),
            version: 1,
            created_at: now,
            updated_at: now,
            device_id: self.identity.device_id.clone(),
            collector_id: self.identity.session_id.clone(),
            queue_id: item.id.clone(),
            object_store: item.object_store.clone(),
            record_id: item.record_id.clone(),
            operation: item.operation,
            local_value: context.local.clone(),
            server_value: context.server.clone(),
            strategy: context.strategy,
            status: ConflictStatus::Unresolved,
            winner: None,
            resolved_at: None,
        };
        item.hold(&conflict.id, now);
        let audit = self.conflict_entry(&item, context, ConflictResolution::Deferred, None);

        let mut batch = WriteBatch::new();
        batch.put(SYNC_CONFLICTS, &conflict.id, serde_json::to_value(&conflict)?);
        batch.put(SYNC_QUEUE, &item.id, item.to_value()?);
        batch.put(AUDIT_TRAILS, &audit.id, audit.to_value()?);
        self.backend.commit(batch).await?;

        tracing::warn!(
            queue_id,
            conflict_id = %conflict.id,
            record_id = %conflict.record_id,
            "conflict held for manual review"
        );
        Ok(conflict)
    }

    /// Write an authority copy pulled during the pull phase.
    ///
    /// Overwrites the local copy when there is none or the remote version is
    /// greater. Returns whether anything was written.
    pub(crate) async fn apply_remote(&self, collection: &str, value: Value) -> Result<bool> {
        let remote = server_copy(&value)?;

        let _guard = self.lock().await;
        self.ensure_open()?;
        let local = self.load_record(collection, &remote.id).await?;
        if local.as_ref().is_some_and(|l| l.version >= remote.version) {
            return Ok(false);
        }

        let stamp = self.stamp();
        let old_value = local.as_ref().map(Record::to_value).transpose()?;
        let audit = AuditEntry::new(&stamp, collection, remote.id.clone(), AuditOperation::Sync)
            .with_values(old_value, Some(remote.to_value()?))
            .seal();

        let mut batch = WriteBatch::new();
        batch.put(collection, &remote.id, remote.to_value()?);
        batch.put(AUDIT_TRAILS, &audit.id, audit.to_value()?);
        self.backend.commit(batch).await?;

        tracing::debug!(collection, record_id = %remote.id, version = remote.version, "pulled authority copy");
        Ok(true)
    }

    // ---- Internals shared with the queue and audit views ----

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::StoreClosed)
        }
    }

    pub(crate) fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    pub(crate) fn stamp(&self) -> Stamp {
        Stamp {
            now: Utc::now(),
            device_id: self.identity.device_id.clone(),
            session_id: self.identity.session_id.clone(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            user_id: self.options.user_id.clone(),
        }
    }

    /// Raw read, without the integrity check.
    pub(crate) async fn load_record(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        self.backend
            .get(collection, id)
            .await?
            .map(Record::from_value)
            .transpose()
    }

    pub(crate) async fn load_queue_item(&self, queue_id: &str) -> Result<Option<SyncQueueItem>> {
        self.backend
            .get(SYNC_QUEUE, queue_id)
            .await?
            .map(SyncQueueItem::from_value)
            .transpose()
    }

    pub(crate) async fn require_queue_item(&self, queue_id: &str) -> Result<SyncQueueItem> {
        self.load_queue_item(queue_id)
            .await?
            .ok_or_else(|| Error::QueueItemNotFound(queue_id.to_string()))
    }

    pub(crate) async fn load_conflict(&self, conflict_id: &str) -> Result<Option<ConflictRecord>> {
        match self.backend.get(SYNC_CONFLICTS, conflict_id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// The record `item` pushed, if no newer local write has replaced it.
    pub(crate) async fn record_at_version(&self, item: &SyncQueueItem) -> Result<Option<Record>> {
        if item.operation == QueueOperation::Delete {
            return Ok(None);
        }
        Ok(self
            .load_record(&item.object_store, &item.record_id)
            .await?
            .filter(|r| r.version == item.record_version))
    }

    /// Whether an unsynced queue entry for the same record was enqueued
    /// after `item`.
    pub(crate) async fn has_newer_write(&self, item: &SyncQueueItem) -> Result<bool> {
        for status in [SyncStatus::Pending, SyncStatus::Error] {
            let values = self
                .backend
                .scan_index(SYNC_QUEUE, "syncStatus", &Value::from(status.to_string()))
                .await?;
            for value in values {
                let other = SyncQueueItem::from_value(value)?;
                if other.object_store == item.object_store
                    && other.record_id == item.record_id
                    && other.sequence > item.sequence
                {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn conflict_entry(
        &self,
        item: &SyncQueueItem,
        context: &ConflictContext,
        resolution: ConflictResolution,
        winner: Option<Winner>,
    ) -> AuditEntry {
        AuditEntry::new(
            &self.stamp(),
            item.object_store.clone(),
            item.record_id.clone(),
            AuditOperation::Conflict,
        )
        .with_values(Some(context.local.clone()), Some(context.server.clone()))
        .with_conflict(ConflictNote {
            strategy: context.strategy,
            resolution,
            winner,
        })
        .seal()
    }

    /// Give every pending record without a live queue entry a fresh one.
    async fn recover_interrupted_writes(&self) -> Result<usize> {
        let _guard = self.lock().await;

        let live: HashSet<(CollectionName, RecordId)> = self
            .backend
            .scan_index(SYNC_QUEUE, "syncStatus", &Value::from("pending"))
            .await?
            .into_iter()
            .map(SyncQueueItem::from_value)
            .map(|item| item.map(|i| (i.object_store, i.record_id)))
            .collect::<Result<_>>()?;

        let ctx = MutationContext::new().with_reason(RECOVERY_REASON);
        let mut batch = WriteBatch::new();
        let mut recovered = 0;

        for collection in self.schema.collections.keys() {
            for value in self.backend.get_all(collection).await? {
                let record = match Record::from_value(value) {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::warn!(collection = %collection, error = %err, "unreadable record skipped during recovery");
                        continue;
                    }
                };
                if record.sync_status != SyncStatus::Pending
                    || live.contains(&(collection.clone(), record.id.clone()))
                {
                    continue;
                }

                let stamp = self.stamp();
                let mutation = if record.version == 1 {
                    Mutation::create(collection, record, &stamp, &ctx, self.options.max_retries)?
                } else {
                    Mutation::update(
                        collection,
                        &record,
                        record.clone(),
                        &stamp,
                        &ctx,
                        self.options.max_retries,
                    )?
                };
                tracing::warn!(
                    collection = %collection,
                    record_id = %mutation.record_id,
                    "re-enqueued pending record without a queue entry"
                );
                batch.extend(mutation.into_batch()?);
                recovered += 1;
            }
        }

        if !batch.is_empty() {
            self.backend.commit(batch).await?;
        }
        Ok(recovered)
    }
}

fn into_object(data: Value) -> Result<Map<String, Value>> {
    match data {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidPayload(format!(
            "expected a JSON object, got {}",
            match other {
                Value::Null => "null",
                Value::Bool(_) => "a boolean",
                Value::Number(_) => "a number",
                Value::String(_) => "a string",
                Value::Array(_) => "an array",
                Value::Object(_) => "an object",
            }
        ))),
    }
}

/// Parse an authority payload into a local, synced record.
fn server_copy(value: &Value) -> Result<Record> {
    let mut record = Record::from_value(value.clone()).map_err(|err| {
        Error::InvalidPayload(format!("authority returned an unusable record: {err}"))
    })?;
    record.sync_status = SyncStatus::Synced;
    record.rehash();
    Ok(record)
}

fn version_of(value: &Value) -> u64 {
    value.get("version").and_then(Value::as_u64).unwrap_or(0)
}

async fn last_sequence(backend: &dyn StorageBackend) -> Result<u64> {
    let mut last = 0;
    for collection in [SYNC_QUEUE, AUDIT_TRAILS] {
        for value in backend.get_all(collection).await? {
            if let Some(sequence) = value.get("sequence").and_then(Value::as_u64) {
                last = last.max(sequence);
            }
        }
    }
    Ok(last)
}
