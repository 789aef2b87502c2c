//! Storage abstraction for the local store.
//!
//! The [`StorageBackend`] trait is the only thing the store needs from the
//! engine underneath: keyed documents grouped by collection, equality scans
//! on declared secondary indexes, and an atomic [`WriteBatch`] commit.
//!
//! Two backends ship with the crate:
//! - [`MemoryStorage`] for tests and ephemeral sessions
//! - [`SqliteStorage`] (feature `sqlite`) for on-device persistence

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use crate::error::Result;
use crate::schema::{Schema, AUDIT_TRAILS, SYNC_CONFLICTS, SYNC_QUEUE};
use crate::CollectionName;
use async_trait::async_trait;
use serde_json::Value;

/// Indexes the engine itself scans on.
pub const SYSTEM_INDEXES: [(&str, &str); 3] = [
    (SYNC_QUEUE, "syncStatus"),
    (AUDIT_TRAILS, "recordId"),
    (SYNC_CONFLICTS, "status"),
];

/// A single write inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert or replace a document
    Put {
        collection: CollectionName,
        id: String,
        value: Value,
    },
    /// Remove a document (missing ids are ignored)
    Delete { collection: CollectionName, id: String },
}

impl WriteOp {
    pub fn collection(&self) -> &str {
        match self {
            WriteOp::Put { collection, .. } | WriteOp::Delete { collection, .. } => collection,
        }
    }
}

/// Writes that must land together or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a put.
    pub fn put(&mut self, collection: impl Into<CollectionName>, id: impl Into<String>, value: Value) {
        self.ops.push(WriteOp::Put {
            collection: collection.into(),
            id: id.into(),
            value,
        });
    }

    /// Queue a delete.
    pub fn delete(&mut self, collection: impl Into<CollectionName>, id: impl Into<String>) {
        self.ops.push(WriteOp::Delete {
            collection: collection.into(),
            id: id.into(),
        });
    }

    /// Append every write of `other`.
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Trait for local storage engines.
///
/// Implementations must apply a [`WriteBatch`] atomically: after a failed
/// `commit` none of its writes are visible.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Create whatever the schema needs (tables, secondary indexes).
    ///
    /// Called on every open, so it must be idempotent.
    async fn prepare(&self, schema: &Schema) -> Result<()>;

    /// Load one document.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Load every document in a collection.
    async fn get_all(&self, collection: &str) -> Result<Vec<Value>>;

    /// Load documents whose top-level `field` equals `value`.
    async fn scan_index(&self, collection: &str, field: &str, value: &Value) -> Result<Vec<Value>>;

    /// Apply a batch atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Store a single document.
    async fn put(&self, collection: &str, id: &str, value: Value) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(collection, id, value);
        self.commit(batch).await
    }

    /// Release the underlying handle.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_keeps_insertion_order() {
        let mut batch = WriteBatch::new();
        batch.put("households", "hh-1", json!({"id": "hh-1"}));
        batch.put(SYNC_QUEUE, "q-1", json!({"id": "q-1"}));
        batch.delete("households", "hh-0");

        let collections: Vec<_> = batch.ops().iter().map(WriteOp::collection).collect();
        assert_eq!(collections, vec!["households", SYNC_QUEUE, "households"]);
        assert_eq!(batch.len(), 3);
        assert!(!batch.is_empty());
    }
}
