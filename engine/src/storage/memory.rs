//! In-memory storage implementation.
//!
//! Cloning a [`MemoryStorage`] shares the underlying maps, which lets tests
//! close a store and reopen another one on the same data.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use super::{StorageBackend, WriteBatch, WriteOp};
use crate::error::{Error, Result};
use crate::schema::Schema;

type Collections = HashMap<String, BTreeMap<String, Value>>;

/// In-memory document storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    collections: Arc<RwLock<Collections>>,
    /// When set, every commit fails without applying anything
    fail_commits: Arc<AtomicBool>,
}

impl MemoryStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent commits fail, simulating a full disk.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Overwrite a document bypassing every check, for corruption tests.
    pub fn tamper(&self, collection: &str, id: &str, value: Value) {
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), value);
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        collections.get(collection).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn prepare(&self, schema: &Schema) -> Result<()> {
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for name in schema.collections.keys() {
            collections.entry(name.clone()).or_default();
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(collections.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Value>> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn scan_index(&self, collection: &str, field: &str, value: &Value) -> Result<Vec<Value>> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(collections
            .get(collection)
            .map(|c| {
                c.values()
                    .filter(|doc| doc.get(field) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(Error::Storage("simulated commit failure".into()));
        }

        // Applying under one write guard keeps the batch atomic for readers.
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for op in batch.into_ops() {
            match op {
                WriteOp::Put {
                    collection,
                    id,
                    value,
                } => {
                    collections.entry(collection).or_default().insert(id, value);
                }
                WriteOp::Delete { collection, id } => {
                    if let Some(c) = collections.get_mut(&collection) {
                        c.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
