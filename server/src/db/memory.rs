//! In-memory [`RecordStore`].

use async_trait::async_trait;
use dashmap::DashMap;

use super::{RecordStore, StoredRecord};

/// Records held in a concurrent map, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryRecords {
    records: DashMap<(String, String), StoredRecord>,
}

impl MemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecords {
    async fn get(&self, collection: &str, record_id: &str) -> Result<Option<StoredRecord>, sqlx::Error> {
        Ok(self
            .records
            .get(&(collection.to_string(), record_id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn list(&self, collection: &str) -> Result<Vec<StoredRecord>, sqlx::Error> {
        let mut records: Vec<StoredRecord> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        Ok(records)
    }

    async fn put(&self, record: &StoredRecord) -> Result<(), sqlx::Error> {
        self.records.insert(
            (record.collection.clone(), record.record_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn delete(&self, collection: &str, record_id: &str) -> Result<bool, sqlx::Error> {
        Ok(self
            .records
            .remove(&(collection.to_string(), record_id.to_string()))
            .is_some())
    }
}
