//! Record persistence for the authority.
//!
//! Handlers see storage only through [`RecordStore`]. [`PgRecords`] keeps
//! records in PostgreSQL; [`MemoryRecords`] keeps them in process memory
//! for tests and database-less runs.

mod memory;
mod pool;
mod records;

pub use memory::*;
pub use pool::*;
pub use records::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// The authority's copy of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub collection: String,
    pub record_id: String,
    pub version: i64,
    /// Full camelCase record body, as returned to clients
    pub body: Value,
    pub updated_at: DateTime<Utc>,
}

/// Persistence for the authority's copies.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, collection: &str, record_id: &str) -> Result<Option<StoredRecord>, sqlx::Error>;

    /// Every record of a collection, oldest write first.
    async fn list(&self, collection: &str) -> Result<Vec<StoredRecord>, sqlx::Error>;

    /// Insert or replace.
    async fn put(&self, record: &StoredRecord) -> Result<(), sqlx::Error>;

    /// Returns whether a record was removed.
    async fn delete(&self, collection: &str, record_id: &str) -> Result<bool, sqlx::Error>;
}
