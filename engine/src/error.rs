//! Error types for the trove engine.
//!
//! Only storage and input problems surface as [`Error`]. Network failures and
//! version conflicts met during a sync pass are absorbed by the
//! [`SyncEngine`](crate::SyncEngine) and reported through
//! [`SyncResult`](crate::SyncResult).

use crate::{CollectionName, RecordId};
use thiserror::Error;

/// All possible errors from the trove engine.
#[derive(Debug, Error)]
pub enum Error {
    // Validation errors
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("record not found: {collection}/{id}")]
    NotFound {
        collection: CollectionName,
        id: RecordId,
    },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("collection '{collection}' has no index on '{field}'")]
    IndexNotFound {
        collection: CollectionName,
        field: String,
    },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    // Storage errors
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("integrity check failed for {collection}/{id}: expected {expected}, found {actual}")]
    Integrity {
        collection: CollectionName,
        id: RecordId,
        expected: String,
        actual: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Bookkeeping errors
    #[error("sync queue item not found: {0}")]
    QueueItemNotFound(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("conflict already resolved: {0}")]
    ConflictAlreadyResolved(String),

    #[error("local store is closed")]
    StoreClosed,

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for a [`Error::NotFound`].
    pub fn not_found(collection: impl Into<CollectionName>, id: impl Into<RecordId>) -> Self {
        Error::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::Storage(format!("migration failed: {err}"))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
