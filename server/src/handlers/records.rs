//! Record handlers - the authority's side of the version check.
//!
//! A write is accepted when the authority has no copy yet, when the incoming
//! version is strictly newer, or when it replays the exact version already
//! stored. Anything else is a conflict answered with the stored copy. A
//! forced write always lands, at a version above the stored one.

use chrono::Utc;
use serde_json::Value;
use trove_engine::{Record, SyncStatus};

use crate::db::{RecordStore, StoredRecord};
use crate::error::{AppError, Result};

/// How a write was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// First copy of this record
    Created(Value),
    /// Replaced an older copy
    Updated(Value),
    /// Same version and content as the stored copy
    Replayed(Value),
}

impl WriteOutcome {
    pub fn into_body(self) -> Value {
        match self {
            WriteOutcome::Created(body) | WriteOutcome::Updated(body) | WriteOutcome::Replayed(body) => body,
        }
    }
}

/// Every record of a collection.
pub async fn list_records(store: &dyn RecordStore, collection: &str) -> Result<Vec<Value>> {
    let records = store.list(collection).await?;
    Ok(records.into_iter().map(|record| record.body).collect())
}

/// One record by id.
pub async fn get_record(store: &dyn RecordStore, collection: &str, record_id: &str) -> Result<Value> {
    store
        .get(collection, record_id)
        .await?
        .map(|record| record.body)
        .ok_or_else(|| AppError::NotFound(format!("{collection}/{record_id}")))
}

/// Store an incoming record after the version check.
///
/// `path_id` is the id from the URL on updates; it must match the body.
pub async fn write_record(
    store: &dyn RecordStore,
    collection: &str,
    path_id: Option<&str>,
    body: Value,
    force: bool,
) -> Result<WriteOutcome> {
    let mut record = Record::from_value(body)?;
    if let Some(path_id) = path_id {
        if path_id != record.id {
            return Err(AppError::BadRequest(format!(
                "record id {} does not match path id {path_id}",
                record.id
            )));
        }
    }
    if record.integrity_mismatch().is_some() {
        return Err(AppError::BadRequest(format!(
            "integrity hash of {collection}/{} does not match its fields",
            record.id
        )));
    }

    let incoming = i64::try_from(record.version)
        .map_err(|_| AppError::BadRequest(format!("version {} out of range", record.version)))?;
    let existing = store.get(collection, &record.id).await?;

    let version = match &existing {
        None => incoming,
        Some(current) if force => {
            tracing::info!(
                collection,
                record_id = %record.id,
                incoming,
                stored = current.version,
                "forced write accepted"
            );
            incoming.max(current.version + 1)
        }
        Some(current) if incoming > current.version => incoming,
        Some(current) if incoming == current.version && same_content(&current.body, &record) => {
            tracing::debug!(collection, record_id = %record.id, "replayed write");
            return Ok(WriteOutcome::Replayed(current.body.clone()));
        }
        Some(current) => {
            tracing::info!(
                collection,
                record_id = %record.id,
                incoming,
                stored = current.version,
                "version conflict"
            );
            return Err(AppError::Conflict(current.body.clone()));
        }
    };

    // `version` is never below `incoming`, which came from a u64.
    record.version = version as u64;
    record.sync_status = SyncStatus::Synced;
    let body = record.to_value()?;

    store
        .put(&StoredRecord {
            collection: collection.to_string(),
            record_id: record.id.clone(),
            version,
            body: body.clone(),
            updated_at: Utc::now(),
        })
        .await?;

    tracing::debug!(collection, record_id = %record.id, version, "record stored");
    Ok(match existing {
        None => WriteOutcome::Created(body),
        Some(_) => WriteOutcome::Updated(body),
    })
}

/// Remove a record. Missing records are [`AppError::NotFound`].
pub async fn delete_record(store: &dyn RecordStore, collection: &str, record_id: &str) -> Result<()> {
    if store.delete(collection, record_id).await? {
        tracing::debug!(collection, record_id, "record deleted");
        Ok(())
    } else {
        Err(AppError::NotFound(format!("{collection}/{record_id}")))
    }
}

fn same_content(stored: &Value, incoming: &Record) -> bool {
    stored.get("integrityHash").and_then(Value::as_str) == Some(incoming.integrity_hash.as_str())
}
