//! Device and session identity.
//!
//! The device id is generated once per install and kept in the `_meta`
//! collection. The session id is fresh on every open.

use crate::error::Result;
use crate::schema::META;
use crate::storage::StorageBackend;
use crate::{DeviceId, SessionId};
use serde_json::{json, Value};

const DEVICE_KEY: &str = "device";

/// Identity stamped on every record and bookkeeping entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub device_id: DeviceId,
    pub session_id: SessionId,
}

impl Identity {
    /// Load the persisted device id, creating it on first use, and start a
    /// new session.
    pub async fn load_or_create(backend: &dyn StorageBackend) -> Result<Self> {
        let stored = backend
            .get(META, DEVICE_KEY)
            .await?
            .and_then(|doc| doc.get("deviceId").and_then(Value::as_str).map(str::to_string));

        let device_id = match stored {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                backend
                    .put(META, DEVICE_KEY, json!({ "id": DEVICE_KEY, "deviceId": id }))
                    .await?;
                tracing::info!(device_id = %id, "generated device id");
                id
            }
        };

        Ok(Self {
            device_id,
            session_id: uuid::Uuid::new_v4().to_string(),
        })
    }
}
