//! The remote authority.
//!
//! The sync engine talks to the authority only through the [`Remote`] trait.
//! [`HttpRemote`] implements it over the REST contract: one endpoint per
//! collection, `POST` to create, `PUT /{id}` to update, `DELETE /{id}` to
//! remove and a bulk `GET` for reference data. A version conflict comes back
//! as `409` with the authority's copy in the body, and the
//! [`FORCE_OVERRIDE_HEADER`] lets a `client_wins` push through anyway.

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::queue::{QueueOperation, SyncQueueItem};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::Value;

/// Header asking the authority to accept a write despite a version mismatch.
pub const FORCE_OVERRIDE_HEADER: &str = "X-Force-Override";

/// Longest error body kept in diagnostics.
const MAX_MESSAGE_LEN: usize = 240;

/// How the authority answered a push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// 2xx, with the stored record when the authority returned one.
    /// A `404` on delete also lands here.
    Accepted(Option<Value>),
    /// 409, with the authority's current copy
    Conflict(Value),
    /// Any other status
    Rejected { status: u16, message: String },
}

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("authority answered HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("could not decode authority response: {0}")]
    Decode(String),
}

/// A remote authority.
#[async_trait]
pub trait Remote: Send + Sync + std::fmt::Debug {
    /// Fetch every record of a reference collection.
    async fn pull(&self, collection: &str, endpoint: &str) -> std::result::Result<Vec<Value>, RemoteError>;

    /// Replay one queue item. With `force`, ask the authority to override a
    /// version mismatch.
    async fn push(
        &self,
        endpoint: &str,
        item: &SyncQueueItem,
        force: bool,
    ) -> std::result::Result<PushOutcome, RemoteError>;
}

/// [`Remote`] over HTTP with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| Error::Config(format!("failed to construct HTTP client: {err}")))?;
        Ok(Self {
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl Remote for HttpRemote {
    async fn pull(&self, collection: &str, endpoint: &str) -> std::result::Result<Vec<Value>, RemoteError> {
        let response = self
            .request(Method::GET, endpoint)
            .send()
            .await
            .map_err(|err| RemoteError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                message: compact(&body),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| RemoteError::Decode(err.to_string()))?;
        match body {
            Value::Array(items) => Ok(items),
            other => Err(RemoteError::Decode(format!(
                "expected an array of {collection} records, got {}",
                compact(&other.to_string())
            ))),
        }
    }

    async fn push(
        &self,
        endpoint: &str,
        item: &SyncQueueItem,
        force: bool,
    ) -> std::result::Result<PushOutcome, RemoteError> {
        let item_path = format!("{endpoint}/{}", item.record_id);
        let request = match item.operation {
            QueueOperation::Create => self.request(Method::POST, endpoint).json(&item.data),
            QueueOperation::Update => self.request(Method::PUT, &item_path).json(&item.data),
            QueueOperation::Delete => self.request(Method::DELETE, &item_path),
        };
        let request = if force {
            request.header(FORCE_OVERRIDE_HEADER, "true")
        } else {
            request
        };

        let response = request
            .send()
            .await
            .map_err(|err| RemoteError::Network(err.to_string()))?;
        let status = response.status();

        if status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(PushOutcome::Accepted(serde_json::from_str(&body).ok()));
        }
        if status == StatusCode::NOT_FOUND && item.operation == QueueOperation::Delete {
            return Ok(PushOutcome::Accepted(None));
        }
        if status == StatusCode::CONFLICT {
            let server = response
                .json::<Value>()
                .await
                .map_err(|err| RemoteError::Decode(format!("409 without a record body: {err}")))?;
            return Ok(PushOutcome::Conflict(server));
        }

        let body = response.text().await.unwrap_or_default();
        Ok(PushOutcome::Rejected {
            status: status.as_u16(),
            message: compact(&body),
        })
    }
}

fn compact(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > MAX_MESSAGE_LEN {
        let cut: String = flat.chars().take(MAX_MESSAGE_LEN).collect();
        format!("{cut}...")
    } else {
        flat
    }
}
