//! Fakes for exercising the sync engine without an authority.
//!
//! Compiled for this crate's tests and behind the `test-util` feature.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::queue::{QueueOperation, SyncQueueItem};
use crate::remote::{PushOutcome, Remote, RemoteError};

/// Scripted answer to one push.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedPush {
    /// 2xx echoing the pushed data
    Accept,
    /// 2xx with this body
    AcceptWith(Value),
    /// 409 with this server copy
    Conflict(Value),
    /// Any other status
    Reject(u16),
    /// Transport failure
    NetworkError,
}

/// One push the fake received.
#[derive(Debug, Clone, PartialEq)]
pub struct PushCall {
    pub endpoint: String,
    pub record_id: String,
    pub operation: QueueOperation,
    pub force: bool,
    pub data: Value,
}

#[derive(Debug, Default)]
struct State {
    script: VecDeque<ScriptedPush>,
    reference: HashMap<String, Vec<Value>>,
    failing_pulls: Vec<String>,
    pushes: Vec<PushCall>,
    pulls: Vec<String>,
}

/// In-process [`Remote`] answering from a script.
///
/// Pushes consume the script front to back; once it runs dry every push is
/// accepted with its own data echoed back.
#[derive(Debug, Default)]
pub struct ScriptedRemote {
    state: Mutex<State>,
    delay: Option<Duration>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every push.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue the answer to the next unanswered push.
    pub fn script(&self, answer: ScriptedPush) -> &Self {
        self.state().script.push_back(answer);
        self
    }

    /// Serve these records on a reference collection pull.
    pub fn set_reference(&self, collection: &str, records: Vec<Value>) {
        self.state()
            .reference
            .insert(collection.to_string(), records);
    }

    /// Make pulls of `collection` fail with a network error.
    pub fn fail_pulls(&self, collection: &str) {
        self.state().failing_pulls.push(collection.to_string());
    }

    pub fn pushes(&self) -> Vec<PushCall> {
        self.state().pushes.clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state().pulls.clone()
    }
}

#[async_trait]
impl Remote for ScriptedRemote {
    async fn pull(&self, collection: &str, _endpoint: &str) -> Result<Vec<Value>, RemoteError> {
        let mut state = self.state();
        state.pulls.push(collection.to_string());
        if state.failing_pulls.iter().any(|c| c == collection) {
            return Err(RemoteError::Network("connection refused".into()));
        }
        Ok(state.reference.get(collection).cloned().unwrap_or_default())
    }

    async fn push(
        &self,
        endpoint: &str,
        item: &SyncQueueItem,
        force: bool,
    ) -> Result<PushOutcome, RemoteError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let answer = {
            let mut state = self.state();
            state.pushes.push(PushCall {
                endpoint: endpoint.to_string(),
                record_id: item.record_id.clone(),
                operation: item.operation,
                force,
                data: item.data.clone(),
            });
            state.script.pop_front().unwrap_or(ScriptedPush::Accept)
        };

        match answer {
            ScriptedPush::Accept => Ok(PushOutcome::Accepted(Some(item.data.clone()))),
            ScriptedPush::AcceptWith(body) => Ok(PushOutcome::Accepted(Some(body))),
            ScriptedPush::Conflict(server) => Ok(PushOutcome::Conflict(server)),
            ScriptedPush::Reject(status) => Ok(PushOutcome::Rejected {
                status,
                message: "scripted rejection".into(),
            }),
            ScriptedPush::NetworkError => Err(RemoteError::Network("connection reset".into())),
        }
    }
}
