//! The sync engine.
//!
//! One [`SyncEngine::sync_now`] call is one sync pass:
//!
//! 1. **Pull**: fetch every reference collection and overwrite local copies
//!    the authority has a newer version of.
//! 2. **Push**: drain the pending queue in order. Accepted pushes mark the
//!    item synced, `409`s go through the conflict protocol, anything else
//!    counts against the item's retries.
//! 3. **Report**: build a [`SyncResult`] and hand it to every
//!    `on_sync_complete` listener, exactly once.
//!
//! A pass never overlaps another one. A call made while a pass is running,
//! or while offline, returns at once with a skipped result (and still
//! notifies). Network failures and conflicts never surface as `Err`; they are
//! reported as [`SyncIssue`]s.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SyncConfig;
use crate::error::Error;
use crate::listeners::{ListenerRegistry, Subscription};
use crate::network::NetworkMonitor;
use crate::queue::SyncQueueItem;
use crate::reconcile::{
    decide, updated_at_of, ConflictDecision, ConflictResolution, ConflictSummary, Winner,
};
use crate::remote::{PushOutcome, Remote};
use crate::scheduler::SchedulerHandle;
use crate::record::SyncStatus;
use crate::store::{ConflictContext, LocalStore};

/// How a sync pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Everything pulled and pushed cleanly
    Completed,
    /// The pass ran, but some items failed or are waiting on a human
    Partial,
    /// Skipped: the network monitor reports offline
    Offline,
    /// Skipped: another pass is running
    AlreadySyncing,
}

/// Category of a problem met during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncIssueKind {
    /// Timeout, refused connection, DNS
    Network,
    /// The authority answered with an unexpected status or payload
    Rejected,
    /// The item ran out of retries and is frozen in `error`
    ExhaustedRetries,
    /// A `manual_merge` conflict is waiting in the holding area
    UnresolvedConflict,
    /// The local store failed
    Storage,
}

/// One problem met during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncIssue {
    pub kind: SyncIssueKind,
    pub collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
    pub message: String,
}

impl SyncIssue {
    fn for_item(kind: SyncIssueKind, item: &SyncQueueItem, message: impl Into<String>) -> Self {
        Self {
            kind,
            collection: item.object_store.clone(),
            record_id: Some(item.record_id.clone()),
            queue_id: Some(item.id.clone()),
            message: message.into(),
        }
    }

    fn for_collection(kind: SyncIssueKind, collection: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            collection: collection.to_string(),
            record_id: None,
            queue_id: None,
            message: message.into(),
        }
    }
}

fn kind_of(err: &Error) -> SyncIssueKind {
    match err {
        Error::Storage(_) | Error::StoreClosed | Error::Integrity { .. } => SyncIssueKind::Storage,
        _ => SyncIssueKind::Rejected,
    }
}

/// Summary of one sync pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub outcome: SyncOutcome,
    /// Queue items the authority accepted
    pub items_synced: usize,
    /// Queue items that failed this pass
    pub items_failed: usize,
    /// Reference records overwritten by the pull phase
    pub reference_items_pulled: usize,
    pub conflicts: Vec<ConflictSummary>,
    pub errors: Vec<SyncIssue>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl SyncResult {
    fn skipped(outcome: SyncOutcome, started_at: DateTime<Utc>) -> Self {
        Self {
            outcome,
            items_synced: 0,
            items_failed: 0,
            reference_items_pulled: 0,
            conflicts: Vec::new(),
            errors: Vec::new(),
            started_at,
            duration_ms: 0,
        }
    }

    /// Whether the pass actually ran.
    pub fn ran(&self) -> bool {
        matches!(self.outcome, SyncOutcome::Completed | SyncOutcome::Partial)
    }
}

/// Tallies for a pass in progress.
#[derive(Debug, Default)]
struct Pass {
    synced: usize,
    failed: usize,
    pulled: usize,
    conflicts: Vec<ConflictSummary>,
    issues: Vec<SyncIssue>,
}

impl Pass {
    fn finish(self, started_at: DateTime<Utc>, elapsed: std::time::Duration) -> SyncResult {
        let outcome = if self.failed == 0 && self.issues.is_empty() {
            SyncOutcome::Completed
        } else {
            SyncOutcome::Partial
        };
        SyncResult {
            outcome,
            items_synced: self.synced,
            items_failed: self.failed,
            reference_items_pulled: self.pulled,
            conflicts: self.conflicts,
            errors: self.issues,
            started_at,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Clears the syncing flag however the pass ends, including cancellation.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Orchestrates pull, push and conflict resolution against one authority.
#[derive(Debug)]
pub struct SyncEngine {
    store: Arc<LocalStore>,
    remote: Arc<dyn Remote>,
    network: Arc<dyn NetworkMonitor>,
    config: SyncConfig,
    syncing: AtomicBool,
    listeners: ListenerRegistry<SyncResult>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn Remote>,
        network: Arc<dyn NetworkMonitor>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            network,
            config,
            syncing: AtomicBool::new(false),
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn network(&self) -> &Arc<dyn NetworkMonitor> {
        &self.network
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Register a listener called once per pass, skipped passes included.
    pub fn on_sync_complete<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncResult) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Start background syncing: periodic passes, reconnect bursts and
    /// visibility triggers.
    pub fn start(self: &Arc<Self>) -> SchedulerHandle {
        SchedulerHandle::spawn(Arc::clone(self))
    }

    /// Run one sync pass now.
    pub async fn sync_now(&self) -> SyncResult {
        let started_at = Utc::now();

        if !self.network.is_online() {
            tracing::debug!("sync skipped, offline");
            return self.report(SyncResult::skipped(SyncOutcome::Offline, started_at));
        }
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("sync skipped, another pass is running");
            return self.report(SyncResult::skipped(SyncOutcome::AlreadySyncing, started_at));
        }
        let _syncing = SyncingGuard(&self.syncing);

        let clock = Instant::now();
        let mut pass = Pass::default();
        self.pull(&mut pass).await;
        self.push(&mut pass).await;

        let result = pass.finish(started_at, clock.elapsed());
        tracing::info!(
            outcome = ?result.outcome,
            synced = result.items_synced,
            failed = result.items_failed,
            pulled = result.reference_items_pulled,
            conflicts = result.conflicts.len(),
            duration_ms = result.duration_ms,
            "sync pass finished"
        );
        self.report(result)
    }

    fn report(&self, result: SyncResult) -> SyncResult {
        self.listeners.emit(&result);
        result
    }

    async fn pull(&self, pass: &mut Pass) {
        for collection in self.store.schema().reference_collections() {
            let items = match self
                .remote
                .pull(&collection.name, &collection.endpoint_path())
                .await
            {
                Ok(items) => items,
                Err(err) => {
                    tracing::warn!(collection = %collection.name, error = %err, "reference pull failed");
                    let kind = match &err {
                        crate::remote::RemoteError::Network(_) => SyncIssueKind::Network,
                        _ => SyncIssueKind::Rejected,
                    };
                    pass.issues
                        .push(SyncIssue::for_collection(kind, &collection.name, err.to_string()));
                    continue;
                }
            };

            for value in items {
                match self.store.apply_remote(&collection.name, value).await {
                    Ok(true) => pass.pulled += 1,
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(collection = %collection.name, error = %err, "reference record not applied");
                        pass.issues.push(SyncIssue::for_collection(
                            kind_of(&err),
                            &collection.name,
                            err.to_string(),
                        ));
                    }
                }
            }
        }
    }

    async fn push(&self, pass: &mut Pass) {
        let pending = match self.store.queue().list_pending().await {
            Ok(pending) => pending,
            Err(err) => {
                tracing::error!(error = %err, "could not read the sync queue");
                pass.issues.push(SyncIssue::for_collection(
                    SyncIssueKind::Storage,
                    crate::schema::SYNC_QUEUE,
                    err.to_string(),
                ));
                return;
            }
        };
        tracing::debug!(pending = pending.len(), "push phase started");

        // Records whose earlier entry did not go through this pass.
        let mut blocked: HashSet<(String, String)> = HashSet::new();
        for item in pending {
            if !self.network.is_online() {
                tracing::info!("went offline mid-pass, leaving the rest for later");
                break;
            }
            let key = (item.object_store.clone(), item.record_id.clone());
            if blocked.contains(&key) {
                tracing::debug!(queue_id = %item.id, record_id = %item.record_id, "earlier entry unsettled, skipped");
                continue;
            }
            if !self.push_item(&item, pass).await {
                blocked.insert(key);
            }
        }
    }

    fn endpoint_for(&self, collection: &str) -> String {
        self.store
            .schema()
            .get_collection(collection)
            .map(|c| c.endpoint_path())
            .unwrap_or_else(|| format!("/api/{collection}"))
    }

    /// Push one item. Returns whether it settled.
    async fn push_item(&self, item: &SyncQueueItem, pass: &mut Pass) -> bool {
        let endpoint = self.endpoint_for(&item.object_store);
        tracing::debug!(
            queue_id = %item.id,
            collection = %item.object_store,
            record_id = %item.record_id,
            operation = %item.operation,
            "pushing"
        );

        match self.remote.push(&endpoint, item, item.force_override).await {
            Ok(PushOutcome::Accepted(body)) => {
                match self
                    .store
                    .finish_push(&item.id, body.as_ref(), false, None)
                    .await
                {
                    Ok(_) => {
                        pass.synced += 1;
                        true
                    }
                    Err(err) => {
                        self.storage_issue(item, err, pass);
                        false
                    }
                }
            }
            Ok(PushOutcome::Conflict(server)) => self.resolve(item, &endpoint, server, pass).await,
            Ok(PushOutcome::Rejected { status, message }) => {
                self.fail(
                    item,
                    &format!("HTTP {status}: {message}"),
                    SyncIssueKind::Rejected,
                    None,
                    pass,
                )
                .await;
                false
            }
            Err(err) => {
                self.fail(item, &err.to_string(), SyncIssueKind::Network, None, pass)
                    .await;
                false
            }
        }
    }

    /// Run the conflict protocol for one item.
    async fn resolve(
        &self,
        item: &SyncQueueItem,
        endpoint: &str,
        server: Value,
        pass: &mut Pass,
    ) -> bool {
        let strategy = item
            .conflict_resolution
            .unwrap_or_else(|| self.store.schema().strategy_for(&item.object_store));
        let decision = decide(strategy, item.local_updated_at(), updated_at_of(&server));
        tracing::warn!(
            queue_id = %item.id,
            record_id = %item.record_id,
            %strategy,
            ?decision,
            "version conflict"
        );

        let context = ConflictContext {
            strategy,
            local: item.data.clone(),
            server,
        };
        let mut summary = ConflictSummary {
            queue_id: item.id.clone(),
            collection: item.object_store.clone(),
            record_id: item.record_id.clone(),
            strategy,
            resolution: ConflictResolution::Resolved,
            winner: None,
            conflict_id: None,
        };

        match decision {
            ConflictDecision::AcceptServer => {
                match self.store.accept_server(&item.id, &context).await {
                    Ok(_) => summary.winner = Some(Winner::Server),
                    Err(err) => {
                        summary.resolution = ConflictResolution::Failed;
                        self.fail(item, &err.to_string(), kind_of(&err), Some(&context), pass)
                            .await;
                    }
                }
            }
            ConflictDecision::ForcePushLocal => {
                match self.remote.push(endpoint, item, true).await {
                    Ok(PushOutcome::Accepted(body)) => {
                        match self
                            .store
                            .finish_push(&item.id, body.as_ref(), true, Some((&context, Winner::Local)))
                            .await
                        {
                            Ok(_) => {
                                pass.synced += 1;
                                summary.winner = Some(Winner::Local);
                            }
                            Err(err) => {
                                summary.resolution = ConflictResolution::Failed;
                                self.storage_issue(item, err, pass);
                            }
                        }
                    }
                    Ok(PushOutcome::Conflict(_)) => {
                        summary.resolution = ConflictResolution::Failed;
                        self.fail(
                            item,
                            "authority refused the override",
                            SyncIssueKind::Rejected,
                            Some(&context),
                            pass,
                        )
                        .await;
                    }
                    Ok(PushOutcome::Rejected { status, message }) => {
                        summary.resolution = ConflictResolution::Failed;
                        self.fail(
                            item,
                            &format!("forced push got HTTP {status}: {message}"),
                            SyncIssueKind::Rejected,
                            Some(&context),
                            pass,
                        )
                        .await;
                    }
                    Err(err) => {
                        summary.resolution = ConflictResolution::Failed;
                        self.fail(item, &err.to_string(), SyncIssueKind::Network, Some(&context), pass)
                            .await;
                    }
                }
            }
            ConflictDecision::Hold => match self.store.hold_conflict(&item.id, &context).await {
                Ok(conflict) => {
                    summary.resolution = ConflictResolution::Deferred;
                    summary.conflict_id = Some(conflict.id.clone());
                    pass.issues.push(SyncIssue::for_item(
                        SyncIssueKind::UnresolvedConflict,
                        item,
                        format!("held for manual review as conflict {}", conflict.id),
                    ));
                }
                Err(err) => {
                    summary.resolution = ConflictResolution::Failed;
                    self.storage_issue(item, err, pass);
                }
            },
        }

        let settled = summary.winner.is_some();
        pass.conflicts.push(summary);
        settled
    }

    async fn fail(
        &self,
        item: &SyncQueueItem,
        message: &str,
        kind: SyncIssueKind,
        conflict: Option<&ConflictContext>,
        pass: &mut Pass,
    ) {
        pass.failed += 1;
        match self.store.fail_push(&item.id, message, conflict).await {
            Ok(updated) => {
                let kind = if updated.sync_status == SyncStatus::Error {
                    SyncIssueKind::ExhaustedRetries
                } else {
                    kind
                };
                pass.issues.push(SyncIssue::for_item(kind, item, message));
            }
            Err(err) => self.storage_issue(item, err, pass),
        }
    }

    fn storage_issue(&self, item: &SyncQueueItem, err: Error, pass: &mut Pass) {
        tracing::error!(queue_id = %item.id, error = %err, "store failed during sync");
        pass.issues
            .push(SyncIssue::for_item(kind_of(&err), item, err.to_string()));
    }
}
