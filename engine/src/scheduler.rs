//! Background sync triggers.
//!
//! A running scheduler starts a sync pass when:
//!
//! - the periodic timer fires and the network is online,
//! - the network comes back (one pass at once, then one follow-up per
//!   configured reconnect delay),
//! - the host reports the app became visible again.
//!
//! Going offline drops any follow-ups still waiting. Passes never overlap;
//! the engine's own guard turns a second trigger into a skipped pass.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::engine::SyncEngine;
use crate::network::NetworkStatus;

/// Handle to the background sync loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct SchedulerHandle {
    cancel: CancellationToken,
    visible: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub(crate) fn spawn(engine: Arc<SyncEngine>) -> Self {
        let cancel = CancellationToken::new();
        let visible = Arc::new(Notify::new());
        let task = tokio::spawn(run(engine, cancel.clone(), Arc::clone(&visible)));
        Self {
            cancel,
            visible,
            task: Some(task),
        }
    }

    /// The host app came back to the foreground.
    pub fn notify_visible(&self) {
        self.visible.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the loop and wait for it to exit. A pass in flight is abandoned.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "sync scheduler task failed");
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(engine: Arc<SyncEngine>, cancel: CancellationToken, visible: Arc<Notify>) {
    let interval = engine.config().sync_interval;
    let delays = engine.config().reconnect_delays.clone();
    let mut status = engine.network().watch();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut follow_ups: VecDeque<Instant> = VecDeque::new();

    tracing::info!(
        interval_secs = interval.as_secs(),
        "sync scheduler started"
    );

    loop {
        let next_follow_up = follow_ups.front().copied();
        let trigger = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !engine.network().is_online() {
                    continue;
                }
                "timer"
            }
            changed = status.changed() => {
                if changed.is_err() {
                    tracing::warn!("network monitor went away, scheduler stopping");
                    break;
                }
                let now_online = *status.borrow_and_update() == NetworkStatus::Online;
                if now_online {
                    let now = Instant::now();
                    follow_ups = delays.iter().map(|delay| now + *delay).collect();
                    "reconnect"
                } else {
                    follow_ups.clear();
                    continue;
                }
            }
            _ = visible.notified() => "visible",
            _ = sleep_until(next_follow_up.unwrap_or_else(Instant::now)), if next_follow_up.is_some() => {
                follow_ups.pop_front();
                "reconnect follow-up"
            }
        };

        tracing::debug!(trigger, "sync triggered");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = engine.sync_now() => {}
        }
    }

    tracing::info!("sync scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StoreOptions, SyncConfig};
    use crate::network::ManualNetwork;
    use crate::schema::{CollectionSchema, FieldDef, FieldType, Schema};
    use crate::storage::MemoryStorage;
    use crate::store::LocalStore;
    use crate::testing::ScriptedRemote;
    use crate::SyncResult;
    use std::sync::Mutex;
    use std::time::Duration;

    async fn engine(network: ManualNetwork) -> (Arc<SyncEngine>, Arc<Mutex<Vec<SyncResult>>>) {
        let schema = Schema::new(1).with_collection(CollectionSchema::new(
            "notes",
            vec![FieldDef::required("text", FieldType::String)],
        ));
        let store = LocalStore::open(
            Arc::new(MemoryStorage::new()),
            schema,
            StoreOptions::default(),
        )
        .await
        .unwrap();
        let config = SyncConfig::new("http://authority.test")
            .with_sync_interval(Duration::from_secs(30))
            .with_reconnect_delays(vec![Duration::from_secs(2), Duration::from_secs(5)]);
        let engine = Arc::new(SyncEngine::new(
            Arc::new(store),
            Arc::new(ScriptedRemote::new()),
            Arc::new(network),
            config,
        ));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = engine.on_sync_complete(move |result| {
            sink.lock().unwrap().push(result.clone());
        });
        (engine, seen)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_passes_only_while_online() {
        let network = ManualNetwork::offline();
        let (engine, seen) = engine(network.clone()).await;
        let handle = engine.start();

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        assert!(seen.lock().unwrap().is_empty());

        network.go_online();
        settle().await;
        let after_reconnect = seen.lock().unwrap().len();
        assert_eq!(after_reconnect, 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_runs_immediately_then_follow_ups() {
        let network = ManualNetwork::offline();
        let (engine, seen) = engine(network.clone()).await;
        let handle = engine.start();
        settle().await;

        network.go_online();
        settle().await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        settle().await;
        assert_eq!(seen.lock().unwrap().len(), 2);

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(seen.lock().unwrap().len(), 3);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_cancels_follow_ups() {
        let network = ManualNetwork::offline();
        let (engine, seen) = engine(network.clone()).await;
        let handle = engine.start();
        settle().await;

        network.go_online();
        settle().await;
        network.go_offline();
        settle().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_triggers_a_pass() {
        let network = ManualNetwork::online();
        let (engine, seen) = engine(network).await;
        let handle = engine.start();
        settle().await;

        handle.notify_visible();
        settle().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(handle.is_running());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loop() {
        let network = ManualNetwork::online();
        let (engine, seen) = engine(network).await;
        let handle = engine.start();
        handle.shutdown().await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert!(seen.lock().unwrap().is_empty());
    }
}
