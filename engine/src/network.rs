//! Connectivity tracking.
//!
//! A [`NetworkMonitor`] answers "are we online?" and announces transitions.
//! Two adapters ship:
//!
//! - [`ManualNetwork`] is toggled by hand. Tests use it, and so can hosts
//!   that learn about connectivity some other way.
//! - [`ProbingNetwork`] takes passive link events from the platform and
//!   confirms reachability with a periodic HTTP probe. Link events only say
//!   an interface is up, the probe says the authority answers.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::listeners::{ListenerRegistry, Subscription};

/// Connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Online,
    Offline,
}

impl NetworkStatus {
    pub fn from_online(online: bool) -> Self {
        if online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        }
    }

    pub fn is_online(self) -> bool {
        self == NetworkStatus::Online
    }
}

impl std::fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkStatus::Online => write!(f, "online"),
            NetworkStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Source of connectivity state.
pub trait NetworkMonitor: Send + Sync + std::fmt::Debug {
    /// Current state.
    fn status(&self) -> NetworkStatus;

    /// Watch channel following every transition.
    fn watch(&self) -> watch::Receiver<NetworkStatus>;

    /// Call `listener` on every transition.
    fn on_change(&self, listener: Box<dyn Fn(&NetworkStatus) + Send + Sync>) -> Subscription;

    fn is_online(&self) -> bool {
        self.status().is_online()
    }
}

/// Current state plus the listeners interested in it.
#[derive(Debug)]
struct StatusCell {
    sender: watch::Sender<NetworkStatus>,
    listeners: ListenerRegistry<NetworkStatus>,
}

impl StatusCell {
    fn new(initial: NetworkStatus) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender,
            listeners: ListenerRegistry::new(),
        }
    }

    fn status(&self) -> NetworkStatus {
        *self.sender.borrow()
    }

    /// Returns whether the state changed.
    fn set(&self, status: NetworkStatus) -> bool {
        let changed = self.sender.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            tracing::info!(%status, "network status changed");
            self.listeners.emit(&status);
        }
        changed
    }

    fn on_change(&self, listener: Box<dyn Fn(&NetworkStatus) + Send + Sync>) -> Subscription {
        self.listeners.subscribe(listener)
    }
}

/// Hand-toggled monitor.
#[derive(Debug, Clone)]
pub struct ManualNetwork {
    cell: Arc<StatusCell>,
}

impl ManualNetwork {
    pub fn new(initial: NetworkStatus) -> Self {
        Self {
            cell: Arc::new(StatusCell::new(initial)),
        }
    }

    pub fn online() -> Self {
        Self::new(NetworkStatus::Online)
    }

    pub fn offline() -> Self {
        Self::new(NetworkStatus::Offline)
    }

    /// Returns whether the state changed.
    pub fn set_status(&self, status: NetworkStatus) -> bool {
        self.cell.set(status)
    }

    pub fn go_online(&self) -> bool {
        self.set_status(NetworkStatus::Online)
    }

    pub fn go_offline(&self) -> bool {
        self.set_status(NetworkStatus::Offline)
    }
}

impl NetworkMonitor for ManualNetwork {
    fn status(&self) -> NetworkStatus {
        self.cell.status()
    }

    fn watch(&self) -> watch::Receiver<NetworkStatus> {
        self.cell.sender.subscribe()
    }

    fn on_change(&self, listener: Box<dyn Fn(&NetworkStatus) + Send + Sync>) -> Subscription {
        self.cell.on_change(listener)
    }
}

/// Production monitor: passive link events plus an active liveness probe.
#[derive(Debug)]
pub struct ProbingNetwork {
    cell: Arc<StatusCell>,
    client: reqwest::Client,
    probe_url: String,
    interval: Duration,
    task: std::sync::Mutex<Option<ProbeTask>>,
}

#[derive(Debug)]
struct ProbeTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProbingNetwork {
    /// Build a monitor that starts `offline` until the first probe answers.
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .map_err(|err| Error::Config(format!("failed to construct probe client: {err}")))?;
        Ok(Self {
            cell: Arc::new(StatusCell::new(NetworkStatus::Offline)),
            client,
            probe_url: config.probe_target(),
            interval: config.probe_interval,
            task: std::sync::Mutex::new(None),
        })
    }

    /// Spawn the probe loop on the current tokio runtime. The first probe
    /// runs immediately. Calling this while running is a no-op; after
    /// [`stop`](Self::stop) it spawns a fresh loop.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }

        let cell = Arc::clone(&self.cell);
        let client = self.client.clone();
        let url = self.probe_url.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(probe_url = %url, interval_secs = self.interval.as_secs(), "network probe started");
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let status = probe(&client, &url).await;
                        cell.set(status);
                    }
                }
            }
            tracing::info!("network probe stopped");
        });
        *task = Some(ProbeTask {
            cancel: token,
            handle,
        });
    }

    /// Stop the probe loop. [`start`](Self::start) may be called again.
    pub fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel.cancel();
        }
    }

    /// Whether the probe loop is alive.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Platform link event. Link-down is believed at once. Link-up flips
    /// the state to online at once too; the next probe corrects it if the
    /// authority is not actually reachable.
    pub fn report_link(&self, up: bool) -> bool {
        tracing::debug!(up, "link event");
        self.cell.set(NetworkStatus::from_online(up))
    }

    /// Probe once and apply the result.
    pub async fn probe_now(&self) -> NetworkStatus {
        let status = probe(&self.client, &self.probe_url).await;
        self.cell.set(status);
        status
    }
}

impl NetworkMonitor for ProbingNetwork {
    fn status(&self) -> NetworkStatus {
        self.cell.status()
    }

    fn watch(&self) -> watch::Receiver<NetworkStatus> {
        self.cell.sender.subscribe()
    }

    fn on_change(&self, listener: Box<dyn Fn(&NetworkStatus) + Send + Sync>) -> Subscription {
        self.cell.on_change(listener)
    }
}

impl Drop for ProbingNetwork {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn probe(client: &reqwest::Client, url: &str) -> NetworkStatus {
    match client.get(url).send().await {
        Ok(response) if response.status().is_success() => NetworkStatus::Online,
        Ok(response) => {
            tracing::debug!(status = response.status().as_u16(), "probe answered with an error");
            NetworkStatus::Offline
        }
        Err(err) => {
            tracing::debug!(error = %err, "probe failed");
            NetworkStatus::Offline
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn manual_network_notifies_on_transitions_only() {
        let network = ManualNetwork::offline();
        let changes = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&changes);
        let subscription = network.on_change(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!network.is_online());
        assert!(network.go_online());
        assert!(!network.go_online());
        assert!(network.is_online());
        assert!(network.go_offline());
        assert_eq!(changes.load(Ordering::SeqCst), 2);

        subscription.unsubscribe();
        network.go_online();
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn watch_follows_status() {
        let network = ManualNetwork::offline();
        let mut rx = network.watch();

        network.go_online();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), NetworkStatus::Online);
    }

    #[tokio::test]
    async fn probe_against_unreachable_host_is_offline() {
        let config = SyncConfig::new("http://127.0.0.1:9")
            .with_probe_url("http://127.0.0.1:9/health");
        let network = ProbingNetwork::new(&config).unwrap();

        assert!(network.report_link(true));
        assert_eq!(network.probe_now().await, NetworkStatus::Offline);
        assert!(!network.is_online());
    }

    #[tokio::test]
    async fn monitor_restarts_after_stop() {
        let config = SyncConfig::new("http://127.0.0.1:9")
            .with_probe_url("http://127.0.0.1:9/health");
        let network = ProbingNetwork::new(&config).unwrap();

        network.start();
        assert!(network.is_running());
        network.stop();
        assert!(!network.is_running());

        // The restarted loop checks right away and corrects the link event.
        network.report_link(true);
        let mut rx = network.watch();
        network.start();
        assert!(network.is_running());
        tokio::time::timeout(
            Duration::from_secs(10),
            rx.wait_for(|status| *status == NetworkStatus::Offline),
        )
        .await
        .unwrap()
        .unwrap();

        network.stop();
        assert!(!network.is_running());
    }
}
