//! Engine configuration.

use crate::error::{Error, Result};
use crate::queue::DEFAULT_MAX_RETRIES;
use std::env;
use std::time::Duration;

/// Sync engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Base URL of the remote authority, e.g. `https://api.example.org`
    pub api_base_url: String,
    /// Bearer token sent with every request
    pub auth_token: Option<String>,
    /// Liveness probe target, `{api_base_url}/health` when unset
    pub probe_url: Option<String>,
    /// Periodic sync while online
    pub sync_interval: Duration,
    /// Liveness probe period
    pub probe_interval: Duration,
    /// Liveness probe timeout
    pub probe_timeout: Duration,
    /// Timeout for every push and pull request
    pub request_timeout: Duration,
    /// Follow-up passes after the immediate one on reconnect
    pub reconnect_delays: Vec<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            auth_token: None,
            probe_url: None,
            sync_interval: Duration::from_secs(30),
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            reconnect_delays: vec![Duration::from_secs(2), Duration::from_secs(5)],
        }
    }
}

impl SyncConfig {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// `TROVE_API_URL` is required; everything else falls back to defaults.
    pub fn from_env() -> Result<Self> {
        let api_base_url = env::var("TROVE_API_URL")
            .map_err(|_| Error::Config("TROVE_API_URL environment variable is required".into()))?;

        let mut config = Self::new(api_base_url);
        config.auth_token = env::var("TROVE_AUTH_TOKEN").ok();
        config.probe_url = env::var("TROVE_PROBE_URL").ok();
        if let Some(secs) = secs_from_env("TROVE_SYNC_INTERVAL_SECS")? {
            config.sync_interval = secs;
        }
        if let Some(secs) = secs_from_env("TROVE_PROBE_INTERVAL_SECS")? {
            config.probe_interval = secs;
        }
        if let Some(secs) = secs_from_env("TROVE_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = secs;
        }
        Ok(config)
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_probe_url(mut self, url: impl Into<String>) -> Self {
        self.probe_url = Some(url.into());
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_reconnect_delays(mut self, delays: Vec<Duration>) -> Self {
        self.reconnect_delays = delays;
        self
    }

    /// Resolved liveness probe URL.
    pub fn probe_target(&self) -> String {
        self.probe_url
            .clone()
            .unwrap_or_else(|| format!("{}/health", self.api_base_url.trim_end_matches('/')))
    }
}

fn secs_from_env(name: &str) -> Result<Option<Duration>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| Error::Config(format!("invalid {name} value: {raw}"))),
        Err(_) => Ok(None),
    }
}

/// Local store options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Attempt ceiling for new queue items
    pub max_retries: u32,
    /// Default acting user recorded in audit entries
    pub user_id: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            user_id: None,
        }
    }
}

impl StoreOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.sync_interval, Duration::from_secs(30));
        assert_eq!(config.probe_interval, Duration::from_secs(10));
        assert_eq!(
            config.reconnect_delays,
            vec![Duration::from_secs(2), Duration::from_secs(5)]
        );
        assert_eq!(StoreOptions::default().max_retries, 3);
    }

    #[test]
    fn probe_target_defaults_to_health() {
        let config = SyncConfig::new("https://authority.example/");
        assert_eq!(config.probe_target(), "https://authority.example/health");

        let config = config.with_probe_url("https://authority.example/ping");
        assert_eq!(config.probe_target(), "https://authority.example/ping");
    }

    #[test]
    fn max_retries_is_at_least_one() {
        assert_eq!(StoreOptions::default().with_max_retries(0).max_retries, 1);
    }
}
