// Linkwatch Engine — Configuration
// EngineSettings (process-wide knobs) and SessionConfig (per-tenant destinations)

use crate::atoms::constants::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Engine Settings ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Seconds a session may take to reach `connected` (default: 300)
    pub connect_timeout_secs: u64,
    /// Fallback poll cadence in seconds (default: 5, 0 disables polling)
    pub poll_interval_secs: u64,
    /// Timeout for deliveries to the tenant webhook (default: 10)
    pub webhook_timeout_secs: u64,
    /// Timeout for deliveries to the platform callback (default: 5)
    pub callback_timeout_secs: u64,
    /// Bounded wait per session during shutdown_all (default: 10)
    pub shutdown_wait_secs: u64,
    /// Max remembered message ids per session (default: 10 000)
    pub seen_capacity: usize,
    /// Bearer token attached to tenant webhook requests
    pub webhook_secret: Option<String>,
    /// Bearer token attached to platform callback requests
    pub callback_secret: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            webhook_timeout_secs: DEFAULT_WEBHOOK_TIMEOUT_SECS,
            callback_timeout_secs: DEFAULT_CALLBACK_TIMEOUT_SECS,
            shutdown_wait_secs: DEFAULT_SHUTDOWN_WAIT_SECS,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            webhook_secret: None,
            callback_secret: None,
        }
    }
}

impl EngineSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// `None` when polling is disabled.
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_wait_secs)
    }
}

// ── Session Config ─────────────────────────────────────────────────────

/// Destinations fixed at session creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
}

impl SessionConfig {
    pub fn new(webhook_url: Option<String>, callback_url: Option<String>) -> Self {
        SessionConfig {
            webhook_url: webhook_url.filter(|u| !u.trim().is_empty()),
            callback_url: callback_url.filter(|u| !u.trim().is_empty()),
        }
    }

    pub fn has_destinations(&self) -> bool {
        self.webhook_url.is_some() || self.callback_url.is_some()
    }
}
