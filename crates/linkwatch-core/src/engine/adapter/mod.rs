// Linkwatch Engine — Platform Adapter
//
// The adapter drives the third-party messaging web client for one tenant.
// Sessions only see it through this contract:
//   events   — launch() returns a stream of AdapterEvent
//   commands — load/export credentials, poll, resolve sender, teardown
//
// Module layout:
//   relay — RelayAdapter + RelayHub, events pushed by an external driver

pub mod relay;

use crate::atoms::constants::UNKNOWN_SENDER;
use crate::atoms::error::EngineResult;
use crate::engine::credentials::CredentialBlob;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use relay::{RelayAdapter, RelayHub};

// ── Events ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AdapterEvent {
    /// Client loaded and is ready to start authentication.
    AwaitingAuth,
    /// A fresh pairing challenge was issued.
    ChallengeIssued { token: String },
    /// Authenticated; the client is usable.
    Ready,
    MessageReceived(InboundMessage),
    AuthFailed {
        #[serde(default)]
        reason: String,
    },
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    Fatal {
        #[serde(default)]
        reason: String,
    },
}

impl AdapterEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AdapterEvent::AwaitingAuth => "awaiting_auth",
            AdapterEvent::ChallengeIssued { .. } => "challenge_issued",
            AdapterEvent::Ready => "ready",
            AdapterEvent::MessageReceived(_) => "message_received",
            AdapterEvent::AuthFailed { .. } => "auth_failed",
            AdapterEvent::Disconnected { .. } => "disconnected",
            AdapterEvent::Fatal { .. } => "fatal",
        }
    }
}

// ── Inbound Message ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Platform message id; empty for scraped messages without one.
    #[serde(default)]
    pub id: String,
    pub body: String,
    /// Sender reference, e.g. "15551234567@c.us"
    #[serde(default)]
    pub sender: String,
    /// Chat the message arrived in, e.g. "status@broadcast"
    #[serde(default)]
    pub origin: String,
    /// Display name when the platform already attached one.
    #[serde(default)]
    pub sender_name: Option<String>,
}

impl InboundMessage {
    /// Dedup key: the platform id, else a digest of origin, sender and body.
    pub fn key(&self) -> String {
        if !self.id.is_empty() {
            return self.id.clone();
        }
        let mut hasher = Sha256::new();
        hasher.update(self.origin.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.sender.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.body.as_bytes());
        hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Broadcast lists and status feeds are not user conversations.
    pub fn is_system_origin(&self) -> bool {
        self.origin.ends_with("@broadcast") || self.origin == "status"
    }
}

/// Placeholder name when the platform cannot resolve a sender: the numeric
/// user part of the reference if there is one, else "Unknown".
pub fn fallback_sender_name(sender: &str) -> String {
    let user = sender.split('@').next().unwrap_or("");
    if !user.is_empty() && user.chars().all(|c| c.is_ascii_digit()) {
        user.to_string()
    } else {
        UNKNOWN_SENDER.to_string()
    }
}

// ── Adapter Contract ───────────────────────────────────────────────────

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Start driving the client. Called once per adapter; the returned
    /// stream ends when the adapter is torn down.
    async fn launch(&self) -> EngineResult<mpsc::Receiver<AdapterEvent>>;

    /// Seed a previous session before launch.
    async fn load_credentials(&self, blob: &CredentialBlob) -> EngineResult<()>;

    async fn export_credentials(&self) -> EngineResult<CredentialBlob>;

    /// Fallback feed for platforms whose events can be missed.
    async fn poll_messages(&self) -> EngineResult<Vec<InboundMessage>> {
        Ok(Vec::new())
    }

    async fn resolve_sender(&self, sender: &str) -> EngineResult<String>;

    /// Whether the underlying client handle is still alive.
    fn is_live(&self) -> bool;

    /// Release client resources. Must be safe to call more than once.
    async fn teardown(&self) -> EngineResult<()>;
}

/// Builds one adapter per session.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, user_id: &str) -> Arc<dyn PlatformAdapter>;

    /// Called once the tenant's session is stopped and forgotten.
    fn release(&self, _user_id: &str) {}
}
