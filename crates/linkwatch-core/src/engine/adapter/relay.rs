// Linkwatch Engine — Relay Adapter
// RelayAdapter, RelayHub
//
// For deployments where the browser automation runs out of process: the
// driver POSTs platform events to the control plane, which pushes them into
// the tenant's relay. The hub doubles as the AdapterFactory so every session
// start gets a fresh relay registered under its tenant id.

use super::{AdapterEvent, AdapterFactory, InboundMessage, PlatformAdapter};
use crate::atoms::constants::ADAPTER_EVENT_BUFFER;
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::credentials::CredentialBlob;
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const ADAPTER_NAME: &str = "relay";

// ── Relay Adapter ──────────────────────────────────────────────────────

pub struct RelayAdapter {
    user_id: String,
    tx: Mutex<Option<mpsc::Sender<AdapterEvent>>>,
    rx: Mutex<Option<mpsc::Receiver<AdapterEvent>>>,
    live: AtomicBool,
    /// Blob handed to the session at start, for the driver to restore.
    loaded: Mutex<Option<CredentialBlob>>,
    /// Latest snapshot reported by the driver.
    snapshot: Mutex<Option<CredentialBlob>>,
}

impl RelayAdapter {
    pub fn new(user_id: &str) -> Self {
        let (tx, rx) = mpsc::channel(ADAPTER_EVENT_BUFFER);
        RelayAdapter {
            user_id: user_id.to_string(),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            live: AtomicBool::new(false),
            loaded: Mutex::new(None),
            snapshot: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Queue an event for the session. Fails once the relay is torn down.
    pub async fn push(&self, event: AdapterEvent) -> EngineResult<()> {
        let tx = self.tx.lock().clone();
        let tx = tx.ok_or_else(|| EngineError::SessionNotFound(self.user_id.clone()))?;
        debug!("[relay] {} ← {}", self.user_id, event.name());
        tx.send(event)
            .await
            .map_err(|_| EngineError::SessionNotFound(self.user_id.clone()))
    }

    pub fn set_snapshot(&self, blob: CredentialBlob) {
        *self.snapshot.lock() = Some(blob);
    }

    pub fn loaded_credentials(&self) -> Option<CredentialBlob> {
        self.loaded.lock().clone()
    }

    fn is_torn_down(&self) -> bool {
        self.tx.lock().is_none()
    }
}

#[async_trait]
impl PlatformAdapter for RelayAdapter {
    fn name(&self) -> &str {
        ADAPTER_NAME
    }

    async fn launch(&self) -> EngineResult<mpsc::Receiver<AdapterEvent>> {
        let rx = self.rx.lock().take()
            .ok_or_else(|| EngineError::adapter(ADAPTER_NAME, "already launched"))?;
        self.live.store(true, Ordering::Relaxed);
        info!("[relay] Launched relay for {}", self.user_id);
        Ok(rx)
    }

    async fn load_credentials(&self, blob: &CredentialBlob) -> EngineResult<()> {
        *self.loaded.lock() = Some(blob.clone());
        Ok(())
    }

    async fn export_credentials(&self) -> EngineResult<CredentialBlob> {
        self.snapshot.lock().clone()
            .ok_or_else(|| EngineError::adapter(ADAPTER_NAME, "driver has not reported credentials"))
    }

    async fn poll_messages(&self) -> EngineResult<Vec<InboundMessage>> {
        // Everything arrives by push.
        Ok(Vec::new())
    }

    async fn resolve_sender(&self, _sender: &str) -> EngineResult<String> {
        Err(EngineError::adapter(ADAPTER_NAME, "no contact lookup"))
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed) && !self.is_torn_down()
    }

    async fn teardown(&self) -> EngineResult<()> {
        let was_open = self.tx.lock().take().is_some();
        self.live.store(false, Ordering::Relaxed);
        if was_open {
            info!("[relay] Relay for {} torn down", self.user_id);
        }
        Ok(())
    }
}

// ── Relay Hub ──────────────────────────────────────────────────────────

/// Tenant id → the relay of its current session.
#[derive(Default)]
pub struct RelayHub {
    relays: Mutex<HashMap<String, Arc<RelayAdapter>>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<RelayAdapter>> {
        self.relays.lock().get(user_id).cloned()
    }

    fn live_relay(&self, user_id: &str) -> EngineResult<Arc<RelayAdapter>> {
        self.get(user_id)
            .filter(|r| !r.is_torn_down())
            .ok_or_else(|| EngineError::SessionNotFound(user_id.to_string()))
    }

    pub async fn push(&self, user_id: &str, event: AdapterEvent) -> EngineResult<()> {
        self.live_relay(user_id)?.push(event).await
    }

    pub fn store_credentials(&self, user_id: &str, blob: CredentialBlob) -> EngineResult<()> {
        self.live_relay(user_id)?.set_snapshot(blob);
        Ok(())
    }

    pub fn loaded_credentials(&self, user_id: &str) -> EngineResult<Option<CredentialBlob>> {
        Ok(self.live_relay(user_id)?.loaded_credentials())
    }
}

impl AdapterFactory for RelayHub {
    fn create(&self, user_id: &str) -> Arc<dyn PlatformAdapter> {
        let relay = Arc::new(RelayAdapter::new(user_id));
        self.relays.lock().insert(user_id.to_string(), relay.clone());
        relay
    }

    fn release(&self, user_id: &str) {
        let mut relays = self.relays.lock();
        // A newer session may already own the slot.
        if relays.get(user_id).is_some_and(|r| r.is_torn_down()) {
            relays.remove(user_id);
            debug!("[relay] Forgot relay for {}", user_id);
        }
    }
}
