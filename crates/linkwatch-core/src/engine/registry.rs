// Linkwatch Engine — Session Registry
//
// Owns the tenant → session map and is the only structure the control plane
// touches concurrently. Swapping a tenant's session (start, stop, restart) is
// serialized by a per-tenant async lock; calls for different tenants never
// wait on each other. The lock covers the swap only, not the adapter launch,
// so a stop can always cancel a start that is still launching. Locks for
// tenants with no session are dropped once nobody waits on them.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::adapter::AdapterFactory;
use crate::engine::config::{EngineSettings, SessionConfig};
use crate::engine::credentials::CredentialStore;
use crate::engine::dispatcher::{Dispatch, WebhookDispatcher};
use crate::engine::session::{Session, SessionSnapshot};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Slack on top of the connect timeout so the session watchdog reports first.
const WAIT_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    pub timed_out: Vec<String>,
}

pub struct SessionRegistry {
    settings: Arc<EngineSettings>,
    adapters: Arc<dyn AdapterFactory>,
    dispatcher: Arc<dyn Dispatch>,
    store: Arc<dyn CredentialStore>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    lifecycle: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new(
        settings: EngineSettings,
        adapters: Arc<dyn AdapterFactory>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let dispatcher = Arc::new(WebhookDispatcher::new(&settings));
        SessionRegistry {
            settings: Arc::new(settings),
            adapters,
            dispatcher,
            store,
            sessions: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the HTTP dispatcher.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatch>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    fn lifecycle_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.lifecycle
            .lock()
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the tenant's lock if it has no session and no other holder.
    /// Call after the guard is released.
    fn prune_lifecycle(&self, user_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.lifecycle.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 && !self.sessions.lock().contains_key(user_id) {
            locks.remove(user_id);
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Replace any existing session for `user_id` with a fresh one and begin
    /// initialization. Returns once the adapter has launched; connection
    /// continues in the background.
    pub async fn start(&self, user_id: &str, config: SessionConfig) -> EngineResult<SessionSnapshot> {
        validate_user_id(user_id)?;
        let lock = self.lifecycle_lock(user_id);
        let session = {
            let _guard = lock.lock().await;
            self.replace(user_id, config).await
        };
        self.launch(session).await
    }

    /// `start`, then wait for `connected`. Fails with `ConnectionTimeout`
    /// when the session does not authenticate in time.
    pub async fn start_and_wait(&self, user_id: &str, config: SessionConfig) -> EngineResult<SessionSnapshot> {
        self.start(user_id, config).await?;
        let session = self.session(user_id)?;
        session
            .wait_until_connected(self.settings.connect_timeout() + WAIT_SLACK)
            .await?;
        Ok(session.snapshot())
    }

    /// Stop the tenant's current session and register a fresh one in its
    /// place. Caller holds the tenant's lifecycle lock.
    async fn replace(&self, user_id: &str, config: SessionConfig) -> Arc<Session> {
        let existing = self.sessions.lock().remove(user_id);
        if let Some(old) = existing {
            info!("[registry] Replacing existing session for {}", user_id);
            self.stop_bounded(&old).await;
        }

        let adapter = self.adapters.create(user_id);
        let session = Session::new(
            user_id,
            config,
            self.settings.clone(),
            adapter,
            self.dispatcher.clone(),
            self.store.clone(),
        );
        self.sessions.lock().insert(user_id.to_string(), session.clone());
        session
    }

    async fn launch(&self, session: Arc<Session>) -> EngineResult<SessionSnapshot> {
        // A failed launch stays registered so its error is visible in status.
        session.start().await?;
        info!("[registry] Started session for {}", session.user_id());
        Ok(session.snapshot())
    }

    /// Tear down and forget the tenant's session. Returns false if there
    /// was none.
    pub async fn stop(&self, user_id: &str) -> bool {
        let lock = self.lifecycle_lock(user_id);
        let stopped = {
            let _guard = lock.lock().await;
            let existing = self.sessions.lock().remove(user_id);
            match existing {
                Some(session) => {
                    self.stop_bounded(&session).await;
                    self.adapters.release(user_id);
                    info!("[registry] Stopped session for {}", user_id);
                    true
                }
                None => false,
            }
        };
        self.prune_lifecycle(user_id, lock);
        stopped
    }

    /// Stop then start under one lock. `None` reuses the running session's
    /// destinations.
    pub async fn restart(&self, user_id: &str, config: Option<SessionConfig>) -> EngineResult<SessionSnapshot> {
        validate_user_id(user_id)?;
        let lock = self.lifecycle_lock(user_id);
        let session = {
            let _guard = lock.lock().await;
            let config = match config {
                Some(c) => c,
                None => self
                    .sessions
                    .lock()
                    .get(user_id)
                    .map(|s| s.config().clone())
                    .unwrap_or_default(),
            };
            self.replace(user_id, config).await
        };
        self.launch(session).await
    }

    async fn stop_bounded(&self, session: &Session) {
        let wait = self.settings.shutdown_wait();
        if tokio::time::timeout(wait, session.stop()).await.is_err() {
            warn!("[registry] Teardown of {} exceeded {}s, abandoning", session.user_id(), wait.as_secs());
        }
    }

    /// Stop every session concurrently, bounding each teardown.
    pub async fn shutdown_all(&self) -> ShutdownReport {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return ShutdownReport::default();
        }
        info!("[registry] Shutting down {} session(s)", sessions.len());

        let wait = self.settings.shutdown_wait();
        let results = futures::future::join_all(sessions.iter().map(|session| async move {
            let finished = tokio::time::timeout(wait, session.stop()).await.is_ok();
            (session.user_id().to_string(), finished)
        }))
        .await;

        self.lifecycle.lock().retain(|_, lock| Arc::strong_count(lock) > 1);

        let mut report = ShutdownReport::default();
        for (user_id, finished) in results {
            self.adapters.release(&user_id);
            if finished {
                report.stopped.push(user_id);
            } else {
                warn!("[registry] Teardown of {} timed out during shutdown", user_id);
                report.timed_out.push(user_id);
            }
        }
        report.stopped.sort();
        report.timed_out.sort();
        report
    }

    // ── Queries ────────────────────────────────────────────────────────

    pub fn session(&self, user_id: &str) -> EngineResult<Arc<Session>> {
        self.sessions
            .lock()
            .get(user_id)
            .cloned()
            .ok_or_else(|| EngineError::SessionNotFound(user_id.to_string()))
    }

    pub fn get(&self, user_id: &str) -> Option<SessionSnapshot> {
        let session = self.sessions.lock().get(user_id).cloned();
        session.map(|s| s.snapshot())
    }

    /// Snapshots of all sessions, ordered by tenant id.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().values().cloned().collect();
        let mut out: Vec<SessionSnapshot> = sessions.iter().map(|s| s.snapshot()).collect();
        out.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        out
    }

    /// Current encoded QR challenge for the tenant.
    pub fn challenge(&self, user_id: &str) -> EngineResult<Option<String>> {
        Ok(self.session(user_id)?.current_challenge())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

fn validate_user_id(user_id: &str) -> EngineResult<()> {
    if user_id.trim().is_empty() {
        return Err(EngineError::Config("userId is required".into()));
    }
    Ok(())
}
