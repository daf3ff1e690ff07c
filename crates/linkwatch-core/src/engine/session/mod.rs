// Linkwatch Engine — Per-Tenant Session
//
// Module layout:
//   status — SessionStatus, Trigger, transition table
//   seen   — SeenMessages (bounded dedup set)
//   mod    — Session: start, worker loop, event handling, intake, stop
//
// One worker task per session consumes adapter events, a fallback poll and
// the connect watchdog. Status, challenge and dedup state live behind a
// short-lived lock that is never held across an await.

mod seen;
mod status;

pub use seen::SeenMessages;
pub use status::{SessionStatus, Trigger};

use crate::atoms::constants::{RESOLVE_SENDER_TIMEOUT_SECS, WORKER_STOP_GRACE_MS};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::adapter::{fallback_sender_name, AdapterEvent, InboundMessage, PlatformAdapter};
use crate::engine::config::{EngineSettings, SessionConfig};
use crate::engine::credentials::CredentialStore;
use crate::engine::dispatcher::{Dispatch, WebhookEvent};
use crate::engine::links::extract_links;
use crate::engine::qr::QrChallenge;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

// ── Snapshot ───────────────────────────────────────────────────────────

/// Read-only view handed to the control plane.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub user_id: String,
    pub status: SessionStatus,
    pub connected: bool,
    pub has_qr_code: bool,
    pub webhook_url: Option<String>,
    pub callback_url: Option<String>,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub messages_processed: u64,
    pub links_detected: u64,
    pub last_error: Option<String>,
}

// ── Mutable State ──────────────────────────────────────────────────────

struct SessionState {
    status: SessionStatus,
    qr: QrChallenge,
    seen: SeenMessages,
    connected_at: Option<DateTime<Utc>>,
    messages_processed: u64,
    links_detected: u64,
    last_error: Option<String>,
    timed_out: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

// ── Session ────────────────────────────────────────────────────────────

pub struct Session {
    user_id: String,
    config: SessionConfig,
    settings: Arc<EngineSettings>,
    adapter: Arc<dyn PlatformAdapter>,
    dispatcher: Arc<dyn Dispatch>,
    store: Arc<dyn CredentialStore>,
    state: Mutex<SessionState>,
    status_tx: watch::Sender<SessionStatus>,
    stop_tx: watch::Sender<bool>,
    stopped: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        user_id: &str,
        config: SessionConfig,
        settings: Arc<EngineSettings>,
        adapter: Arc<dyn PlatformAdapter>,
        dispatcher: Arc<dyn Dispatch>,
        store: Arc<dyn CredentialStore>,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(SessionStatus::Disconnected);
        let (stop_tx, _) = watch::channel(false);
        let seen = SeenMessages::new(settings.seen_capacity);
        Arc::new(Session {
            user_id: user_id.to_string(),
            config,
            settings,
            adapter,
            dispatcher,
            store,
            state: Mutex::new(SessionState {
                status: SessionStatus::Disconnected,
                qr: QrChallenge::new(),
                seen,
                connected_at: None,
                messages_processed: 0,
                links_detected: 0,
                last_error: None,
                timed_out: false,
            }),
            status_tx,
            stop_tx,
            stopped: AtomicBool::new(false),
            worker: Mutex::new(None),
            started_at: Utc::now(),
        })
    }

    // ── Accessors ──────────────────────────────────────────────────────

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    /// Connected and the platform handle is still alive.
    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Connected && self.adapter.is_live()
    }

    /// Encoded QR challenge; only ever present while `qr_ready`.
    pub fn current_challenge(&self) -> Option<String> {
        self.state.lock().qr.current().map(String::from)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let live = self.adapter.is_live();
        let st = self.state.lock();
        SessionSnapshot {
            user_id: self.user_id.clone(),
            status: st.status,
            connected: st.status == SessionStatus::Connected && live,
            has_qr_code: st.qr.current().is_some(),
            webhook_url: self.config.webhook_url.clone(),
            callback_url: self.config.callback_url.clone(),
            started_at: self.started_at,
            connected_at: st.connected_at,
            messages_processed: st.messages_processed,
            links_detected: st.links_detected,
            last_error: st.last_error.clone(),
        }
    }

    /// Subscribe to status changes.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    // ── Transitions ────────────────────────────────────────────────────

    /// Apply `trigger`; returns `(previous, next)` if it applied. Leaving
    /// `qr_ready` always drops the pending challenge.
    fn apply(&self, trigger: Trigger) -> Option<(SessionStatus, SessionStatus)> {
        let mut st = self.state.lock();
        let next = st.status.next(trigger)?;
        let prev = st.status;
        st.status = next;
        if next != SessionStatus::QrReady {
            st.qr.clear();
        }
        if next == SessionStatus::Connected {
            st.connected_at = Some(Utc::now());
        }
        self.status_tx.send_replace(next);
        drop(st);

        self.log_transition(prev, next);
        Some((prev, next))
    }

    fn apply_and_notify(&self, trigger: Trigger) -> Option<SessionStatus> {
        let (_, next) = self.apply(trigger)?;
        self.notify(WebhookEvent::status(&self.user_id, next));
        Some(next)
    }

    fn log_transition(&self, prev: SessionStatus, next: SessionStatus) {
        if prev != next {
            info!("[session] {} {} → {}", self.user_id, prev, next);
        }
    }

    fn notify(&self, event: WebhookEvent) {
        self.dispatcher.dispatch(&self.config, event);
    }

    fn record_error(&self, message: String) {
        self.state.lock().last_error = Some(message);
    }

    // ── Start ──────────────────────────────────────────────────────────

    /// Move to `initializing`, restore credentials, launch the adapter and
    /// hand its event stream to the worker. Returns once the worker runs;
    /// authentication continues in the background.
    ///
    /// The connect deadline starts here, so a launch that never returns
    /// still fails with `ConnectionTimeout`. A concurrent `stop` abandons the
    /// launch and returns `Ok`.
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        let mut stop_rx = self.stop_tx.subscribe();
        if self.is_stopped() {
            debug!("[session] {} stopped before launch", self.user_id);
            return Ok(());
        }
        if self.apply_and_notify(Trigger::Start).is_none() {
            return Err(EngineError::Other(format!("session for {} already started", self.user_id)));
        }
        let deadline = Instant::now() + self.settings.connect_timeout();

        let launch = async {
            self.restore_credentials().await;
            self.adapter.launch().await
        };
        let launched = tokio::select! {
            result = launch => result,
            _ = async { stop_rx.wait_for(|stopped| *stopped).await.is_ok() } => return Ok(()),
            _ = tokio::time::sleep_until(deadline) => {
                self.on_connect_timeout().await;
                return Err(EngineError::ConnectionTimeout {
                    user_id: self.user_id.clone(),
                    secs: self.settings.connect_timeout_secs,
                });
            }
        };

        let events = match launched {
            Ok(rx) => rx,
            Err(e) => {
                error!("[session] {} adapter launch failed: {}", self.user_id, e);
                self.record_error(e.to_string());
                self.apply_and_notify(Trigger::Fatal);
                self.release_adapter().await;
                return Err(e);
            }
        };

        if self.is_stopped() {
            // stop() ran while we were launching and found nothing to release.
            self.release_adapter().await;
            return Ok(());
        }

        let me = Arc::clone(self);
        let handle = tokio::spawn(async move { me.run(events, deadline).await });
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    async fn restore_credentials(&self) {
        match self.store.load(&self.user_id).await {
            Ok(Some(blob)) if !blob.is_empty() => {
                match self.adapter.load_credentials(&blob).await {
                    Ok(()) => info!("[session] {} restoring saved session", self.user_id),
                    Err(e) => warn!("[session] {} could not apply saved session: {}", self.user_id, e),
                }
            }
            Ok(_) => debug!("[session] {} has no saved session", self.user_id),
            Err(e) => warn!("[session] {} saved session unreadable, starting fresh: {}", self.user_id, e),
        }
    }

    async fn persist_credentials(&self) {
        let blob = match self.adapter.export_credentials().await {
            Ok(b) => b,
            Err(e) => {
                warn!("[session] {} export credentials failed: {}", self.user_id, e);
                return;
            }
        };
        if let Err(e) = self.store.save(&self.user_id, &blob).await {
            warn!("[session] {} save credentials failed: {}", self.user_id, e);
        }
    }

    async fn release_adapter(&self) {
        if let Err(e) = self.adapter.teardown().await {
            warn!("[session] {} adapter teardown failed: {}", self.user_id, e);
        }
    }

    /// Resolve once `connected`, or fail on a terminal status or `timeout`.
    pub async fn wait_until_connected(&self, timeout: Duration) -> EngineResult<()> {
        let mut rx = self.watch_status();
        let wait = async {
            loop {
                let status = *rx.borrow_and_update();
                match status {
                    SessionStatus::Connected => return Ok(()),
                    SessionStatus::Error | SessionStatus::AuthFailed | SessionStatus::Disconnected => {
                        return Err(self.failure_for(status));
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(self.failure_for(SessionStatus::Disconnected));
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::ConnectionTimeout {
                user_id: self.user_id.clone(),
                secs: timeout.as_secs(),
            }),
        }
    }

    fn failure_for(&self, status: SessionStatus) -> EngineError {
        let st = self.state.lock();
        if st.timed_out {
            return EngineError::ConnectionTimeout {
                user_id: self.user_id.clone(),
                secs: self.settings.connect_timeout_secs,
            };
        }
        let detail = st.last_error.clone().unwrap_or_else(|| status.to_string());
        EngineError::adapter(self.adapter.name(), format!("{} ended in {}: {}", self.user_id, status, detail))
    }

    // ── Worker ─────────────────────────────────────────────────────────

    async fn run(self: Arc<Self>, mut events: mpsc::Receiver<AdapterEvent>, deadline: Instant) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut poll = self.settings.poll_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        loop {
            if *stop_rx.borrow() {
                break;
            }
            let status = self.status();
            let polling = poll.is_some() && status == SessionStatus::Connected;

            tokio::select! {
                _ = stop_rx.changed() => break,
                ev = events.recv() => match ev {
                    Some(ev) => {
                        if self.handle_event(ev).await == Flow::Exit {
                            break;
                        }
                    }
                    None => {
                        if !self.is_stopped() {
                            warn!("[session] {} adapter event stream closed", self.user_id);
                            self.record_error("adapter event stream closed".into());
                            self.apply_and_notify(Trigger::Disconnected);
                        }
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline), if status.is_pending() => {
                    self.on_connect_timeout().await;
                    break;
                }
                _ = next_tick(&mut poll), if polling => self.poll_once().await,
            }
        }
        debug!("[session] {} worker exited", self.user_id);
    }

    async fn handle_event(&self, event: AdapterEvent) -> Flow {
        if self.is_stopped() {
            return Flow::Exit;
        }
        debug!("[session] {} event {}", self.user_id, event.name());

        match event {
            AdapterEvent::AwaitingAuth => {
                self.apply_and_notify(Trigger::AwaitingAuth);
            }
            AdapterEvent::ChallengeIssued { token } => self.on_challenge(&token),
            AdapterEvent::Ready => {
                if self.apply_and_notify(Trigger::Authenticated).is_some() {
                    self.persist_credentials().await;
                }
            }
            AdapterEvent::MessageReceived(msg) => {
                if let Err(e) = self.intake(msg).await {
                    warn!("[session] {} message intake failed: {}", self.user_id, e);
                }
            }
            AdapterEvent::AuthFailed { reason } => {
                warn!("[session] {} authentication failed: {}", self.user_id, reason);
                self.record_error(format!("auth failed: {}", reason));
                self.apply_and_notify(Trigger::AuthFailed);
                // The saved session was rejected; the next start pairs afresh.
                if let Err(e) = self.store.remove(&self.user_id).await {
                    warn!("[session] {} could not discard saved session: {}", self.user_id, e);
                }
            }
            AdapterEvent::Disconnected { reason } => {
                warn!("[session] {} disconnected: {}", self.user_id, reason);
                self.record_error(format!("disconnected: {}", reason));
                self.apply_and_notify(Trigger::Disconnected);
                self.release_adapter().await;
                return Flow::Exit;
            }
            AdapterEvent::Fatal { reason } => {
                error!("[session] {} fatal adapter error: {}", self.user_id, reason);
                self.record_error(reason);
                self.apply_and_notify(Trigger::Fatal);
                self.release_adapter().await;
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    fn on_challenge(&self, token: &str) {
        // Capture and transition under one lock so qr_ready never exists
        // without the challenge that caused it.
        let (prev, captured) = {
            let mut st = self.state.lock();
            let Some(next) = st.status.next(Trigger::Challenge) else {
                debug!("[session] {} ignoring challenge in {}", self.user_id, st.status);
                return;
            };
            let prev = st.status;
            let captured = st.qr.capture(token);
            st.status = next;
            self.status_tx.send_replace(next);
            (prev, captured)
        };

        self.log_transition(prev, SessionStatus::QrReady);
        self.notify(WebhookEvent::status(&self.user_id, SessionStatus::QrReady));
        match captured {
            Ok(encoded) => {
                info!("[session] {} QR challenge ready — waiting for scan", self.user_id);
                self.notify(WebhookEvent::qr_code(&self.user_id, &encoded));
            }
            Err(e) => {
                error!("[session] {} could not encode challenge: {}", self.user_id, e);
                self.record_error(e.to_string());
            }
        }
    }

    async fn on_connect_timeout(&self) {
        let secs = self.settings.connect_timeout_secs;
        error!("[session] {} not connected after {}s", self.user_id, secs);
        {
            let mut st = self.state.lock();
            st.timed_out = true;
            st.last_error = Some(format!("not connected after {}s", secs));
        }
        self.apply_and_notify(Trigger::TimedOut);
        self.release_adapter().await;
    }

    async fn poll_once(&self) {
        match self.adapter.poll_messages().await {
            Ok(batch) => {
                for msg in batch {
                    if let Err(e) = self.intake(msg).await {
                        warn!("[session] {} polled message intake failed: {}", self.user_id, e);
                    }
                }
            }
            Err(e) => warn!("[session] {} poll failed: {}", self.user_id, e),
        }
    }

    // ── Intake ─────────────────────────────────────────────────────────

    /// Single entry point for inbound messages from events and polling.
    /// Returns the number of link notifications dispatched; a repeated
    /// message id, a system origin or a non-connected session yields 0.
    pub async fn intake(&self, msg: InboundMessage) -> EngineResult<usize> {
        if msg.is_system_origin() {
            return Ok(0);
        }

        {
            let mut st = self.state.lock();
            if st.status != SessionStatus::Connected {
                return Ok(0);
            }
            if !st.seen.insert(msg.key()) {
                return Ok(0);
            }
            st.messages_processed += 1;
        }

        let links = extract_links(&msg.body);
        if links.is_empty() {
            return Ok(0);
        }

        let sender = self.sender_name(&msg).await;
        self.state.lock().links_detected += links.len() as u64;
        for link in &links {
            info!("[session] {} link from {}: {}", self.user_id, sender, link);
            self.notify(WebhookEvent::link(&self.user_id, link, &sender, &msg.body));
        }
        Ok(links.len())
    }

    async fn sender_name(&self, msg: &InboundMessage) -> String {
        if let Some(name) = msg.sender_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }
        let lookup = tokio::time::timeout(
            Duration::from_secs(RESOLVE_SENDER_TIMEOUT_SECS),
            self.adapter.resolve_sender(&msg.sender),
        )
        .await;
        match lookup {
            Ok(Ok(name)) if !name.trim().is_empty() => name,
            Ok(Ok(_)) => fallback_sender_name(&msg.sender),
            Ok(Err(e)) => {
                debug!("[session] {} sender lookup failed: {}", self.user_id, e);
                fallback_sender_name(&msg.sender)
            }
            Err(_) => {
                debug!("[session] {} sender lookup timed out", self.user_id);
                fallback_sender_name(&msg.sender)
            }
        }
    }

    // ── Stop ───────────────────────────────────────────────────────────

    /// Tear the session down. Safe to call repeatedly and concurrently with
    /// an in-flight authentication wait or intake; later calls are no-ops.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[session] {} stopping", self.user_id);
        self.stop_tx.send_replace(true);

        let worker = self.worker.lock().take();
        if let Some(mut handle) = worker {
            let grace = Duration::from_millis(WORKER_STOP_GRACE_MS);
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("[session] {} worker did not yield, aborting", self.user_id);
                handle.abort();
            }
        }

        if self.is_connected() {
            self.persist_credentials().await;
        }
        self.release_adapter().await;
        if let Some((prev, next)) = self.apply(Trigger::Stop) {
            if prev != next {
                self.notify(WebhookEvent::status(&self.user_id, next));
            }
        }
    }
}

async fn next_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
