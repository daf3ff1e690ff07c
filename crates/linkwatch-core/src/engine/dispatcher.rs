// Linkwatch Engine — Webhook Dispatcher
//
// Delivers session events (connection status, QR challenge, detected link) to
// the tenant's configured destinations:
//   webhook_url   — tenant-operated endpoint, longer timeout, WEBHOOK_SECRET bearer
//   callback_url  — platform callback, shorter timeout, CALLBACK_SECRET bearer
//
// Delivery is fire-and-forget: `dispatch()` returns before any network I/O.
// Each (tenant, destination) pair has its own queue drained by one task, so a
// destination sees a tenant's events in the order they happened while slow
// endpoints never hold up other tenants. One attempt per event, no retry, no
// backoff. Failures are logged and dropped. Idle queues are torn down.

use crate::atoms::constants::WEBHOOK_QUEUE_IDLE_SECS;
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::config::{EngineSettings, SessionConfig};
use crate::engine::session::SessionStatus;
use log::{debug, error, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ── Event Types ────────────────────────────────────────────────────────

/// Outbound webhook body. Serialized with a `type` tag and camelCase fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WebhookEvent {
    ConnectionStatus {
        user_id: String,
        status: SessionStatus,
        timestamp: String,
    },
    QrCode {
        user_id: String,
        qr_code: String,
        timestamp: String,
    },
    LinkDetected {
        user_id: String,
        link: String,
        sender: String,
        message: String,
        timestamp: String,
    },
}

impl WebhookEvent {
    pub fn status(user_id: &str, status: SessionStatus) -> Self {
        WebhookEvent::ConnectionStatus {
            user_id: user_id.to_string(),
            status,
            timestamp: now_rfc3339(),
        }
    }

    pub fn qr_code(user_id: &str, qr_code: &str) -> Self {
        WebhookEvent::QrCode {
            user_id: user_id.to_string(),
            qr_code: qr_code.to_string(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn link(user_id: &str, link: &str, sender: &str, message: &str) -> Self {
        WebhookEvent::LinkDetected {
            user_id: user_id.to_string(),
            link: link.to_string(),
            sender: sender.to_string(),
            message: message.to_string(),
            timestamp: now_rfc3339(),
        }
    }

    /// Wire name of the event type, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WebhookEvent::ConnectionStatus { .. } => "connection_status",
            WebhookEvent::QrCode { .. } => "qr_code",
            WebhookEvent::LinkDetected { .. } => "link_detected",
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            WebhookEvent::ConnectionStatus { user_id, .. }
            | WebhookEvent::QrCode { user_id, .. }
            | WebhookEvent::LinkDetected { user_id, .. } => user_id,
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ── Dispatch Seam ──────────────────────────────────────────────────────

/// Anything that can take a session event off the caller's hands.
///
/// Implementations must not block: the session state machine calls this
/// from its critical path and never awaits delivery.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, targets: &SessionConfig, event: WebhookEvent);
}

// ── Destinations ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum DestinationKind {
    Webhook,
    Callback,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Webhook => write!(f, "webhook"),
            DestinationKind::Callback => write!(f, "callback"),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Destination {
    pub kind: DestinationKind,
    pub url: String,
    pub timeout: Duration,
    pub bearer: Option<String>,
}

struct Delivery {
    dest: Destination,
    event: WebhookEvent,
}

type QueueKey = (String, DestinationKind);
type Queues = Arc<Mutex<HashMap<QueueKey, mpsc::UnboundedSender<Delivery>>>>;

// ── HTTP Dispatcher ────────────────────────────────────────────────────

#[derive(Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    webhook_timeout: Duration,
    callback_timeout: Duration,
    webhook_secret: Option<String>,
    callback_secret: Option<String>,
    queues: Queues,
    queue_idle: Duration,
}

impl WebhookDispatcher {
    pub fn new(settings: &EngineSettings) -> Self {
        WebhookDispatcher {
            client: reqwest::Client::new(),
            webhook_timeout: Duration::from_secs(settings.webhook_timeout_secs),
            callback_timeout: Duration::from_secs(settings.callback_timeout_secs),
            webhook_secret: non_blank(settings.webhook_secret.as_deref()),
            callback_secret: non_blank(settings.callback_secret.as_deref()),
            queues: Arc::new(Mutex::new(HashMap::new())),
            queue_idle: Duration::from_secs(WEBHOOK_QUEUE_IDLE_SECS),
        }
    }

    /// Resolve the configured destinations for one session, webhook first.
    pub(crate) fn destinations(&self, targets: &SessionConfig) -> Vec<Destination> {
        let mut out = Vec::with_capacity(2);
        if let Some(url) = targets.webhook_url.as_deref().filter(|u| !u.is_empty()) {
            out.push(Destination {
                kind: DestinationKind::Webhook,
                url: url.to_string(),
                timeout: self.webhook_timeout,
                bearer: self.webhook_secret.clone(),
            });
        }
        if let Some(url) = targets.callback_url.as_deref().filter(|u| !u.is_empty()) {
            out.push(Destination {
                kind: DestinationKind::Callback,
                url: url.to_string(),
                timeout: self.callback_timeout,
                bearer: self.callback_secret.clone(),
            });
        }
        out
    }
}

impl WebhookDispatcher {
    /// Append to the queue for this tenant and destination, starting its
    /// drain task if there is none.
    fn enqueue(&self, delivery: Delivery) {
        let key = (delivery.event.user_id().to_string(), delivery.dest.kind);
        let mut queues = self.queues.lock();
        let delivery = match queues.get(&key) {
            Some(tx) => match tx.send(delivery) {
                Ok(()) => return,
                // The drain task is gone; start a new one.
                Err(mpsc::error::SendError(d)) => d,
            },
            None => delivery,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(delivery).is_err() {
            return;
        }
        let label = format!("{} queue for {}", key.1, key.0);
        let drain = drain_queue(self.client.clone(), self.queues.clone(), key.clone(), rx, self.queue_idle);
        if spawn_supervised(label, drain) {
            queues.insert(key, tx);
        }
    }
}

impl Dispatch for WebhookDispatcher {
    fn dispatch(&self, targets: &SessionConfig, event: WebhookEvent) {
        for dest in self.destinations(targets) {
            self.enqueue(Delivery { dest, event: event.clone() });
        }
    }
}

/// Deliver queued events one at a time until the queue sits idle.
async fn drain_queue(
    client: reqwest::Client,
    queues: Queues,
    key: QueueKey,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    idle: Duration,
) -> EngineResult<()> {
    loop {
        let delivery = match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(d)) => d,
            Ok(None) => return Ok(()),
            Err(_) => {
                // Senders only enqueue under this lock, so an empty queue
                // here stays empty once the key is gone.
                let mut queues = queues.lock();
                match rx.try_recv() {
                    Ok(d) => d,
                    Err(_) => {
                        queues.remove(&key);
                        debug!("[webhook] {} queue for {} idle, closing", key.1, key.0);
                        return Ok(());
                    }
                }
            }
        };
        if let Err(e) = deliver(&client, &delivery.dest, &delivery.event).await {
            warn!(
                "[webhook] {} {} for {} failed: {}",
                delivery.dest.kind,
                delivery.event.kind(),
                delivery.event.user_id(),
                e
            );
        }
    }
}

/// Single delivery attempt. Non-2xx is an error.
pub(crate) async fn deliver(
    client: &reqwest::Client,
    dest: &Destination,
    event: &WebhookEvent,
) -> EngineResult<()> {
    let mut req = client.post(&dest.url).timeout(dest.timeout).json(event);
    if let Some(token) = &dest.bearer {
        req = req.bearer_auth(token);
    }

    let resp = req.send().await?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let preview: String = text.chars().take(200).collect();
        return Err(EngineError::Other(format!("{} returned {}: {}", dest.kind, status, preview)));
    }

    debug!("[webhook] {} {} delivered for {}", dest.kind, event.kind(), event.user_id());
    Ok(())
}

// ── Detached Tasks ─────────────────────────────────────────────────────

/// Run `fut` detached from the caller. A supervisor task awaits it and logs
/// any error or panic so nothing escapes unobserved. Returns false if there
/// is no runtime to run it on.
pub(crate) fn spawn_supervised<F>(label: String, fut: F) -> bool
where
    F: Future<Output = EngineResult<()>> + Send + 'static,
{
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(h) => h,
        Err(_) => {
            error!("[webhook] No async runtime, dropping {}", label);
            return false;
        }
    };

    let task = handle.spawn(fut);
    handle.spawn(async move {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[webhook] {} failed: {}", label, e),
            Err(e) if e.is_panic() => error!("[webhook] {} panicked", label),
            Err(e) => warn!("[webhook] {} aborted: {}", label, e),
        }
    });
    true
}

fn non_blank(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

// ── Tests ──────────────────────────────────────────────────────────────
