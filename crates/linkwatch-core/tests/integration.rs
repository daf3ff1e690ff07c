// Integration tests for the session engine, driven by scripted in-memory
// adapters and a dispatcher that records every event instead of sending it.

use async_trait::async_trait;
use linkwatch_core::engine::qr::encode_challenge;
use linkwatch_core::{
    AdapterEvent, AdapterFactory, CredentialBlob, CredentialStore, Dispatch, EngineError,
    EngineResult, EngineSettings, InboundMessage, MemoryCredentialStore, PlatformAdapter,
    SessionConfig, SessionRegistry, SessionStatus, WebhookEvent,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

// ── Test doubles ───────────────────────────────────────────────────────

type OrderLog = Arc<Mutex<Vec<String>>>;

struct ScriptedAdapter {
    user_id: String,
    tx: Mutex<Option<mpsc::Sender<AdapterEvent>>>,
    rx: Mutex<Option<mpsc::Receiver<AdapterEvent>>>,
    live: AtomicBool,
    fail_launch: bool,
    hang_launch: bool,
    hang_teardown: bool,
    launches: AtomicUsize,
    teardowns: AtomicUsize,
    loaded: Mutex<Option<CredentialBlob>>,
    polled: Mutex<VecDeque<Vec<InboundMessage>>>,
    names: HashMap<String, String>,
    log: OrderLog,
}

impl ScriptedAdapter {
    async fn push(&self, event: AdapterEvent) {
        let tx = self.tx.lock().clone().expect("adapter torn down");
        tx.send(event).await.expect("event stream closed");
    }

    fn queue_poll(&self, batch: Vec<InboundMessage>) {
        self.polled.lock().push_back(batch);
    }

    fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn launch(&self) -> EngineResult<mpsc::Receiver<AdapterEvent>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.hang_launch {
            std::future::pending::<()>().await;
        }
        if self.fail_launch {
            return Err(EngineError::adapter("scripted", "browser failed to start"));
        }
        let rx = self.rx.lock().take().ok_or("already launched")?;
        self.live.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn load_credentials(&self, blob: &CredentialBlob) -> EngineResult<()> {
        *self.loaded.lock() = Some(blob.clone());
        Ok(())
    }

    async fn export_credentials(&self) -> EngineResult<CredentialBlob> {
        Ok(exported_blob())
    }

    async fn poll_messages(&self) -> EngineResult<Vec<InboundMessage>> {
        Ok(self.polled.lock().pop_front().unwrap_or_default())
    }

    async fn resolve_sender(&self, sender: &str) -> EngineResult<String> {
        self.names
            .get(sender)
            .cloned()
            .ok_or_else(|| EngineError::adapter("scripted", "contact not found"))
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn teardown(&self) -> EngineResult<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("teardown:{}", self.user_id));
        self.tx.lock().take();
        self.live.store(false, Ordering::SeqCst);
        if self.hang_teardown {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedFactory {
    adapters: Mutex<HashMap<String, Arc<ScriptedAdapter>>>,
    scripts: Mutex<HashMap<String, Vec<AdapterEvent>>>,
    hang: Mutex<HashSet<String>>,
    hang_launch: Mutex<HashSet<String>>,
    fail: Mutex<HashSet<String>>,
    log: OrderLog,
}

impl ScriptedFactory {
    /// Events queued into the next adapter created for `user_id`.
    fn script(&self, user_id: &str, events: Vec<AdapterEvent>) {
        self.scripts.lock().insert(user_id.to_string(), events);
    }

    fn hang_teardown(&self, user_id: &str) {
        self.hang.lock().insert(user_id.to_string());
    }

    /// The adapter's launch never returns, like a browser stuck loading.
    fn hang_launch(&self, user_id: &str) {
        self.hang_launch.lock().insert(user_id.to_string());
    }

    fn fail_launch(&self, user_id: &str) {
        self.fail.lock().insert(user_id.to_string());
    }

    fn adapter(&self, user_id: &str) -> Arc<ScriptedAdapter> {
        self.adapters.lock().get(user_id).cloned().expect("no adapter")
    }

    fn launching(&self, user_id: &str) -> bool {
        self.adapters.lock().get(user_id).is_some_and(|a| a.launches() > 0)
    }

    fn order(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl AdapterFactory for ScriptedFactory {
    fn create(&self, user_id: &str) -> Arc<dyn PlatformAdapter> {
        let (tx, rx) = mpsc::channel(64);
        for event in self.scripts.lock().remove(user_id).unwrap_or_default() {
            tx.try_send(event).expect("script too long");
        }
        let mut names = HashMap::new();
        names.insert("1@c.us".to_string(), "Alice".to_string());
        let adapter = Arc::new(ScriptedAdapter {
            user_id: user_id.to_string(),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            live: AtomicBool::new(false),
            fail_launch: self.fail.lock().contains(user_id),
            hang_launch: self.hang_launch.lock().contains(user_id),
            hang_teardown: self.hang.lock().contains(user_id),
            launches: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
            loaded: Mutex::new(None),
            polled: Mutex::new(VecDeque::new()),
            names,
            log: self.log.clone(),
        });
        self.log.lock().push(format!("create:{}", user_id));
        self.adapters.lock().insert(user_id.to_string(), adapter.clone());
        adapter
    }
}

#[derive(Default)]
struct RecordingDispatch {
    events: Mutex<Vec<(SessionConfig, WebhookEvent)>>,
}

impl RecordingDispatch {
    fn events(&self) -> Vec<WebhookEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    fn statuses(&self, user_id: &str) -> Vec<SessionStatus> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WebhookEvent::ConnectionStatus { user_id: u, status, .. } if u == user_id => Some(status),
                _ => None,
            })
            .collect()
    }

    fn qr_codes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WebhookEvent::QrCode { qr_code, .. } => Some(qr_code),
                _ => None,
            })
            .collect()
    }

    fn links(&self) -> Vec<(String, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WebhookEvent::LinkDetected { link, sender, .. } => Some((link, sender)),
                _ => None,
            })
            .collect()
    }
}

impl Dispatch for RecordingDispatch {
    fn dispatch(&self, targets: &SessionConfig, event: WebhookEvent) {
        self.events.lock().push((targets.clone(), event));
    }
}

// ── Harness ────────────────────────────────────────────────────────────

struct Harness {
    registry: SessionRegistry,
    factory: Arc<ScriptedFactory>,
    dispatch: Arc<RecordingDispatch>,
    store: Arc<MemoryCredentialStore>,
}

fn fast_settings() -> EngineSettings {
    EngineSettings {
        connect_timeout_secs: 5,
        poll_interval_secs: 0,
        shutdown_wait_secs: 1,
        ..Default::default()
    }
}

fn harness_with(settings: EngineSettings) -> Harness {
    let factory = Arc::new(ScriptedFactory::default());
    let dispatch = Arc::new(RecordingDispatch::default());
    let store = Arc::new(MemoryCredentialStore::new());
    let registry = SessionRegistry::new(settings, factory.clone(), store.clone())
        .with_dispatcher(dispatch.clone());
    Harness { registry, factory, dispatch, store }
}

fn harness() -> Harness {
    harness_with(fast_settings())
}

fn hook() -> SessionConfig {
    SessionConfig::new(Some("https://hook".into()), None)
}

fn connect_script() -> Vec<AdapterEvent> {
    vec![
        AdapterEvent::AwaitingAuth,
        AdapterEvent::ChallengeIssued { token: "2@first".into() },
        AdapterEvent::Ready,
    ]
}

fn exported_blob() -> CredentialBlob {
    CredentialBlob { cookies: vec![serde_json::json!({"name": "session", "value": "s1"})], ..Default::default() }
}

fn msg(id: &str, body: &str) -> InboundMessage {
    InboundMessage {
        id: id.into(),
        body: body.into(),
        sender: "1@c.us".into(),
        origin: "1@c.us".into(),
        sender_name: None,
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn connected(h: &Harness, user_id: &str) {
    h.factory.script(user_id, connect_script());
    h.registry.start_and_wait(user_id, hook()).await.unwrap();
    // The status watch flips before the notification is handed off.
    eventually("connected notification", || {
        h.dispatch.statuses(user_id).last() == Some(&SessionStatus::Connected)
    })
    .await;
}

// ── Lifecycle ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_flow_emits_status_and_challenge() {
    let h = harness();
    connected(&h, "u1").await;

    assert_eq!(
        h.dispatch.statuses("u1"),
        vec![
            SessionStatus::Initializing,
            SessionStatus::Connecting,
            SessionStatus::QrReady,
            SessionStatus::Connected,
        ]
    );
    assert_eq!(h.dispatch.qr_codes(), vec![encode_challenge("2@first").unwrap()]);

    let snap = h.registry.get("u1").unwrap();
    assert!(snap.connected);
    assert!(!snap.has_qr_code);
    assert!(snap.connected_at.is_some());
    assert_eq!(h.registry.challenge("u1").unwrap(), None);
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_events_carry_session_destinations() {
    let h = harness();
    connected(&h, "u1").await;
    let targets: Vec<SessionConfig> = h.dispatch.events.lock().iter().map(|(t, _)| t.clone()).collect();
    assert!(targets.iter().all(|t| t == &hook()));
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_credentials_persisted_on_connect_and_restored_on_start() {
    let h = harness();
    connected(&h, "u1").await;
    eventually("credentials saved", || h.store.get("u1") == Some(exported_blob())).await;

    h.factory.script("u1", vec![AdapterEvent::AwaitingAuth]);
    h.registry.restart("u1", None).await.unwrap();
    assert_eq!(*h.factory.adapter("u1").loaded.lock(), Some(exported_blob()));
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_unreadable_credentials_fall_back_to_challenge() {
    struct BrokenStore;

    #[async_trait]
    impl CredentialStore for BrokenStore {
        async fn load(&self, _user_id: &str) -> EngineResult<Option<CredentialBlob>> {
            Err(EngineError::Credentials("corrupt".into()))
        }
        async fn save(&self, _user_id: &str, _blob: &CredentialBlob) -> EngineResult<()> {
            Err(EngineError::Credentials("disk full".into()))
        }
        async fn remove(&self, _user_id: &str) -> EngineResult<()> {
            Ok(())
        }
    }

    let factory = Arc::new(ScriptedFactory::default());
    let dispatch = Arc::new(RecordingDispatch::default());
    let registry = SessionRegistry::new(fast_settings(), factory.clone(), Arc::new(BrokenStore))
        .with_dispatcher(dispatch.clone());
    factory.script("u1", connect_script());

    let snap = registry.start_and_wait("u1", hook()).await.unwrap();
    assert_eq!(snap.status, SessionStatus::Connected);
    assert!(factory.adapter("u1").loaded.lock().is_none());
    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_connect_timeout_fails_start_and_tears_down() {
    let h = harness_with(EngineSettings { connect_timeout_secs: 1, ..fast_settings() });
    h.factory.script("u1", vec![AdapterEvent::AwaitingAuth]);

    let err = h.registry.start_and_wait("u1", hook()).await.unwrap_err();
    assert!(matches!(err, EngineError::ConnectionTimeout { .. }), "got {:?}", err);

    let snap = h.registry.get("u1").unwrap();
    assert_eq!(snap.status, SessionStatus::Error);
    assert!(snap.last_error.is_some());
    eventually("error notification", || h.dispatch.statuses("u1").last() == Some(&SessionStatus::Error)).await;
    eventually("teardown", || h.factory.adapter("u1").teardowns() == 1).await;
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_hung_launch_times_out() {
    let h = harness_with(EngineSettings { connect_timeout_secs: 1, ..fast_settings() });
    h.factory.hang_launch("u1");

    let started = Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(4), h.registry.start_and_wait("u1", hook()))
        .await
        .expect("start_and_wait did not return");
    assert!(matches!(result, Err(EngineError::ConnectionTimeout { .. })), "got {:?}", result);
    assert!(started.elapsed() < Duration::from_secs(3));

    let snap = h.registry.get("u1").unwrap();
    assert_eq!(snap.status, SessionStatus::Error);
    assert!(snap.last_error.is_some());
    eventually("teardown", || h.factory.adapter("u1").teardowns() == 1).await;

    // The tenant is not wedged: a fresh start goes through.
    h.factory.hang_launch.lock().clear();
    h.factory.script("u1", connect_script());
    h.registry.start_and_wait("u1", hook()).await.unwrap();
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_stop_cancels_hung_launch() {
    let h = harness_with(EngineSettings { connect_timeout_secs: 30, ..fast_settings() });
    h.factory.hang_launch("u1");

    let (started, stopped) = tokio::join!(h.registry.start("u1", hook()), async {
        eventually("launch", || h.factory.launching("u1")).await;
        tokio::time::timeout(Duration::from_secs(3), h.registry.stop("u1")).await
    });
    assert!(stopped.expect("stop blocked behind launch"));
    assert!(started.is_ok(), "got {:?}", started);
    assert!(h.registry.is_empty());
    assert_eq!(h.factory.adapter("u1").teardowns(), 1);
    assert_eq!(h.dispatch.statuses("u1").last(), Some(&SessionStatus::Disconnected));
}

#[tokio::test]
async fn test_stop_ends_pending_start_and_wait() {
    let h = harness_with(EngineSettings { connect_timeout_secs: 30, ..fast_settings() });
    h.factory.script("u1", vec![AdapterEvent::AwaitingAuth]);

    let (waited, stopped) = tokio::join!(h.registry.start_and_wait("u1", hook()), async {
        eventually("awaiting auth", || {
            h.registry.get("u1").is_some_and(|s| s.status == SessionStatus::Connecting)
        })
        .await;
        tokio::time::timeout(Duration::from_secs(3), h.registry.stop("u1")).await
    });
    assert!(stopped.expect("stop blocked behind start_and_wait"));
    assert!(waited.is_err(), "got {:?}", waited);
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn test_auth_failure_discards_saved_credentials() {
    let h = harness();
    h.store.insert("u1", exported_blob());
    h.factory.script(
        "u1",
        vec![AdapterEvent::AwaitingAuth, AdapterEvent::AuthFailed { reason: "session revoked".into() }],
    );

    assert!(h.registry.start_and_wait("u1", hook()).await.is_err());
    assert_eq!(*h.factory.adapter("u1").loaded.lock(), Some(exported_blob()));
    eventually("credentials removed", || h.store.get("u1").is_none()).await;
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_auth_failure_keeps_session_addressable() {
    let h = harness();
    h.factory.script(
        "u1",
        vec![AdapterEvent::AwaitingAuth, AdapterEvent::AuthFailed { reason: "bad scan".into() }],
    );

    let err = h.registry.start_and_wait("u1", hook()).await.unwrap_err();
    assert!(matches!(err, EngineError::Adapter { .. }), "got {:?}", err);

    let snap = h.registry.get("u1").unwrap();
    assert_eq!(snap.status, SessionStatus::AuthFailed);
    assert!(snap.last_error.unwrap().contains("bad scan"));
    assert_eq!(h.registry.len(), 1);
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_launch_failure_is_failed_start() {
    let h = harness();
    h.factory.fail_launch("u1");

    assert!(h.registry.start("u1", hook()).await.is_err());
    let snap = h.registry.get("u1").unwrap();
    assert_eq!(snap.status, SessionStatus::Error);
    assert!(snap.last_error.unwrap().contains("browser failed to start"));
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_adapter_disconnect_releases_adapter() {
    let h = harness();
    connected(&h, "u1").await;
    let adapter = h.factory.adapter("u1");

    adapter.push(AdapterEvent::Disconnected { reason: "logged out".into() }).await;
    eventually("disconnect", || h.registry.get("u1").unwrap().status == SessionStatus::Disconnected).await;
    eventually("teardown", || adapter.teardowns() == 1).await;

    // Stopping afterwards does not repeat the disconnected notification.
    assert!(h.registry.stop("u1").await);
    let disconnects = h.dispatch.statuses("u1").into_iter().filter(|s| *s == SessionStatus::Disconnected).count();
    assert_eq!(disconnects, 1);
}

#[tokio::test]
async fn test_stop_notifies_and_is_idempotent() {
    let h = harness();
    connected(&h, "u1").await;
    let adapter = h.factory.adapter("u1");

    assert!(h.registry.stop("u1").await);
    assert!(!h.registry.stop("u1").await);
    assert!(h.registry.get("u1").is_none());
    assert_eq!(h.dispatch.statuses("u1").last(), Some(&SessionStatus::Disconnected));
    assert_eq!(adapter.teardowns(), 1);
}

// ── Challenges ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_second_challenge_replaces_first() {
    let h = harness();
    h.factory.script(
        "u1",
        vec![AdapterEvent::AwaitingAuth, AdapterEvent::ChallengeIssued { token: "2@first".into() }],
    );
    h.registry.start("u1", hook()).await.unwrap();
    let first = encode_challenge("2@first").unwrap();
    let second = encode_challenge("2@second").unwrap();
    eventually("first challenge", || h.registry.challenge("u1").unwrap().as_deref() == Some(first.as_str())).await;

    h.factory.adapter("u1").push(AdapterEvent::ChallengeIssued { token: "2@second".into() }).await;
    eventually("second challenge", || h.registry.challenge("u1").unwrap().as_deref() == Some(second.as_str())).await;
    eventually("second qr event", || h.dispatch.qr_codes().len() == 2).await;

    assert_eq!(h.dispatch.qr_codes(), vec![first, second]);
    assert_eq!(h.registry.get("u1").unwrap().status, SessionStatus::QrReady);
    h.registry.shutdown_all().await;
}

// ── Message intake ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_message_without_links_dispatches_nothing() {
    let h = harness();
    connected(&h, "u1").await;
    let session = h.registry.session("u1").unwrap();
    let before = h.dispatch.events().len();

    assert_eq!(session.intake(msg("m1", "no links here, just www.example.com")).await.unwrap(), 0);
    assert_eq!(h.dispatch.events().len(), before);
    assert_eq!(h.registry.get("u1").unwrap().messages_processed, 1);
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_links_dispatched_in_order_with_duplicates() {
    let h = harness();
    connected(&h, "u1").await;
    let session = h.registry.session("u1").unwrap();

    let sent = session
        .intake(msg("m1", "see https://x.com and http://y.example/a?b=1 then https://x.com"))
        .await
        .unwrap();
    assert_eq!(sent, 3);
    let links: Vec<String> = h.dispatch.links().into_iter().map(|(l, _)| l).collect();
    assert_eq!(links, vec!["https://x.com", "http://y.example/a?b=1", "https://x.com"]);
    assert_eq!(h.registry.get("u1").unwrap().links_detected, 3);
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_repeated_message_id_dispatches_once() {
    let h = harness();
    connected(&h, "u1").await;
    let session = h.registry.session("u1").unwrap();

    assert_eq!(session.intake(msg("m1", "https://x.com")).await.unwrap(), 1);
    let after_first = h.dispatch.events().len();
    assert_eq!(session.intake(msg("m1", "https://x.com")).await.unwrap(), 0);
    assert_eq!(h.dispatch.events().len(), after_first);
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_event_and_poll_share_dedup() {
    let h = harness_with(EngineSettings { poll_interval_secs: 1, ..fast_settings() });
    connected(&h, "u1").await;
    let adapter = h.factory.adapter("u1");

    adapter.push(AdapterEvent::MessageReceived(msg("m1", "https://x.com"))).await;
    eventually("event intake", || h.dispatch.links().len() == 1).await;

    adapter.queue_poll(vec![msg("m1", "https://x.com"), msg("m2", "https://y.com")]);
    eventually("poll intake", || h.dispatch.links().len() == 2).await;
    eventually("poll drained", || adapter.polled.lock().is_empty()).await;

    let links: Vec<String> = h.dispatch.links().into_iter().map(|(l, _)| l).collect();
    assert_eq!(links, vec!["https://x.com", "https://y.com"]);
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_system_origin_ignored() {
    let h = harness();
    connected(&h, "u1").await;
    let session = h.registry.session("u1").unwrap();

    let status = InboundMessage { origin: "status@broadcast".into(), ..msg("m1", "https://x.com") };
    assert_eq!(session.intake(status).await.unwrap(), 0);
    assert!(h.dispatch.links().is_empty());
    assert_eq!(h.registry.get("u1").unwrap().messages_processed, 0);
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_messages_before_connect_ignored() {
    let h = harness();
    h.factory.script("u1", vec![AdapterEvent::AwaitingAuth]);
    h.registry.start("u1", hook()).await.unwrap();
    let session = h.registry.session("u1").unwrap();

    assert_eq!(session.intake(msg("m1", "https://x.com")).await.unwrap(), 0);
    assert!(h.dispatch.links().is_empty());
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_sender_resolution_and_fallback() {
    let h = harness();
    connected(&h, "u1").await;
    let session = h.registry.session("u1").unwrap();

    session.intake(msg("m1", "https://a.com")).await.unwrap();
    session
        .intake(InboundMessage { sender: "15550001111@c.us".into(), ..msg("m2", "https://b.com") })
        .await
        .unwrap();
    session
        .intake(InboundMessage { sender: "lid:x@lid".into(), ..msg("m3", "https://c.com") })
        .await
        .unwrap();
    session
        .intake(InboundMessage { sender_name: Some("Bob".into()), ..msg("m4", "https://d.com") })
        .await
        .unwrap();

    let senders: Vec<String> = h.dispatch.links().into_iter().map(|(_, s)| s).collect();
    assert_eq!(senders, vec!["Alice", "15550001111", "Unknown", "Bob"]);
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_dedup_window_is_bounded() {
    let h = harness_with(EngineSettings { seen_capacity: 2, ..fast_settings() });
    connected(&h, "u1").await;
    let session = h.registry.session("u1").unwrap();

    for id in ["m1", "m2", "m3"] {
        assert_eq!(session.intake(msg(id, "https://x.com")).await.unwrap(), 1);
    }
    // m1 was evicted, m3 is still remembered.
    assert_eq!(session.intake(msg("m3", "https://x.com")).await.unwrap(), 0);
    assert_eq!(session.intake(msg("m1", "https://x.com")).await.unwrap(), 1);
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_unreachable_webhook_does_not_alter_status() {
    let factory = Arc::new(ScriptedFactory::default());
    let settings = EngineSettings { webhook_timeout_secs: 1, callback_timeout_secs: 1, ..fast_settings() };
    let registry = SessionRegistry::new(settings, factory.clone(), Arc::new(MemoryCredentialStore::new()));
    factory.script("u1", connect_script());

    let config = SessionConfig::new(Some("http://127.0.0.1:1/hook".into()), Some("http://127.0.0.1:1/cb".into()));
    registry.start_and_wait("u1", config).await.unwrap();
    let session = registry.session("u1").unwrap();

    assert_eq!(session.intake(msg("m1", "https://x.com")).await.unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.status(), SessionStatus::Connected);
    assert!(session.snapshot().last_error.is_none());
    registry.shutdown_all().await;
}

// ── Registry ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_start_replaces_connected_session() {
    let h = harness();
    connected(&h, "u1").await;
    let old = h.registry.session("u1").unwrap();

    h.factory.script("u1", vec![AdapterEvent::AwaitingAuth]);
    let snap = h.registry.start("u1", hook()).await.unwrap();
    assert_ne!(snap.status, SessionStatus::Disconnected);

    assert_eq!(h.factory.order(), vec!["create:u1", "teardown:u1", "create:u1"]);
    assert!(old.is_stopped());
    assert_eq!(h.registry.len(), 1);
    assert_eq!(h.registry.list().len(), 1);
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_tenants_are_isolated() {
    let h = harness();
    connected(&h, "u1").await;
    h.factory.fail_launch("u2");
    assert!(h.registry.start("u2", hook()).await.is_err());

    let session = h.registry.session("u1").unwrap();
    assert_eq!(session.intake(msg("m1", "https://x.com")).await.unwrap(), 1);
    assert_eq!(h.registry.get("u1").unwrap().status, SessionStatus::Connected);
    h.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_shutdown_all_survives_hung_teardown() {
    let h = harness();
    h.factory.hang_teardown("u2");
    for user in ["u1", "u2", "u3"] {
        connected(&h, user).await;
    }

    let started = Instant::now();
    let report = h.registry.shutdown_all().await;
    assert!(started.elapsed() < Duration::from_secs(4));

    assert_eq!(report.stopped, vec!["u1", "u3"]);
    assert_eq!(report.timed_out, vec!["u2"]);
    assert!(h.registry.is_empty());
    for user in ["u1", "u3"] {
        assert_eq!(h.factory.adapter(user).teardowns(), 1);
        assert_eq!(h.dispatch.statuses(user).last(), Some(&SessionStatus::Disconnected));
    }
}
