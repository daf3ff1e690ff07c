// ── Linkwatch Atoms: Constants ─────────────────────────────────────────────

/// How long a session may sit between start and `connected` before the
/// watchdog moves it to `error`.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 300;

/// Fallback poll cadence for platforms whose event delivery has gaps.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// A delivery queue with nothing to send for this long is dropped.
pub const WEBHOOK_QUEUE_IDLE_SECS: u64 = 60;

/// Tenant webhooks are user-operated and may be slow.
pub const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// The platform callback is expected to answer quickly.
pub const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 5;

/// Per-session bound on teardown during bulk shutdown.
pub const DEFAULT_SHUTDOWN_WAIT_SECS: u64 = 10;

/// Maximum number of message ids remembered per session.
pub const DEFAULT_SEEN_CAPACITY: usize = 10_000;

/// Sender name used when the platform cannot resolve one.
pub const UNKNOWN_SENDER: &str = "Unknown";

/// Buffer size of the adapter → session event channel.
pub const ADAPTER_EVENT_BUFFER: usize = 64;

/// Upper bound on a sender-name lookup during intake.
pub const RESOLVE_SENDER_TIMEOUT_SECS: u64 = 5;

/// How long stop() lets an in-flight event finish before aborting the worker.
pub const WORKER_STOP_GRACE_MS: u64 = 2_000;
