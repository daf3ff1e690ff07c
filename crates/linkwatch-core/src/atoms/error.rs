// ── Linkwatch Atoms: Error Types ───────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, Network, Adapter, Config…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • No variant carries secret material (bearer tokens, cookies) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Platform adapter failure (launch, query, teardown).
    #[error("Adapter error: {adapter}: {message}")]
    Adapter { adapter: String, message: String },

    /// Persisted credential load/save failure.
    #[error("Credential store error: {0}")]
    Credentials(String),

    /// Authentication challenge could not be encoded.
    #[error("Challenge error: {0}")]
    Challenge(String),

    /// Session did not reach `connected` within the configured window.
    #[error("Connection timeout: {user_id} not connected after {secs}s")]
    ConnectionTimeout { user_id: String, secs: u64 },

    /// No session registered for the tenant.
    #[error("No session for user {0}")]
    SessionNotFound(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create an adapter error with adapter name and message.
    pub fn adapter(adapter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Adapter { adapter: adapter.into(), message: message.into() }
    }
}

// ── String bridges ─────────────────────────────────────────────────────────
// Allows `?` on `Result<T, String>` inside functions returning `EngineResult<T>`.

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;
