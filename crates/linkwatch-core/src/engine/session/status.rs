// Session status and the transition table.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Initializing,
    Connecting,
    QrReady,
    Connected,
    AuthFailed,
    Error,
}

/// What happened to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    AwaitingAuth,
    Challenge,
    Authenticated,
    AuthFailed,
    Disconnected,
    Fatal,
    TimedOut,
    Stop,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Initializing => "initializing",
            SessionStatus::Connecting => "connecting",
            SessionStatus::QrReady => "qr_ready",
            SessionStatus::Connected => "connected",
            SessionStatus::AuthFailed => "auth_failed",
            SessionStatus::Error => "error",
        }
    }

    /// Started but not yet authenticated; the connect watchdog runs here.
    pub fn is_pending(&self) -> bool {
        matches!(self, SessionStatus::Initializing | SessionStatus::Connecting | SessionStatus::QrReady)
    }

    /// Next status for `trigger`, or `None` when the trigger does not apply.
    pub fn next(self, trigger: Trigger) -> Option<SessionStatus> {
        use SessionStatus::*;
        match (self, trigger) {
            (Disconnected, Trigger::Start) => Some(Initializing),
            (Initializing, Trigger::AwaitingAuth) => Some(Connecting),
            (s, Trigger::Challenge) if s.is_pending() => Some(QrReady),
            (s, Trigger::Authenticated) if s.is_pending() => Some(Connected),
            (s, Trigger::TimedOut) if s.is_pending() => Some(Error),
            (s, Trigger::AuthFailed) if s != Disconnected => Some(AuthFailed),
            (s, Trigger::Fatal) if s != Disconnected => Some(Error),
            (_, Trigger::Disconnected) | (_, Trigger::Stop) => Some(Disconnected),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
