// Linkwatch core engine.
//
// Runs one messaging-client session per tenant, watches inbound messages for
// links and fans detections plus connection-status changes out to webhooks.
//
//   atoms/   — error type and constants (pure)
//   engine/  — links, dispatcher, qr, credentials, adapter, session, registry

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use engine::adapter::{AdapterEvent, AdapterFactory, InboundMessage, PlatformAdapter, RelayAdapter, RelayHub};
pub use engine::config::{EngineSettings, SessionConfig};
pub use engine::credentials::{CredentialBlob, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use engine::dispatcher::{Dispatch, WebhookDispatcher, WebhookEvent};
pub use engine::registry::{SessionRegistry, ShutdownReport};
pub use engine::session::{Session, SessionSnapshot, SessionStatus};
