// Linkwatch Engine
//
// Module layout:
//   config      — EngineSettings (process-wide), SessionConfig (per tenant)
//   links       — extract_links
//   dispatcher  — WebhookEvent, Dispatch trait, WebhookDispatcher
//   qr          — QrChallenge capture / encode / clear
//   credentials — CredentialBlob, CredentialStore, file + memory stores
//   adapter     — PlatformAdapter trait, AdapterEvent, relay adapter
//   session     — per-tenant state machine, dedup set, intake pipeline
//   registry    — tenant → session map, start/stop/restart/shutdown_all

pub mod adapter;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod links;
pub mod qr;
pub mod registry;
pub mod session;
