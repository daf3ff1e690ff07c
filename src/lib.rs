// Linkwatch server: HTTP control plane over linkwatch-core.
//
//   config — AppConfig, TOML + environment loading
//   routes — axum router and handlers
//   server — bootstrap, graceful shutdown

pub mod config;
pub mod routes;
pub mod server;

pub use config::AppConfig;
pub use routes::{router, AppState};
pub use server::{build_state, serve};
