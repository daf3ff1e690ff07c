// Linkwatch — Server bootstrap and shutdown

use crate::config::AppConfig;
use crate::routes::{router, AppState};
use anyhow::{Context, Result};
use linkwatch_core::{FileCredentialStore, RelayHub, SessionRegistry};
use log::{info, warn};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Wire the engine to its relay hub and on-disk credential store.
pub fn build_state(config: &AppConfig) -> AppState {
    let relays = Arc::new(RelayHub::new());
    let store = Arc::new(FileCredentialStore::new(config.sessions_dir.clone()));
    let registry = Arc::new(SessionRegistry::new(config.engine.clone(), relays.clone(), store));
    AppState { registry, relays }
}

/// Serve until Ctrl-C / SIGTERM, then stop every session.
pub async fn serve(config: AppConfig) -> Result<()> {
    let state = build_state(&config);
    let registry = state.registry.clone();

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("[server] Listening on {}", addr);
    info!("[server] Credentials stored in {}", config.sessions_dir.display());

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let report = registry.shutdown_all().await;
    info!(
        "[server] Shutdown complete: {} stopped, {} timed out",
        report.stopped.len(),
        report.timed_out.len()
    );
    if !report.timed_out.is_empty() {
        warn!("[server] Sessions abandoned mid-teardown: {}", report.timed_out.join(", "));
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("[server] Ctrl-C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("[server] SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("[server] Ctrl-C received, shutting down"),
        _ = terminate => info!("[server] SIGTERM received, shutting down"),
    }
}
