// Linkwatch — HTTP Control Plane
//
// Thin routing over SessionRegistry and RelayHub:
//   POST /start  /stop  /restart        session lifecycle
//   GET  /status  /status/:user_id      snapshots
//   GET  /qr/:user_id                   current QR challenge
//   POST /relay/:user_id/events         events from an external driver
//   PUT|GET /relay/:user_id/credentials credential snapshots for the driver
//   GET  /health
//
// Every response is JSON with an `ok` flag; failures add `error`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use linkwatch_core::{AdapterEvent, CredentialBlob, EngineError, RelayHub, SessionConfig, SessionRegistry};
use log::warn;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub relays: Arc<RelayHub>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/restart", post(restart))
        .route("/status", get(status_all))
        .route("/status/:user_id", get(status_one))
        .route("/qr/:user_id", get(qr_code))
        .route("/relay/:user_id/events", post(relay_event))
        .route("/relay/:user_id/credentials", get(relay_loaded_credentials).put(relay_store_credentials))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Engine(EngineError::SessionNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Engine(EngineError::ConnectionTimeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Engine(EngineError::Config(_)) => StatusCode::BAD_REQUEST,
            ApiError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("[server] {}", self);
        }
        (status, Json(json!({ "ok": false, "error": self.to_string() }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

// ── Request bodies ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub user_id: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
}

impl StartRequest {
    fn config(&self) -> SessionConfig {
        SessionConfig::new(self.webhook_url.clone(), self.callback_url.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub user_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartQuery {
    #[serde(default)]
    pub wait: bool,
}

// ── Handlers ───────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "ok": true, "sessions": state.registry.len() }))
}

async fn start(
    State(state): State<AppState>,
    Query(query): Query<StartQuery>,
    Json(req): Json<StartRequest>,
) -> ApiResult {
    let session = if query.wait {
        state.registry.start_and_wait(&req.user_id, req.config()).await?
    } else {
        state.registry.start(&req.user_id, req.config()).await?
    };
    Ok(Json(json!({ "ok": true, "session": session })))
}

async fn stop(State(state): State<AppState>, Json(req): Json<StopRequest>) -> ApiResult {
    let stopped = state.registry.stop(&req.user_id).await;
    Ok(Json(json!({ "ok": true, "stopped": stopped })))
}

async fn restart(State(state): State<AppState>, Json(req): Json<StartRequest>) -> ApiResult {
    // Blank URLs count as absent, so they keep the running destinations.
    let config = req.config();
    let config = config.has_destinations().then_some(config);
    let session = state.registry.restart(&req.user_id, config).await?;
    Ok(Json(json!({ "ok": true, "session": session })))
}

async fn status_all(State(state): State<AppState>) -> ApiResult {
    Ok(Json(json!({ "ok": true, "sessions": state.registry.list() })))
}

async fn status_one(State(state): State<AppState>, Path(user_id): Path<String>) -> ApiResult {
    let session = state
        .registry
        .get(&user_id)
        .ok_or(EngineError::SessionNotFound(user_id))?;
    Ok(Json(json!({ "ok": true, "session": session })))
}

async fn qr_code(State(state): State<AppState>, Path(user_id): Path<String>) -> ApiResult {
    let qr = state.registry.challenge(&user_id)?;
    Ok(Json(json!({ "ok": true, "userId": user_id, "qrCode": qr })))
}

async fn relay_event(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(event): Json<AdapterEvent>,
) -> ApiResult {
    state.relays.push(&user_id, event).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn relay_store_credentials(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(blob): Json<CredentialBlob>,
) -> ApiResult {
    state.relays.store_credentials(&user_id, blob)?;
    Ok(Json(json!({ "ok": true })))
}

async fn relay_loaded_credentials(State(state): State<AppState>, Path(user_id): Path<String>) -> ApiResult {
    let blob = state.relays.loaded_credentials(&user_id)?;
    Ok(Json(json!({ "ok": true, "credentials": blob })))
}
