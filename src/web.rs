//! Diagnostics HTTP API
//!
//! Read-only views of the last tick and the engine state, plus a few
//! endpoints that forward commands to the driver loop.

use crate::driver::{DriverCommand, DriverSnapshot};
use crate::loadpoint::{CarId, ChargeMode, ConnectorId, LoadpointRef};
use crate::state::StateStore;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
    pub snapshot: watch::Receiver<Arc<DriverSnapshot>>,
    pub commands: mpsc::UnboundedSender<DriverCommand>,
}

#[derive(Deserialize)]
pub struct ModeBody {
    pub mode: String,
}

#[derive(Deserialize)]
pub struct PriorityBody {
    pub priority: i32,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Resolve `/{kind}/{id}` against the known devices
fn resolve_loadpoint(state: &AppState, kind: &str, id: u32) -> Result<LoadpointRef, Response> {
    let target = match kind {
        "car" => LoadpointRef::Car(CarId(id)),
        "connector" => LoadpointRef::Connector(ConnectorId(id)),
        other => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                format!("unknown loadpoint kind '{}'", other),
            ));
        }
    };
    let known = state.store.read(|s| match target {
        LoadpointRef::Car(id) => s.car(id).is_some(),
        LoadpointRef::Connector(id) => s.connector(id).is_some(),
    });
    if known {
        Ok(target)
    } else {
        Err(error_response(
            StatusCode::NOT_FOUND,
            format!("unknown {}", target),
        ))
    }
}

fn send(state: &AppState, cmd: DriverCommand) -> Response {
    match state.commands.send(cmd) {
        Ok(()) => (StatusCode::ACCEPTED, Json(serde_json::json!({ "ok": true }))).into_response(),
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "driver is not running"),
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = Arc::clone(&state.snapshot.borrow());
    Json(snapshot.as_ref().clone())
}

async fn schedules(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.schedules().as_ref().clone())
}

async fn reasons(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = Arc::clone(&state.snapshot.borrow());
    Json(serde_json::json!({
        "global": snapshot.global_reasons,
        "loadpoints": snapshot.reasons,
    }))
}

async fn engine_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.snapshot())
}

async fn set_mode(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, u32)>,
    Json(body): Json<ModeBody>,
) -> Response {
    let target = match resolve_loadpoint(&state, &kind, id) {
        Ok(target) => target,
        Err(resp) => return resp,
    };
    match body.mode.parse::<ChargeMode>() {
        Ok(mode) => send(&state, DriverCommand::SetChargeMode(target, mode)),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn set_priority(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, u32)>,
    Json(body): Json<PriorityBody>,
) -> Response {
    match resolve_loadpoint(&state, &kind, id) {
        Ok(target) => send(&state, DriverCommand::SetPriority(target, body.priority)),
        Err(resp) => resp,
    }
}

async fn trigger_tick(State(state): State<AppState>) -> Response {
    send(&state, DriverCommand::TriggerTick)
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/schedules", get(schedules))
        .route("/api/reasons", get(reasons))
        .route("/api/state", get(engine_state))
        .route("/api/loadpoints/{kind}/{id}/mode", post(set_mode))
        .route("/api/loadpoints/{kind}/{id}/priority", post(set_priority))
        .route("/api/tick", post(trigger_tick))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until `shutdown` fires
pub async fn serve(
    state: AppState,
    host: &str,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let router = build_router(state);
    let logger = crate::logging::get_logger("web");

    let addr = match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => {
            logger.warn(&format!("Invalid host '{}'; falling back to 127.0.0.1", host));
            ([127, 0, 0, 1], port).into()
        }
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    logger.info(&format!(
        "Diagnostics API listening at http://{}:{}/api",
        local_addr.ip(),
        local_addr.port()
    ));

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
