//! HTTP trigger: `POST /api/sync`, `GET /api/sync`, `GET /healthz`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use tally_core::TallyConfig;
use tally_sync::pipeline;

use crate::error::{io_err, DaemonError};
use crate::protocol::{ErrorBody, SyncStatus, HEALTH_PATH, SYNC_PATH};
use crate::runtime::{trigger_sync, SyncGate, SyncJob};

#[derive(Clone)]
pub(crate) struct AppState {
    home: PathBuf,
    config: Arc<TallyConfig>,
    gate: Arc<SyncGate>,
    sync_tx: mpsc::Sender<SyncJob>,
    secret: Option<Arc<str>>,
}

impl AppState {
    pub(crate) fn new(
        home: PathBuf,
        config: Arc<TallyConfig>,
        gate: Arc<SyncGate>,
        sync_tx: mpsc::Sender<SyncJob>,
    ) -> Self {
        let secret = config.server.secret().map(Arc::from);
        if secret.is_none() {
            tracing::warn!("no sync secret configured; POST {SYNC_PATH} is unauthenticated");
        }
        Self {
            home,
            config,
            gate,
            sync_tx,
            secret,
        }
    }
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route(SYNC_PATH, get(sync_status).post(start_sync))
        .route(HEALTH_PATH, get(healthz))
        .with_state(state)
}

pub(crate) async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let local = listener
        .local_addr()
        .map_err(|e| io_err("http listener", e))?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .map_err(|e| io_err(local.to_string(), e))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn start_sync(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&headers, state.secret.as_deref()) {
        return error_response(StatusCode::UNAUTHORIZED, "missing or invalid bearer token");
    }
    match trigger_sync(&state.gate, &state.sync_tx, "http").await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(err) => error_response(status_for(&err), &err.to_string()),
    }
}

async fn sync_status(State(state): State<AppState>) -> Response {
    let sync_in_progress = state.gate.is_in_flight();
    let home = state.home.clone();
    let config = state.config.clone();
    let last_run = tokio::task::spawn_blocking(move || pipeline::last_run(&config, &home)).await;

    match last_run {
        Ok(Ok(last_run)) => Json(SyncStatus {
            last_run,
            sync_in_progress,
        })
        .into_response(),
        Ok(Err(err)) => {
            tracing::error!(error = %err, "could not read the run ledger");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("ledger read join error: {err}"),
        ),
    }
}

/// No secret configured means the endpoint is open.
fn authorized(headers: &HeaderMap, secret: Option<&str>) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| constant_time_eq(token.trim().as_bytes(), secret.as_bytes()))
        .unwrap_or(false)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn status_for(err: &DaemonError) -> StatusCode {
    if err.is_conflict() {
        StatusCode::CONFLICT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
