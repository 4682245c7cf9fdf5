use std::convert::Infallible;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::error::ScanError;
use crate::job::ScanManager;
use crate::types::{ScanOptions, ScanStrategy};

#[derive(Clone)]
pub struct AppState {
    manager: ScanManager,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ScanRequest {
    pub target: String,
    #[serde(default)]
    pub strategy: ScanStrategy,
    #[serde(default)]
    pub options: ScanOptions,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StopResponse {
    pub accepted: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// JSON API over a [`ScanManager`].
pub fn router(manager: ScanManager) -> Router {
    let api = Router::new()
        .route("/scans", get(list_scans).post(post_scan))
        .route("/scans/{id}", get(get_scan).delete(delete_scan))
        .route("/devices", get(get_devices))
        .route("/events", get(stream_events))
        .with_state(AppState { manager });

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, manager: ScanManager) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "serving scan API");
    axum::serve(listener, router(manager)).await?;
    Ok(())
}

async fn list_scans(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.manager.list_jobs().await)
}

async fn get_scan(State(app): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match app.manager.get_job_status(id).await {
        Some(job) => (StatusCode::OK, Json(job)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, ScanError::UnknownJob(id).to_string()),
    }
}

async fn post_scan(State(app): State<AppState>, Json(req): Json<ScanRequest>) -> Response {
    match app.manager.start_scan(&req.target, req.strategy, req.options).await {
        Ok(id) => match app.manager.get_job_status(id).await {
            Some(job) => (StatusCode::ACCEPTED, Json(job)).into_response(),
            None => error_response(StatusCode::NOT_FOUND, ScanError::UnknownJob(id).to_string()),
        },
        Err(e @ ScanError::Validation(_)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn delete_scan(State(app): State<AppState>, Path(id): Path<Uuid>) -> Response {
    if app.manager.get_job_status(id).await.is_none() {
        return error_response(StatusCode::NOT_FOUND, ScanError::UnknownJob(id).to_string());
    }
    let accepted = app.manager.stop_scan(id).await;
    (StatusCode::OK, Json(StopResponse { accepted })).into_response()
}

async fn get_devices(State(app): State<AppState>) -> Response {
    match app.manager.inventory().all().await {
        Ok(devices) => (StatusCode::OK, Json(devices)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn stream_events(
    State(app): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = app.manager.events().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| {
        let event = msg.ok()?;
        Event::default().event(event.name()).json_data(&event).ok().map(Ok)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}
