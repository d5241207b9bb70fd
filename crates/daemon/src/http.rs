//! HTTP adapter over [`SessionService`].
//!
//! Every route is a thin translation between JSON bodies and service calls.
//! Command errors map onto status codes in [`ApiError`]; the pairing stream
//! is served as server-sent events.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::header::{self, HeaderName};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::StreamExt;
use protocol::{BulkItem, ProtocolError, StreamMessage};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::service::SessionService;
use crate::session::InitializeOutcome;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SessionService>,
    /// Cancelled on shutdown; open event streams end when it fires.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(service: Arc<SessionService>, shutdown: CancellationToken) -> Self {
        Self { service, shutdown }
    }
}

/// Builds the router with every session route.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sessions", get(list_handler))
        .route("/api/sessions/{id}", axum::routing::delete(destroy_handler))
        .route("/api/sessions/{id}/initialize", post(initialize_handler))
        .route("/api/sessions/{id}/status", get(status_handler))
        .route("/api/sessions/{id}/qr", get(qr_handler))
        .route("/api/sessions/{id}/qr-stream", get(qr_stream_handler))
        .route("/api/sessions/{id}/send", post(send_handler))
        .route("/api/sessions/{id}/send-bulk", post(send_bulk_handler))
        .route("/api/sessions/{id}/logout", post(logout_handler))
        .with_state(state)
}

/// Serves `router` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("Failed to read listener address")?;
    tracing::info!("HTTP server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    tracing::info!("HTTP server stopped");
    Ok(())
}

/// A command error rendered as `{"success":false,"message":..}`.
#[derive(Debug)]
pub struct ApiError(pub ProtocolError);

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self.0 {
            ProtocolError::NotFound(_) => StatusCode::NOT_FOUND,
            ProtocolError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProtocolError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ProtocolError> for ApiError {
    fn from(err: ProtocolError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Request failed");
        }
        let body = json!({ "success": false, "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct SendRequest {
    #[serde(default, alias = "number")]
    recipient: String,
    #[serde(default, alias = "message")]
    body: String,
}

#[derive(Debug, Default, Deserialize)]
struct BulkRequest {
    #[serde(default, alias = "messages")]
    items: Vec<SendRequest>,
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.service.list_sessions().len(),
    }))
}

async fn list_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let statuses = state.service.all_statuses().await;
    Json(json!({ "success": true, "data": statuses }))
}

async fn initialize_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let outcome = state.service.initialize(&id).await?;
    let response = match outcome {
        InitializeOutcome::Started | InitializeOutcome::Initializing => (
            StatusCode::ACCEPTED,
            Json(json!({ "success": true, "sessionId": id, "status": "initializing" })),
        )
            .into_response(),
        InitializeOutcome::AlreadyInitialized(status) => Json(json!({
            "success": true,
            "sessionId": id,
            "status": "initialized",
            "data": status,
        }))
        .into_response(),
    };
    Ok(response)
}

async fn status_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let status = state.service.status(&id).await;
    Json(json!({ "success": true, "data": status }))
}

async fn qr_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let code = state.service.pairing_code(&id).await?;
    Ok(Json(json!({ "success": true, "qrCode": code })).into_response())
}

async fn qr_stream_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let stream = state.service.open_stream(&id).await?;
    let events = stream
        .map(|message| Ok::<Event, Infallible>(to_sse_event(&message)))
        .take_until(state.shutdown.cancelled_owned());

    let headers = [
        (header::CACHE_CONTROL, "no-cache"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    Ok((headers, Sse::new(events)).into_response())
}

fn to_sse_event(message: &StreamMessage) -> Event {
    match message {
        StreamMessage::Frame(frame) => match serde_json::to_string(frame) {
            Ok(json) => Event::default().data(json),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode stream frame");
                Event::default().comment("encode-error")
            }
        },
        StreamMessage::Heartbeat => Event::default().comment("heartbeat"),
    }
}

async fn send_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SendRequest>,
) -> ApiResult {
    let receipt = state
        .service
        .send_message(&id, &request.recipient, &request.body)
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": "Message sent",
        "data": receipt,
    }))
    .into_response())
}

async fn send_bulk_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<BulkRequest>,
) -> ApiResult {
    if request.items.is_empty() {
        return Err(ProtocolError::InvalidInput(
            "at least one message is required".to_string(),
        )
        .into());
    }

    let items: Vec<BulkItem> = request
        .items
        .into_iter()
        .map(|item| BulkItem::new(item.recipient, item.body))
        .collect();
    let report = state.service.send_bulk(&id, &items).await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("{} messages sent, {} errors", report.sent.len(), report.errors.len()),
        "data": report,
    }))
    .into_response())
}

async fn logout_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.service.logout(&id).await?;
    Ok(Json(json!({ "success": true, "message": "Session logged out" })).into_response())
}

async fn destroy_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.service.destroy(&id).await?;
    Ok(Json(json!({ "success": true, "message": "Session destroyed" })).into_response())
}
