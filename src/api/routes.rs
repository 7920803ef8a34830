//! REST endpoints for channel adapters and operators.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{Error, HandoffError, IngestError};
use crate::handoff::HandoffManager;
use crate::ingest::{InboundEvent, IngestOutcome, IngestionGateway};
use crate::store::Database;
use crate::worker::Sweeper;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub gateway: Arc<IngestionGateway>,
    pub sweeper: Arc<Sweeper>,
    pub handoff: Arc<HandoffManager>,
}

/// Build the Axum router with all REST routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/events", post(ingest_event))
        .route("/api/alerts", get(list_alerts))
        .route("/api/alerts/{id}/resolve", post(resolve_alert))
        .route("/api/participants/{id}/sweep", post(force_sweep))
        .route(
            "/api/conversations/{id}/handoff",
            post(activate_handoff).delete(deactivate_handoff),
        )
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(json!({"error": message.into()})))
}

fn internal_error(e: &Error) -> (StatusCode, Json<serde_json::Value>) {
    error!(error = %e, "Request failed");
    error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

fn parse_id(id: &str, what: &str) -> Result<Uuid, (StatusCode, Json<serde_json::Value>)> {
    Uuid::parse_str(id).map_err(|_| error_body(StatusCode::BAD_REQUEST, format!("Invalid {what} ID")))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "burstline"
    }))
}

// ── Ingestion ───────────────────────────────────────────────────────────

/// Takes the raw body so that non-JSON payloads are dropped like any other
/// malformed event instead of being rejected by the extractor.
async fn ingest_event(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let parsed = serde_json::from_slice::<serde_json::Value>(&body)
        .map_err(|e| IngestError::Malformed(format!("body is not JSON: {e}")))
        .and_then(InboundEvent::from_json);
    let event = match parsed {
        Ok(event) => event,
        Err(e) => {
            warn!("Dropping inbound event: {e}");
            let outcome = IngestOutcome::Dropped {
                reason: e.to_string(),
            };
            return (StatusCode::OK, Json(json!(outcome)));
        }
    };

    match state.gateway.ingest(event).await {
        Ok(outcome) => (StatusCode::OK, Json(json!(outcome))),
        Err(e) => internal_error(&e),
    }
}

// ── Alerts ──────────────────────────────────────────────────────────────

fn default_limit() -> usize {
    50
}

#[derive(Deserialize)]
struct AlertQuery {
    #[serde(default)]
    all: bool,
    #[serde(default = "default_limit")]
    limit: usize,
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> impl IntoResponse {
    match state.db.list_alerts(!query.all, query.limit.min(500)).await {
        Ok(alerts) => (StatusCode::OK, Json(json!(alerts))),
        Err(e) => internal_error(&Error::from(e)),
    }
}

async fn resolve_alert(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let alert_id = match parse_id(&id, "alert") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.db.resolve_alert(alert_id).await {
        Ok(true) => (StatusCode::OK, Json(json!({"status": "resolved"}))),
        Ok(false) => error_body(StatusCode::NOT_FOUND, "Alert not found or already resolved"),
        Err(e) => internal_error(&Error::from(e)),
    }
}

// ── Forced sweep ────────────────────────────────────────────────────────

async fn force_sweep(State(state): State<AppState>, Path(participant_id): Path<String>) -> impl IntoResponse {
    match state.sweeper.sweep_participant(&participant_id).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({"participant_id": participant_id, "outcome": outcome})),
        ),
        Err(e) => internal_error(&e),
    }
}

// ── Handoff ─────────────────────────────────────────────────────────────

fn handoff_error(e: Error) -> (StatusCode, Json<serde_json::Value>) {
    match e {
        Error::Handoff(HandoffError::NotFound { .. }) => {
            error_body(StatusCode::NOT_FOUND, e.to_string())
        }
        Error::Handoff(HandoffError::InvalidTransition { .. }) => {
            error_body(StatusCode::CONFLICT, e.to_string())
        }
        other => internal_error(&other),
    }
}

async fn activate_handoff(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let conversation_id = match parse_id(&id, "conversation") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.handoff.activate(conversation_id, chrono::Utc::now()).await {
        Ok(conversation) => (StatusCode::OK, Json(json!(conversation))),
        Err(e) => handoff_error(e),
    }
}

async fn deactivate_handoff(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let conversation_id = match parse_id(&id, "conversation") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.handoff.deactivate(conversation_id).await {
        Ok(conversation) => (StatusCode::OK, Json(json!(conversation))),
        Err(e) => handoff_error(e),
    }
}
