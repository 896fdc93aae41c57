use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

use propnet_protocol::{GossipMessage, GossipResponse, NodeError, PropagationError, Value};

use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/gossip", post(gossip))
        .route("/api/contacts/{contact_id}", get(get_contact).post(write_contact))
        .route("/api/flush", post(flush))
        .route("/api/sync", post(sync))
        .route("/api/status", get(status))
        .with_state(state)
}

fn error_status(e: &NodeError) -> StatusCode {
    match e {
        NodeError::NotJoined | NodeError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        NodeError::NotReplicated(_) => StatusCode::FORBIDDEN,
        NodeError::Propagation(PropagationError::UnknownContact(_)) => StatusCode::NOT_FOUND,
        NodeError::Propagation(PropagationError::DidNotConverge { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
        NodeError::Topology(_) => StatusCode::BAD_REQUEST,
        NodeError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(e: NodeError) -> (StatusCode, Json<JsonValue>) {
    let status = error_status(&e);
    if status.is_server_error() {
        tracing::warn!(error = %e, "Request failed");
    }
    (status, Json(json!({ "error": e.to_string() })))
}

async fn gossip(
    State(state): State<Arc<AppState>>,
    Json(msg): Json<GossipMessage>,
) -> Result<Json<GossipResponse>, (StatusCode, Json<JsonValue>)> {
    state.node.handle_message(msg).await.map(Json).map_err(reject)
}

async fn get_contact(
    State(state): State<Arc<AppState>>,
    Path(contact_id): Path<String>,
) -> Result<Json<JsonValue>, (StatusCode, Json<JsonValue>)> {
    let content = state.node.content(&contact_id).await.map_err(reject)?;
    Ok(Json(json!({ "contactId": contact_id, "content": content })))
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    value: Value,
}

async fn write_contact(
    State(state): State<Arc<AppState>>,
    Path(contact_id): Path<String>,
    Json(req): Json<WriteRequest>,
) -> Result<Json<JsonValue>, (StatusCode, Json<JsonValue>)> {
    match state.node.update_contact(&contact_id, req.value).await.map_err(reject)? {
        Some(report) => Ok(Json(json!({ "status": "settled", "report": report }))),
        None => Ok(Json(json!({ "status": "queued" }))),
    }
}

async fn flush(State(state): State<Arc<AppState>>) -> Result<Json<JsonValue>, (StatusCode, Json<JsonValue>)> {
    let reports = state.node.flush().await.map_err(reject)?;
    tracing::info!(writes = reports.len(), "Manual flush");
    Ok(Json(json!({
        "flushed": reports.len(),
        "reports": reports,
    })))
}

async fn sync(State(state): State<Arc<AppState>>) -> Result<Json<JsonValue>, (StatusCode, Json<JsonValue>)> {
    let settled = state.node.sync_round().await.map_err(reject)?;
    Ok(Json(json!({ "settled": settled })))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
    let status = state.node.status().await;
    Json(json!({
        "uptime_secs": state.uptime_secs(),
        "node": status,
    }))
}
