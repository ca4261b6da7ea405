use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::{json, Value};
use taskforge_core::EngineError;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct ActionRequest {
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

/// Maps an `EngineError`'s stable `kind()` tag onto an HTTP status, per the
/// propagation policy: the error message is forwarded unreinterpreted.
fn status_for(err: &EngineError) -> StatusCode {
    match err.kind() {
        "not_found" => StatusCode::NOT_FOUND,
        "invalid_argument" => StatusCode::BAD_REQUEST,
        "illegal_transition" | "illegal_project_transition" => StatusCode::CONFLICT,
        "locked" => StatusCode::CONFLICT,
        "precondition" => StatusCode::UNPROCESSABLE_ENTITY,
        "conflict" => StatusCode::CONFLICT,
        "unknown_action" => StatusCode::BAD_REQUEST,
        "external" => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.engine.project_list().await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => {
            tracing::warn!("readiness check failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "not_ready", "error": e.to_string() })),
            )
        }
    }
}

/// `POST /v1/actions` — the action table's single wire entry point.
pub(crate) async fn dispatch_action(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ActionRequest>,
) -> impl IntoResponse {
    let outcome = taskforge_core::actions::dispatch(&state.engine, &req.action, req.params).await;
    match outcome {
        Ok(value) => (StatusCode::OK, Json(json!({ "ok": true, "result": value }))),
        Err(err) => {
            let status = status_for(&err);
            tracing::info!(action = %req.action, kind = err.kind(), "action failed");
            (
                status,
                Json(json!({
                    "ok": false,
                    "error": { "kind": err.kind(), "message": err.to_string() },
                })),
            )
        }
    }
}
