//! HTTP surface: trigger API, run history and the Google push endpoint.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use pomodoroom_sync::sync::{WebhookListener, WebhookNotification, WebhookOutcome};
use pomodoroom_sync::{Direction, SyncError, SyncOrchestrator, SyncRequest, SyncScope};

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub webhooks: Arc<WebhookListener>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/sync", post(trigger_sync))
        .route("/v1/runs", get(list_runs))
        .route("/v1/webhooks/google", post(google_webhook))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerBody {
    pub owner_id: String,
    pub direction: Direction,
    pub scope: SyncScope,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

pub(crate) fn sync_error_status(err: &SyncError) -> StatusCode {
    match err {
        SyncError::AlreadyRunning { .. } => StatusCode::CONFLICT,
        SyncError::UnsupportedKind(_) => StatusCode::BAD_REQUEST,
        SyncError::Storage(_) | SyncError::Logger(_) => StatusCode::SERVICE_UNAVAILABLE,
        // folded into a failed run by the orchestrator, never returned from `run`
        SyncError::Provider(_) | SyncError::Timeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn trigger_sync(State(state): State<AppState>, Json(body): Json<TriggerBody>) -> Response {
    if body.owner_id.trim().is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "ownerId must not be empty");
    }
    if let SyncScope::TimeWindow { start, end, .. } = &body.scope {
        if end <= start {
            return error_body(StatusCode::BAD_REQUEST, "scope.end must be after scope.start");
        }
    }

    let request = SyncRequest::manual(body.owner_id, body.direction, body.scope);
    match state.orchestrator.run(&request).await {
        Ok(run) => (StatusCode::OK, Json(run.summary())).into_response(),
        Err(e) => {
            let status = sync_error_status(&e);
            if status.is_server_error() {
                tracing::error!(owner_id = %request.owner_id, error = %e, "sync trigger failed");
            }
            error_body(status, e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub owner_id: String,
    pub limit: Option<usize>,
}

async fn list_runs(State(state): State<AppState>, Query(query): Query<RunsQuery>) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    match state.orchestrator.logger().history(&query.owner_id, limit) {
        Ok(runs) => (StatusCode::OK, Json(runs)).into_response(),
        Err(e) => error_body(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

async fn google_webhook(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let notification = match WebhookNotification::from_headers(|name| {
        headers.get(name).and_then(|v| v.to_str().ok())
    }) {
        Ok(n) => n,
        Err(rejection) => return rejection_response(rejection),
    };

    match state.webhooks.handle(&notification) {
        Ok(outcome) => {
            let label = match outcome {
                WebhookOutcome::Acknowledged => "acknowledged",
                WebhookOutcome::Deduplicated => "deduplicated",
                WebhookOutcome::AlreadyRunning(_) => "already_running",
                WebhookOutcome::Enqueued(_) => "enqueued",
            };
            (StatusCode::OK, Json(json!({ "status": label }))).into_response()
        }
        Err(rejection) => rejection_response(rejection),
    }
}

fn rejection_response(rejection: pomodoroom_sync::sync::WebhookRejection) -> Response {
    let status = StatusCode::from_u16(rejection.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_body(status, rejection.to_string())
}
