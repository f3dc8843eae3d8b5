//! HTTP endpoints.
//!
//! Workers that cannot open the SQLite file directly create IPC requests
//! here and poll for the response. The Discord gateway process forwards
//! thread messages and finished upload prompts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use kimaki_core::{KimakiConfig, NewIpcRequest, ThreadMessage, ThreadState};
use kimaki_store::{StatusCounts, Store};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};

use crate::dispatcher::IpcDispatcher;
use crate::platform::{PendingUploads, UploadResolution};
use crate::thread_queue::{ThreadQueue, TurnStats, TurnTotals};

#[derive(Clone)]
pub struct AppState {
    pub started_at: Instant,
    pub config: Arc<KimakiConfig>,
    pub store: Store,
    pub dispatcher: Arc<IpcDispatcher>,
    pub queue: ThreadQueue,
    pub turns: Arc<TurnStats>,
    pub uploads: PendingUploads,
    pub discord_enabled: bool,
    /// Suffix for generated message ids.
    pub message_seq: Arc<AtomicU64>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/v1/ipc/requests", post(create_ipc_request))
        .route("/v1/ipc/requests/{id}", get(get_ipc_request))
        .route("/v1/threads/{thread_id}/messages", post(post_thread_message))
        .route("/v1/uploads/{upload_id}", post(resolve_upload))
        .with_state(state)
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

fn api_error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiError { error: msg.into() })).into_response()
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    bind: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    dispatcher_running: bool,
    discord_enabled: bool,
    active_threads: usize,
    tracked_threads: usize,
    turns: TurnTotals,
    pending_uploads: usize,
    ipc_requests: StatusCounts,
}

#[derive(Debug, Deserialize)]
pub struct ThreadMessageRequest {
    pub message_id: Option<String>,
    pub author: Option<String>,
    pub content: String,
}

#[derive(Serialize)]
struct ThreadMessageResponse {
    queued: bool,
    thread_id: String,
    message_id: String,
    state: ThreadState,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "kimakid",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        bind: state.config.server.bind.clone(),
    })
}

async fn readyz(State(state): State<AppState>) -> Response {
    let ipc_requests = match state.store.status_counts_async().await {
        Ok(counts) => counts,
        Err(err) => {
            error!(err = %err, "readiness check could not read ipc_requests");
            return api_error(StatusCode::SERVICE_UNAVAILABLE, format!("{err:#}"));
        }
    };
    Json(ReadyResponse {
        status: "ready",
        dispatcher_running: state.dispatcher.is_running(),
        discord_enabled: state.discord_enabled,
        active_threads: state.queue.active_threads(),
        tracked_threads: state.queue.tracked_threads(),
        turns: state.turns.totals(),
        pending_uploads: state.uploads.len(),
        ipc_requests,
    })
    .into_response()
}

async fn create_ipc_request(
    State(state): State<AppState>,
    Json(request): Json<NewIpcRequest>,
) -> Response {
    if request.request_type.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "type is required");
    }
    if request.thread_id.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "thread_id is required");
    }
    match state.store.create_ipc_request_async(request).await {
        Ok(created) => {
            debug!(request_id = %created.id, request_type = %created.request_type, "ipc request created over http");
            (
                StatusCode::CREATED,
                Json(json!({ "id": created.id, "status": created.status })),
            )
                .into_response()
        }
        Err(err) => api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}

async fn get_ipc_request(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_ipc_request_async(id.clone()).await {
        Ok(Some(request)) => Json(request).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, format!("IPC request {id} not found")),
        Err(err) => api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}

async fn post_thread_message(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(request): Json<ThreadMessageRequest>,
) -> Response {
    if request.content.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "content is required");
    }
    let message_id = request
        .message_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| {
            let seq = state.message_seq.fetch_add(1, Ordering::Relaxed);
            format!("http-{}-{seq}", chrono::Utc::now().timestamp_millis())
        });

    let queued = state.queue.enqueue(ThreadMessage {
        thread_id: thread_id.clone(),
        message_id: message_id.clone(),
        author: request.author,
        content: request.content,
    });
    if !queued {
        return api_error(StatusCode::SERVICE_UNAVAILABLE, "kimakid is shutting down");
    }

    (
        StatusCode::ACCEPTED,
        Json(ThreadMessageResponse {
            queued,
            state: state.queue.thread_state(&thread_id),
            thread_id,
            message_id,
        }),
    )
        .into_response()
}

async fn resolve_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    Json(resolution): Json<UploadResolution>,
) -> Response {
    if state.uploads.resolve(&upload_id, resolution) {
        Json(json!({ "resolved": true })).into_response()
    } else {
        api_error(
            StatusCode::NOT_FOUND,
            format!("no upload prompt waiting for {upload_id}"),
        )
    }
}
