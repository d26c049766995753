//! HTTP segment server (the TCP transport's far end).
//!
//! GET /manifest                    — the manifest as JSON
//! GET /segments/{quality_id}/{index} — one segment body

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{debug, warn};
use vidbench_common::manifest::Manifest;

use crate::storage::{SegmentStore, StorageError};

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn SegmentStore>,
    manifest: Arc<Manifest>,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        let status = if e.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

pub fn router(store: Arc<dyn SegmentStore>, manifest: Arc<Manifest>) -> Router {
    Router::new()
        .route("/manifest", get(get_manifest))
        .route("/segments/{quality_id}/{index}", get(get_segment))
        .with_state(AppState { store, manifest })
}

async fn get_manifest(State(state): State<AppState>) -> Json<Manifest> {
    Json(state.manifest.as_ref().clone())
}

async fn get_segment(
    State(state): State<AppState>,
    Path((quality_id, index)): Path<(u32, u32)>,
) -> Result<Response, ApiError> {
    let store = state.store.clone();
    let body = tokio::task::spawn_blocking(move || store.read(quality_id, index))
        .await
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        })?
        .inspect_err(|e| {
            if e.is_not_found() {
                debug!(quality_id, index, "segment not found");
            } else {
                warn!(quality_id, index, error = %e, "segment read failed");
            }
        })?;

    debug!(quality_id, index, len = body.len(), "serving segment");
    Ok(([(header::CONTENT_TYPE, "video/iso.segment")], body).into_response())
}

/// Serve `router` on `listener` until the task is dropped or `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: tokio_util::sync::CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
