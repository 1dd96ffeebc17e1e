//! HTTP API handlers.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use deltasync_core::FileDelta;
use deltasync_services::{FsError, SyncEngine, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Peer,
}

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<SyncEngine>,
    /// Deltas produced by local edits, drained by the hub (host) or the
    /// hub connection (peer).
    pub deltas: mpsc::Sender<FileDelta>,
    pub role: Role,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(engine: Arc<SyncEngine>, deltas: mpsc::Sender<FileDelta>, role: Role) -> Self {
        Self {
            engine,
            deltas,
            role,
            started_at: Instant::now(),
        }
    }
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub role: Role,
    pub tracked_files: usize,
    pub total_bytes: u64,
    pub uptime_secs: u64,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let snapshot = state.engine.snapshot().await;
    Json(StatusResponse {
        role: state.role,
        tracked_files: snapshot.len(),
        total_bytes: snapshot.total_bytes(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

// ── /files ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub checksum: String,
    pub chunks: usize,
}

pub async fn handle_files(State(state): State<ApiState>) -> Json<Vec<FileInfo>> {
    let snapshot = state.engine.snapshot().await;
    Json(
        snapshot
            .files
            .iter()
            .map(|(path, m)| FileInfo {
                path: path.clone(),
                size: m.len(),
                checksum: hex::encode(m.whole_checksum),
                chunks: m.chunks.len(),
            })
            .collect(),
    )
}

// ── /sync ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub path: String,
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub added: usize,
    pub moved: usize,
    pub removed: usize,
    pub payload_bytes: u64,
}

fn sync_error_status(e: &SyncError) -> StatusCode {
    match e {
        SyncError::Fs(FsError::InvalidPath(_) | FsError::Ignored(_)) => StatusCode::BAD_REQUEST,
        SyncError::Fs(fs) if fs.is_not_found() => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Re-read a file after a local edit and push the resulting delta.
pub async fn handle_sync(
    State(state): State<ApiState>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, (StatusCode, String)> {
    let delta = state.engine.submit_path(&req.path).await.map_err(|e| {
        tracing::warn!(path = %req.path, error = %e, "local sync failed");
        (sync_error_status(&e), e.to_string())
    })?;

    let Some(delta) = delta else {
        return Ok(Json(SyncResponse {
            path: req.path,
            changed: false,
            checksum: None,
            added: 0,
            moved: 0,
            removed: 0,
            payload_bytes: 0,
        }));
    };

    let response = SyncResponse {
        path: req.path,
        changed: true,
        checksum: Some(hex::encode(delta.checksum)),
        added: delta.added.len(),
        moved: delta.moved.len(),
        removed: delta.removed.len(),
        payload_bytes: delta.payload_bytes(),
    };
    state.deltas.send(delta).await.map_err(|_| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "sync link is down".to_string(),
        )
    })?;
    Ok(Json(response))
}
