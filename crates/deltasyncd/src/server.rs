//! Host-side HTTP surface: the `/connect` WebSocket endpoint the hub is
//! reached through, plus a status page and OTP issuance.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use deltasync_services::{SyncEngine, TokenStore};

use crate::hub::{Hub, PeerSummary};
use crate::transport::{split_axum, MAX_WS_MESSAGE};

const ADMIN_KEY_HEADER: &str = "x-admin-key";

#[derive(Clone)]
pub struct ServerState {
    pub hub: Hub,
    pub engine: Arc<SyncEngine>,
    pub tokens: Arc<TokenStore>,
    /// Accepted `Origin` header values; empty accepts any.
    pub allowed_origins: Arc<Vec<String>>,
    /// Required in `x-admin-key` to issue OTPs, when set.
    pub admin_key: Option<Arc<str>>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/connect", get(handle_connect))
        .route("/status", get(handle_status))
        .route("/admin/otp", post(handle_issue_otp))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(state: ServerState, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr().context("listener has no address")?;
    tracing::info!(%addr, "hub listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("hub server failed")
}

/// An absent `Origin` header is a non-browser client and is let through.
pub fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match headers.get(axum::http::header::ORIGIN) {
        None => true,
        Some(value) => value
            .to_str()
            .map(|origin| allowed.iter().any(|a| a == origin))
            .unwrap_or(false),
    }
}

async fn handle_connect(
    State(state): State<ServerState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    if !origin_allowed(&headers, &state.allowed_origins) {
        tracing::warn!(%remote, "rejected upgrade from disallowed origin");
        return StatusCode::FORBIDDEN.into_response();
    }
    let hub = state.hub.clone();
    upgrade
        .max_message_size(MAX_WS_MESSAGE)
        .max_frame_size(MAX_WS_MESSAGE)
        .on_upgrade(move |socket| async move {
            let (source, sink) = split_axum(socket);
            hub.accept(source, sink, remote.to_string()).await;
        })
}

#[derive(Debug, Serialize)]
pub struct HubStatus {
    pub peers: Vec<PeerSummary>,
    pub tracked_files: usize,
    pub total_bytes: u64,
}

async fn handle_status(State(state): State<ServerState>) -> Json<HubStatus> {
    let snapshot = state.engine.snapshot().await;
    Json(HubStatus {
        peers: state.hub.peers().await,
        tracked_files: snapshot.len(),
        total_bytes: snapshot.total_bytes(),
    })
}

#[derive(Debug, Serialize)]
pub struct OtpResponse {
    pub token: String,
    pub expires_in_secs: u64,
}

async fn handle_issue_otp(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Result<Json<OtpResponse>, StatusCode> {
    if let Some(key) = &state.admin_key {
        let presented = headers.get(ADMIN_KEY_HEADER).and_then(|v| v.to_str().ok());
        if presented != Some(&**key) {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }
    let token = state.tokens.issue_otp();
    Ok(Json(OtpResponse {
        token,
        expires_in_secs: deltasync_services::credentials::OTP_TTL.as_secs(),
    }))
}
