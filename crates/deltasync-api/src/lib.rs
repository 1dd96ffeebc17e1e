//! Loopback HTTP API: how local edits enter the sync pipeline.

pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::{ApiState, Role};

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/files", get(handlers::handle_files))
        .route("/sync", post(handlers::handle_sync))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

/// Serve on 127.0.0.1:`port` until the listener fails.
pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    serve_on(state, listener).await
}

pub async fn serve_on(state: ApiState, listener: TcpListener) -> anyhow::Result<()> {
    let port = listener.local_addr()?.port();
    tracing::info!(port, role = ?state.role, "API listening on 127.0.0.1");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
