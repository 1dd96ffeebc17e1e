//! deltasyncd: real-time project sync daemon.
//!
//! `deltasyncd host` serves the project to peers; `deltasyncd peer` joins
//! a host. Both expose the loopback edit API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use deltasync_api::{ApiState, Role};
use deltasync_core::config::DeltaSyncConfig;
use deltasync_core::FileDelta;
use deltasync_services::fs::relative_to;
use deltasync_services::{LocalFs, SyncEngine, TokenStore};
use deltasyncd::server::{self, ServerState};
use deltasyncd::{Hub, HubSettings, PeerClient};

const OTP_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = DeltaSyncConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = DeltaSyncConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        DeltaSyncConfig::default()
    });

    let mode = std::env::args().nth(1).unwrap_or_else(|| "host".to_string());
    tracing::info!(mode, root = %config.project.root.display(), "deltasyncd starting");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    match mode.as_str() {
        "host" => run_host(config, shutdown).await,
        "peer" => run_peer(config, shutdown).await,
        other => bail!("unknown mode {other:?}, expected `host` or `peer`"),
    }
}

/// Open the engine over the configured project and index it.
async fn open_engine(config: &DeltaSyncConfig) -> Result<Arc<SyncEngine>> {
    let params = config.chunk_params().context("invalid chunking config")?;
    let snapshot = config.snapshot_file();

    let mut ignored = config.project.ignored.clone();
    if let Some(rel) = relative_to(&config.project.root, &snapshot) {
        ignored.push(rel);
    }
    let fs = LocalFs::new(&config.project.root, ignored)?;

    let engine = SyncEngine::open(Arc::new(fs), params, &snapshot)
        .await
        .with_context(|| format!("failed to open snapshot {}", snapshot.display()))?;
    engine.index_tree().await.context("failed to index project")?;
    Ok(Arc::new(engine))
}

async fn run_host(config: DeltaSyncConfig, shutdown: CancellationToken) -> Result<()> {
    let engine = open_engine(&config).await?;

    let tokens = Arc::new(TokenStore::new());
    let otp = tokens.issue_otp();
    tracing::info!(otp = %otp, "one-time password for the first peer");

    let (hub, hub_task) = Hub::spawn(
        HubSettings::from(&config.hub),
        engine.clone(),
        tokens.clone(),
        shutdown.clone(),
    );

    let listener = TcpListener::bind(&config.hub.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.hub.listen_addr))?;

    // Local edits on the host enter through the API and fan out with the
    // host as origin.
    let (delta_tx, mut delta_rx) = mpsc::channel::<FileDelta>(config.hub.broadcast_queue_capacity);
    let forward_task = {
        let hub = hub.clone();
        tokio::spawn(async move {
            while let Some(delta) = delta_rx.recv().await {
                if let Err(e) = hub.broadcast_local(delta).await {
                    tracing::warn!(error = %e, "could not broadcast local change");
                    break;
                }
            }
        })
    };

    let api_task = {
        let state = ApiState::new(engine.clone(), delta_tx, Role::Host);
        let port = config.peer.api_port;
        tokio::spawn(async move {
            if let Err(e) = deltasync_api::serve(state, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    let purge_task = {
        let tokens = tokens.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(OTP_PURGE_INTERVAL);
            loop {
                ticker.tick().await;
                let purged = tokens.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "expired OTPs purged");
                }
            }
        })
    };

    let admin_key = (!config.hub.admin_key.is_empty()).then(|| Arc::from(config.hub.admin_key.as_str()));
    let state = ServerState {
        hub,
        engine,
        tokens,
        allowed_origins: Arc::new(config.hub.allowed_origins.clone()),
        admin_key,
    };
    let result = server::serve(state, listener, shutdown.clone()).await;

    shutdown.cancel();
    api_task.abort();
    purge_task.abort();
    forward_task.abort();
    let _ = hub_task.await;
    tracing::info!("deltasyncd stopped");
    result
}

async fn run_peer(config: DeltaSyncConfig, shutdown: CancellationToken) -> Result<()> {
    if config.peer.token.is_empty() {
        bail!("peer.token is empty; set it to an OTP issued by the host");
    }
    let engine = open_engine(&config).await?;

    let (delta_tx, delta_rx) = mpsc::channel::<FileDelta>(config.hub.peer_queue_capacity);
    let api_task = {
        let state = ApiState::new(engine.clone(), delta_tx, Role::Peer);
        let port = config.peer.api_port;
        tokio::spawn(async move {
            if let Err(e) = deltasync_api::serve(state, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    let client = PeerClient::new(engine, config.peer.hub_url.clone(), config.peer.token.clone());
    let result = client.run(delta_rx, shutdown).await;

    api_task.abort();
    tracing::info!("deltasyncd stopped");
    result
}
