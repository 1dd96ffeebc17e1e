//! deltasync integration test harness.
//!
//! Every test runs a real hub on 127.0.0.1:0 and talks to it over
//! WebSockets, with one temp directory per participant. Nothing here needs
//! privileges or outside services.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use deltasync_core::{ChunkParams, FileDelta};
use deltasync_services::{LocalFs, SyncEngine, TokenStore};
use deltasyncd::server::{self, ServerState};
use deltasyncd::{Hub, HubSettings, PeerClient};

mod handshake;
mod recovery;
mod relay;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const SNAPSHOT: &str = ".deltasync-snapshot";

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn params() -> ChunkParams {
    ChunkParams::new(256, 1024, 4096).unwrap()
}

/// One participant's project directory and engine.
pub struct Project {
    pub root: PathBuf,
    pub engine: Arc<SyncEngine>,
}

impl Project {
    pub async fn open(label: &str) -> Self {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "deltasync-it-{label}-{}-{id}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        let fs = LocalFs::new(&root, vec![SNAPSHOT.into()]).unwrap();
        let engine = SyncEngine::open(Arc::new(fs), params(), root.join(SNAPSHOT))
            .await
            .unwrap();
        Self {
            root,
            engine: Arc::new(engine),
        }
    }

    pub fn write(&self, rel: &str, content: &[u8]) {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn read(&self, rel: &str) -> Option<Vec<u8>> {
        std::fs::read(self.root.join(rel)).ok()
    }
}

impl Drop for Project {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

pub struct Host {
    pub project: Project,
    pub hub: Hub,
    pub tokens: Arc<TokenStore>,
    pub url: String,
    shutdown: CancellationToken,
}

impl Host {
    /// Edit a file on the host and broadcast the change.
    pub async fn edit(&self, rel: &str, content: &[u8]) {
        self.project.write(rel, content);
        if let Some(delta) = self.project.engine.submit_path(rel).await.unwrap() {
            self.hub.broadcast_local(delta).await.unwrap();
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn test_settings() -> HubSettings {
    HubSettings {
        handshake_timeout: Duration::from_secs(2),
        ping_interval: Duration::from_millis(200),
        pong_wait: Duration::from_secs(2),
        peer_queue_capacity: 64,
        broadcast_queue_capacity: 64,
    }
}

pub async fn start_host(allowed_origins: Vec<String>) -> Host {
    let project = Project::open("host").await;
    let tokens = Arc::new(TokenStore::new());
    let shutdown = CancellationToken::new();
    let (hub, _task) = Hub::spawn(
        test_settings(),
        project.engine.clone(),
        tokens.clone(),
        shutdown.clone(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = ServerState {
        hub: hub.clone(),
        engine: project.engine.clone(),
        tokens: tokens.clone(),
        allowed_origins: Arc::new(allowed_origins),
        admin_key: None,
    };
    tokio::spawn(server::serve(state, listener, shutdown.clone()));

    Host {
        project,
        hub,
        tokens,
        url: format!("ws://{addr}/connect"),
        shutdown,
    }
}

pub struct Peer {
    pub project: Project,
    pub deltas: mpsc::Sender<FileDelta>,
    pub task: JoinHandle<Result<()>>,
    shutdown: CancellationToken,
}

impl Peer {
    /// Edit a file locally and push the change to the hub.
    pub async fn edit(&self, rel: &str, content: &[u8]) {
        self.project.write(rel, content);
        if let Some(delta) = self.project.engine.submit_path(rel).await.unwrap() {
            self.deltas.send(delta).await.unwrap();
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Connect a fresh peer and wait until the hub has registered it.
pub async fn join(host: &Host) -> Peer {
    let before = host.hub.peer_count().await;
    let project = Project::open("peer").await;
    let client = PeerClient::new(project.engine.clone(), host.url.clone(), host.tokens.issue_otp());
    let (deltas, rx) = mpsc::channel(64);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move { client.run(rx, token).await });
    wait_for_peers(&host.hub, before + 1).await;
    Peer {
        project,
        deltas,
        task,
        shutdown,
    }
}

pub async fn wait_for_peers(hub: &Hub, expected: usize) {
    for _ in 0..500 {
        if hub.peer_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("hub never reached {expected} peers");
}

/// Poll `check` for up to five seconds.
pub async fn eventually(what: &str, check: impl FnMut() -> bool) {
    eventually_within(what, Duration::from_secs(5), check).await
}

pub async fn eventually_within(what: &str, limit: Duration, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Deterministic, incompressible-looking content.
pub fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}
