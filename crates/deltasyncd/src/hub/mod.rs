//! Distribution hub.
//!
//! One actor task owns the peer registry. Peer tasks talk to it through
//! bounded register and unregister queues, so a fan-out never sees a
//! half-updated registry. Inbound messages pass through a separate applier
//! task first, which writes peer deltas to the host replica and hands the
//! actor only what is left to send; disk writes never hold up the
//! registry. Each peer has a bounded outbound queue; a peer whose queue is
//! full when a fan-out reaches it is evicted on the spot.

mod peer;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use deltasync_core::config::HubConfig;
use deltasync_core::hash::short_hex;
use deltasync_core::wire::{Envelope, FileDelta, WireError};
use deltasync_services::{ApplyOutcome, CredentialValidator, SyncEngine};

/// Capacity of the register and unregister queues.
const CONTROL_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub peer_queue_capacity: usize,
    pub broadcast_queue_capacity: usize,
}

impl From<&HubConfig> for HubSettings {
    fn from(config: &HubConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            ping_interval: config.ping_interval(),
            pong_wait: config.pong_wait(),
            peer_queue_capacity: config.peer_queue_capacity,
            broadcast_queue_capacity: config.broadcast_queue_capacity,
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

pub type PeerId = u64;

/// Where a dispatched message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Host,
    Peer(PeerId),
}

enum Outbound {
    Frame(Bytes),
    /// Written back to back; used for the initial sync.
    Batch(Vec<Bytes>),
}

struct PeerHandle {
    id: PeerId,
    addr: String,
    outbound: mpsc::Sender<Outbound>,
    close: CancellationToken,
    joined_at_unix_ms: u64,
}

struct Inbound {
    origin: Origin,
    envelope: Envelope,
}

/// What the applier leaves for the actor, in arrival order.
enum Relay {
    FanOut { origin: Origin, delta: FileDelta },
    Resync { peer: PeerId, path: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub id: PeerId,
    pub addr: String,
    pub joined_at_unix_ms: u64,
}

struct HubShared {
    register_tx: mpsc::Sender<PeerHandle>,
    unregister_tx: mpsc::Sender<PeerId>,
    dispatch_tx: mpsc::Sender<Inbound>,
    next_id: AtomicU64,
    directory: Arc<RwLock<Vec<PeerSummary>>>,
    settings: HubSettings,
    validator: Arc<dyn CredentialValidator>,
    shutdown: CancellationToken,
}

/// Cheap-to-clone handle to the running hub.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<HubShared>,
}

impl Hub {
    /// Start the hub actor. Cancelling `shutdown` stops it and closes
    /// every peer.
    pub fn spawn(
        settings: HubSettings,
        engine: Arc<SyncEngine>,
        validator: Arc<dyn CredentialValidator>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (register_tx, register_rx) = mpsc::channel(CONTROL_QUEUE);
        let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_QUEUE);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(settings.broadcast_queue_capacity);
        let (relay_tx, relay_rx) = mpsc::channel(settings.broadcast_queue_capacity);
        let directory = Arc::new(RwLock::new(Vec::new()));

        let applier = Applier {
            engine: engine.clone(),
            inbound: dispatch_rx,
            relay: relay_tx,
            shutdown: shutdown.clone(),
        };
        let actor = HubActor {
            engine,
            peers: HashMap::new(),
            directory: directory.clone(),
            register_rx,
            unregister_rx,
            relay_rx,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(async move {
            let applier = tokio::spawn(applier.run());
            actor.run().await;
            let _ = applier.await;
        });

        let hub = Self {
            shared: Arc::new(HubShared {
                register_tx,
                unregister_tx,
                dispatch_tx,
                next_id: AtomicU64::new(1),
                directory,
                settings,
                validator,
                shutdown,
            }),
        };
        (hub, task)
    }

    pub fn settings(&self) -> &HubSettings {
        &self.shared.settings
    }

    /// Fan a delta produced on the host out to every peer. The host engine
    /// has already recorded it.
    pub async fn broadcast_local(&self, delta: FileDelta) -> Result<()> {
        self.dispatch(Origin::Host, Envelope::FileDelta(delta)).await
    }

    async fn dispatch(&self, origin: Origin, envelope: Envelope) -> Result<()> {
        self.shared
            .dispatch_tx
            .send(Inbound { origin, envelope })
            .await
            .map_err(|_| anyhow!("hub is not running"))
    }

    pub async fn peers(&self) -> Vec<PeerSummary> {
        self.shared.directory.read().await.clone()
    }

    pub async fn peer_count(&self) -> usize {
        self.shared.directory.read().await.len()
    }
}

// ── Applier ───────────────────────────────────────────────────────────────────

/// Sole consumer of the dispatch queue. The host copy is authoritative: a
/// peer delta it cannot apply goes nowhere and the sender gets the host's
/// version instead.
struct Applier {
    engine: Arc<SyncEngine>,
    inbound: mpsc::Receiver<Inbound>,
    relay: mpsc::Sender<Relay>,
    shutdown: CancellationToken,
}

impl Applier {
    async fn run(mut self) {
        loop {
            let inbound = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                inbound = self.inbound.recv() => match inbound {
                    Some(inbound) => inbound,
                    None => break,
                },
            };
            let Some(relay) = self.admit(inbound).await else {
                continue;
            };
            if self.relay.send(relay).await.is_err() {
                break;
            }
        }
    }

    async fn admit(&self, inbound: Inbound) -> Option<Relay> {
        let Inbound { origin, envelope } = inbound;
        match (origin, envelope) {
            (Origin::Host, Envelope::FileDelta(delta)) => Some(Relay::FanOut { origin, delta }),
            (Origin::Peer(id), Envelope::FileDelta(delta)) => {
                match self.engine.on_remote_delta(&delta).await {
                    Ok(ApplyOutcome::Applied) => Some(Relay::FanOut { origin, delta }),
                    Ok(ApplyOutcome::Echo) => {
                        tracing::debug!(peer = id, path = %delta.path, "host already current, not relaying");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(peer = id, path = %delta.path, error = %e, "rejected delta");
                        if e.needs_resync() {
                            Some(Relay::Resync {
                                peer: id,
                                path: delta.path,
                            })
                        } else {
                            None
                        }
                    }
                }
            }
            (Origin::Peer(id), Envelope::ResyncRequest { path }) => {
                tracing::info!(peer = id, path = %path, "resync requested");
                Some(Relay::Resync { peer: id, path })
            }
            (origin, other) => {
                tracing::warn!(?origin, kind = other.kind(), "unexpected message, ignoring");
                None
            }
        }
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

struct HubActor {
    engine: Arc<SyncEngine>,
    peers: HashMap<PeerId, PeerHandle>,
    directory: Arc<RwLock<Vec<PeerSummary>>>,
    register_rx: mpsc::Receiver<PeerHandle>,
    unregister_rx: mpsc::Receiver<PeerId>,
    relay_rx: mpsc::Receiver<Relay>,
    shutdown: CancellationToken,
}

impl HubActor {
    async fn run(mut self) {
        tracing::info!("hub running");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(id) = self.unregister_rx.recv() => self.unregister(id).await,
                Some(peer) = self.register_rx.recv() => self.register(peer).await,
                Some(relay) = self.relay_rx.recv() => match relay {
                    Relay::FanOut { origin, delta } => self.relay(origin, delta).await,
                    Relay::Resync { peer, path } => self.resync(peer, &path).await,
                },
                else => break,
            }
        }
        for peer in self.peers.values() {
            peer.close.cancel();
        }
        self.peers.clear();
        self.publish().await;
        tracing::info!("hub stopped");
    }

    async fn register(&mut self, peer: PeerHandle) {
        if peer.close.is_cancelled() {
            return;
        }
        let batch = match self.initial_batch(peer.id).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(peer = peer.id, error = %e, "failed to encode initial sync");
                peer.close.cancel();
                return;
            }
        };
        let files = batch.len().saturating_sub(2);
        if peer.outbound.try_send(Outbound::Batch(batch)).is_err() {
            tracing::warn!(peer = peer.id, "could not queue initial sync, dropping peer");
            peer.close.cancel();
            return;
        }

        tracing::info!(
            peer = peer.id,
            addr = %peer.addr,
            files,
            peers = self.peers.len() + 1,
            "peer registered"
        );
        self.peers.insert(peer.id, peer);
        self.publish().await;
    }

    /// Encoded initial sync. A file too large for one envelope is left out
    /// and the start marker counts only the files that are sent.
    async fn initial_batch(&self, id: PeerId) -> Result<Vec<Bytes>, WireError> {
        let mut files = Vec::new();
        for envelope in self.engine.initial_sync().await {
            let Envelope::InitialSyncFile(file) = &envelope else {
                continue;
            };
            match envelope.encode() {
                Ok(frame) => files.push(frame),
                Err(e) => tracing::warn!(
                    peer = id,
                    path = %file.path,
                    bytes = file.manifest.len(),
                    error = %e,
                    "file does not fit in one message, left out of initial sync"
                ),
            }
        }
        let mut batch = Vec::with_capacity(files.len() + 2);
        batch.push(
            Envelope::StartProjectSync {
                file_count: files.len() as u64,
            }
            .encode()?,
        );
        batch.append(&mut files);
        batch.push(Envelope::EndProjectSync.encode()?);
        Ok(batch)
    }

    async fn unregister(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.remove(&id) {
            peer.close.cancel();
            tracing::info!(peer = id, addr = %peer.addr, peers = self.peers.len(), "peer unregistered");
            self.publish().await;
        }
    }

    /// Fan a delta the host replica already holds out to every peer but
    /// its origin.
    async fn relay(&mut self, origin: Origin, delta: FileDelta) {
        let path = delta.path.clone();
        let checksum = delta.checksum;
        let frame = match Envelope::FileDelta(delta).encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(path = %path, error = %e, "failed to encode delta");
                return;
            }
        };
        let reached = self.fan_out(origin, frame).await;
        tracing::debug!(
            ?origin,
            path = %path,
            checksum = %short_hex(&checksum),
            reached,
            "delta relayed"
        );
    }

    /// Queue `frame` for every peer except the origin. Returns how many
    /// peers it was queued for.
    async fn fan_out(&mut self, origin: Origin, frame: Bytes) -> usize {
        let mut reached = 0;
        let mut evicted = Vec::new();
        for (id, peer) in &self.peers {
            if origin == Origin::Peer(*id) {
                continue;
            }
            match peer.outbound.try_send(Outbound::Frame(frame.clone())) {
                Ok(()) => reached += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(peer = id, addr = %peer.addr, "outbound queue full, evicting");
                    evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => evicted.push(*id),
            }
        }
        self.evict(&evicted).await;
        reached
    }

    async fn resync(&mut self, id: PeerId, path: &str) {
        let Some(file) = self.engine.initial_file(path).await else {
            tracing::warn!(peer = id, path, "resync requested for an untracked path");
            return;
        };
        let frame = match Envelope::InitialSyncFile(file).encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(path, error = %e, "failed to encode resync");
                return;
            }
        };
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        if peer.outbound.try_send(Outbound::Frame(frame)).is_err() {
            tracing::warn!(peer = id, "outbound queue full during resync, evicting");
            self.evict(&[id]).await;
        }
    }

    async fn evict(&mut self, ids: &[PeerId]) {
        if ids.is_empty() {
            return;
        }
        for id in ids {
            if let Some(peer) = self.peers.remove(id) {
                peer.close.cancel();
            }
        }
        self.publish().await;
    }

    async fn publish(&self) {
        let mut summaries: Vec<PeerSummary> = self
            .peers
            .values()
            .map(|p| PeerSummary {
                id: p.id,
                addr: p.addr.clone(),
                joined_at_unix_ms: p.joined_at_unix_ms,
            })
            .collect();
        summaries.sort_by_key(|p| p.id);
        *self.directory.write().await = summaries;
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
