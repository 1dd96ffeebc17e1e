//! Configuration for deltasync.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $DELTASYNC_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/deltasync/config.toml
//!   3. ~/.config/deltasync/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::chunker::{ChunkParams, ChunkerError};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaSyncConfig {
    pub project: ProjectConfig,
    pub chunking: ChunkingConfig,
    pub hub: HubConfig,
    pub peer: PeerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Directory tree being synchronized.
    pub root: PathBuf,
    /// Manifest snapshot file. Relative paths resolve against `root`.
    pub snapshot_path: PathBuf,
    /// Relative path prefixes never indexed or written.
    pub ignored: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub min_size: usize,
    pub avg_size: usize,
    pub max_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub listen_addr: String,
    /// Time a new connection has to send its credential.
    pub handshake_timeout_secs: u64,
    pub ping_interval_secs: u64,
    /// Read deadline, refreshed on every pong. Must exceed the ping interval.
    pub pong_wait_secs: u64,
    /// Outbound frames buffered per peer before it is evicted.
    pub peer_queue_capacity: usize,
    pub broadcast_queue_capacity: usize,
    /// Accepted `Origin` headers. Empty = accept any.
    pub allowed_origins: Vec<String>,
    /// Required in `x-admin-key` for OTP issuance. Empty = no check.
    pub admin_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub hub_url: String,
    /// One-time password or static token presented at handshake.
    pub token: String,
    /// Loopback port for the local sync API. 0 = OS-assigned.
    pub api_port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            snapshot_path: PathBuf::from(".deltasync-snapshot"),
            ignored: vec![".git".into()],
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        let params = ChunkParams::default();
        Self {
            min_size: params.min_size(),
            avg_size: params.avg_size(),
            max_size: params.max_size(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9470".into(),
            handshake_timeout_secs: 5,
            ping_interval_secs: 30,
            pong_wait_secs: 60,
            peer_queue_capacity: 256,
            broadcast_queue_capacity: 256,
            allowed_origins: Vec::new(),
            admin_key: String::new(),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://127.0.0.1:9470/connect".into(),
            token: String::new(),
            api_port: 9471,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("deltasync")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid chunking section: {0}")]
    Chunking(#[from] ChunkerError),
    #[error("hub.ping_interval_secs ({ping}) must be below hub.pong_wait_secs ({pong})")]
    KeepaliveOrder { ping: u64, pong: u64 },
    #[error("hub.{0} must be non-zero")]
    ZeroCapacity(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DeltaSyncConfig {
    /// Load config: env vars → file → defaults. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            DeltaSyncConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DELTASYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&DeltaSyncConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chunk_params()?;
        if self.hub.ping_interval_secs >= self.hub.pong_wait_secs {
            return Err(ConfigError::KeepaliveOrder {
                ping: self.hub.ping_interval_secs,
                pong: self.hub.pong_wait_secs,
            });
        }
        if self.hub.peer_queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("peer_queue_capacity"));
        }
        if self.hub.broadcast_queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("broadcast_queue_capacity"));
        }
        Ok(())
    }

    pub fn chunk_params(&self) -> Result<ChunkParams, ChunkerError> {
        ChunkParams::new(
            self.chunking.min_size,
            self.chunking.avg_size,
            self.chunking.max_size,
        )
    }

    /// Snapshot path with relative values resolved against the project root.
    pub fn snapshot_file(&self) -> PathBuf {
        if self.project.snapshot_path.is_absolute() {
            self.project.snapshot_path.clone()
        } else {
            self.project.root.join(&self.project.snapshot_path)
        }
    }

    /// Apply DELTASYNC_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DELTASYNC_PROJECT__ROOT") {
            self.project.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DELTASYNC_HUB__LISTEN_ADDR") {
            self.hub.listen_addr = v;
        }
        if let Ok(v) = std::env::var("DELTASYNC_PEER__HUB_URL") {
            self.peer.hub_url = v;
        }
        if let Ok(v) = std::env::var("DELTASYNC_PEER__TOKEN") {
            self.peer.token = v;
        }
        if let Ok(v) = std::env::var("DELTASYNC_PEER__API_PORT") {
            if let Ok(p) = v.parse() {
                self.peer.api_port = p;
            }
        }
    }
}

impl HubConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }
}
