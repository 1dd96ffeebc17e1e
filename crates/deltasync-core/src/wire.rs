//! Wire protocol between hub and peers.
//!
//! Every message is one binary WebSocket frame:
//!
//! ```text
//! [ WIRE_VERSION: u8 ][ bincode(Envelope) ]
//! ```
//!
//! The handshake credential is the only text frame on the wire.

use std::collections::BTreeSet;

use bincode::Options;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::hash::Digest;
use crate::manifest::FileManifest;

pub const WIRE_VERSION: u8 = 1;

/// Upper bound on a decoded envelope. An initial sync of one large file is
/// the biggest message we expect.
pub const MAX_MESSAGE_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("empty frame")]
    Empty,
    #[error("unknown wire version {0} (expected {WIRE_VERSION})")]
    UnknownVersion(u8),
    #[error("malformed envelope: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("failed to encode envelope: {0}")]
    Encode(bincode::Error),
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// A chunk whose content the receiver cannot have: shipped inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedChunk {
    pub checksum: Digest,
    pub content: Bytes,
    pub new_offset: u64,
}

/// A chunk the receiver already holds, relocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovedChunk {
    pub checksum: Digest,
    pub new_offset: u64,
}

/// Change to one file, expressed against the sender's previous manifest.
///
/// Chunks whose checksum appears in neither `moved` nor `removed` stay at
/// their current offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDelta {
    pub path: String,
    /// Whole-file checksum after the change.
    pub checksum: Digest,
    /// Whole-file checksum the sender had before the change. `None` when
    /// the sender had no manifest for the path.
    pub base_checksum: Option<Digest>,
    pub added: Vec<AddedChunk>,
    pub moved: Vec<MovedChunk>,
    pub removed: BTreeSet<Digest>,
}

impl FileDelta {
    /// Bytes carried inline.
    pub fn payload_bytes(&self) -> u64 {
        self.added.iter().map(|a| a.content.len() as u64).sum()
    }
}

/// Full state of one file. Every chunk carries its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialSyncFile {
    pub path: String,
    pub manifest: FileManifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    FileDelta(FileDelta),
    InitialSyncFile(InitialSyncFile),
    StartProjectSync { file_count: u64 },
    EndProjectSync,
    /// Sent by a peer whose replica of `path` can no longer take deltas.
    ResyncRequest { path: String },
}

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_MESSAGE_BYTES)
}

impl Envelope {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let body = options().serialize(self).map_err(WireError::Encode)?;
        let mut frame = Vec::with_capacity(1 + body.len());
        frame.push(WIRE_VERSION);
        frame.extend_from_slice(&body);
        Ok(Bytes::from(frame))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        let (&version, body) = frame.split_first().ok_or(WireError::Empty)?;
        if version != WIRE_VERSION {
            return Err(WireError::UnknownVersion(version));
        }
        Ok(options().deserialize(body)?)
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::FileDelta(_) => "file_delta",
            Envelope::InitialSyncFile(_) => "initial_sync_file",
            Envelope::StartProjectSync { .. } => "start_project_sync",
            Envelope::EndProjectSync => "end_project_sync",
            Envelope::ResyncRequest { .. } => "resync_request",
        }
    }
}
