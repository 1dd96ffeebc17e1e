//! deltasync-core: chunking, manifests and the wire format.
//! All other deltasync crates depend on this one.

pub mod chunker;
pub mod config;
pub mod hash;
pub mod manifest;
pub mod wire;

pub use chunker::{ChunkParams, ChunkerError};
pub use hash::Digest;
pub use manifest::{ChunkRecord, FileManifest, ManifestError, ProjectSnapshot};
pub use wire::{AddedChunk, Envelope, FileDelta, InitialSyncFile, MovedChunk, WireError};
