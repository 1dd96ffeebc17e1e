//! Diff and apply.
//!
//! Both directions are pure functions over manifests; the engine owns the
//! I/O around them.
//!
//! A delta describes the new layout relative to the old one by checksum:
//! chunks the receiver cannot have are `added` inline, chunks it already
//! holds at different offsets are `moved`, and checksums that disappear
//! are `removed`. Anything else stays where it is.

use std::collections::{BTreeSet, HashMap, HashSet};

use bytes::Bytes;
use deltasync_core::hash::{hash, short_hex, Digest, Hasher};
use deltasync_core::wire::{AddedChunk, FileDelta, MovedChunk};
use deltasync_core::{ChunkRecord, FileManifest, ManifestError};

use crate::fs::FsError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("{path}: delta for an unknown file carries moved or removed chunks")]
    NewFileWithMoves { path: String },
    #[error("{path}: moved chunk {} is not held locally", short_hex(.checksum))]
    MissingChunk { path: String, checksum: Digest },
    #[error("{path}: chunk at offset {offset} does not match its checksum")]
    ChunkChecksum { path: String, offset: u64 },
    #[error("{path}: rebuilt layout is invalid: {source}")]
    Layout {
        path: String,
        #[source]
        source: ManifestError,
    },
    #[error("{path}: rebuilt file hashes to {} but {} was expected", short_hex(.actual), short_hex(.expected))]
    ChecksumMismatch {
        path: String,
        expected: Digest,
        actual: Digest,
    },
    #[error("{path}: delta is based on {} but the local file is {}", short_hex(.base), short_hex(.local))]
    Diverged {
        path: String,
        base: Digest,
        local: Digest,
    },
    #[error("{path}: local chunk content is not loaded")]
    ContentUnavailable { path: String },
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApplyError {
    /// Integrity and divergence failures: the local replica of the path
    /// cannot take further deltas until it is replaced wholesale.
    pub fn needs_resync(&self) -> bool {
        match self {
            ApplyError::NewFileWithMoves { .. }
            | ApplyError::MissingChunk { .. }
            | ApplyError::ChunkChecksum { .. }
            | ApplyError::Layout { .. }
            | ApplyError::ChecksumMismatch { .. }
            | ApplyError::Diverged { .. }
            | ApplyError::ContentUnavailable { .. } => true,
            ApplyError::Fs(_) | ApplyError::Store(_) => false,
        }
    }
}

// ── Diff ──────────────────────────────────────────────────────────────────────

/// Offsets of every occurrence of each checksum, in file order.
fn occurrences(manifest: &FileManifest) -> HashMap<Digest, Vec<u64>> {
    let mut map: HashMap<Digest, Vec<u64>> = HashMap::new();
    for c in &manifest.chunks {
        map.entry(c.checksum).or_default().push(c.offset);
    }
    map
}

/// Delta turning `old` into `new`, or `None` when the whole checksums agree.
///
/// `new` must carry chunk content. A checksum whose offset set is unchanged
/// is omitted; otherwise every new occurrence is emitted, as `moved` when
/// `old` had the checksum and `added` when it did not.
pub fn diff(path: &str, old: Option<&FileManifest>, new: &FileManifest) -> Option<FileDelta> {
    if old.is_some_and(|o| o.whole_checksum == new.whole_checksum) {
        return None;
    }

    let old_at = old.map(occurrences).unwrap_or_default();
    let new_at = occurrences(new);

    let mut added = Vec::new();
    let mut moved = Vec::new();
    for c in &new.chunks {
        match old_at.get(&c.checksum) {
            None => added.push(AddedChunk {
                checksum: c.checksum,
                content: c.content.clone().unwrap_or_default(),
                new_offset: c.offset,
            }),
            Some(old_offsets) if Some(old_offsets) == new_at.get(&c.checksum) => {}
            Some(_) => moved.push(MovedChunk {
                checksum: c.checksum,
                new_offset: c.offset,
            }),
        }
    }

    let removed: BTreeSet<Digest> = old_at
        .keys()
        .filter(|checksum| !new_at.contains_key(*checksum))
        .copied()
        .collect();

    Some(FileDelta {
        path: path.to_string(),
        checksum: new.whole_checksum,
        base_checksum: old.map(|o| o.whole_checksum),
        added,
        moved,
        removed,
    })
}

// ── Apply ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum Reconstruction {
    /// Local file already has the delta's checksum.
    Echo,
    Rebuilt { bytes: Bytes, manifest: FileManifest },
}

fn added_record(path: &str, a: &AddedChunk) -> Result<ChunkRecord, ApplyError> {
    if hash(&a.content) != a.checksum {
        return Err(ApplyError::ChunkChecksum {
            path: path.to_string(),
            offset: a.new_offset,
        });
    }
    Ok(ChunkRecord {
        checksum: a.checksum,
        offset: a.new_offset,
        size: a.content.len() as u64,
        content: Some(a.content.clone()),
    })
}

/// Rebuild the file `delta` describes from `local` (the receiver's current
/// manifest, with content) and the inline chunks. Nothing is written; the
/// caller persists `Rebuilt` only after this returns `Ok`.
pub fn reconstruct(
    local: Option<&FileManifest>,
    delta: &FileDelta,
) -> Result<Reconstruction, ApplyError> {
    let path = delta.path.as_str();
    let mut targets = Vec::with_capacity(delta.added.len() + delta.moved.len());

    match local {
        None => {
            if !delta.moved.is_empty() || !delta.removed.is_empty() {
                return Err(ApplyError::NewFileWithMoves {
                    path: path.to_string(),
                });
            }
            for a in &delta.added {
                targets.push(added_record(path, a)?);
            }
        }
        Some(local) => {
            if local.whole_checksum == delta.checksum {
                return Ok(Reconstruction::Echo);
            }
            if let Some(base) = delta.base_checksum {
                if base != local.whole_checksum {
                    return Err(ApplyError::Diverged {
                        path: path.to_string(),
                        base,
                        local: local.whole_checksum,
                    });
                }
            }

            let mut content: HashMap<Digest, &Bytes> = HashMap::with_capacity(local.chunks.len());
            for c in &local.chunks {
                let bytes = c.content.as_ref().ok_or_else(|| ApplyError::ContentUnavailable {
                    path: path.to_string(),
                })?;
                content.insert(c.checksum, bytes);
            }

            for a in &delta.added {
                targets.push(added_record(path, a)?);
            }

            let mut relocated = HashSet::with_capacity(delta.moved.len());
            for m in &delta.moved {
                let bytes = content.get(&m.checksum).ok_or(ApplyError::MissingChunk {
                    path: path.to_string(),
                    checksum: m.checksum,
                })?;
                relocated.insert(m.checksum);
                targets.push(ChunkRecord {
                    checksum: m.checksum,
                    offset: m.new_offset,
                    size: bytes.len() as u64,
                    content: Some((*bytes).clone()),
                });
            }

            targets.extend(
                local
                    .chunks
                    .iter()
                    .filter(|c| !relocated.contains(&c.checksum) && !delta.removed.contains(&c.checksum))
                    .cloned(),
            );
        }
    }

    targets.sort_by_key(|c| c.offset);
    let manifest = FileManifest {
        whole_checksum: delta.checksum,
        chunks: targets,
    };
    manifest.check_layout().map_err(|source| ApplyError::Layout {
        path: path.to_string(),
        source,
    })?;

    let carried: usize = manifest
        .chunks
        .iter()
        .filter_map(|c| c.content.as_ref())
        .map(Bytes::len)
        .sum();
    let mut buf = Vec::with_capacity(carried);
    let mut hasher = Hasher::new();
    for c in &manifest.chunks {
        if let Some(bytes) = &c.content {
            buf.extend_from_slice(bytes);
            hasher.update(bytes);
        }
    }
    let actual = hasher.finalize();
    if actual != delta.checksum {
        return Err(ApplyError::ChecksumMismatch {
            path: path.to_string(),
            expected: delta.checksum,
            actual,
        });
    }

    Ok(Reconstruction::Rebuilt {
        bytes: Bytes::from(buf),
        manifest,
    })
}
