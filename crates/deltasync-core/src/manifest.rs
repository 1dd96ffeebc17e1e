//! Chunk manifests: the per-file description that diff and apply work on.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::chunker::{chunk_bytes, ChunkParams};
use crate::hash::{hash, Digest, Hasher};

/// One content-defined chunk of a file.
///
/// `content` is present for freshly chunked data and for manifests sent over
/// the wire during initial sync. Persisted manifests drop it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub checksum: Digest,
    pub offset: u64,
    pub size: u64,
    pub content: Option<Bytes>,
}

impl ChunkRecord {
    pub fn new(offset: u64, content: Bytes) -> Self {
        Self {
            checksum: hash(&content),
            offset,
            size: content.len() as u64,
            content: Some(content),
        }
    }

    /// Offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("chunk at offset {offset} does not follow the previous chunk (expected {expected})")]
    NotContiguous { offset: u64, expected: u64 },
    #[error("chunk at offset {offset} declares {declared} bytes but carries {actual}")]
    SizeMismatch {
        offset: u64,
        declared: u64,
        actual: u64,
    },
    #[error("chunk at offset {offset} declares {size} bytes, past the end of any file")]
    Overflow { offset: u64, size: u64 },
    #[error("chunk at offset {offset} has no content")]
    ContentMissing { offset: u64 },
    #[error("chunk at offset {offset} hashes to a different checksum")]
    ChunkChecksum { offset: u64 },
    #[error("manifest describes {expected} bytes but the source has {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("assembled bytes do not match the whole-file checksum")]
    WholeChecksum,
}

/// Ordered chunk list of one file plus its whole-file checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    pub whole_checksum: Digest,
    pub chunks: Vec<ChunkRecord>,
}

impl FileManifest {
    /// Chunk `data` and build its manifest. Every chunk carries content.
    pub fn from_bytes(data: &[u8], params: &ChunkParams) -> Self {
        Self {
            whole_checksum: hash(data),
            chunks: chunk_bytes(data, params),
        }
    }

    /// Build from chunker output, computing the whole checksum from the
    /// chunk contents.
    pub fn from_chunks(chunks: Vec<ChunkRecord>) -> Result<Self, ManifestError> {
        let mut hasher = Hasher::new();
        for c in &chunks {
            let content = c
                .content
                .as_ref()
                .ok_or(ManifestError::ContentMissing { offset: c.offset })?;
            hasher.update(content);
        }
        let manifest = Self {
            whole_checksum: hasher.finalize(),
            chunks,
        };
        manifest.check_layout()?;
        Ok(manifest)
    }

    /// Total file length described by the chunks.
    pub fn len(&self) -> u64 {
        self.chunks.last().map(ChunkRecord::end).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn has_content(&self) -> bool {
        self.chunks.iter().all(|c| c.content.is_some())
    }

    /// Chunks sorted, contiguous from zero, and sized to their content.
    pub fn check_layout(&self) -> Result<(), ManifestError> {
        let mut expected = 0u64;
        for c in &self.chunks {
            if c.offset != expected {
                return Err(ManifestError::NotContiguous {
                    offset: c.offset,
                    expected,
                });
            }
            if let Some(content) = &c.content {
                if content.len() as u64 != c.size {
                    return Err(ManifestError::SizeMismatch {
                        offset: c.offset,
                        declared: c.size,
                        actual: content.len() as u64,
                    });
                }
            }
            expected = c.offset.checked_add(c.size).ok_or(ManifestError::Overflow {
                offset: c.offset,
                size: c.size,
            })?;
        }
        Ok(())
    }

    /// Concatenate chunk contents and verify the result against
    /// `whole_checksum`.
    ///
    /// Capacity comes from the content actually carried, never from the
    /// declared sizes.
    pub fn assemble(&self) -> Result<Vec<u8>, ManifestError> {
        self.check_layout()?;
        let parts = self
            .chunks
            .iter()
            .map(|c| {
                c.content
                    .as_ref()
                    .ok_or(ManifestError::ContentMissing { offset: c.offset })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            out.extend_from_slice(part);
        }
        if hash(&out) != self.whole_checksum {
            return Err(ManifestError::WholeChecksum);
        }
        Ok(out)
    }

    /// Same manifest with chunk content dropped, for persistence.
    pub fn without_content(&self) -> Self {
        Self {
            whole_checksum: self.whole_checksum,
            chunks: self
                .chunks
                .iter()
                .map(|c| ChunkRecord {
                    content: None,
                    ..c.clone()
                })
                .collect(),
        }
    }

    /// Re-attach content by slicing `data`, which must be the file these
    /// chunks were computed from. Each chunk is re-verified.
    pub fn hydrate(&self, data: Bytes) -> Result<Self, ManifestError> {
        self.check_layout()?;
        if self.len() != data.len() as u64 {
            return Err(ManifestError::LengthMismatch {
                expected: self.len(),
                actual: data.len() as u64,
            });
        }
        if hash(&data) != self.whole_checksum {
            return Err(ManifestError::WholeChecksum);
        }
        let mut chunks = Vec::with_capacity(self.chunks.len());
        for c in &self.chunks {
            let content = data.slice(c.offset as usize..c.end() as usize);
            if hash(&content) != c.checksum {
                return Err(ManifestError::ChunkChecksum { offset: c.offset });
            }
            chunks.push(ChunkRecord {
                content: Some(content),
                ..c.clone()
            });
        }
        Ok(Self {
            whole_checksum: self.whole_checksum,
            chunks,
        })
    }
}

/// Every tracked file of a project, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub files: BTreeMap<String, FileManifest>,
}

impl ProjectSnapshot {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&FileManifest> {
        self.files.get(path)
    }

    /// Sum of the tracked file lengths.
    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(FileManifest::len).sum()
    }
}
