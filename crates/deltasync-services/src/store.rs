//! Manifest store: tracked path → [`FileManifest`], persisted as one
//! snapshot file.
//!
//! The snapshot is rewritten atomically after every successful mutation.
//! Chunk content is stripped on disk; the engine re-hydrates it from the
//! tracked files on load.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use deltasync_core::{FileManifest, ProjectSnapshot};
use serde::{Deserialize, Serialize};

use crate::fs::TEMP_SUFFIX;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct PersistedSnapshot {
    version: u32,
    saved_at_unix_ms: u64,
    files: BTreeMap<String, FileManifest>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },
    #[error("snapshot {path} has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
    #[error("failed to encode snapshot: {0}")]
    Encode(bincode::Error),
}

pub struct ManifestStore {
    path: PathBuf,
    files: BTreeMap<String, FileManifest>,
}

impl ManifestStore {
    /// Open the snapshot at `path`. A missing file is an empty store.
    ///
    /// Loaded manifests carry no chunk content.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    path,
                    files: BTreeMap::new(),
                })
            }
            Err(source) => {
                return Err(StoreError::Io {
                    op: "read",
                    path,
                    source,
                })
            }
        };
        let persisted: PersistedSnapshot =
            bincode::deserialize(&bytes).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?;
        if persisted.version != SNAPSHOT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                path,
                version: persisted.version,
            });
        }
        tracing::debug!(
            path = %path.display(),
            files = persisted.files.len(),
            saved_at_unix_ms = persisted.saved_at_unix_ms,
            "snapshot loaded"
        );
        Ok(Self {
            path,
            files: persisted.files,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, path: &str) -> Option<&FileManifest> {
        self.files.get(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Record `manifest` for `path` and persist. On a persist failure the
    /// previous entry is restored and the error returned.
    pub fn commit(&mut self, path: &str, manifest: FileManifest) -> Result<(), StoreError> {
        let previous = self.files.insert(path.to_string(), manifest);
        if let Err(e) = self.persist() {
            match previous {
                Some(old) => self.files.insert(path.to_string(), old),
                None => self.files.remove(path),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Replace every entry at once and persist.
    pub fn reset(&mut self, files: BTreeMap<String, FileManifest>) -> Result<(), StoreError> {
        let previous = std::mem::replace(&mut self.files, files);
        if let Err(e) = self.persist() {
            self.files = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Clone of the full state, chunk content included.
    pub fn snapshot(&self) -> ProjectSnapshot {
        ProjectSnapshot {
            files: self.files.clone(),
        }
    }

    fn persist(&self) -> Result<(), StoreError> {
        let persisted = PersistedSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at_unix_ms: now_unix_ms(),
            files: self
                .files
                .iter()
                .map(|(path, m)| (path.clone(), m.without_content()))
                .collect(),
        };
        let bytes = bincode::serialize(&persisted).map_err(StoreError::Encode)?;

        let io_err = |op: &'static str, path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io { op, path, source }
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err("create dir", parent))?;
            }
        }

        // Atomic write: tmp file → rename
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(TEMP_SUFFIX);
        let tmp = PathBuf::from(tmp_name);
        {
            let mut file = fs::File::create(&tmp).map_err(io_err("create", &tmp))?;
            file.write_all(&bytes).map_err(io_err("write", &tmp))?;
            file.sync_all().map_err(io_err("sync", &tmp))?;
        }
        fs::rename(&tmp, &self.path).map_err(io_err("rename", &self.path))?;

        tracing::trace!(files = self.files.len(), bytes = bytes.len(), "snapshot persisted");
        Ok(())
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
