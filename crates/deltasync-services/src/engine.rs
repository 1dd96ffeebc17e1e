//! Sync engine: local changes in, deltas out; remote deltas in, verified
//! files out.
//!
//! All manifest mutations go through one async mutex, held across the
//! filesystem write, so a path is never rebuilt from a manifest another
//! task is replacing.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use deltasync_core::hash::{short_hex, Hasher};
use deltasync_core::wire::{Envelope, FileDelta, InitialSyncFile};
use deltasync_core::{ChunkParams, FileManifest, ManifestError, ProjectSnapshot};
use tokio::sync::Mutex;

use crate::delta::{self, ApplyError, Reconstruction};
use crate::fs::{validate_relative, FsError, ProjectFs};
use crate::store::{ManifestStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// File written and manifest replaced.
    Applied,
    /// Local state already matched; nothing done.
    Echo,
}

/// Result of a full tree scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexReport {
    pub scanned: usize,
    pub changed: usize,
}

pub struct SyncEngine {
    fs: Arc<dyn ProjectFs>,
    params: ChunkParams,
    store: Mutex<ManifestStore>,
}

impl SyncEngine {
    /// Load the snapshot at `snapshot_path` and re-hydrate every manifest
    /// from disk. Files that changed while we were down are re-chunked;
    /// files that vanished are dropped.
    pub async fn open(
        fs: Arc<dyn ProjectFs>,
        params: ChunkParams,
        snapshot_path: impl Into<PathBuf>,
    ) -> Result<Self, SyncError> {
        let mut store = ManifestStore::load(snapshot_path)?;
        let mut files = BTreeMap::new();
        let mut stale = 0usize;
        for path in store.paths().map(str::to_string).collect::<Vec<_>>() {
            let Some(stored) = store.get(&path) else { continue };
            let data = match fs.read(&path) {
                Ok(data) => data,
                Err(e) if e.is_not_found() => {
                    tracing::info!(path = %path, "tracked file vanished, dropping manifest");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let manifest = match stored.hydrate(data.clone()) {
                Ok(m) => m,
                Err(_) => {
                    stale += 1;
                    FileManifest::from_bytes(&data, &params)
                }
            };
            files.insert(path, manifest);
        }
        let loaded = files.len();
        store.reset(files)?;
        tracing::info!(files = loaded, rechunked = stale, "sync engine ready");

        Ok(Self {
            fs,
            params,
            store: Mutex::new(store),
        })
    }

    pub fn params(&self) -> &ChunkParams {
        &self.params
    }

    /// Walk the project and record a manifest for every file whose content
    /// differs from the store.
    pub async fn index_tree(&self) -> Result<IndexReport, SyncError> {
        let paths = self.fs.walk()?;
        let mut report = IndexReport::default();
        for path in paths {
            report.scanned += 1;
            let data = self.fs.read(&path)?;
            let manifest = FileManifest::from_bytes(&data, &self.params);
            let mut store = self.store.lock().await;
            if store.get(&path).map(|m| m.whole_checksum) != Some(manifest.whole_checksum) {
                store.commit(&path, manifest)?;
                report.changed += 1;
            }
        }
        tracing::info!(scanned = report.scanned, changed = report.changed, "project indexed");
        Ok(report)
    }

    /// Chunk `bytes` as the new content of `path`, diff against the stored
    /// manifest, and persist. Returns the delta to distribute, or `None`
    /// when nothing changed.
    pub async fn submit_local_change(
        &self,
        path: &str,
        bytes: Bytes,
    ) -> Result<Option<FileDelta>, SyncError> {
        validate_relative(path)?;
        let manifest = FileManifest::from_bytes(&bytes, &self.params);

        let mut store = self.store.lock().await;
        let Some(delta) = delta::diff(path, store.get(path), &manifest) else {
            tracing::debug!(path, "no change");
            return Ok(None);
        };
        store.commit(path, manifest)?;

        tracing::info!(
            path,
            checksum = %short_hex(&delta.checksum),
            added = delta.added.len(),
            moved = delta.moved.len(),
            removed = delta.removed.len(),
            payload_bytes = delta.payload_bytes(),
            "local change"
        );
        Ok(Some(delta))
    }

    /// Read `path` from the project and submit it.
    pub async fn submit_path(&self, path: &str) -> Result<Option<FileDelta>, SyncError> {
        let bytes = self.fs.read(path)?;
        self.submit_local_change(path, bytes).await
    }

    /// Apply a delta from another participant. On any error the file on
    /// disk and the stored manifest are left as they were.
    pub async fn on_remote_delta(&self, delta: &FileDelta) -> Result<ApplyOutcome, ApplyError> {
        validate_relative(&delta.path)?;
        let mut store = self.store.lock().await;

        let (bytes, manifest) = match delta::reconstruct(store.get(&delta.path), delta)? {
            Reconstruction::Echo => {
                tracing::debug!(path = %delta.path, "echo, ignoring");
                return Ok(ApplyOutcome::Echo);
            }
            Reconstruction::Rebuilt { bytes, manifest } => (bytes, manifest),
        };

        self.replace_file(&mut store, &delta.path, &bytes, manifest)?;

        tracing::info!(
            path = %delta.path,
            checksum = %short_hex(&delta.checksum),
            bytes = bytes.len(),
            "remote delta applied"
        );
        Ok(ApplyOutcome::Applied)
    }

    /// Replace `file.path` wholesale with the shipped manifest, after
    /// verifying it assembles to its declared checksum.
    pub async fn apply_initial_file(&self, file: &InitialSyncFile) -> Result<ApplyOutcome, ApplyError> {
        validate_relative(&file.path)?;
        let mut store = self.store.lock().await;

        if store.get(&file.path).map(|m| m.whole_checksum) == Some(file.manifest.whole_checksum) {
            return Ok(ApplyOutcome::Echo);
        }

        let (bytes, manifest) = verify_full_file(file)?;

        self.replace_file(&mut store, &file.path, &bytes, manifest)?;

        tracing::info!(
            path = %file.path,
            checksum = %short_hex(&file.manifest.whole_checksum),
            bytes = bytes.len(),
            "file replaced from full state"
        );
        Ok(ApplyOutcome::Applied)
    }

    /// Write `bytes` to `path` and record `manifest` for it. When the
    /// manifest cannot be persisted the previous file is put back, so the
    /// disk never runs ahead of the store.
    fn replace_file(
        &self,
        store: &mut ManifestStore,
        path: &str,
        bytes: &[u8],
        manifest: FileManifest,
    ) -> Result<(), ApplyError> {
        let previous = match store.get(path).map(FileManifest::assemble) {
            Some(Ok(old)) => Some(Bytes::from(old)),
            _ => match self.fs.read(path) {
                Ok(old) => Some(old),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e.into()),
            },
        };

        self.fs.write(path, bytes)?;
        if let Err(e) = store.commit(path, manifest) {
            let restored = match &previous {
                Some(old) => self.fs.write(path, old),
                None => self.fs.remove(path),
            };
            if let Err(re) = restored {
                tracing::error!(path, error = %re, "could not restore file after a failed commit");
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn manifest(&self, path: &str) -> Option<FileManifest> {
        self.store.lock().await.get(path).cloned()
    }

    /// Full state of one tracked file, ready to ship.
    pub async fn initial_file(&self, path: &str) -> Option<InitialSyncFile> {
        self.manifest(path).await.map(|manifest| InitialSyncFile {
            path: path.to_string(),
            manifest,
        })
    }

    pub async fn snapshot(&self) -> ProjectSnapshot {
        self.store.lock().await.snapshot()
    }

    pub async fn tracked_files(&self) -> usize {
        self.store.lock().await.len()
    }

    /// The bootstrap sequence for a joining peer: start marker, every
    /// tracked file, end marker.
    pub async fn initial_sync(&self) -> Vec<Envelope> {
        let snapshot = self.snapshot().await;
        let mut out = Vec::with_capacity(snapshot.len() + 2);
        out.push(Envelope::StartProjectSync {
            file_count: snapshot.len() as u64,
        });
        out.extend(
            snapshot
                .files
                .into_iter()
                .map(|(path, manifest)| Envelope::InitialSyncFile(InitialSyncFile { path, manifest })),
        );
        out.push(Envelope::EndProjectSync);
        out
    }
}

/// Assemble a shipped manifest and check every chunk against its checksum.
fn verify_full_file(file: &InitialSyncFile) -> Result<(Bytes, FileManifest), ApplyError> {
    let path = || file.path.clone();
    let assembled = file.manifest.assemble().map_err(|e| match e {
        ManifestError::WholeChecksum => ApplyError::ChecksumMismatch {
            path: path(),
            expected: file.manifest.whole_checksum,
            actual: content_digest(&file.manifest),
        },
        ManifestError::ContentMissing { .. } => ApplyError::ContentUnavailable { path: path() },
        source => ApplyError::Layout { path: path(), source },
    })?;
    let bytes = Bytes::from(assembled);
    let manifest = file.manifest.hydrate(bytes.clone()).map_err(|e| match e {
        ManifestError::ChunkChecksum { offset } => ApplyError::ChunkChecksum { path: path(), offset },
        source => ApplyError::Layout { path: path(), source },
    })?;
    Ok((bytes, manifest))
}

fn content_digest(manifest: &FileManifest) -> deltasync_core::Digest {
    let mut hasher = Hasher::new();
    for content in manifest.chunks.iter().filter_map(|c| c.content.as_ref()) {
        hasher.update(content);
    }
    hasher.finalize()
}
