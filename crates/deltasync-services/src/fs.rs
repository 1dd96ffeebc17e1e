//! Project filesystem access.
//!
//! Paths crossing this boundary are project-relative, `/`-separated, and
//! never absolute or escaping the root. Writes are atomic: temp file,
//! fsync, rename.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;

/// Suffix of in-flight temp files. Never indexed.
pub const TEMP_SUFFIX: &str = ".deltasync-tmp";

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("invalid project path {0:?}")]
    InvalidPath(String),
    #[error("path {0:?} is ignored")]
    Ignored(String),
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("walking project tree: {0}")]
    Walk(#[from] walkdir::Error),
}

impl FsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Read, write and enumerate files of one project tree.
pub trait ProjectFs: Send + Sync {
    fn read(&self, path: &str) -> Result<Bytes, FsError>;

    /// Replace the file at `path`, creating parent directories.
    fn write(&self, path: &str, data: &[u8]) -> Result<(), FsError>;

    /// Delete the file at `path`. A missing file is not an error.
    fn remove(&self, path: &str) -> Result<(), FsError>;

    /// Every tracked file, sorted.
    fn walk(&self) -> Result<Vec<String>, FsError>;
}

/// Reject absolute paths, `..`, `.` and empty components.
pub fn validate_relative(path: &str) -> Result<(), FsError> {
    let invalid = || FsError::InvalidPath(path.to_string());
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return Err(invalid());
    }
    if path.split('/').any(|part| part.is_empty()) {
        return Err(invalid());
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(invalid()),
        }
    }
    Ok(())
}

/// Project-relative key of `path`, or `None` when outside `root` or not UTF-8.
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// [`ProjectFs`] over a local directory.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
    ignored: Vec<String>,
}

impl LocalFs {
    /// `ignored` holds relative path prefixes, matched on whole components.
    pub fn new(root: impl Into<PathBuf>, ignored: Vec<String>) -> Result<Self, FsError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| FsError::Io {
            op: "create root",
            path: root.clone(),
            source,
        })?;
        let ignored = ignored
            .into_iter()
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect();
        Ok(Self { root, ignored })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_ignored(&self, rel: &str) -> bool {
        if rel.ends_with(TEMP_SUFFIX) {
            return true;
        }
        self.ignored.iter().any(|prefix| {
            rel == prefix
                || (rel.len() > prefix.len()
                    && rel.starts_with(prefix.as_str())
                    && rel.as_bytes()[prefix.len()] == b'/')
        })
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf, FsError> {
        validate_relative(rel)?;
        Ok(self.root.join(rel))
    }
}

impl ProjectFs for LocalFs {
    fn read(&self, path: &str) -> Result<Bytes, FsError> {
        let full = self.resolve(path)?;
        let data = fs::read(&full).map_err(|source| FsError::Io {
            op: "read",
            path: full,
            source,
        })?;
        Ok(Bytes::from(data))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        if self.is_ignored(path) {
            return Err(FsError::Ignored(path.to_string()));
        }
        let io_err = |op: &'static str, path: &Path| {
            let path = path.to_path_buf();
            move |source| FsError::Io { op, path, source }
        };

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(io_err("create dir", parent))?;
        }

        let mut tmp_name = full.as_os_str().to_owned();
        tmp_name.push(TEMP_SUFFIX);
        let tmp = PathBuf::from(tmp_name);
        {
            let mut file = fs::File::create(&tmp).map_err(io_err("create", &tmp))?;
            file.write_all(data).map_err(io_err("write", &tmp))?;
            file.sync_all().map_err(io_err("sync", &tmp))?;
        }
        fs::rename(&tmp, &full).map_err(io_err("rename", &full))?;

        tracing::trace!(path, bytes = data.len(), "file written");
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        if self.is_ignored(path) {
            return Err(FsError::Ignored(path.to_string()));
        }
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(FsError::Io {
                op: "remove",
                path: full,
                source,
            }),
        }
    }

    fn walk(&self) -> Result<Vec<String>, FsError> {
        let mut files = Vec::new();
        let walker = walkdir::WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                relative_to(&self.root, entry.path())
                    .map(|rel| !self.is_ignored(&rel))
                    .unwrap_or(true)
            });
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            match relative_to(&self.root, entry.path()) {
                Some(rel) => files.push(rel),
                None => {
                    tracing::warn!(path = %entry.path().display(), "skipping non UTF-8 path");
                }
            }
        }
        files.sort();
        Ok(files)
    }
}
