//! Storage adapter abstraction
//!
//! Every filesystem mutation made by the cache, registry, workspace and
//! orchestrator goes through [`StorageAdapter`], which is injected at
//! construction time. [`FsStorage`] is the tokio-backed implementation.

mod fs;

pub use fs::FsStorage;

use crate::error::DepotResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One directory entry as seen by the storage adapter
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    /// File name of the entry
    pub name: String,
    /// Full path of the entry
    pub path: PathBuf,
    /// Whether the entry is a directory (symlinks are never directories here)
    pub is_dir: bool,
    /// Last modification time
    pub modified: DateTime<Utc>,
}

/// Primitive filesystem capability consumed by the depot services
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Create a directory and all of its parents
    async fn ensure_directory(&self, path: &Path) -> DepotResult<()>;

    /// Whether anything (file, directory, symlink) exists at `path`
    async fn exists(&self, path: &Path) -> bool;

    /// List the direct children of a directory, sorted by name.
    /// A missing directory lists as empty.
    async fn list_directory(&self, path: &Path) -> DepotResult<Vec<DirEntryInfo>>;

    /// Sum of the sizes of all regular files below `path`
    async fn calculate_directory_size(&self, path: &Path) -> DepotResult<u64>;

    /// Recursively remove a directory; a missing directory is not an error
    async fn remove_directory(&self, path: &Path) -> DepotResult<()>;

    /// Rename a directory into place (same filesystem, atomic)
    async fn move_directory(&self, from: &Path, to: &Path) -> DepotResult<()>;

    /// Recursively copy a directory tree, returning bytes copied
    async fn copy_directory(&self, from: &Path, to: &Path) -> DepotResult<u64>;

    /// Write a file via temp-file-then-rename
    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> DepotResult<()>;

    /// Read a whole file; a missing file reads as `None`
    async fn read_file(&self, path: &Path) -> DepotResult<Option<Vec<u8>>>;

    /// Remove a file; a missing file is not an error
    async fn remove_file(&self, path: &Path) -> DepotResult<()>;

    /// Deterministic SHA-256 over sorted relative file paths and contents
    async fn calculate_checksum(&self, path: &Path) -> DepotResult<String>;

    /// Create the file if missing and bump its modification time
    async fn touch_file(&self, path: &Path) -> DepotResult<()>;

    /// Create `<base>/tmp/<name>`, failing if it already exists
    async fn create_temp_directory(&self, base: &Path, name: &str) -> DepotResult<PathBuf>;

    /// List directories under `<base>/tmp`
    async fn list_temp_directories(&self, base: &Path) -> DepotResult<Vec<DirEntryInfo>>;

    /// Atomically point `link` at `target`, replacing any previous link
    async fn swap_symlink(&self, target: &Path, link: &Path) -> DepotResult<()>;

    /// Remove a symlink; a missing link is not an error
    async fn remove_symlink(&self, link: &Path) -> DepotResult<()>;

    /// Read a symlink target; missing or non-link paths read as `None`
    async fn read_symlink(&self, link: &Path) -> DepotResult<Option<PathBuf>>;
}

impl dyn StorageAdapter {
    /// Serialize `value` as pretty JSON and write it atomically
    pub async fn write_json_atomic<T>(&self, path: &Path, value: &T) -> DepotResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let mut bytes = serde_json::to_vec_pretty(value)?;
        bytes.push(b'\n');
        self.write_atomic(path, &bytes).await
    }

    /// Read and deserialize a JSON file; a missing file reads as `None`
    pub async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> DepotResult<Option<T>> {
        match self.read_file(path).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Run `op`, retrying exactly once when the first failure is transient
pub(crate) async fn retry_transient<T, F, Fut>(what: &str, mut op: F) -> DepotResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DepotResult<T>>,
{
    match op().await {
        Err(e) if e.is_retryable() => {
            warn!("Transient failure while {}, retrying once: {}", what, e);
            op().await
        }
        other => other,
    }
}
