//! tokio-backed filesystem storage

use super::{retry_transient, DirEntryInfo, StorageAdapter};
use crate::error::{DepotError, DepotResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

const CHECKSUM_CHUNK: usize = 64 * 1024;

/// Storage adapter over the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStorage;

impl FsStorage {
    /// Create a new filesystem storage adapter
    pub fn new() -> Self {
        Self
    }

    async fn write_once(&self, path: &Path, contents: &[u8]) -> DepotResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| DepotError::Internal(format!("{} has no parent", path.display())))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| DepotError::io(format!("creating directory {}", parent.display()), e))?;

        let tmp = sibling_temp_path(path);
        let result = async {
            let mut file = fs::File::create(&tmp)
                .await
                .map_err(|e| DepotError::io(format!("creating {}", tmp.display()), e))?;
            file.write_all(contents)
                .await
                .map_err(|e| DepotError::io(format!("writing {}", tmp.display()), e))?;
            file.sync_all()
                .await
                .map_err(|e| DepotError::io(format!("syncing {}", tmp.display()), e))?;
            fs::rename(&tmp, path)
                .await
                .map_err(|e| DepotError::io(format!("renaming into {}", path.display()), e))
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result
    }

    async fn read_once(&self, path: &Path) -> DepotResult<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DepotError::io(format!("reading {}", path.display()), e)),
        }
    }
}

/// Hidden temp path next to `path`, unique per call
fn sibling_temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

fn to_utc(time: std::io::Result<SystemTime>) -> DateTime<Utc> {
    time.map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
}

/// Collect every regular file below `root` as (relative path, absolute path),
/// sorted by relative path with `/` separators
async fn collect_files(root: &Path) -> DepotResult<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| DepotError::io(format!("reading directory {}", dir.display()), e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DepotError::io(format!("reading entry in {}", dir.display()), e))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| DepotError::io(format!("inspecting {}", path.display()), e))?;

            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .map_err(|e| DepotError::Internal(e.to_string()))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((relative, path));
            } else {
                debug!("Skipping non-regular file {}", path.display());
            }
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

#[async_trait]
impl StorageAdapter for FsStorage {
    async fn ensure_directory(&self, path: &Path) -> DepotResult<()> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| DepotError::io(format!("creating directory {}", path.display()), e))
    }

    async fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).await.is_ok()
    }

    async fn list_directory(&self, path: &Path) -> DepotResult<Vec<DirEntryInfo>> {
        let mut entries = match fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(DepotError::io(
                    format!("listing directory {}", path.display()),
                    e,
                ))
            }
        };

        let mut listed = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DepotError::io(format!("reading entry in {}", path.display()), e))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| DepotError::io(format!("inspecting {}", entry.path().display()), e))?;

            listed.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path(),
                is_dir: metadata.is_dir(),
                modified: to_utc(metadata.modified()),
            });
        }

        listed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listed)
    }

    async fn calculate_directory_size(&self, path: &Path) -> DepotResult<u64> {
        let mut total = 0u64;
        for (_, file) in collect_files(path).await? {
            let metadata = fs::symlink_metadata(&file)
                .await
                .map_err(|e| DepotError::io(format!("inspecting {}", file.display()), e))?;
            total += metadata.len();
        }
        Ok(total)
    }

    async fn remove_directory(&self, path: &Path) -> DepotResult<()> {
        match fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DepotError::io(
                format!("removing directory {}", path.display()),
                e,
            )),
        }
    }

    async fn move_directory(&self, from: &Path, to: &Path) -> DepotResult<()> {
        if let Some(parent) = to.parent() {
            self.ensure_directory(parent).await?;
        }
        fs::rename(from, to).await.map_err(|e| {
            DepotError::io(
                format!("moving {} to {}", from.display(), to.display()),
                e,
            )
        })
    }

    async fn copy_directory(&self, from: &Path, to: &Path) -> DepotResult<u64> {
        if !fs::metadata(from).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(DepotError::PathNotFound(from.to_path_buf()));
        }

        self.ensure_directory(to).await?;
        let mut copied = 0u64;
        for (relative, source) in collect_files(from).await? {
            let dest = to.join(&relative);
            if let Some(parent) = dest.parent() {
                self.ensure_directory(parent).await?;
            }
            copied += fs::copy(&source, &dest).await.map_err(|e| {
                DepotError::io(
                    format!("copying {} to {}", source.display(), dest.display()),
                    e,
                )
            })?;
        }
        Ok(copied)
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> DepotResult<()> {
        retry_transient("writing file", move || self.write_once(path, contents)).await
    }

    async fn read_file(&self, path: &Path) -> DepotResult<Option<Vec<u8>>> {
        retry_transient("reading file", move || self.read_once(path)).await
    }

    async fn remove_file(&self, path: &Path) -> DepotResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DepotError::io(format!("removing {}", path.display()), e)),
        }
    }

    async fn calculate_checksum(&self, path: &Path) -> DepotResult<String> {
        if !fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(DepotError::PathNotFound(path.to_path_buf()));
        }

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHECKSUM_CHUNK];

        for (relative, file) in collect_files(path).await? {
            hasher.update(relative.as_bytes());
            hasher.update([0u8]);

            let mut handle = fs::File::open(&file)
                .await
                .map_err(|e| DepotError::io(format!("opening {}", file.display()), e))?;
            loop {
                let n = handle
                    .read(&mut buf)
                    .await
                    .map_err(|e| DepotError::io(format!("reading {}", file.display()), e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hasher.update([0u8]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    async fn touch_file(&self, path: &Path) -> DepotResult<()> {
        if let Some(parent) = path.parent() {
            self.ensure_directory(parent).await?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| DepotError::io(format!("touching {}", path.display()), e))?;
        let file = file.into_std().await;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            file.set_modified(SystemTime::now())
                .map_err(|e| DepotError::io(format!("touching {}", path.display()), e))
        })
        .await
        .map_err(|e| DepotError::Internal(e.to_string()))?
    }

    async fn create_temp_directory(&self, base: &Path, name: &str) -> DepotResult<PathBuf> {
        let tmp_root = base.join("tmp");
        self.ensure_directory(&tmp_root).await?;

        let dir = tmp_root.join(name);
        fs::create_dir(&dir)
            .await
            .map_err(|e| DepotError::staging(&dir, format!("cannot create workspace: {}", e)))?;
        Ok(dir)
    }

    async fn list_temp_directories(&self, base: &Path) -> DepotResult<Vec<DirEntryInfo>> {
        let entries = self.list_directory(&base.join("tmp")).await?;
        Ok(entries.into_iter().filter(|e| e.is_dir).collect())
    }

    async fn swap_symlink(&self, target: &Path, link: &Path) -> DepotResult<()> {
        if let Some(parent) = link.parent() {
            self.ensure_directory(parent).await?;
        }

        let tmp_link = sibling_temp_path(link);
        #[cfg(unix)]
        fs::symlink(target, &tmp_link).await.map_err(|e| {
            DepotError::io(format!("creating symlink {}", tmp_link.display()), e)
        })?;
        #[cfg(windows)]
        fs::symlink_dir(target, &tmp_link).await.map_err(|e| {
            DepotError::io(format!("creating symlink {}", tmp_link.display()), e)
        })?;

        if let Err(e) = fs::rename(&tmp_link, link).await {
            let _ = fs::remove_file(&tmp_link).await;
            return Err(DepotError::io(
                format!("activating symlink {}", link.display()),
                e,
            ));
        }
        Ok(())
    }

    async fn remove_symlink(&self, link: &Path) -> DepotResult<()> {
        let metadata = match fs::symlink_metadata(link).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(DepotError::io(format!("inspecting {}", link.display()), e));
            }
        };

        if !metadata.file_type().is_symlink() {
            return Err(DepotError::User(format!(
                "{} is not a symlink, refusing to remove it",
                link.display()
            )));
        }

        #[cfg(windows)]
        let removed = fs::remove_dir(link).await;
        #[cfg(not(windows))]
        let removed = fs::remove_file(link).await;

        removed.map_err(|e| DepotError::io(format!("removing symlink {}", link.display()), e))
    }

    async fn read_symlink(&self, link: &Path) -> DepotResult<Option<PathBuf>> {
        match fs::read_link(link).await {
            Ok(target) => Ok(Some(target)),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::InvalidInput) => Ok(None),
            Err(e) => Err(DepotError::io(format!("reading link {}", link.display()), e)),
        }
    }
}
