//! Transaction-scoped staging workspaces
//!
//! Every transaction stages into `<base>/tmp/<transaction_id>`. Workspaces
//! left behind by a crash are reclaimed by age.

use crate::error::{DepotError, DepotResult};
use crate::storage::StorageAdapter;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default age (hours) after which an unreferenced workspace counts as orphaned
pub const DEFAULT_ORPHAN_MAX_AGE_HOURS: i64 = 24;

/// A workspace directory that outlived its transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedWorkspace {
    /// Transaction id (directory name)
    pub transaction_id: String,
    /// Full workspace path
    pub path: PathBuf,
    /// Last modification time
    pub modified: DateTime<Utc>,
    /// Bytes on disk when the workspace was found
    pub size_bytes: u64,
}

/// Provisions and reclaims staging workspaces
#[derive(Clone)]
pub struct TempWorkspace {
    storage: Arc<dyn StorageAdapter>,
}

impl TempWorkspace {
    /// Create a workspace manager over the given storage adapter
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    /// Create `<base_dir>/tmp/<transaction_id>`.
    ///
    /// Fails loudly: an install cannot proceed without a staging area.
    pub async fn provision(&self, base_dir: &Path, transaction_id: &str) -> DepotResult<PathBuf> {
        let path = self
            .storage
            .create_temp_directory(base_dir, transaction_id)
            .await
            .map_err(|e| match e {
                DepotError::StagingFailed { .. } => e,
                other => DepotError::staging(
                    base_dir.join("tmp").join(transaction_id),
                    other.to_string(),
                ),
            })?;
        debug!("Provisioned workspace {}", path.display());
        Ok(path)
    }

    /// Best-effort recursive removal. Failures are logged, never returned.
    pub async fn cleanup(&self, path: &Path) -> bool {
        match self.storage.remove_directory(path).await {
            Ok(()) => {
                debug!("Removed workspace {}", path.display());
                true
            }
            Err(e) => {
                warn!("Failed to remove workspace {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Workspaces under `<base_dir>/tmp` older than `max_age`
    pub async fn list_orphaned(
        &self,
        base_dir: &Path,
        max_age: Duration,
    ) -> DepotResult<Vec<OrphanedWorkspace>> {
        let cutoff = Utc::now() - max_age;
        let dirs = self.storage.list_temp_directories(base_dir).await?;

        let mut orphans = Vec::new();
        for dir in dirs.into_iter().filter(|d| d.modified < cutoff) {
            let size_bytes = self
                .storage
                .calculate_directory_size(&dir.path)
                .await
                .unwrap_or(0);
            orphans.push(OrphanedWorkspace {
                transaction_id: dir.name,
                path: dir.path,
                modified: dir.modified,
                size_bytes,
            });
        }
        Ok(orphans)
    }

    /// Remove orphaned workspaces, skipping any transaction still in flight.
    /// Returns the workspaces that were actually removed.
    pub async fn cleanup_orphaned(
        &self,
        base_dir: &Path,
        max_age: Duration,
        in_flight: &HashSet<String>,
    ) -> DepotResult<Vec<OrphanedWorkspace>> {
        let mut removed = Vec::new();

        for orphan in self.list_orphaned(base_dir, max_age).await? {
            if in_flight.contains(&orphan.transaction_id) {
                debug!("Skipping in-flight workspace {}", orphan.transaction_id);
                continue;
            }
            if self.cleanup(&orphan.path).await {
                info!("Reclaimed orphaned workspace {}", orphan.path.display());
                removed.push(orphan);
            }
        }

        Ok(removed)
    }

    /// Confirm staged content hashes to `expected`
    pub async fn verify_checksum(&self, path: &Path, expected: &str) -> DepotResult<String> {
        let actual = self
            .storage
            .calculate_checksum(path)
            .await
            .map_err(|e| DepotError::staging(path, e.to_string()))?;

        if !actual.eq_ignore_ascii_case(expected) {
            return Err(DepotError::ChecksumMismatch {
                subject: path.display().to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(actual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsStorage;
    use tempfile::TempDir;

    fn workspace() -> (TempWorkspace, TempDir) {
        let temp = TempDir::new().unwrap();
        (TempWorkspace::new(Arc::new(FsStorage::new())), temp)
    }

    #[tokio::test]
    async fn provision_and_cleanup() {
        let (ws, temp) = workspace();
        let path = ws.provision(temp.path(), "tx-abc").await.unwrap();
        assert!(path.ends_with("tmp/tx-abc"));
        assert!(path.is_dir());

        std::fs::write(path.join("file"), "x").unwrap();
        assert!(ws.cleanup(&path).await);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn provision_twice_fails_loudly() {
        let (ws, temp) = workspace();
        ws.provision(temp.path(), "tx-dup").await.unwrap();
        let err = ws.provision(temp.path(), "tx-dup").await.unwrap_err();
        assert_eq!(err.code(), "STAGING_FAILED");
    }

    #[tokio::test]
    async fn orphan_detection_respects_age_and_in_flight() {
        let (ws, temp) = workspace();
        ws.provision(temp.path(), "tx-old").await.unwrap();
        ws.provision(temp.path(), "tx-busy").await.unwrap();

        // Fresh directories are not orphaned under the default threshold
        let orphans = ws
            .list_orphaned(temp.path(), Duration::hours(DEFAULT_ORPHAN_MAX_AGE_HOURS))
            .await
            .unwrap();
        assert!(orphans.is_empty());

        // With a negative age everything qualifies
        let everything = Duration::seconds(-60);
        let orphans = ws.list_orphaned(temp.path(), everything).await.unwrap();
        assert_eq!(orphans.len(), 2);

        let in_flight: HashSet<String> = ["tx-busy".to_string()].into_iter().collect();
        let removed = ws
            .cleanup_orphaned(temp.path(), everything, &in_flight)
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].transaction_id, "tx-old");
        assert!(temp.path().join("tmp/tx-busy").exists());
        assert!(!temp.path().join("tmp/tx-old").exists());
    }

    #[tokio::test]
    async fn verify_checksum_detects_mismatch() {
        let (ws, temp) = workspace();
        let path = ws.provision(temp.path(), "tx-sum").await.unwrap();
        std::fs::write(path.join("plugin.json"), "{}").unwrap();

        let storage = FsStorage::new();
        let expected = storage.calculate_checksum(&path).await.unwrap();
        assert_eq!(ws.verify_checksum(&path, &expected).await.unwrap(), expected);

        let err = ws.verify_checksum(&path, "deadbeef").await.unwrap_err();
        assert_eq!(err.code(), "CHECKSUM_MISMATCH");
    }
}
