//! Cache service
//!
//! Owns `<pluginDir>/cache`: the per-version artifact trees and `index.json`.
//! All writers in this process are serialized through `write_lock`; writers in
//! other processes are detected through the index `revision` and rejected with
//! [`DepotError::Conflict`].

use crate::cache::eviction::{
    plan_eviction, plan_eviction_excluding, EvictionLimits, DEFAULT_MAX_VERSIONS_PER_PLUGIN,
};
use crate::cache::index::{
    compare_versions, mb_to_bytes, CacheEntry, CacheIndex, CacheSizeStatus, EvictedEntry,
    EvictionLogEntry, EvictionReason, EvictionResult, ProtectedEntry, INDEX_FORMAT_VERSION,
};
use crate::config::schema::CacheConfig;
use crate::error::{DepotError, DepotResult};
use crate::layout::{is_safe_segment, PluginLayout};
use crate::storage::StorageAdapter;
use crate::workspace::{OrphanedWorkspace, TempWorkspace, DEFAULT_ORPHAN_MAX_AGE_HOURS};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Directory inside a transaction workspace that receives the artifact tree
const STAGING_DIR_NAME: &str = "payload";

/// Limits and thresholds the cache enforces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub max_size_bytes: u64,
    pub max_versions_per_plugin: usize,
    pub orphan_max_age: Duration,
    /// Run eviction after every promotion unless the caller opts out
    pub evict_on_promote: bool,
}

impl CacheSettings {
    /// Settings with a size limit given in decimal megabytes
    pub fn from_mb(max_size_mb: u64) -> Self {
        Self {
            max_size_bytes: mb_to_bytes(max_size_mb),
            ..Self::default()
        }
    }

    /// Eviction limits derived from these settings
    pub fn limits(&self) -> EvictionLimits {
        EvictionLimits {
            max_size_bytes: self.max_size_bytes,
            max_versions_per_plugin: self.max_versions_per_plugin,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size_bytes: mb_to_bytes(500),
            max_versions_per_plugin: DEFAULT_MAX_VERSIONS_PER_PLUGIN,
            orphan_max_age: Duration::hours(DEFAULT_ORPHAN_MAX_AGE_HOURS),
            evict_on_promote: true,
        }
    }
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            max_size_bytes: mb_to_bytes(config.max_size_mb),
            max_versions_per_plugin: config.max_versions_per_plugin,
            orphan_max_age: Duration::hours(config.orphan_max_age_hours),
            evict_on_promote: config.evict_on_promote,
        }
    }
}

/// Staging area allocated for one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifacts {
    pub transaction_id: String,
    /// `<pluginDir>/tmp/<transaction_id>`
    pub workspace: PathBuf,
    /// Directory the artifact tree is written into
    pub staging_path: PathBuf,
}

/// Options for [`CacheService::promote_artifacts`]
#[derive(Debug, Clone, Default)]
pub struct PromoteOptions {
    /// Reject the promotion unless the staged tree hashes to this value
    pub expected_checksum: Option<String>,
    /// Leave eviction to the caller
    pub skip_eviction: bool,
}

/// Outcome of a promotion
#[derive(Debug, Clone)]
pub struct PromoteOutcome {
    pub entry: CacheEntry,
    /// An entry for the same version existed and was replaced
    pub replaced: bool,
    pub eviction: Option<EvictionResult>,
}

/// Overrides for an on-demand eviction pass
#[derive(Debug, Clone, Default)]
pub struct EvictionOptions {
    pub max_size_bytes: Option<u64>,
    pub max_versions_per_plugin: Option<usize>,
    /// Plan only
    pub dry_run: bool,
}

/// What went wrong with a cached entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntegrityProblem {
    /// The cache directory is gone
    Missing,
    /// The tree no longer hashes to the recorded checksum
    ChecksumMismatch { expected: String, actual: String },
    /// The tree could not be read
    Unreadable { reason: String },
}

/// One entry that failed verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityIssue {
    pub plugin_id: String,
    pub version: String,
    pub path: PathBuf,
    pub problem: IntegrityProblem,
    pub pinned: bool,
    pub is_current_version: bool,
}

/// Summary of a [`CacheService::rebuild_index`] run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    pub entries: usize,
    pub total_size_bytes: u64,
    /// `id@version` found on disk but missing from the old index
    pub added: Vec<String>,
    /// `id@version` in the old index with no directory on disk
    pub dropped: Vec<String>,
    /// The previous index could not be read
    pub previous_unreadable: bool,
}

/// Point-in-time cache usage
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_size_bytes: u64,
    pub max_size_bytes: u64,
    pub usage_percent: f64,
    pub status: CacheSizeStatus,
    pub entry_count: usize,
    pub plugin_count: usize,
    pub pinned_count: usize,
    pub eviction_log_len: usize,
    pub last_eviction: Option<EvictionLogEntry>,
    pub last_updated: DateTime<Utc>,
}

/// Only the revision is needed to detect a concurrent writer
#[derive(Deserialize)]
struct StoredRevision {
    #[serde(default)]
    revision: u64,
}

fn key(plugin_id: &str, version: &str) -> String {
    format!("{}@{}", plugin_id, version)
}

fn protected_entry(entry: &CacheEntry) -> ProtectedEntry {
    ProtectedEntry {
        plugin_id: entry.plugin_id.clone(),
        version: entry.version.clone(),
        pinned: entry.pinned,
        is_current_version: entry.is_current_version,
        reason: EvictionReason::PinProtected,
    }
}

fn validate_key(plugin_id: &str, version: &str) -> DepotResult<()> {
    if !is_safe_segment(plugin_id) {
        return Err(DepotError::User(format!("Invalid plugin id '{}'", plugin_id)));
    }
    if !is_safe_segment(version) {
        return Err(DepotError::User(format!("Invalid version '{}'", version)));
    }
    Ok(())
}

/// On-disk artifact cache with deterministic eviction
pub struct CacheService {
    storage: Arc<dyn StorageAdapter>,
    layout: PluginLayout,
    settings: CacheSettings,
    workspace: TempWorkspace,
    in_flight: StdMutex<HashSet<String>>,
    write_lock: Mutex<()>,
}

impl CacheService {
    pub fn new(storage: Arc<dyn StorageAdapter>, layout: PluginLayout, settings: CacheSettings) -> Self {
        let workspace = TempWorkspace::new(storage.clone());
        Self {
            storage,
            layout,
            settings,
            workspace,
            in_flight: StdMutex::new(HashSet::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn layout(&self) -> &PluginLayout {
        &self.layout
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- index persistence -------------------------------------------------

    /// Read the index; a missing file is an empty index
    pub async fn load_index(&self) -> DepotResult<CacheIndex> {
        let path = self.layout.index_path();
        let Some(bytes) = self.storage.read_file(&path).await? else {
            return Ok(CacheIndex::default());
        };

        let mut index: CacheIndex =
            serde_json::from_slice(&bytes).map_err(|e| DepotError::IndexCorrupted {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if index.version > INDEX_FORMAT_VERSION {
            return Err(DepotError::IndexCorrupted {
                path,
                reason: format!("unsupported index format version {}", index.version),
            });
        }
        index.recompute_total();
        Ok(index)
    }

    async fn disk_revision(&self) -> DepotResult<u64> {
        let path = self.layout.index_path();
        match self.storage.read_file(&path).await? {
            None => Ok(0),
            Some(bytes) => serde_json::from_slice::<StoredRevision>(&bytes)
                .map(|stored| stored.revision)
                .map_err(|e| DepotError::IndexCorrupted {
                    path,
                    reason: e.to_string(),
                }),
        }
    }

    /// Persist `index`, failing if another writer committed since it was loaded.
    /// Callers must hold `write_lock`.
    async fn save_index(&self, index: &mut CacheIndex) -> DepotResult<()> {
        let on_disk = self.disk_revision().await?;
        if on_disk != index.revision {
            warn!(
                "Cache index revision moved from {} to {} underneath us",
                index.revision, on_disk
            );
            return Err(DepotError::Conflict(self.layout.index_path()));
        }
        self.write_index(index).await
    }

    async fn write_index(&self, index: &mut CacheIndex) -> DepotResult<()> {
        index.revision += 1;
        index.last_updated = Utc::now();
        index.recompute_total();
        self.storage.ensure_directory(&self.layout.cache_dir()).await?;
        self.storage
            .write_json_atomic(&self.layout.index_path(), &*index)
            .await?;
        debug!("Cache index written at revision {}", index.revision);
        Ok(())
    }

    // ---- staging and promotion ---------------------------------------------

    /// Allocate a transaction workspace and its staging directory.
    /// The index is not touched.
    pub async fn stage_artifacts(
        &self,
        plugin_id: &str,
        version: &str,
        transaction_id: Option<String>,
    ) -> DepotResult<StagedArtifacts> {
        validate_key(plugin_id, version)?;
        let transaction_id = transaction_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let workspace = self
            .workspace
            .provision(self.layout.workspace_base(), &transaction_id)
            .await?;
        let staging_path = workspace.join(STAGING_DIR_NAME);
        if let Err(e) = self.storage.ensure_directory(&staging_path).await {
            self.workspace.cleanup(&workspace).await;
            return Err(DepotError::staging(&staging_path, e.to_string()));
        }

        self.in_flight().insert(transaction_id.clone());
        debug!(
            "Staging {}@{} for transaction {} at {}",
            plugin_id,
            version,
            transaction_id,
            staging_path.display()
        );

        Ok(StagedArtifacts {
            transaction_id,
            workspace,
            staging_path,
        })
    }

    /// Remove a transaction's workspace and stop treating it as in flight
    pub async fn release_staging(&self, staged: &StagedArtifacts) -> bool {
        let removed = self.workspace.cleanup(&staged.workspace).await;
        self.in_flight().remove(&staged.transaction_id);
        removed
    }

    /// Whether a transaction still owns a workspace
    pub fn is_in_flight(&self, transaction_id: &str) -> bool {
        self.in_flight().contains(transaction_id)
    }

    /// Move a staged tree into `cache/<id>/<version>` and record it
    pub async fn promote_artifacts(
        &self,
        plugin_id: &str,
        version: &str,
        staging_path: &Path,
        options: &PromoteOptions,
    ) -> DepotResult<PromoteOutcome> {
        validate_key(plugin_id, version)?;
        if !self.storage.exists(staging_path).await {
            return Err(DepotError::staging(staging_path, "staging path does not exist"));
        }

        let checksum = match &options.expected_checksum {
            Some(expected) => self.workspace.verify_checksum(staging_path, expected).await?,
            None => self
                .storage
                .calculate_checksum(staging_path)
                .await
                .map_err(|e| DepotError::staging(staging_path, e.to_string()))?,
        };
        let size_bytes = self
            .storage
            .calculate_directory_size(staging_path)
            .await
            .map_err(|e| DepotError::staging(staging_path, e.to_string()))?;

        let _guard = self.write_lock.lock().await;
        let mut index = self.load_index().await?;

        let dest = self.layout.version_dir(plugin_id, version);
        self.storage
            .ensure_directory(&self.layout.plugin_cache_dir(plugin_id))
            .await?;
        self.move_into_cache(staging_path, &dest).await?;

        let previous = index.get(plugin_id, version).cloned();
        let mut entry = CacheEntry::new(plugin_id, version, dest, size_bytes, Some(checksum));
        if let Some(prev) = &previous {
            entry.pinned = prev.pinned;
            entry.is_current_version = prev.is_current_version;
        }
        index.upsert(entry.clone());
        self.save_index(&mut index).await?;

        info!(
            "Promoted {}@{} into cache ({} bytes)",
            plugin_id, version, size_bytes
        );

        let eviction = if options.skip_eviction || !self.settings.evict_on_promote {
            None
        } else {
            Some(
                self.evict_locked(&mut index, self.settings.limits(), false)
                    .await?,
            )
        };

        Ok(PromoteOutcome {
            entry,
            replaced: previous.is_some(),
            eviction,
        })
    }

    /// Rename `staging` to `dest`, displacing an existing tree only once the
    /// new one is in place
    async fn move_into_cache(&self, staging: &Path, dest: &Path) -> DepotResult<()> {
        if !self.storage.exists(dest).await {
            return self
                .storage
                .move_directory(staging, dest)
                .await
                .map_err(|e| DepotError::staging(staging, e.to_string()));
        }

        let tmp = self.layout.tmp_dir();
        self.storage.ensure_directory(&tmp).await?;
        let displaced = tmp.join(format!("displaced-{}", Uuid::new_v4()));
        self.storage.move_directory(dest, &displaced).await?;

        if let Err(e) = self.storage.move_directory(staging, dest).await {
            if let Err(restore) = self.storage.move_directory(&displaced, dest).await {
                warn!(
                    "Could not restore {} from {}: {}",
                    dest.display(),
                    displaced.display(),
                    restore
                );
            }
            return Err(DepotError::staging(staging, e.to_string()));
        }

        self.workspace.cleanup(&displaced).await;
        Ok(())
    }

    // ---- lookups -----------------------------------------------------------

    /// Cache path for a version, bumping its last-access time
    pub async fn retrieve_artifacts(&self, plugin_id: &str, version: &str) -> DepotResult<PathBuf> {
        let _guard = self.write_lock.lock().await;
        let mut index = self.load_index().await?;

        let path = {
            let entry = index
                .get_mut(plugin_id, version)
                .ok_or_else(|| DepotError::not_cached(plugin_id, version))?;
            entry.last_access_time = Utc::now();
            entry.cache_path.clone()
        };
        if !self.storage.exists(&path).await {
            return Err(DepotError::not_cached(plugin_id, version));
        }

        self.save_index(&mut index).await?;
        Ok(path)
    }

    /// Entry for one version without touching its access time
    pub async fn lookup(&self, plugin_id: &str, version: &str) -> DepotResult<Option<CacheEntry>> {
        Ok(self.load_index().await?.get(plugin_id, version).cloned())
    }

    /// All cached versions of a plugin, oldest version first
    pub async fn entries_for(&self, plugin_id: &str) -> DepotResult<Vec<CacheEntry>> {
        let index = self.load_index().await?;
        Ok(index.versions_of(plugin_id).into_iter().cloned().collect())
    }

    /// Recompute an entry's checksum and compare with the recorded one
    pub async fn verify_entry(&self, plugin_id: &str, version: &str) -> DepotResult<CacheEntry> {
        let entry = self
            .lookup(plugin_id, version)
            .await?
            .ok_or_else(|| DepotError::not_cached(plugin_id, version))?;

        if !self.storage.exists(&entry.cache_path).await {
            return Err(DepotError::ChecksumMismatch {
                subject: key(plugin_id, version),
                expected: entry.checksum.clone().unwrap_or_default(),
                actual: "<missing>".to_string(),
            });
        }
        let actual = self.storage.calculate_checksum(&entry.cache_path).await?;
        if let Some(expected) = &entry.checksum {
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(DepotError::ChecksumMismatch {
                    subject: key(plugin_id, version),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(entry)
    }

    // ---- flags -------------------------------------------------------------

    /// Pin a cached version. Returns `false` if it was already pinned.
    pub async fn pin_version(&self, plugin_id: &str, version: &str) -> DepotResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut index = self.load_index().await?;
        let entry = index
            .get_mut(plugin_id, version)
            .ok_or_else(|| DepotError::not_cached(plugin_id, version))?;
        if entry.pinned {
            return Ok(false);
        }
        entry.pinned = true;
        self.save_index(&mut index).await?;
        debug!("Pinned cache entry {}@{}", plugin_id, version);
        Ok(true)
    }

    /// Unpin a cached version. Unknown or unpinned entries are a no-op.
    pub async fn unpin_version(&self, plugin_id: &str, version: &str) -> DepotResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut index = self.load_index().await?;
        match index.get_mut(plugin_id, version) {
            Some(entry) if entry.pinned => entry.pinned = false,
            _ => return Ok(false),
        }
        self.save_index(&mut index).await?;
        debug!("Unpinned cache entry {}@{}", plugin_id, version);
        Ok(true)
    }

    /// Mark which version of a plugin is active (`None` clears it)
    pub async fn mark_current(&self, plugin_id: &str, version: Option<&str>) -> DepotResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut index = self.load_index().await?;
        if let Some(v) = version {
            if index.get(plugin_id, v).is_none() {
                return Err(DepotError::not_cached(plugin_id, v));
            }
        }
        if index.set_current(plugin_id, version) {
            self.save_index(&mut index).await?;
        }
        Ok(())
    }

    // ---- eviction ----------------------------------------------------------

    /// Run an eviction pass with the configured limits, optionally overridden
    pub async fn evict_cache(&self, options: &EvictionOptions) -> DepotResult<EvictionResult> {
        let mut limits = self.settings.limits();
        if let Some(max) = options.max_size_bytes {
            limits.max_size_bytes = max;
        }
        if let Some(max) = options.max_versions_per_plugin {
            limits.max_versions_per_plugin = max;
        }

        let _guard = self.write_lock.lock().await;
        let mut index = self.load_index().await?;
        self.evict_locked(&mut index, limits, options.dry_run).await
    }

    /// Execute eviction one removal at a time, re-planning after each.
    /// Callers must hold `write_lock`.
    async fn evict_locked(
        &self,
        index: &mut CacheIndex,
        limits: EvictionLimits,
        dry_run: bool,
    ) -> DepotResult<EvictionResult> {
        let initial = plan_eviction(index, &limits);
        let mut result = EvictionResult::untriggered(initial.total_before);
        if !initial.triggered() {
            return Ok(result);
        }
        result.triggered = true;
        result.reasons = initial.reasons.clone();
        result.protected = initial.protected.clone();

        if dry_run {
            result.dry_run = true;
            result.evicted = initial
                .removals
                .iter()
                .map(|r| EvictedEntry {
                    plugin_id: r.plugin_id.clone(),
                    version: r.version.clone(),
                    size_bytes: r.size_bytes,
                    reason: r.reason,
                })
                .collect();
            result.entries_evicted = result.evicted.len();
            result.bytes_freed = initial.removals.iter().map(|r| r.size_bytes).sum();
            result.total_after = initial.projected_after;
            return Ok(result);
        }

        let mut skipped: HashSet<(String, String)> = HashSet::new();
        loop {
            let plan = plan_eviction_excluding(index, &limits, &skipped);
            let Some(next) = plan.removals.into_iter().next() else {
                break;
            };
            match self
                .remove_entry(index, &next.plugin_id, &next.version, next.reason)
                .await?
            {
                Some(evicted) => {
                    result.bytes_freed += evicted.size_bytes;
                    result.evicted.push(evicted);
                }
                None => {
                    skipped.insert((next.plugin_id, next.version));
                }
            }
        }

        result.entries_evicted = result.evicted.len();
        result.total_after = index.total_size_bytes;
        result.timestamp = Utc::now();
        if result.entries_evicted > 0 {
            info!(
                "Evicted {} cache entries, freed {} bytes",
                result.entries_evicted, result.bytes_freed
            );
        }
        Ok(result)
    }

    /// Remove one entry's directory, then drop it from the index and persist.
    /// Returns `None` (entry kept) when the directory could not be removed.
    async fn remove_entry(
        &self,
        index: &mut CacheIndex,
        plugin_id: &str,
        version: &str,
        reason: EvictionReason,
    ) -> DepotResult<Option<EvictedEntry>> {
        let Some(entry) = index.get(plugin_id, version).cloned() else {
            return Ok(None);
        };
        if !entry.cache_path.starts_with(self.layout.cache_dir()) {
            warn!(
                "Refusing to remove {} outside the cache root",
                entry.cache_path.display()
            );
            return Ok(None);
        }
        if let Err(e) = self.storage.remove_directory(&entry.cache_path).await {
            warn!("Failed to remove {}: {}", entry.cache_path.display(), e);
            return Ok(None);
        }

        index.remove(plugin_id, version);
        index.record_eviction(EvictionLogEntry {
            timestamp: Utc::now(),
            reason,
            plugin_id: Some(plugin_id.to_string()),
            version: Some(version.to_string()),
            path: entry.cache_path.clone(),
            size_bytes: entry.size_bytes,
            was_pinned: entry.pinned,
        });
        self.save_index(index).await?;
        self.prune_plugin_dir(index, plugin_id).await;

        debug!("Removed {}@{} ({})", plugin_id, version, reason);
        Ok(Some(EvictedEntry {
            plugin_id: plugin_id.to_string(),
            version: version.to_string(),
            size_bytes: entry.size_bytes,
            reason,
        }))
    }

    async fn prune_plugin_dir(&self, index: &CacheIndex, plugin_id: &str) {
        if !index.versions_of(plugin_id).is_empty() {
            return;
        }
        let dir = self.layout.plugin_cache_dir(plugin_id);
        if let Ok(children) = self.storage.list_directory(&dir).await {
            if children.is_empty() {
                let _ = self.storage.remove_directory(&dir).await;
            }
        }
    }

    /// Remove every unprotected cached version of a plugin
    pub async fn remove_plugin_versions(&self, plugin_id: &str) -> DepotResult<EvictionResult> {
        let _guard = self.write_lock.lock().await;
        let mut index = self.load_index().await?;

        let mut result = EvictionResult::untriggered(index.total_size_bytes);
        let entries: Vec<CacheEntry> = index.versions_of(plugin_id).into_iter().cloned().collect();
        if entries.is_empty() {
            return Ok(result);
        }
        result.triggered = true;
        result.reasons = vec![EvictionReason::ManualCleanup];

        for entry in entries {
            if entry.is_protected() {
                result.protected.push(protected_entry(&entry));
                continue;
            }
            if let Some(evicted) = self
                .remove_entry(
                    &mut index,
                    &entry.plugin_id,
                    &entry.version,
                    EvictionReason::ManualCleanup,
                )
                .await?
            {
                result.bytes_freed += evicted.size_bytes;
                result.evicted.push(evicted);
            }
        }

        result.entries_evicted = result.evicted.len();
        result.total_after = index.total_size_bytes;
        Ok(result)
    }

    // ---- maintenance -------------------------------------------------------

    /// Reclaim stale transaction workspaces not owned by an in-flight transaction
    pub async fn cleanup_orphaned_temp(
        &self,
        max_age: Option<Duration>,
    ) -> DepotResult<Vec<OrphanedWorkspace>> {
        let max_age = max_age.unwrap_or(self.settings.orphan_max_age);
        let in_flight = self.in_flight().clone();

        let removed = self
            .workspace
            .cleanup_orphaned(self.layout.workspace_base(), max_age, &in_flight)
            .await?;
        if removed.is_empty() {
            return Ok(removed);
        }

        let _guard = self.write_lock.lock().await;
        let mut index = self.load_index().await?;
        for orphan in &removed {
            index.record_eviction(EvictionLogEntry {
                timestamp: Utc::now(),
                reason: EvictionReason::OrphanedTemp,
                plugin_id: None,
                version: None,
                path: orphan.path.clone(),
                size_bytes: orphan.size_bytes,
                was_pinned: false,
            });
        }
        self.save_index(&mut index).await?;
        info!("Reclaimed {} orphaned workspaces", removed.len());
        Ok(removed)
    }

    /// Reconstruct the index from the directories actually present.
    ///
    /// Sizes and checksums are recomputed. Pin, current and access metadata
    /// carry over from the previous index when it is readable.
    pub async fn rebuild_index(&self) -> DepotResult<RebuildReport> {
        let _guard = self.write_lock.lock().await;

        let mut report = RebuildReport::default();
        let previous = match self.load_index().await {
            Ok(index) => Some(index),
            Err(e) => {
                warn!("Discarding unreadable cache index: {}", e);
                report.previous_unreadable = true;
                None
            }
        };

        let mut rebuilt = CacheIndex::default();
        if let Some(prev) = &previous {
            rebuilt.revision = prev.revision;
            rebuilt.eviction_log = prev.eviction_log.clone();
        }

        let plugin_dirs = self.storage.list_directory(&self.layout.cache_dir()).await?;
        for plugin_dir in plugin_dirs
            .iter()
            .filter(|d| d.is_dir && is_safe_segment(&d.name))
        {
            let version_dirs = self.storage.list_directory(&plugin_dir.path).await?;
            for version_dir in version_dirs
                .iter()
                .filter(|d| d.is_dir && is_safe_segment(&d.name))
            {
                let size = match self.storage.calculate_directory_size(&version_dir.path).await {
                    Ok(size) => size,
                    Err(e) => {
                        warn!("Skipping {}: {}", version_dir.path.display(), e);
                        continue;
                    }
                };
                let checksum = match self.storage.calculate_checksum(&version_dir.path).await {
                    Ok(sum) => sum,
                    Err(e) => {
                        warn!("Skipping {}: {}", version_dir.path.display(), e);
                        continue;
                    }
                };

                let mut entry = CacheEntry::new(
                    &plugin_dir.name,
                    &version_dir.name,
                    version_dir.path.clone(),
                    size,
                    Some(checksum),
                );
                match previous
                    .as_ref()
                    .and_then(|p| p.get(&plugin_dir.name, &version_dir.name))
                {
                    Some(old) => {
                        entry.pinned = old.pinned;
                        entry.is_current_version = old.is_current_version;
                        entry.last_access_time = old.last_access_time;
                        entry.promoted_at = old.promoted_at;
                    }
                    None => {
                        entry.last_access_time = version_dir.modified;
                        entry.promoted_at = version_dir.modified;
                        report.added.push(key(&plugin_dir.name, &version_dir.name));
                    }
                }
                rebuilt.upsert(entry);
            }
        }

        if let Some(prev) = &previous {
            for old in prev.iter() {
                if rebuilt.get(&old.plugin_id, &old.version).is_none() {
                    report.dropped.push(key(&old.plugin_id, &old.version));
                }
            }
        }

        self.write_index(&mut rebuilt).await?;
        report.entries = rebuilt.entry_count();
        report.total_size_bytes = rebuilt.total_size_bytes;

        info!(
            "Rebuilt cache index: {} entries, {} added, {} dropped",
            report.entries,
            report.added.len(),
            report.dropped.len()
        );
        Ok(report)
    }

    /// Recompute every entry's checksum; returns the entries that fail
    pub async fn validate_integrity(&self) -> DepotResult<Vec<IntegrityIssue>> {
        let index = self.load_index().await?;
        let mut issues = Vec::new();

        for entry in index.iter() {
            let problem = if !self.storage.exists(&entry.cache_path).await {
                Some(IntegrityProblem::Missing)
            } else {
                match self.storage.calculate_checksum(&entry.cache_path).await {
                    Ok(actual) => match &entry.checksum {
                        Some(expected) if !expected.eq_ignore_ascii_case(&actual) => {
                            Some(IntegrityProblem::ChecksumMismatch {
                                expected: expected.clone(),
                                actual,
                            })
                        }
                        _ => None,
                    },
                    Err(e) => Some(IntegrityProblem::Unreadable {
                        reason: e.to_string(),
                    }),
                }
            };

            if let Some(problem) = problem {
                issues.push(IntegrityIssue {
                    plugin_id: entry.plugin_id.clone(),
                    version: entry.version.clone(),
                    path: entry.cache_path.clone(),
                    problem,
                    pinned: entry.pinned,
                    is_current_version: entry.is_current_version,
                });
            }
        }

        if !issues.is_empty() {
            warn!("{} cache entries failed verification", issues.len());
        }
        Ok(issues)
    }

    /// Evict entries reported by [`validate_integrity`](Self::validate_integrity).
    /// Pinned and current entries are reported as protected, never removed.
    pub async fn repair_corruption(&self, issues: &[IntegrityIssue]) -> DepotResult<EvictionResult> {
        let _guard = self.write_lock.lock().await;
        let mut index = self.load_index().await?;

        let mut result = EvictionResult::untriggered(index.total_size_bytes);
        if issues.is_empty() {
            return Ok(result);
        }
        result.triggered = true;
        result.reasons = vec![EvictionReason::Corruption];

        for issue in issues {
            let Some(entry) = index.get(&issue.plugin_id, &issue.version).cloned() else {
                continue;
            };
            if entry.is_protected() {
                result.protected.push(protected_entry(&entry));
                continue;
            }
            if let Some(evicted) = self
                .remove_entry(
                    &mut index,
                    &issue.plugin_id,
                    &issue.version,
                    EvictionReason::Corruption,
                )
                .await?
            {
                result.bytes_freed += evicted.size_bytes;
                result.evicted.push(evicted);
            }
        }

        result.entries_evicted = result.evicted.len();
        result.total_after = index.total_size_bytes;
        Ok(result)
    }

    /// Current usage against the configured limit
    pub async fn stats(&self) -> DepotResult<CacheStats> {
        let index = self.load_index().await?;
        let total = index.total_size_bytes;
        let max = self.settings.max_size_bytes;

        Ok(CacheStats {
            total_size_bytes: total,
            max_size_bytes: max,
            usage_percent: CacheSizeStatus::percentage(total, max),
            status: CacheSizeStatus::from_usage(total, max),
            entry_count: index.entry_count(),
            plugin_count: index.entries.len(),
            pinned_count: index.iter().filter(|e| e.pinned).count(),
            eviction_log_len: index.eviction_log.len(),
            last_eviction: index.eviction_log.back().cloned(),
            last_updated: index.last_updated,
        })
    }

    /// Versions of a plugin sorted newest first
    pub async fn versions_newest_first(&self, plugin_id: &str) -> DepotResult<Vec<CacheEntry>> {
        let mut entries = self.entries_for(plugin_id).await?;
        entries.sort_by(|a, b| compare_versions(&b.version, &a.version));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsStorage;
    use tempfile::TempDir;

    fn service(max_size_bytes: u64) -> (CacheService, TempDir) {
        let temp = TempDir::new().unwrap();
        let settings = CacheSettings {
            max_size_bytes,
            ..CacheSettings::default()
        };
        let service = CacheService::new(
            Arc::new(FsStorage::new()),
            PluginLayout::new(temp.path()),
            settings,
        );
        (service, temp)
    }

    /// Stage a tree holding `size` bytes and promote it
    async fn promote(
        cache: &CacheService,
        plugin: &str,
        version: &str,
        size: usize,
        skip_eviction: bool,
    ) -> PromoteOutcome {
        let staged = cache.stage_artifacts(plugin, version, None).await.unwrap();
        std::fs::write(staged.staging_path.join("payload.bin"), vec![b'x'; size]).unwrap();
        let outcome = cache
            .promote_artifacts(
                plugin,
                version,
                &staged.staging_path,
                &PromoteOptions {
                    skip_eviction,
                    ..PromoteOptions::default()
                },
            )
            .await
            .unwrap();
        cache.release_staging(&staged).await;
        outcome
    }

    #[tokio::test]
    async fn promote_then_retrieve() {
        let (cache, temp) = service(10_000);
        let outcome = promote(&cache, "alpha", "1.0.0", 42, true).await;
        assert_eq!(outcome.entry.size_bytes, 42);
        assert!(!outcome.entry.pinned);
        assert!(!outcome.replaced);
        assert!(temp.path().join("cache/alpha/1.0.0/payload.bin").exists());
        // Workspace is gone after release
        assert_eq!(std::fs::read_dir(temp.path().join("tmp")).unwrap().count(), 0);

        let before = cache.lookup("alpha", "1.0.0").await.unwrap().unwrap();
        let path = cache.retrieve_artifacts("alpha", "1.0.0").await.unwrap();
        assert_eq!(path, temp.path().join("cache/alpha/1.0.0"));
        let after = cache.lookup("alpha", "1.0.0").await.unwrap().unwrap();
        assert!(after.last_access_time >= before.last_access_time);

        let err = cache.retrieve_artifacts("alpha", "9.9.9").await.unwrap_err();
        assert_eq!(err.code(), "VERSION_NOT_CACHED");
    }

    #[tokio::test]
    async fn promote_rejects_missing_staging_and_bad_checksum() {
        let (cache, temp) = service(10_000);
        let err = cache
            .promote_artifacts(
                "alpha",
                "1.0.0",
                &temp.path().join("nope"),
                &PromoteOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STAGING_FAILED");

        let staged = cache.stage_artifacts("alpha", "1.0.0", None).await.unwrap();
        std::fs::write(staged.staging_path.join("a"), "content").unwrap();
        let err = cache
            .promote_artifacts(
                "alpha",
                "1.0.0",
                &staged.staging_path,
                &PromoteOptions {
                    expected_checksum: Some("00".repeat(32)),
                    skip_eviction: true,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CHECKSUM_MISMATCH");
        assert!(cache.lookup("alpha", "1.0.0").await.unwrap().is_none());
        assert!(!temp.path().join("cache/alpha/1.0.0").exists());
    }

    #[tokio::test]
    async fn scenario_promotion_over_limit_evicts_oldest_only() {
        let (cache, temp) = service(500);
        promote(&cache, "alpha", "1.0", 150, true).await;
        promote(&cache, "alpha", "1.1", 150, true).await;
        promote(&cache, "alpha", "1.2", 150, true).await;
        cache.mark_current("alpha", Some("1.2")).await.unwrap();

        let outcome = promote(&cache, "alpha", "1.3", 150, false).await;
        let eviction = outcome.eviction.unwrap();

        assert!(eviction.triggered);
        assert_eq!(eviction.entries_evicted, 1);
        assert_eq!(eviction.evicted[0].version, "1.0");
        assert_eq!(eviction.total_before, 600);
        assert_eq!(eviction.total_after, 450);
        assert_eq!(eviction.bytes_freed, 150);

        let remaining: Vec<String> = cache
            .entries_for("alpha")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(remaining, vec!["1.1", "1.2", "1.3"]);
        assert!(!temp.path().join("cache/alpha/1.0").exists());

        let index = cache.load_index().await.unwrap();
        assert_eq!(index.total_size_bytes, 450);
        assert_eq!(index.eviction_log.len(), 1);
        assert_eq!(index.eviction_log[0].reason, EvictionReason::SizeLimit);
        assert!(!index.eviction_log[0].was_pinned);
    }

    #[tokio::test]
    async fn eviction_never_removes_protected_entries() {
        let (cache, _temp) = service(1_000_000);
        promote(&cache, "alpha", "1.0", 100, true).await;
        promote(&cache, "alpha", "1.1", 100, true).await;
        promote(&cache, "beta", "2.0", 100, true).await;
        cache.pin_version("alpha", "1.0").await.unwrap();
        cache.mark_current("alpha", Some("1.1")).await.unwrap();

        let result = cache
            .evict_cache(&EvictionOptions {
                max_size_bytes: Some(10),
                ..EvictionOptions::default()
            })
            .await
            .unwrap();

        assert_eq!(result.entries_evicted, 1);
        assert_eq!(result.evicted[0].plugin_id, "beta");
        assert_eq!(result.protected.len(), 2);
        // Still over the limit: only protected entries remain
        assert_eq!(result.total_after, 200);
        assert!(cache.lookup("alpha", "1.0").await.unwrap().is_some());
        assert!(cache.lookup("alpha", "1.1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn version_limit_keeps_three() {
        let (cache, _temp) = service(1_000_000);
        for v in ["1.0.0", "1.1.0", "1.2.0", "1.3.0", "1.4.0"] {
            promote(&cache, "alpha", v, 10, false).await;
        }
        let versions: Vec<String> = cache
            .entries_for("alpha")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec!["1.2.0", "1.3.0", "1.4.0"]);
    }

    #[tokio::test]
    async fn dry_run_eviction_changes_nothing() {
        let (cache, temp) = service(1_000_000);
        promote(&cache, "alpha", "1.0", 100, true).await;
        promote(&cache, "alpha", "1.1", 100, true).await;
        let before = std::fs::read(temp.path().join("cache/index.json")).unwrap();

        let result = cache
            .evict_cache(&EvictionOptions {
                max_size_bytes: Some(150),
                dry_run: true,
                ..EvictionOptions::default()
            })
            .await
            .unwrap();
        assert!(result.dry_run);
        assert_eq!(result.entries_evicted, 1);
        assert_eq!(result.total_after, 100);

        let after = std::fs::read(temp.path().join("cache/index.json")).unwrap();
        assert_eq!(before, after);
        assert!(temp.path().join("cache/alpha/1.0").exists());
    }

    #[tokio::test]
    async fn pinning_is_idempotent() {
        let (cache, temp) = service(10_000);
        promote(&cache, "alpha", "1.0", 10, true).await;

        assert!(cache.pin_version("alpha", "1.0").await.unwrap());
        let snapshot = std::fs::read(temp.path().join("cache/index.json")).unwrap();
        assert!(!cache.pin_version("alpha", "1.0").await.unwrap());
        assert_eq!(
            snapshot,
            std::fs::read(temp.path().join("cache/index.json")).unwrap()
        );

        assert!(cache.unpin_version("alpha", "1.0").await.unwrap());
        assert!(!cache.unpin_version("alpha", "1.0").await.unwrap());
        assert!(!cache.unpin_version("ghost", "0.1").await.unwrap());
        assert_eq!(
            cache.pin_version("ghost", "0.1").await.unwrap_err().code(),
            "VERSION_NOT_CACHED"
        );
    }

    #[tokio::test]
    async fn mark_current_keeps_one_current_per_plugin() {
        let (cache, _temp) = service(10_000);
        promote(&cache, "alpha", "1.0", 10, true).await;
        promote(&cache, "alpha", "1.1", 10, true).await;

        cache.mark_current("alpha", Some("1.0")).await.unwrap();
        cache.mark_current("alpha", Some("1.1")).await.unwrap();
        let current: Vec<String> = cache
            .entries_for("alpha")
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.is_current_version)
            .map(|e| e.version)
            .collect();
        assert_eq!(current, vec!["1.1"]);

        assert!(cache.mark_current("alpha", Some("7.0")).await.is_err());
        cache.mark_current("alpha", None).await.unwrap();
        assert!(cache
            .entries_for("alpha")
            .await
            .unwrap()
            .iter()
            .all(|e| !e.is_current_version));
    }

    #[tokio::test]
    async fn repromotion_replaces_tree_and_keeps_flags() {
        let (cache, temp) = service(10_000);
        promote(&cache, "alpha", "1.0", 10, true).await;
        cache.pin_version("alpha", "1.0").await.unwrap();

        let outcome = promote(&cache, "alpha", "1.0", 20, true).await;
        assert!(outcome.replaced);
        assert!(outcome.entry.pinned);
        assert_eq!(
            std::fs::metadata(temp.path().join("cache/alpha/1.0/payload.bin"))
                .unwrap()
                .len(),
            20
        );
    }

    #[tokio::test]
    async fn rebuild_reflects_disk_after_interrupted_promotion() {
        let (cache, temp) = service(10_000);
        promote(&cache, "alpha", "1.0", 10, true).await;
        cache.pin_version("alpha", "1.0").await.unwrap();
        promote(&cache, "alpha", "1.1", 10, true).await;

        // Tree moved into place but the index write never happened
        let orphan = temp.path().join("cache/alpha/2.0");
        std::fs::create_dir_all(&orphan).unwrap();
        std::fs::write(orphan.join("payload.bin"), vec![b'y'; 30]).unwrap();
        // Indexed tree vanished
        std::fs::remove_dir_all(temp.path().join("cache/alpha/1.1")).unwrap();

        let report = cache.rebuild_index().await.unwrap();
        assert_eq!(report.added, vec!["alpha@2.0"]);
        assert_eq!(report.dropped, vec!["alpha@1.1"]);
        assert_eq!(report.entries, 2);

        let index = cache.load_index().await.unwrap();
        let versions: Vec<&str> = index.iter().map(|e| e.version.as_str()).collect();
        assert_eq!(versions, vec!["1.0", "2.0"]);
        assert_eq!(index.total_size_bytes, 40);
        assert!(index.get("alpha", "1.0").unwrap().pinned);
        assert!(index.get("alpha", "2.0").unwrap().checksum.is_some());
    }

    #[tokio::test]
    async fn rebuild_recovers_from_corrupt_index() {
        let (cache, temp) = service(10_000);
        promote(&cache, "alpha", "1.0", 10, true).await;
        std::fs::write(temp.path().join("cache/index.json"), "{not json").unwrap();

        assert_eq!(
            cache.load_index().await.unwrap_err().code(),
            "INDEX_CORRUPTED"
        );
        let report = cache.rebuild_index().await.unwrap();
        assert!(report.previous_unreadable);
        assert_eq!(report.entries, 1);
        assert!(cache.lookup("alpha", "1.0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn integrity_issues_are_repaired_except_protected() {
        let (cache, temp) = service(10_000);
        promote(&cache, "alpha", "1.0", 10, true).await;
        promote(&cache, "alpha", "1.1", 10, true).await;
        promote(&cache, "beta", "1.0", 10, true).await;
        cache.mark_current("alpha", Some("1.1")).await.unwrap();

        std::fs::write(temp.path().join("cache/alpha/1.0/payload.bin"), "tampered").unwrap();
        std::fs::write(temp.path().join("cache/alpha/1.1/payload.bin"), "tampered").unwrap();
        std::fs::remove_dir_all(temp.path().join("cache/beta/1.0")).unwrap();

        let issues = cache.validate_integrity().await.unwrap();
        assert_eq!(issues.len(), 3);
        assert!(issues
            .iter()
            .any(|i| i.plugin_id == "beta" && i.problem == IntegrityProblem::Missing));

        let result = cache.repair_corruption(&issues).await.unwrap();
        assert_eq!(result.reasons, vec![EvictionReason::Corruption]);
        assert_eq!(result.entries_evicted, 2);
        assert_eq!(result.protected.len(), 1);
        assert!(cache.lookup("alpha", "1.1").await.unwrap().is_some());
        assert!(cache.lookup("alpha", "1.0").await.unwrap().is_none());

        assert!(cache.verify_entry("alpha", "1.1").await.is_err());
    }

    #[tokio::test]
    async fn orphan_cleanup_skips_in_flight_transactions() {
        let (cache, temp) = service(10_000);
        let staged = cache.stage_artifacts("alpha", "1.0", None).await.unwrap();
        std::fs::create_dir_all(temp.path().join("tmp/crashed-tx")).unwrap();
        std::fs::write(temp.path().join("tmp/crashed-tx/part"), "12345").unwrap();

        let removed = cache
            .cleanup_orphaned_temp(Some(Duration::seconds(-60)))
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].transaction_id, "crashed-tx");
        assert!(staged.workspace.exists());
        assert!(cache.is_in_flight(&staged.transaction_id));

        let index = cache.load_index().await.unwrap();
        let last = index.eviction_log.back().unwrap();
        assert_eq!(last.reason, EvictionReason::OrphanedTemp);
        assert_eq!(last.size_bytes, 5);

        cache.release_staging(&staged).await;
        assert!(!cache.is_in_flight(&staged.transaction_id));
    }

    #[tokio::test]
    async fn remove_plugin_versions_keeps_pinned() {
        let (cache, _temp) = service(10_000);
        promote(&cache, "alpha", "1.0", 10, true).await;
        promote(&cache, "alpha", "1.1", 10, true).await;
        cache.pin_version("alpha", "1.0").await.unwrap();

        let result = cache.remove_plugin_versions("alpha").await.unwrap();
        assert_eq!(result.reasons, vec![EvictionReason::ManualCleanup]);
        assert_eq!(result.entries_evicted, 1);
        assert_eq!(result.protected.len(), 1);
        let left = cache.entries_for("alpha").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].version, "1.0");
    }

    #[tokio::test]
    async fn stale_writer_gets_conflict() {
        let (cache, temp) = service(10_000);
        promote(&cache, "alpha", "1.0", 10, true).await;

        let mut stale = cache.load_index().await.unwrap();

        let other = CacheService::new(
            Arc::new(FsStorage::new()),
            PluginLayout::new(temp.path()),
            CacheSettings::default(),
        );
        other.pin_version("alpha", "1.0").await.unwrap();

        let err = cache.save_index(&mut stale).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        assert!(cache.lookup("alpha", "1.0").await.unwrap().unwrap().pinned);
    }

    #[tokio::test]
    async fn stats_report_usage() {
        let (cache, _temp) = service(100);
        promote(&cache, "alpha", "1.0", 85, true).await;
        cache.pin_version("alpha", "1.0").await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.total_size_bytes, 85);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.plugin_count, 1);
        assert_eq!(stats.pinned_count, 1);
        assert_eq!(stats.status, CacheSizeStatus::Warning);
    }

    #[tokio::test]
    async fn rejects_unsafe_identifiers() {
        let (cache, _temp) = service(10_000);
        assert!(cache.stage_artifacts("../etc", "1.0", None).await.is_err());
        assert!(cache.stage_artifacts("alpha", "..", None).await.is_err());
    }
}
