//! Registry persistence
//!
//! Every mutation is load → modify in memory → atomic write of the whole
//! file. A mutation that leaves the content unchanged writes nothing.

use crate::error::{DepotError, DepotResult};
use crate::layout::PluginLayout;
use crate::registry::model::{
    InstallState, InstalledPlugin, InstalledPluginRegistry, RegistryViolation,
    TelemetrySnapshot, ViolationKind, REGISTRY_SCHEMA_VERSION,
};
use crate::storage::StorageAdapter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Side effects requested around a registry write
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Snapshot the current file first, tagged with this reason
    pub backup: Option<String>,
    /// Re-validate the registry after writing
    pub validate: bool,
}

impl WriteOptions {
    pub fn with_backup(reason: impl Into<String>) -> Self {
        Self {
            backup: Some(reason.into()),
            validate: true,
        }
    }
}

/// A registry snapshot on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub name: String,
    pub path: PathBuf,
    pub created: DateTime<Utc>,
}

#[derive(Deserialize)]
struct StoredChecksum {
    #[serde(default)]
    metadata: Option<StoredMetadata>,
}

#[derive(Deserialize)]
struct StoredMetadata {
    #[serde(default)]
    checksum: String,
}

fn sanitize_reason(reason: &str) -> String {
    let cleaned: String = reason
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "manual".to_string()
    } else {
        cleaned
    }
}

/// Durable record of installed plugins
pub struct RegistryService {
    storage: Arc<dyn StorageAdapter>,
    layout: PluginLayout,
    write_lock: Mutex<()>,
}

impl RegistryService {
    pub fn new(storage: Arc<dyn StorageAdapter>, layout: PluginLayout) -> Self {
        Self {
            storage,
            layout,
            write_lock: Mutex::new(()),
        }
    }

    /// Path of `registry.json`
    pub fn path(&self) -> PathBuf {
        self.layout.registry_path()
    }

    /// Load the registry; a missing file is an empty registry
    pub async fn load_registry(&self) -> DepotResult<InstalledPluginRegistry> {
        let path = self.path();
        let Some(bytes) = self.storage.read_file(&path).await? else {
            debug!("No registry at {}, starting empty", path.display());
            return Ok(InstalledPluginRegistry::default());
        };
        Self::parse(&path, &bytes)
    }

    fn parse(path: &Path, bytes: &[u8]) -> DepotResult<InstalledPluginRegistry> {
        let registry: InstalledPluginRegistry =
            serde_json::from_slice(bytes).map_err(|e| DepotError::RegistryCorrupted {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if registry.metadata.schema_version > REGISTRY_SCHEMA_VERSION {
            return Err(DepotError::RegistrySchema {
                found: registry.metadata.schema_version,
                expected: REGISTRY_SCHEMA_VERSION,
            });
        }
        Ok(registry)
    }

    pub async fn get_plugin(&self, plugin_id: &str) -> DepotResult<Option<InstalledPlugin>> {
        Ok(self.load_registry().await?.get(plugin_id).cloned())
    }

    pub async fn list_plugins(&self) -> DepotResult<Vec<InstalledPlugin>> {
        Ok(self.load_registry().await?.plugins)
    }

    async fn disk_checksum(&self) -> DepotResult<String> {
        let path = self.path();
        match self.storage.read_file(&path).await? {
            None => Ok(String::new()),
            Some(bytes) => serde_json::from_slice::<StoredChecksum>(&bytes)
                .map(|stored| stored.metadata.map(|m| m.checksum).unwrap_or_default())
                .map_err(|e| DepotError::RegistryCorrupted {
                    path,
                    reason: e.to_string(),
                }),
        }
    }

    /// Read-modify-write under the write lock. Returns the closure's value
    /// and whether a write happened.
    async fn mutate<T, F>(&self, options: &WriteOptions, apply: F) -> DepotResult<(T, bool)>
    where
        F: FnOnce(&mut InstalledPluginRegistry) -> DepotResult<T>,
    {
        let _guard = self.write_lock.lock().await;
        let mut registry = self.load_registry().await?;
        let loaded_checksum = registry.metadata.checksum.clone();
        let before = registry.compute_checksum();

        let value = apply(&mut registry)?;
        if registry.compute_checksum() == before {
            debug!("Registry mutation was a no-op, skipping write");
            return Ok((value, false));
        }

        let on_disk = self.disk_checksum().await?;
        if on_disk != loaded_checksum {
            warn!("Registry changed on disk since it was loaded");
            return Err(DepotError::Conflict(self.path()));
        }

        if let Some(reason) = &options.backup {
            self.backup_locked(reason).await?;
        }

        registry.seal();
        self.storage
            .write_json_atomic(&self.path(), &registry)
            .await?;

        if options.validate {
            let written = self.load_registry().await?;
            if let Some(violation) = written.violations().into_iter().next() {
                return Err(DepotError::RegistryCorrupted {
                    path: self.path(),
                    reason: violation.message,
                });
            }
        }
        Ok((value, true))
    }

    /// Add a new plugin record. Fails if the plugin is already present
    /// unless its previous attempt failed.
    pub async fn add_plugin(&self, plugin: InstalledPlugin, options: &WriteOptions) -> DepotResult<()> {
        self.mutate(options, |registry| {
            if let Some(existing) = registry.get(&plugin.plugin_id) {
                if existing.install_state != InstallState::Failed {
                    return Err(DepotError::AlreadyInstalled {
                        plugin_id: existing.plugin_id.clone(),
                        version: existing.version.clone(),
                    });
                }
            }
            registry.upsert(plugin);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Insert or replace a plugin record, returning the replaced one
    pub async fn put_plugin(
        &self,
        plugin: InstalledPlugin,
        options: &WriteOptions,
    ) -> DepotResult<Option<InstalledPlugin>> {
        let (previous, _) = self
            .mutate(options, |registry| Ok(registry.upsert(plugin)))
            .await?;
        Ok(previous)
    }

    /// Modify an existing record in place and return the updated copy
    pub async fn update_plugin<F>(
        &self,
        plugin_id: &str,
        options: &WriteOptions,
        update: F,
    ) -> DepotResult<InstalledPlugin>
    where
        F: FnOnce(&mut InstalledPlugin),
    {
        self.modify_plugin(plugin_id, options, |plugin| {
            update(plugin);
            Ok(())
        })
        .await
    }

    /// Move a record to `next` through the lifecycle table, then apply
    /// `update`. A disallowed transition writes nothing.
    pub async fn transition_plugin<F>(
        &self,
        plugin_id: &str,
        next: InstallState,
        options: &WriteOptions,
        update: F,
    ) -> DepotResult<InstalledPlugin>
    where
        F: FnOnce(&mut InstalledPlugin),
    {
        self.modify_plugin(plugin_id, options, |plugin| {
            plugin.transition_to(next)?;
            update(plugin);
            Ok(())
        })
        .await
    }

    async fn modify_plugin<F>(
        &self,
        plugin_id: &str,
        options: &WriteOptions,
        modify: F,
    ) -> DepotResult<InstalledPlugin>
    where
        F: FnOnce(&mut InstalledPlugin) -> DepotResult<()>,
    {
        let (updated, _) = self
            .mutate(options, |registry| {
                let plugin = registry
                    .get_mut(plugin_id)
                    .ok_or_else(|| DepotError::PluginNotFound(plugin_id.to_string()))?;
                let original = plugin.clone();
                modify(plugin)?;
                if *plugin != original {
                    plugin.updated_at = Some(Utc::now());
                }
                let updated = plugin.clone();
                // Keep activePins in step with a flag the closure may have changed
                registry.set_pinned(plugin_id, updated.pinned);
                Ok(updated)
            })
            .await?;
        Ok(updated)
    }

    /// Remove a plugin record (and its pin and telemetry)
    pub async fn remove_plugin(
        &self,
        plugin_id: &str,
        options: &WriteOptions,
    ) -> DepotResult<InstalledPlugin> {
        let (removed, _) = self
            .mutate(options, |registry| {
                registry
                    .remove(plugin_id)
                    .ok_or_else(|| DepotError::PluginNotFound(plugin_id.to_string()))
            })
            .await?;
        info!("Removed {} from registry", plugin_id);
        Ok(removed)
    }

    /// Pin a plugin. Returns `false` when it was already pinned.
    pub async fn pin_plugin(&self, plugin_id: &str) -> DepotResult<bool> {
        let (changed, _) = self
            .mutate(&WriteOptions::default(), |registry| {
                if registry.get(plugin_id).is_none() {
                    return Err(DepotError::PluginNotFound(plugin_id.to_string()));
                }
                Ok(registry.set_pinned(plugin_id, true))
            })
            .await?;
        Ok(changed)
    }

    /// Unpin a plugin. Unknown or unpinned plugins are a no-op.
    pub async fn unpin_plugin(&self, plugin_id: &str) -> DepotResult<bool> {
        let (changed, _) = self
            .mutate(&WriteOptions::default(), |registry| {
                Ok(registry.set_pinned(plugin_id, false))
            })
            .await?;
        Ok(changed)
    }

    /// Record the last transaction for a plugin
    pub async fn record_telemetry(
        &self,
        plugin_id: &str,
        snapshot: TelemetrySnapshot,
    ) -> DepotResult<()> {
        self.mutate(&WriteOptions::default(), |registry| {
            if let Some(plugin) = registry.get_mut(plugin_id) {
                plugin.telemetry_ref = Some(snapshot.last_transaction_id.clone());
            }
            if registry.get(plugin_id).is_some() {
                registry.telemetry.insert(plugin_id.to_string(), snapshot);
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Health check: every problem found, never an error
    pub async fn validate_registry(&self) -> Vec<RegistryViolation> {
        match self.load_registry().await {
            Ok(registry) => registry.violations(),
            Err(e) => vec![RegistryViolation::new(
                ViolationKind::Unreadable,
                e.to_string(),
            )],
        }
    }

    // ---- backups -----------------------------------------------------------

    /// Snapshot the current registry into `backups/`
    pub async fn create_backup(&self, reason: &str) -> DepotResult<PathBuf> {
        let _guard = self.write_lock.lock().await;
        self.backup_locked(reason).await
    }

    async fn backup_locked(&self, reason: &str) -> DepotResult<PathBuf> {
        let dir = self.layout.backups_dir();
        self.storage.ensure_directory(&dir).await?;

        let bytes = match self.storage.read_file(&self.path()).await? {
            Some(bytes) => bytes,
            None => {
                let mut empty = serde_json::to_vec_pretty(&InstalledPluginRegistry::default())?;
                empty.push(b'\n');
                empty
            }
        };

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let reason = sanitize_reason(reason);
        let mut path = dir.join(format!("registry-{}-{}.json", stamp, reason));
        let mut attempt = 1;
        while self.storage.exists(&path).await {
            attempt += 1;
            path = dir.join(format!("registry-{}-{}-{}.json", stamp, reason, attempt));
        }

        self.storage.write_atomic(&path, &bytes).await?;
        info!("Registry backed up to {}", path.display());
        Ok(path)
    }

    /// Replace the registry with a backup, snapshotting the current one first
    pub async fn restore_from_backup(&self, backup: &Path) -> DepotResult<InstalledPluginRegistry> {
        let _guard = self.write_lock.lock().await;

        let bytes = self
            .storage
            .read_file(backup)
            .await?
            .ok_or_else(|| DepotError::BackupNotFound(backup.to_path_buf()))?;
        let mut restored = Self::parse(backup, &bytes)?;

        if self.storage.exists(&self.path()).await {
            self.backup_locked("pre-restore").await?;
        }

        restored.seal();
        self.storage
            .write_json_atomic(&self.path(), &restored)
            .await?;
        info!("Registry restored from {}", backup.display());
        Ok(restored)
    }

    /// Backups, newest first
    pub async fn list_backups(&self) -> DepotResult<Vec<BackupInfo>> {
        let mut backups: Vec<BackupInfo> = self
            .storage
            .list_directory(&self.layout.backups_dir())
            .await?
            .into_iter()
            .filter(|e| !e.is_dir && e.name.starts_with("registry-") && e.name.ends_with(".json"))
            .map(|e| BackupInfo {
                name: e.name,
                path: e.path,
                created: e.modified,
            })
            .collect();
        backups.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(backups)
    }
}
