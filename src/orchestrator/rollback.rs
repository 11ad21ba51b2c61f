//! Rollback to a version that is already cached
//!
//! Nothing is staged or fetched and cache contents are never changed; only
//! the activation link, the current flag and the registry pointer move.

use super::activation::ActivationUndo;
use super::phase::{Phase, PhaseFailure, Transaction};
use super::types::{Operation, RollbackRequest, TransactionPreview, TransactionResult};
use super::InstallOrchestrator;
use crate::cache::CacheEntry;
use crate::error::{DepotError, DepotResult};
use crate::manifest::PluginManifest;
use crate::registry::{InstallState, InstalledPlugin, TelemetrySnapshot, WriteOptions};
use tracing::debug;

impl InstallOrchestrator {
    /// Re-activate a previously cached version of an installed plugin
    pub async fn rollback(&self, request: RollbackRequest) -> TransactionResult {
        let mut tx = Transaction::begin(
            Operation::Rollback,
            &request.plugin_id,
            request.correlation_id.clone(),
        );
        tx.dry_run = request.dry_run;

        let mut undo = ActivationUndo::default();
        let failure = match self.rollback_phases(&mut tx, &request, &mut undo).await {
            Ok(()) => None,
            Err(failure) => {
                self.undo_activation(&mut tx, &request.plugin_id, &undo)
                    .await;
                Some(failure)
            }
        };
        self.conclude(tx, failure).await
    }

    async fn rollback_phases(
        &self,
        tx: &mut Transaction,
        request: &RollbackRequest,
        undo: &mut ActivationUndo,
    ) -> Result<(), PhaseFailure> {
        let plugin_id = request.plugin_id.as_str();
        let target = request.version.as_str();

        let record = tx
            .step(
                Phase::ValidateRegistryEntry,
                self.rollback_candidate(plugin_id, target),
            )
            .await?;
        tx.previous_version = Some(record.version.clone());
        tx.version = Some(target.to_string());

        let entry = tx
            .step(
                Phase::VerifyCachedVersion,
                self.cache.verify_entry(plugin_id, target),
            )
            .await?;
        tx.note(format!("checksum verified for {}", entry.cache_path.display()));

        if request.dry_run {
            tx.preview = Some(TransactionPreview {
                plugin_id: plugin_id.to_string(),
                version: target.to_string(),
                source: None,
                phases: Phase::ROLLBACK.to_vec(),
                compatibility: None,
                cached_versions: Vec::new(),
                notes: vec![format!(
                    "would switch {} from {} to {}",
                    plugin_id, record.version, target
                )],
            });
            return Ok(());
        }

        let txid = tx.id.clone();
        tx.step(
            Phase::ActivateSymlink,
            self.activate_rollback(undo, &record, &entry, txid),
        )
        .await?;

        let snapshot = tx.success_snapshot();
        let warning = tx
            .step(
                Phase::TelemetryCleanup,
                self.finish_rollback(plugin_id, snapshot),
            )
            .await?;
        if let Some(warning) = warning {
            tx.warn(warning);
        }
        Ok(())
    }

    async fn rollback_candidate(&self, plugin_id: &str, target: &str) -> DepotResult<InstalledPlugin> {
        let record = self
            .registry
            .get_plugin(plugin_id)
            .await?
            .ok_or_else(|| DepotError::PluginNotFound(plugin_id.to_string()))?;

        if !matches!(
            record.install_state,
            InstallState::Installed | InstallState::Disabled
        ) {
            return Err(DepotError::User(format!(
                "{} is {} and cannot be rolled back",
                plugin_id, record.install_state
            )));
        }
        if record.version == target {
            return Err(DepotError::User(format!(
                "{} is already active at {}",
                plugin_id, target
            )));
        }
        Ok(record)
    }

    async fn activate_rollback(
        &self,
        undo: &mut ActivationUndo,
        record: &InstalledPlugin,
        entry: &CacheEntry,
        transaction_id: String,
    ) -> DepotResult<()> {
        let plugin_id = record.plugin_id.as_str();
        let cache_path = self
            .cache
            .retrieve_artifacts(plugin_id, &entry.version)
            .await?;

        self.switch_active_version(undo, plugin_id, &entry.version, &cache_path, record.pinned)
            .await?;

        let permissions = match PluginManifest::load(self.storage.as_ref(), &cache_path).await {
            Ok((manifest, _)) => Some(manifest.permissions),
            Err(e) => {
                debug!("No readable manifest in {}: {}", cache_path.display(), e);
                None
            }
        };

        let from = record.version.clone();
        let to = entry.version.clone();
        self.registry
            .transition_plugin(
                plugin_id,
                InstallState::Installed,
                &WriteOptions::with_backup("rollback"),
                |plugin| {
                    plugin.previous_version = Some(from);
                    plugin.version = to;
                    plugin.cache_path = cache_path.clone();
                    plugin.symlink_target = Some(cache_path);
                    plugin.transaction_id = transaction_id;
                    plugin.error = None;
                    if let Some(permissions) = permissions {
                        plugin.permissions = permissions;
                    }
                },
            )
            .await?;
        Ok(())
    }

    async fn finish_rollback(
        &self,
        plugin_id: &str,
        snapshot: TelemetrySnapshot,
    ) -> DepotResult<Option<String>> {
        Ok(self.record_snapshot(plugin_id, snapshot).await)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::super::types::{InstallRequest, PhaseStatus, UpdateRequest};
    use super::*;
    use crate::error::ErrorKind;

    async fn installed_twice() -> Fixture {
        let fx = Fixture::new();
        fx.publish_manifest(
            "alpha",
            "1.0.0",
            serde_json::json!({"name": "alpha", "version": "1.0.0", "permissions": ["fs:read"]}),
        );
        fx.publish_manifest(
            "alpha",
            "1.1.0",
            serde_json::json!({"name": "alpha", "version": "1.1.0", "permissions": ["net"]}),
        );
        assert!(
            fx.orchestrator
                .install(InstallRequest::new("alpha").version("1.0.0"))
                .await
                .success
        );
        assert!(fx.orchestrator.update(UpdateRequest::new("alpha")).await.success);
        fx
    }

    #[tokio::test]
    async fn rollback_to_uncached_version_leaves_registry_unchanged() {
        let fx = installed_twice().await;
        let before = fx.registry_bytes();

        let result = fx
            .orchestrator
            .rollback(RollbackRequest::new("alpha", "0.9"))
            .await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::NotCached);
        assert_eq!(error.phase, Phase::VerifyCachedVersion);
        assert_eq!(fx.registry_bytes(), before);
    }

    #[tokio::test]
    async fn rollback_switches_active_version() {
        let fx = installed_twice().await;
        let entries_before = fx.cache.entries_for("alpha").await.unwrap().len();

        let result = fx
            .orchestrator
            .rollback(RollbackRequest::new("alpha", "1.0.0"))
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.previous_version.as_deref(), Some("1.1.0"));
        assert!(result
            .phases
            .iter()
            .all(|p| p.status == PhaseStatus::Completed));

        let record = fx.registry.get_plugin("alpha").await.unwrap().unwrap();
        assert_eq!(record.version, "1.0.0");
        assert_eq!(record.previous_version.as_deref(), Some("1.1.0"));
        assert_eq!(record.permissions, vec!["fs:read"]);
        assert_eq!(record.transaction_id, result.transaction_id);

        let entry = fx.cache.lookup("alpha", "1.0.0").await.unwrap().unwrap();
        assert!(entry.is_current_version);
        assert_eq!(fx.link_target("alpha"), Some(entry.cache_path));
        assert_eq!(fx.cache.entries_for("alpha").await.unwrap().len(), entries_before);
    }

    #[tokio::test]
    async fn rollback_rejects_tampered_cache_entry() {
        let fx = installed_twice().await;
        let entry = fx.cache.lookup("alpha", "1.0.0").await.unwrap().unwrap();
        std::fs::write(entry.cache_path.join("plugin.json"), "tampered").unwrap();

        let result = fx
            .orchestrator
            .rollback(RollbackRequest::new("alpha", "1.0.0"))
            .await;

        let error = result.error.unwrap();
        assert_eq!(error.code, "CHECKSUM_MISMATCH");
        assert_eq!(error.kind, ErrorKind::Corruption);
        let record = fx.registry.get_plugin("alpha").await.unwrap().unwrap();
        assert_eq!(record.version, "1.1.0");
    }

    #[tokio::test]
    async fn rollback_to_active_version_is_rejected() {
        let fx = installed_twice().await;
        let result = fx
            .orchestrator
            .rollback(RollbackRequest::new("alpha", "1.1.0"))
            .await;
        let error = result.error.unwrap();
        assert_eq!(error.phase, Phase::ValidateRegistryEntry);
        assert_eq!(error.kind, ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn rollback_dry_run_changes_nothing() {
        let fx = installed_twice().await;
        let before = fx.registry_bytes();

        let result = fx
            .orchestrator
            .rollback(RollbackRequest {
                dry_run: true,
                ..RollbackRequest::new("alpha", "1.0.0")
            })
            .await;

        assert!(result.success);
        assert!(result.preview.is_some());
        assert_eq!(fx.registry_bytes(), before);
        assert!(fx.cache.lookup("alpha", "1.1.0").await.unwrap().unwrap().is_current_version);
    }

    #[tokio::test]
    async fn rollback_of_unknown_plugin_is_not_found() {
        let fx = Fixture::new();
        let result = fx
            .orchestrator
            .rollback(RollbackRequest::new("ghost", "1.0.0"))
            .await;
        assert_eq!(result.error.unwrap().code, "PLUGIN_NOT_FOUND");
    }
}
