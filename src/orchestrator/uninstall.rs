//! Uninstall
//!
//! Until the registry entry is removed every step is undone on failure.
//! Cache retention and telemetry run after that point and only warn.

use super::phase::{Phase, PhaseFailure, Transaction};
use super::types::{
    CacheRetention, Operation, TransactionPreview, TransactionResult, UninstallRequest,
};
use super::InstallOrchestrator;
use crate::cache::{format_bytes, EvictionResult};
use crate::error::{DepotError, DepotResult};
use crate::manifest::{HookKind, PluginManifest};
use crate::registry::{InstallState, InstalledPlugin, WriteOptions};
use std::path::PathBuf;
use tracing::warn;

/// Steps taken before the registry entry is gone
#[derive(Default)]
struct Deactivation {
    previous_state: Option<InstallState>,
    removed_link: Option<PathBuf>,
}

#[derive(Default)]
struct Retention {
    eviction: Option<EvictionResult>,
    warnings: Vec<String>,
}

impl InstallOrchestrator {
    /// Remove an installed plugin
    pub async fn uninstall(&self, request: UninstallRequest) -> TransactionResult {
        let mut tx = Transaction::begin(
            Operation::Uninstall,
            &request.plugin_id,
            request.correlation_id.clone(),
        );
        tx.dry_run = request.dry_run;

        let mut deactivation = Deactivation::default();
        let failure = match self
            .uninstall_phases(&mut tx, &request, &mut deactivation)
            .await
        {
            Ok(()) => None,
            Err(failure) => {
                self.compensate_uninstall(&mut tx, &request.plugin_id, deactivation)
                    .await;
                Some(failure)
            }
        };
        self.conclude(tx, failure).await
    }

    async fn uninstall_phases(
        &self,
        tx: &mut Transaction,
        request: &UninstallRequest,
        deactivation: &mut Deactivation,
    ) -> Result<(), PhaseFailure> {
        let plugin_id = request.plugin_id.as_str();

        let record = tx
            .step(
                Phase::ValidateRegistryEntry,
                self.uninstall_candidate(plugin_id, request.force),
            )
            .await?;
        tx.version = Some(record.version.clone());

        if request.dry_run {
            tx.preview = Some(self.uninstall_preview(&record, request).await);
            return Ok(());
        }

        let hook = tx
            .step(
                Phase::LifecycleConsent,
                self.uninstall_hook(&record, request),
            )
            .await?;
        match hook {
            Some(message) => tx.note(message),
            None => tx.note("no uninstall hook declared"),
        }

        tx.step(Phase::RemoveSymlink, self.deactivate(deactivation, &record))
            .await?;

        tx.step(
            Phase::RemoveRegistryEntry,
            self.registry
                .remove_plugin(plugin_id, &WriteOptions::with_backup("uninstall")),
        )
        .await?;

        let retention = tx
            .step(
                Phase::ApplyCacheRetention,
                self.apply_retention(plugin_id, request.retention),
            )
            .await?;
        if let Some(eviction) = &retention.eviction {
            tx.note(format!(
                "evicted {} cached versions ({}), kept {} protected",
                eviction.entries_evicted,
                format_bytes(eviction.bytes_freed),
                eviction.protected.len()
            ));
        }
        tx.eviction = retention.eviction;
        for warning in retention.warnings {
            tx.warn(warning);
        }

        let event = serde_json::json!({
            "pluginId": plugin_id,
            "version": record.version,
            "transactionId": tx.id,
            "retention": request.retention,
            "evicted": tx.eviction.as_ref().map(|e| e.entries_evicted).unwrap_or(0),
        });
        tx.step(Phase::Telemetry, self.emit_uninstalled(event))
            .await?;
        Ok(())
    }

    async fn uninstall_candidate(&self, plugin_id: &str, force: bool) -> DepotResult<InstalledPlugin> {
        let record = self
            .registry
            .get_plugin(plugin_id)
            .await?
            .ok_or_else(|| DepotError::PluginNotFound(plugin_id.to_string()))?;

        if !force && !record.install_state.can_transition_to(InstallState::Uninstalling) {
            return Err(DepotError::User(format!(
                "{} is {} and cannot be uninstalled; re-run with --force",
                plugin_id, record.install_state
            )));
        }
        Ok(record)
    }

    async fn uninstall_preview(
        &self,
        record: &InstalledPlugin,
        request: &UninstallRequest,
    ) -> TransactionPreview {
        let mut notes = Vec::new();
        let cached_versions: Vec<String> = match self.cache.entries_for(&record.plugin_id).await {
            Ok(entries) => {
                for pinned in entries.iter().filter(|e| e.pinned) {
                    notes.push(format!("{} is pinned and would be kept", pinned.version));
                }
                entries.into_iter().map(|e| e.version).collect()
            }
            Err(e) => {
                notes.push(format!("cache index unreadable: {}", e));
                Vec::new()
            }
        };
        notes.push(match request.retention {
            CacheRetention::Keep => "cached versions would be kept".to_string(),
            CacheRetention::Evict => "unpinned cached versions would be evicted".to_string(),
        });

        TransactionPreview {
            plugin_id: record.plugin_id.clone(),
            version: record.version.clone(),
            source: Some(record.source.clone()),
            phases: Phase::UNINSTALL.to_vec(),
            compatibility: None,
            cached_versions,
            notes,
        }
    }

    /// Run the uninstall hook of the active version, if it declares one
    async fn uninstall_hook(
        &self,
        record: &InstalledPlugin,
        request: &UninstallRequest,
    ) -> DepotResult<Option<String>> {
        if request.force {
            return Ok(Some("uninstall hook skipped (--force)".to_string()));
        }

        let manifest = match PluginManifest::load(self.storage.as_ref(), &record.cache_path).await {
            Ok((manifest, _)) => manifest,
            Err(e) => {
                warn!(
                    "Cannot read manifest for {} at {}: {}",
                    record.plugin_id,
                    record.cache_path.display(),
                    e
                );
                return Ok(None);
            }
        };

        let ran = self
            .run_hook(
                HookKind::Uninstall,
                &manifest,
                &record.cache_path,
                request.allow_scripts,
            )
            .await?;
        Ok(ran.map(|hook| format!("{} hook completed", hook)))
    }

    /// Mark the record `UNINSTALLING` and remove the activation link
    async fn deactivate(
        &self,
        deactivation: &mut Deactivation,
        record: &InstalledPlugin,
    ) -> DepotResult<()> {
        let plugin_id = record.plugin_id.as_str();
        self.registry
            .update_plugin(plugin_id, &WriteOptions::default(), |plugin| {
                plugin.install_state = InstallState::Uninstalling;
            })
            .await?;
        deactivation.previous_state = Some(record.install_state);

        let link = self.layout.activation_link(plugin_id);
        let target = self.storage.read_symlink(&link).await?;
        self.storage.remove_symlink(&link).await?;
        deactivation.removed_link = target;
        Ok(())
    }

    /// Clear the current flag, then evict unpinned versions when asked to
    async fn apply_retention(
        &self,
        plugin_id: &str,
        retention: CacheRetention,
    ) -> DepotResult<Retention> {
        let mut outcome = Retention::default();

        if let Err(e) = self.cache.mark_current(plugin_id, None).await {
            outcome
                .warnings
                .push(format!("Could not clear current cache version: {}", e));
        }

        if retention == CacheRetention::Evict {
            match self.cache.remove_plugin_versions(plugin_id).await {
                Ok(result) => outcome.eviction = Some(result),
                Err(e) => outcome
                    .warnings
                    .push(format!("Could not evict cached versions: {}", e)),
            }
        }
        Ok(outcome)
    }

    async fn emit_uninstalled(&self, event: serde_json::Value) -> DepotResult<()> {
        self.telemetry.record("plugin.uninstalled", &event).await;
        Ok(())
    }

    async fn compensate_uninstall(
        &self,
        tx: &mut Transaction,
        plugin_id: &str,
        deactivation: Deactivation,
    ) {
        if let Some(target) = &deactivation.removed_link {
            let link = self.layout.activation_link(plugin_id);
            let outcome = self.storage.swap_symlink(target, &link).await;
            tx.compensated("restore activation link", outcome);
        }
        if let Some(state) = deactivation.previous_state {
            let outcome = self
                .registry
                .update_plugin(plugin_id, &WriteOptions::default(), |plugin| {
                    plugin.install_state = state;
                })
                .await
                .map(|_| ());
            tx.compensated(format!("restore registry state {}", state), outcome);
        }
    }
}
