//! Install and update
//!
//! Both run the same seven phases. An update additionally requires an
//! existing record, diffs permissions against it, and snapshots the registry
//! before replacing the record.

use super::activation::ActivationUndo;
use super::phase::{Phase, PhaseFailure, Transaction};
use super::types::{
    InstallRequest, Operation, TransactionPreview, TransactionResult, UpdateRequest,
    UpdateTransition,
};
use super::InstallOrchestrator;
use crate::cache::{
    format_bytes, CacheEntry, EvictionOptions, EvictionResult, PromoteOptions, StagedArtifacts,
};
use crate::collaborators::CompatibilityVerdict;
use crate::error::{DepotError, DepotResult};
use crate::layout::is_safe_segment;
use crate::manifest::{HookKind, PermissionDiff, PluginManifest};
use crate::registry::{ErrorDetails, InstallState, InstalledPlugin, TelemetrySnapshot, WriteOptions};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Install and update requests normalized to one shape
struct InstallPlan {
    operation: Operation,
    plugin_id: String,
    version: Option<String>,
    force: bool,
    dry_run: bool,
    allow_scripts: bool,
    expected_checksum: Option<String>,
    correlation_id: Option<String>,
}

impl From<InstallRequest> for InstallPlan {
    fn from(r: InstallRequest) -> Self {
        Self {
            operation: Operation::Install,
            plugin_id: r.plugin_id,
            version: r.version,
            force: r.force,
            dry_run: r.dry_run,
            allow_scripts: r.allow_scripts,
            expected_checksum: r.expected_checksum,
            correlation_id: r.correlation_id,
        }
    }
}

impl From<UpdateRequest> for InstallPlan {
    fn from(r: UpdateRequest) -> Self {
        Self {
            operation: Operation::Update,
            plugin_id: r.plugin_id,
            version: r.version,
            force: false,
            dry_run: r.dry_run,
            allow_scripts: r.allow_scripts,
            expected_checksum: r.expected_checksum,
            correlation_id: r.correlation_id,
        }
    }
}

/// Outcome of the compatibility gate
struct Gate {
    version: String,
    existing: Option<InstalledPlugin>,
    verdict: CompatibilityVerdict,
}

/// Side effects performed so far, consumed by compensation
#[derive(Default)]
struct InstallProgress {
    previous: Option<InstalledPlugin>,
    staged: Option<StagedArtifacts>,
    registered: bool,
    activation: ActivationUndo,
}

#[derive(Default)]
struct Cleanup {
    eviction: Option<EvictionResult>,
    warnings: Vec<String>,
}

impl InstallOrchestrator {
    /// Install a plugin version from the artifact source
    pub async fn install(&self, request: InstallRequest) -> TransactionResult {
        self.run_install_path(request.into()).await
    }

    /// Replace the installed version of a plugin
    pub async fn update(&self, request: UpdateRequest) -> TransactionResult {
        self.run_install_path(request.into()).await
    }

    async fn run_install_path(&self, plan: InstallPlan) -> TransactionResult {
        let mut tx = Transaction::begin(plan.operation, &plan.plugin_id, plan.correlation_id.clone());
        tx.dry_run = plan.dry_run;

        let mut progress = InstallProgress::default();
        let failure = match self.install_phases(&mut tx, &plan, &mut progress).await {
            Ok(()) => None,
            Err(failure) => {
                self.compensate_install(&mut tx, &plan.plugin_id, progress, &failure)
                    .await;
                Some(failure)
            }
        };
        self.conclude(tx, failure).await
    }

    async fn install_phases(
        &self,
        tx: &mut Transaction,
        plan: &InstallPlan,
        progress: &mut InstallProgress,
    ) -> Result<(), PhaseFailure> {
        let plugin_id = plan.plugin_id.as_str();

        let gate = tx
            .step(Phase::ValidateCompatibility, self.check_gate(plan))
            .await?;
        tx.version = Some(gate.version.clone());
        tx.previous_version = gate.existing.as_ref().map(|p| p.version.clone());
        if let CompatibilityVerdict::Warn { reason } = &gate.verdict {
            tx.warn(format!("Compatibility warning for {}: {}", plugin_id, reason));
        }

        if plan.operation == Operation::Update {
            if let Some(existing) = &gate.existing {
                if existing.version == gate.version
                    && existing.install_state == InstallState::Installed
                {
                    tx.warn(format!(
                        "{} is already up to date at {}",
                        plugin_id, gate.version
                    ));
                    return Ok(());
                }
            }
        }

        if plan.dry_run {
            tx.preview = Some(self.install_preview(plan, &gate).await);
            return Ok(());
        }

        let version = gate.version.as_str();
        progress.previous = gate.existing.clone();

        let txid = tx.id.clone();
        let (staging_path, bytes) = tx
            .step(
                Phase::StageArtifacts,
                self.stage_into(&mut progress.staged, plugin_id, version, txid),
            )
            .await?;
        tx.note(format!(
            "staged {} from {}",
            format_bytes(bytes),
            self.source.describe(plugin_id)
        ));

        let manifest = tx
            .step(
                Phase::ValidateManifest,
                self.load_manifest(&staging_path, plugin_id, version),
            )
            .await?;
        if plan.operation == Operation::Update {
            if let Some(existing) = &gate.existing {
                let permissions = PermissionDiff::between(&existing.permissions, &manifest.permissions);
                if !permissions.added.is_empty() {
                    tx.warn(format!(
                        "{} {} requests new permissions: {}",
                        plugin_id,
                        version,
                        permissions.added.join(", ")
                    ));
                }
                tx.update = Some(UpdateTransition {
                    from_version: existing.version.clone(),
                    to_version: version.to_string(),
                    permissions,
                    compatibility: gate.verdict.clone(),
                });
            }
        }

        let consent = tx
            .step(
                Phase::LifecycleConsent,
                self.run_hook(HookKind::Install, &manifest, &staging_path, plan.allow_scripts),
            )
            .await?;
        if consent.is_none() {
            tx.note("no install hook declared");
        }

        let txid = tx.id.clone();
        let entry = tx
            .step(
                Phase::PromoteAndRegister,
                self.promote_and_register(
                    progress,
                    plan,
                    version,
                    &manifest,
                    consent,
                    &staging_path,
                    txid,
                ),
            )
            .await?;
        tx.note(format!(
            "promoted to {} ({})",
            entry.cache_path.display(),
            format_bytes(entry.size_bytes)
        ));

        let pinned = progress.previous.as_ref().is_some_and(|p| p.pinned);
        tx.step(
            Phase::ActivateSymlink,
            self.activate_install(&mut progress.activation, plugin_id, version, &entry.cache_path, pinned),
        )
        .await?;

        let staged = progress.staged.take();
        let snapshot = tx.success_snapshot();
        let cleanup = tx
            .step(
                Phase::TelemetryCleanup,
                self.finish_install(staged, plugin_id, snapshot),
            )
            .await?;
        if let Some(eviction) = &cleanup.eviction {
            tx.note(format!(
                "evicted {} entries, freed {}",
                eviction.entries_evicted,
                format_bytes(eviction.bytes_freed)
            ));
        }
        tx.eviction = cleanup.eviction;
        for warning in cleanup.warnings {
            tx.warn(warning);
        }
        Ok(())
    }

    /// Resolve the version and decide whether the transaction may proceed
    async fn check_gate(&self, plan: &InstallPlan) -> DepotResult<Gate> {
        if !is_safe_segment(&plan.plugin_id) {
            return Err(DepotError::User(format!(
                "Invalid plugin id '{}'",
                plan.plugin_id
            )));
        }

        let existing = self.registry.get_plugin(&plan.plugin_id).await?;
        match (plan.operation, &existing) {
            (Operation::Update, None) => {
                return Err(DepotError::PluginNotFound(plan.plugin_id.clone()));
            }
            (Operation::Install, Some(record))
                if !plan.force
                    && !matches!(
                        record.install_state,
                        InstallState::Failed | InstallState::Staging
                    ) =>
            {
                return Err(DepotError::AlreadyInstalled {
                    plugin_id: record.plugin_id.clone(),
                    version: record.version.clone(),
                });
            }
            _ => {}
        }

        let version = match &plan.version {
            Some(v) => v.clone(),
            None => self.source.latest_version(&plan.plugin_id).await?,
        };
        if !is_safe_segment(&version) {
            return Err(DepotError::User(format!("Invalid version '{}'", version)));
        }

        let verdict = self.compatibility.evaluate(&plan.plugin_id, &version).await?;
        if let CompatibilityVerdict::Block { reason } = &verdict {
            return Err(DepotError::CompatibilityBlocked {
                plugin_id: plan.plugin_id.clone(),
                reason: reason.clone(),
            });
        }

        Ok(Gate {
            version,
            existing,
            verdict,
        })
    }

    async fn install_preview(&self, plan: &InstallPlan, gate: &Gate) -> TransactionPreview {
        let mut notes = Vec::new();
        let cached_versions: Vec<String> = match self.cache.entries_for(&plan.plugin_id).await {
            Ok(entries) => entries.into_iter().map(|e| e.version).collect(),
            Err(e) => {
                notes.push(format!("cache index unreadable: {}", e));
                Vec::new()
            }
        };

        if cached_versions.contains(&gate.version) {
            notes.push(format!("{} is already cached and would be replaced", gate.version));
        }
        if let Some(existing) = &gate.existing {
            notes.push(format!(
                "would replace {} ({})",
                existing.version, existing.install_state
            ));
        }
        if self.settings.evict_after_activation {
            notes.push("an eviction pass would run after activation".to_string());
        }

        TransactionPreview {
            plugin_id: plan.plugin_id.clone(),
            version: gate.version.clone(),
            source: Some(self.source.describe(&plan.plugin_id)),
            phases: Phase::INSTALL.to_vec(),
            compatibility: Some(gate.verdict.clone()),
            cached_versions,
            notes,
        }
    }

    /// Provision a workspace and fetch the artifact tree into it.
    /// The workspace is handed back through `slot` even if the fetch fails.
    async fn stage_into(
        &self,
        slot: &mut Option<StagedArtifacts>,
        plugin_id: &str,
        version: &str,
        transaction_id: String,
    ) -> DepotResult<(PathBuf, u64)> {
        let staged = slot.insert(
            self.cache
                .stage_artifacts(plugin_id, version, Some(transaction_id))
                .await?,
        );
        let bytes = self
            .source
            .fetch(plugin_id, version, &staged.staging_path)
            .await?;
        Ok((staged.staging_path.clone(), bytes))
    }

    async fn load_manifest(
        &self,
        root: &Path,
        plugin_id: &str,
        version: &str,
    ) -> DepotResult<PluginManifest> {
        let (manifest, path) = PluginManifest::load(self.storage.as_ref(), root).await?;
        manifest.validate(plugin_id, version)?;
        debug!("Manifest {} is valid", path.display());
        Ok(manifest)
    }

    /// Promote with eviction deferred, then write the record in `STAGING`
    #[allow(clippy::too_many_arguments)]
    async fn promote_and_register(
        &self,
        progress: &mut InstallProgress,
        plan: &InstallPlan,
        version: &str,
        manifest: &PluginManifest,
        consent: Option<String>,
        staging_path: &Path,
        transaction_id: String,
    ) -> DepotResult<CacheEntry> {
        let plugin_id = plan.plugin_id.as_str();
        let outcome = self
            .cache
            .promote_artifacts(
                plugin_id,
                version,
                staging_path,
                &PromoteOptions {
                    expected_checksum: plan.expected_checksum.clone(),
                    skip_eviction: true,
                },
            )
            .await?;

        let mut record = InstalledPlugin::new(
            plugin_id,
            version,
            self.source.describe(plugin_id),
            outcome.entry.cache_path.clone(),
            transaction_id,
        );
        record.permissions = manifest.permissions.clone();
        record.lifecycle_consent = consent.into_iter().collect();
        if let Some(previous) = &progress.previous {
            record.installed_at = previous.installed_at;
            record.pinned = previous.pinned;
            record.previous_version = if previous.version != version {
                Some(previous.version.clone())
            } else {
                previous.previous_version.clone()
            };
        }

        let options = match plan.operation {
            Operation::Update => WriteOptions::with_backup("update"),
            _ => WriteOptions::default(),
        };
        self.registry.put_plugin(record, &options).await?;
        progress.registered = true;
        Ok(outcome.entry)
    }

    async fn activate_install(
        &self,
        undo: &mut ActivationUndo,
        plugin_id: &str,
        version: &str,
        cache_path: &Path,
        pinned: bool,
    ) -> DepotResult<()> {
        self.switch_active_version(undo, plugin_id, version, cache_path, pinned)
            .await?;
        let target = cache_path.to_path_buf();
        self.registry
            .transition_plugin(
                plugin_id,
                InstallState::Installed,
                &WriteOptions::default(),
                |plugin| {
                    plugin.symlink_target = Some(target);
                    plugin.error = None;
                },
            )
            .await?;
        Ok(())
    }

    /// Post-activation housekeeping. Nothing here can fail the transaction.
    async fn finish_install(
        &self,
        staged: Option<StagedArtifacts>,
        plugin_id: &str,
        snapshot: TelemetrySnapshot,
    ) -> DepotResult<Cleanup> {
        let mut cleanup = Cleanup::default();

        if let Some(staged) = staged {
            if !self.cache.release_staging(&staged).await {
                cleanup.warnings.push(format!(
                    "Staging workspace {} was not removed",
                    staged.workspace.display()
                ));
            }
        }

        if self.settings.evict_after_activation {
            match self.cache.evict_cache(&EvictionOptions::default()).await {
                Ok(result) if result.triggered => cleanup.eviction = Some(result),
                Ok(_) => {}
                Err(e) => cleanup
                    .warnings
                    .push(format!("Eviction after activation failed: {}", e)),
            }
        }

        if let Some(warning) = self.record_snapshot(plugin_id, snapshot).await {
            cleanup.warnings.push(warning);
        }
        Ok(cleanup)
    }

    /// Undo everything `install_phases` did, newest first
    async fn compensate_install(
        &self,
        tx: &mut Transaction,
        plugin_id: &str,
        progress: InstallProgress,
        failure: &PhaseFailure,
    ) {
        self.undo_activation(tx, plugin_id, &progress.activation)
            .await;

        if progress.registered {
            match progress.previous {
                Some(previous) => {
                    let outcome = self
                        .registry
                        .put_plugin(previous, &WriteOptions::default())
                        .await
                        .map(|_| ());
                    tx.compensated("restore previous registry entry", outcome);
                }
                None => {
                    let details = ErrorDetails {
                        phase: failure.phase.to_string(),
                        code: failure.error.code().to_string(),
                        message: failure.error.to_string(),
                        transaction_id: tx.id.clone(),
                        occurred_at: Utc::now(),
                    };
                    let outcome = self
                        .registry
                        .transition_plugin(
                            plugin_id,
                            InstallState::Failed,
                            &WriteOptions::default(),
                            |plugin| plugin.error = Some(details),
                        )
                        .await
                        .map(|_| ());
                    tx.compensated("mark registry entry failed", outcome);
                }
            }
        }

        if let Some(staged) = progress.staged {
            let outcome = if self.cache.release_staging(&staged).await {
                Ok(())
            } else {
                Err(DepotError::staging(&staged.workspace, "workspace was not removed"))
            };
            tx.compensated("remove staging workspace", outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{Fixture, FixtureOptions, RecordingRunner};
    use super::super::types::PhaseStatus;
    use super::*;
    use crate::cache::CacheSettings;
    use crate::error::ErrorKind;
    use std::sync::Arc;

    #[tokio::test]
    async fn install_activates_latest_version() {
        let fx = Fixture::new();
        fx.publish("alpha", "1.0.0");
        fx.publish("alpha", "1.2.0");

        let result = fx.orchestrator.install(InstallRequest::new("alpha")).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.version.as_deref(), Some("1.2.0"));
        assert!(result
            .phases
            .iter()
            .all(|p| p.status == PhaseStatus::Completed));

        let record = fx.registry.get_plugin("alpha").await.unwrap().unwrap();
        assert_eq!(record.install_state, InstallState::Installed);
        assert_eq!(record.transaction_id, result.transaction_id);
        assert_eq!(record.symlink_target.as_ref(), Some(&record.cache_path));

        let entry = fx.cache.lookup("alpha", "1.2.0").await.unwrap().unwrap();
        assert!(entry.is_current_version);
        assert!(entry.checksum.is_some());
        assert_eq!(fx.link_target("alpha"), Some(entry.cache_path.clone()));
        assert_eq!(fx.tmp_entries(), 0);
        assert!(!fx.cache.is_in_flight(&result.transaction_id));

        let registry = fx.registry.load_registry().await.unwrap();
        assert_eq!(registry.telemetry["alpha"].last_operation, "install");
        assert!(fx.layout.telemetry_path().exists());
    }

    #[tokio::test]
    async fn install_rejects_existing_without_force() {
        let fx = Fixture::new();
        fx.publish("alpha", "1.0.0");
        assert!(fx.orchestrator.install(InstallRequest::new("alpha")).await.success);

        let result = fx.orchestrator.install(InstallRequest::new("alpha")).await;
        let error = result.error.as_ref().unwrap();
        assert_eq!(error.code, "ALREADY_INSTALLED");
        assert_eq!(error.phase, Phase::ValidateCompatibility);

        let forced = fx
            .orchestrator
            .install(InstallRequest {
                force: true,
                ..InstallRequest::new("alpha")
            })
            .await;
        assert!(forced.success, "{:?}", forced.error);
        assert_eq!(fx.cache.entries_for("alpha").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blocked_plugin_never_stages() {
        let fx = Fixture::with_options(FixtureOptions {
            blocked: vec!["alpha@1.0.0".to_string()],
            ..FixtureOptions::default()
        });
        fx.publish("alpha", "1.0.0");

        let result = fx
            .orchestrator
            .install(InstallRequest::new("alpha").version("1.0.0"))
            .await;

        let error = result.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::CompatibilityBlocked);
        assert_eq!(error.phase_code, "VALIDATE_COMPATIBILITY_FAILED");
        assert_eq!(
            result.phase(Phase::StageArtifacts).unwrap().status,
            PhaseStatus::Skipped
        );
        assert!(!fx.layout.tmp_dir().exists());
        assert!(fx.registry.get_plugin("alpha").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn compatibility_warning_is_reported() {
        let fx = Fixture::with_options(FixtureOptions {
            warn: vec!["alpha".to_string()],
            ..FixtureOptions::default()
        });
        fx.publish("alpha", "1.0.0");

        let result = fx.orchestrator.install(InstallRequest::new("alpha")).await;
        assert!(result.success);
        assert!(result.warnings.iter().any(|w| w.contains("Compatibility warning")));
    }

    #[tokio::test]
    async fn dry_run_has_no_side_effects() {
        let fx = Fixture::new();
        fx.publish("alpha", "1.0.0");

        let result = fx
            .orchestrator
            .install(InstallRequest {
                dry_run: true,
                ..InstallRequest::new("alpha")
            })
            .await;

        assert!(result.success);
        assert!(result.dry_run);
        let preview = result.preview.unwrap();
        assert_eq!(preview.version, "1.0.0");
        assert_eq!(preview.phases.len(), 7);
        assert!(!fx.layout.root().exists());
    }

    #[tokio::test]
    async fn consent_failure_leaves_nothing_behind() {
        let fx = Fixture::new();
        fx.publish_manifest(
            "alpha",
            "1.0.0",
            serde_json::json!({
                "name": "alpha",
                "version": "1.0.0",
                "lifecycle": { "install": "make setup" }
            }),
        );

        let result = fx.orchestrator.install(InstallRequest::new("alpha")).await;

        let error = result.error.as_ref().unwrap();
        assert_eq!(error.phase, Phase::LifecycleConsent);
        assert_eq!(error.code, "LIFECYCLE_CONSENT_REQUIRED");
        assert!(result
            .compensations
            .iter()
            .any(|c| c.action == "remove staging workspace" && c.succeeded));

        assert_eq!(fx.tmp_entries(), 0);
        assert!(fx.registry.get_plugin("alpha").await.unwrap().is_none());
        assert!(fx.cache.lookup("alpha", "1.0.0").await.unwrap().is_none());
        assert_eq!(fx.runner.call_count(), 0);
    }

    #[tokio::test]
    async fn consented_hook_runs_in_staging_and_is_recorded() {
        let fx = Fixture::new();
        fx.publish_manifest(
            "alpha",
            "1.0.0",
            serde_json::json!({
                "name": "alpha",
                "version": "1.0.0",
                "lifecycle": { "install": "make setup" }
            }),
        );

        let result = fx
            .orchestrator
            .install(InstallRequest {
                allow_scripts: true,
                ..InstallRequest::new("alpha")
            })
            .await;
        assert!(result.success, "{:?}", result.error);

        let calls = fx.runner.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "make setup");
        assert!(calls[0].2.starts_with(fx.layout.tmp_dir()));

        let record = fx.registry.get_plugin("alpha").await.unwrap().unwrap();
        assert_eq!(record.lifecycle_consent, vec!["install"]);
    }

    #[tokio::test]
    async fn failing_hook_aborts_install() {
        let fx = Fixture::with_options(FixtureOptions {
            runner: Arc::new(RecordingRunner::failing()),
            ..FixtureOptions::default()
        });
        fx.publish_manifest(
            "alpha",
            "1.0.0",
            serde_json::json!({
                "name": "alpha",
                "version": "1.0.0",
                "lifecycle": { "install": "false" }
            }),
        );

        let result = fx
            .orchestrator
            .install(InstallRequest {
                allow_scripts: true,
                ..InstallRequest::new("alpha")
            })
            .await;

        let error = result.error.as_ref().unwrap();
        assert_eq!(error.code, "LIFECYCLE_FAILED");
        assert_eq!(error.kind, ErrorKind::TransactionAborted);
        assert_eq!(fx.tmp_entries(), 0);
    }

    #[tokio::test]
    async fn manifest_mismatch_fails_validation() {
        let fx = Fixture::new();
        fx.publish_manifest(
            "alpha",
            "1.0.0",
            serde_json::json!({ "name": "beta", "version": "1.0.0" }),
        );

        let result = fx.orchestrator.install(InstallRequest::new("alpha")).await;
        let error = result.error.as_ref().unwrap();
        assert_eq!(error.phase, Phase::ValidateManifest);
        assert_eq!(error.code, "MANIFEST_INVALID");
        assert_eq!(fx.tmp_entries(), 0);
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_promotion() {
        let fx = Fixture::new();
        fx.publish("alpha", "1.0.0");

        let result = fx
            .orchestrator
            .install(InstallRequest {
                expected_checksum: Some("00".repeat(32)),
                ..InstallRequest::new("alpha")
            })
            .await;

        let error = result.error.as_ref().unwrap();
        assert_eq!(error.phase, Phase::PromoteAndRegister);
        assert_eq!(error.code, "CHECKSUM_MISMATCH");
        assert!(fx.registry.get_plugin("alpha").await.unwrap().is_none());
        assert_eq!(fx.tmp_entries(), 0);
    }

    #[tokio::test]
    async fn activation_failure_marks_fresh_install_failed() {
        let fx = Fixture::new();
        fx.publish("alpha", "1.0.0");
        // A real directory where the link should go cannot be replaced by a symlink
        std::fs::create_dir_all(fx.layout.activation_link("alpha").join("occupied")).unwrap();

        let result = fx.orchestrator.install(InstallRequest::new("alpha")).await;

        let error = result.error.as_ref().unwrap();
        assert_eq!(error.phase, Phase::ActivateSymlink);
        assert_eq!(error.code, "ACTIVATION_FAILED");

        let record = fx.registry.get_plugin("alpha").await.unwrap().unwrap();
        assert_eq!(record.install_state, InstallState::Failed);
        let details = record.error.unwrap();
        assert_eq!(details.phase, "ACTIVATE_SYMLINK");
        assert_eq!(details.transaction_id, result.transaction_id);

        // Promoted entries are retained but never current
        let entry = fx.cache.lookup("alpha", "1.0.0").await.unwrap().unwrap();
        assert!(!entry.is_current_version);
        assert_eq!(fx.tmp_entries(), 0);

        // A failed record does not block a retry
        std::fs::remove_dir_all(fx.layout.activation_link("alpha")).unwrap();
        let retry = fx.orchestrator.install(InstallRequest::new("alpha")).await;
        assert!(retry.success, "{:?}", retry.error);
    }

    #[tokio::test]
    async fn update_records_transition_and_permission_diff() {
        let fx = Fixture::new();
        fx.publish_manifest(
            "alpha",
            "1.0.0",
            serde_json::json!({"name": "alpha", "version": "1.0.0", "permissions": ["fs:read", "net"]}),
        );
        assert!(fx.orchestrator.install(InstallRequest::new("alpha")).await.success);
        fx.publish_manifest(
            "alpha",
            "1.1.0",
            serde_json::json!({"name": "alpha", "version": "1.1.0", "permissions": ["fs:read", "fs:write"]}),
        );

        let result = fx.orchestrator.update(UpdateRequest::new("alpha")).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.previous_version.as_deref(), Some("1.0.0"));
        let transition = result.update.unwrap();
        assert_eq!(transition.from_version, "1.0.0");
        assert_eq!(transition.to_version, "1.1.0");
        assert_eq!(transition.permissions.added, vec!["fs:write"]);
        assert_eq!(transition.permissions.removed, vec!["net"]);
        assert!(result.warnings.iter().any(|w| w.contains("fs:write")));

        let record = fx.registry.get_plugin("alpha").await.unwrap().unwrap();
        assert_eq!(record.version, "1.1.0");
        assert_eq!(record.previous_version.as_deref(), Some("1.0.0"));
        assert!(!fx.cache.lookup("alpha", "1.0.0").await.unwrap().unwrap().is_current_version);
        assert!(fx.cache.lookup("alpha", "1.1.0").await.unwrap().unwrap().is_current_version);
        assert!(!fx.registry.list_backups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_of_unknown_plugin_is_not_found() {
        let fx = Fixture::new();
        let result = fx.orchestrator.update(UpdateRequest::new("ghost")).await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn update_to_same_version_is_a_no_op() {
        let fx = Fixture::new();
        fx.publish("alpha", "1.0.0");
        assert!(fx.orchestrator.install(InstallRequest::new("alpha")).await.success);
        let before = fx.registry_bytes();

        let result = fx.orchestrator.update(UpdateRequest::new("alpha")).await;

        assert!(result.success);
        assert!(result.warnings[0].contains("already up to date"));
        assert_eq!(
            result.phase(Phase::StageArtifacts).unwrap().status,
            PhaseStatus::Skipped
        );
        assert_eq!(fx.registry_bytes(), before);
    }

    #[tokio::test]
    async fn update_moves_pin_to_new_version() {
        let fx = Fixture::new();
        fx.publish("alpha", "1.0.0");
        assert!(fx.orchestrator.install(InstallRequest::new("alpha")).await.success);
        fx.cache.pin_version("alpha", "1.0.0").await.unwrap();
        fx.registry.pin_plugin("alpha").await.unwrap();
        fx.publish("alpha", "2.0.0");

        let result = fx.orchestrator.update(UpdateRequest::new("alpha")).await;
        assert!(result.success, "{:?}", result.error);

        let record = fx.registry.get_plugin("alpha").await.unwrap().unwrap();
        assert!(record.pinned);
        assert!(fx.cache.lookup("alpha", "2.0.0").await.unwrap().unwrap().pinned);
        assert!(!fx.cache.lookup("alpha", "1.0.0").await.unwrap().unwrap().pinned);
    }

    #[tokio::test]
    async fn eviction_runs_after_activation() {
        let fx = Fixture::with_options(FixtureOptions {
            cache: CacheSettings {
                max_versions_per_plugin: 2,
                ..CacheSettings::default()
            },
            ..FixtureOptions::default()
        });
        fx.publish("alpha", "1.0.0");
        assert!(fx.orchestrator.install(InstallRequest::new("alpha")).await.success);
        for version in ["1.1.0", "1.2.0"] {
            fx.publish("alpha", version);
            let result = fx.orchestrator.update(UpdateRequest::new("alpha")).await;
            assert!(result.success, "{:?}", result.error);
        }

        let versions: Vec<String> = fx
            .cache
            .entries_for("alpha")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec!["1.1.0", "1.2.0"]);
        assert!(fx.cache.lookup("alpha", "1.2.0").await.unwrap().unwrap().is_current_version);
    }
}
