//! Transactional install, update, rollback and uninstall
//!
//! Every operation runs as a [`Transaction`] of named [`Phase`]s. A failing
//! phase aborts the rest and the work already done is compensated in reverse
//! order. Callers always receive a [`TransactionResult`]; errors never escape
//! as `Err`.
//!
//! | Operation | Phases |
//! |-----------|--------|
//! | install, update | `VALIDATE_COMPATIBILITY → STAGE_ARTIFACTS → VALIDATE_MANIFEST → LIFECYCLE_CONSENT → PROMOTE_AND_REGISTER → ACTIVATE_SYMLINK → TELEMETRY_CLEANUP` |
//! | rollback | `VALIDATE_REGISTRY_ENTRY → VERIFY_CACHED_VERSION → ACTIVATE_SYMLINK → TELEMETRY_CLEANUP` |
//! | uninstall | `VALIDATE_REGISTRY_ENTRY → LIFECYCLE_CONSENT → REMOVE_SYMLINK → REMOVE_REGISTRY_ENTRY → APPLY_CACHE_RETENTION → TELEMETRY` |

mod activation;
mod batch;
mod install;
pub mod phase;
mod rollback;
pub mod types;
mod uninstall;
mod verify;

#[cfg(test)]
pub(crate) mod test_support;

pub use phase::{Phase, PhaseFailure};
pub use types::{
    CacheRetention, Compensation, InstallRequest, Operation, PhaseReport, PhaseStatus,
    RollbackRequest, RollbackTarget, TransactionError, TransactionPreview, TransactionResult,
    UninstallRequest, UpdateCheck, UpdateRequest, UpdateTransition, VerifyCheck, VerifyReport,
};

use crate::cache::CacheService;
use crate::collaborators::{ArtifactSource, CompatibilityService, LifecycleRunner};
use crate::config::Config;
use crate::error::{DepotError, DepotResult};
use crate::layout::PluginLayout;
use crate::manifest::{HookKind, PluginManifest};
use crate::registry::{RegistryService, TelemetrySnapshot};
use crate::storage::StorageAdapter;
use crate::telemetry::TelemetryLog;
use phase::Transaction;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Tunables that are not owned by a collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Deadline for a single lifecycle hook
    pub lifecycle_timeout: Duration,
    /// Worker pool size for batch update checks
    pub batch_concurrency: usize,
    /// Run an eviction pass once a new version is active
    pub evict_after_activation: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            lifecycle_timeout: Duration::from_secs(60),
            batch_concurrency: 4,
            evict_after_activation: true,
        }
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            lifecycle_timeout: Duration::from_secs(config.lifecycle.timeout_secs),
            batch_concurrency: config.batch.concurrency.max(1),
            evict_after_activation: config.cache.evict_on_promote,
        }
    }
}

/// Everything the orchestrator calls through
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub storage: Arc<dyn StorageAdapter>,
    pub layout: PluginLayout,
    pub cache: Arc<CacheService>,
    pub registry: Arc<RegistryService>,
    pub compatibility: Arc<dyn CompatibilityService>,
    pub source: Arc<dyn ArtifactSource>,
    pub lifecycle: Arc<dyn LifecycleRunner>,
    pub telemetry: Arc<TelemetryLog>,
}

/// Drives plugin transactions over the cache and registry services
pub struct InstallOrchestrator {
    storage: Arc<dyn StorageAdapter>,
    layout: PluginLayout,
    cache: Arc<CacheService>,
    registry: Arc<RegistryService>,
    compatibility: Arc<dyn CompatibilityService>,
    source: Arc<dyn ArtifactSource>,
    lifecycle: Arc<dyn LifecycleRunner>,
    telemetry: Arc<TelemetryLog>,
    settings: OrchestratorSettings,
}

impl InstallOrchestrator {
    pub fn new(deps: OrchestratorDeps, settings: OrchestratorSettings) -> Self {
        Self {
            storage: deps.storage,
            layout: deps.layout,
            cache: deps.cache,
            registry: deps.registry,
            compatibility: deps.compatibility,
            source: deps.source,
            lifecycle: deps.lifecycle,
            telemetry: deps.telemetry,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<RegistryService> {
        &self.registry
    }

    /// Run a manifest hook if one is declared.
    ///
    /// Returns the hook name when it ran, so consent can be recorded.
    async fn run_hook(
        &self,
        kind: HookKind,
        manifest: &PluginManifest,
        working_dir: &Path,
        allow_scripts: bool,
    ) -> DepotResult<Option<String>> {
        let Some(command) = manifest.hook(kind) else {
            return Ok(None);
        };
        if !allow_scripts {
            return Err(DepotError::LifecycleConsentRequired {
                hook: kind.to_string(),
            });
        }

        let output = self
            .lifecycle
            .run(kind, command, working_dir, self.settings.lifecycle_timeout)
            .await?;
        info!(
            "{} hook for {} exited with {}",
            kind, manifest.name, output.exit_code
        );
        Ok(Some(kind.to_string()))
    }

    /// Record the last transaction on the plugin's registry entry.
    /// Returns a warning instead of failing.
    async fn record_snapshot(&self, plugin_id: &str, snapshot: TelemetrySnapshot) -> Option<String> {
        match self.registry.record_telemetry(plugin_id, snapshot).await {
            Ok(()) => None,
            Err(e) => Some(format!("Could not record telemetry snapshot: {}", e)),
        }
    }

    /// Freeze the transaction, log its outcome and emit telemetry
    async fn conclude(&self, tx: Transaction, failure: Option<PhaseFailure>) -> TransactionResult {
        let result = tx.into_result(failure);

        match &result.error {
            None => info!(
                "{} {} succeeded ({}ms, transaction {})",
                result.operation, result.plugin_id, result.duration_ms, result.transaction_id
            ),
            Some(error) => warn!(
                "{} {} failed in {}: {} (transaction {})",
                result.operation,
                result.plugin_id,
                error.phase,
                error.message,
                result.transaction_id
            ),
        }

        if !result.dry_run {
            let event = format!("transaction.{}", result.operation);
            self.telemetry
                .record(
                    &event,
                    &serde_json::json!({
                        "transactionId": result.transaction_id,
                        "correlationId": result.correlation_id,
                        "pluginId": result.plugin_id,
                        "version": result.version,
                        "previousVersion": result.previous_version,
                        "success": result.success,
                        "errorCode": result.error.as_ref().map(|e| e.code.clone()),
                        "failedPhase": result.error.as_ref().map(|e| e.phase),
                        "compensations": result.compensations.len(),
                        "durationMs": result.duration_ms,
                    }),
                )
                .await;
        }

        result
    }
}
