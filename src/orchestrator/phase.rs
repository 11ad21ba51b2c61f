//! Transaction phases and the per-transaction bookkeeping that runs them

use crate::error::{DepotError, DepotResult};
use crate::orchestrator::types::{
    Compensation, Operation, PhaseReport, PhaseStatus, TransactionError, TransactionPreview,
    TransactionResult, UpdateTransition,
};
use crate::cache::EvictionResult;
use crate::registry::TelemetrySnapshot;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// A named step of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    ValidateCompatibility,
    StageArtifacts,
    ValidateManifest,
    LifecycleConsent,
    PromoteAndRegister,
    ActivateSymlink,
    TelemetryCleanup,
    ValidateRegistryEntry,
    VerifyCachedVersion,
    RemoveSymlink,
    RemoveRegistryEntry,
    ApplyCacheRetention,
    Telemetry,
}

impl Phase {
    /// Install and update
    pub const INSTALL: [Phase; 7] = [
        Phase::ValidateCompatibility,
        Phase::StageArtifacts,
        Phase::ValidateManifest,
        Phase::LifecycleConsent,
        Phase::PromoteAndRegister,
        Phase::ActivateSymlink,
        Phase::TelemetryCleanup,
    ];

    /// Rollback never stages or promotes
    pub const ROLLBACK: [Phase; 4] = [
        Phase::ValidateRegistryEntry,
        Phase::VerifyCachedVersion,
        Phase::ActivateSymlink,
        Phase::TelemetryCleanup,
    ];

    pub const UNINSTALL: [Phase; 6] = [
        Phase::ValidateRegistryEntry,
        Phase::LifecycleConsent,
        Phase::RemoveSymlink,
        Phase::RemoveRegistryEntry,
        Phase::ApplyCacheRetention,
        Phase::Telemetry,
    ];

    /// Phases run by an operation, in order
    pub fn sequence(operation: Operation) -> &'static [Phase] {
        match operation {
            Operation::Install | Operation::Update => &Self::INSTALL,
            Operation::Rollback => &Self::ROLLBACK,
            Operation::Uninstall => &Self::UNINSTALL,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ValidateCompatibility => "VALIDATE_COMPATIBILITY",
            Self::StageArtifacts => "STAGE_ARTIFACTS",
            Self::ValidateManifest => "VALIDATE_MANIFEST",
            Self::LifecycleConsent => "LIFECYCLE_CONSENT",
            Self::PromoteAndRegister => "PROMOTE_AND_REGISTER",
            Self::ActivateSymlink => "ACTIVATE_SYMLINK",
            Self::TelemetryCleanup => "TELEMETRY_CLEANUP",
            Self::ValidateRegistryEntry => "VALIDATE_REGISTRY_ENTRY",
            Self::VerifyCachedVersion => "VERIFY_CACHED_VERSION",
            Self::RemoveSymlink => "REMOVE_SYMLINK",
            Self::RemoveRegistryEntry => "REMOVE_REGISTRY_ENTRY",
            Self::ApplyCacheRetention => "APPLY_CACHE_RETENTION",
            Self::Telemetry => "TELEMETRY",
        }
    }

    /// Failure code reported when this phase aborts a transaction
    pub fn failure_code(self) -> String {
        format!("{}_FAILED", self.name())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The phase that aborted a transaction and why
#[derive(Debug)]
pub struct PhaseFailure {
    pub phase: Phase,
    pub error: DepotError,
}

/// Mutable record of one transaction while it runs
pub(crate) struct Transaction {
    pub id: String,
    pub operation: Operation,
    pub plugin_id: String,
    pub correlation_id: Option<String>,
    pub version: Option<String>,
    pub previous_version: Option<String>,
    pub dry_run: bool,
    pub preview: Option<TransactionPreview>,
    pub update: Option<UpdateTransition>,
    pub eviction: Option<EvictionResult>,
    pub warnings: Vec<String>,
    phases: Vec<PhaseReport>,
    compensations: Vec<Compensation>,
    started: Instant,
}

impl Transaction {
    pub fn begin(operation: Operation, plugin_id: &str, correlation_id: Option<String>) -> Self {
        let id = Uuid::new_v4().to_string();
        debug!("Transaction {} begins: {} {}", id, operation, plugin_id);
        Self {
            id,
            operation,
            plugin_id: plugin_id.to_string(),
            correlation_id,
            version: None,
            previous_version: None,
            dry_run: false,
            preview: None,
            update: None,
            eviction: None,
            warnings: Vec::new(),
            phases: Vec::new(),
            compensations: Vec::new(),
            started: Instant::now(),
        }
    }

    /// Run one phase, recording its outcome
    pub async fn step<T, F>(&mut self, phase: Phase, work: F) -> Result<T, PhaseFailure>
    where
        F: Future<Output = DepotResult<T>>,
    {
        let started = Instant::now();
        debug!("[{}] {} started", self.id, phase);

        match work.await {
            Ok(value) => {
                self.phases.push(PhaseReport {
                    phase,
                    status: PhaseStatus::Completed,
                    message: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                Ok(value)
            }
            Err(error) => {
                warn!("[{}] {} failed: {}", self.id, phase, error);
                self.phases.push(PhaseReport {
                    phase,
                    status: PhaseStatus::Failed,
                    message: Some(error.to_string()),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                Err(PhaseFailure { phase, error })
            }
        }
    }

    /// Registry snapshot describing this transaction as succeeded
    pub fn success_snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            last_operation: self.operation.to_string(),
            last_transaction_id: self.id.clone(),
            last_outcome: "success".to_string(),
            updated_at: Utc::now(),
        }
    }

    /// Attach a message to the most recent phase
    pub fn note(&mut self, message: impl Into<String>) {
        if let Some(last) = self.phases.last_mut() {
            last.message = Some(message.into());
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("[{}] {}", self.id, message);
        self.warnings.push(message);
    }

    /// Record the outcome of a compensating action
    pub fn compensated(&mut self, action: impl Into<String>, outcome: DepotResult<()>) {
        let action = action.into();
        let compensation = match outcome {
            Ok(()) => Compensation {
                action,
                succeeded: true,
                detail: None,
            },
            Err(e) => {
                warn!("[{}] compensation '{}' failed: {}", self.id, action, e);
                Compensation {
                    action,
                    succeeded: false,
                    detail: Some(e.to_string()),
                }
            }
        };
        self.compensations.push(compensation);
    }

    /// Freeze into the caller-facing result. Phases that never ran are
    /// reported as skipped.
    pub fn into_result(self, failure: Option<PhaseFailure>) -> TransactionResult {
        let mut phases = Vec::new();
        for phase in Phase::sequence(self.operation) {
            match self.phases.iter().find(|r| r.phase == *phase) {
                Some(report) => phases.push(report.clone()),
                None => phases.push(PhaseReport {
                    phase: *phase,
                    status: PhaseStatus::Skipped,
                    message: None,
                    duration_ms: 0,
                }),
            }
        }

        let error = failure.map(|f| TransactionError {
            phase: f.phase,
            phase_code: f.phase.failure_code(),
            code: f.error.code().to_string(),
            kind: f.error.kind(),
            message: f.error.to_string(),
            hint: f.error.hint().map(str::to_string),
        });

        TransactionResult {
            success: error.is_none(),
            transaction_id: self.id,
            correlation_id: self.correlation_id,
            operation: self.operation,
            plugin_id: self.plugin_id,
            version: self.version,
            previous_version: self.previous_version,
            phases,
            error,
            compensations: self.compensations,
            warnings: self.warnings,
            dry_run: self.dry_run,
            preview: self.preview,
            update: self.update,
            eviction: self.eviction,
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}
