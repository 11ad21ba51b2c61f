//! Requests and results exchanged with the orchestrator

use crate::cache::EvictionResult;
use crate::collaborators::CompatibilityVerdict;
use crate::error::ErrorKind;
use crate::manifest::PermissionDiff;
use crate::orchestrator::phase::Phase;
use crate::registry::model::InstallState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Install,
    Update,
    Rollback,
    Uninstall,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Install => "install",
            Self::Update => "update",
            Self::Rollback => "rollback",
            Self::Uninstall => "uninstall",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    pub plugin_id: String,
    /// Latest published version when unset
    pub version: Option<String>,
    /// Reinstall over an existing record
    pub force: bool,
    pub dry_run: bool,
    /// Consent to run the manifest's install hook
    pub allow_scripts: bool,
    /// Checksum the staged tree must match before promotion
    pub expected_checksum: Option<String>,
    pub correlation_id: Option<String>,
}

impl InstallRequest {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            ..Self::default()
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub plugin_id: String,
    /// Latest published version when unset
    pub version: Option<String>,
    pub dry_run: bool,
    pub allow_scripts: bool,
    pub expected_checksum: Option<String>,
    pub correlation_id: Option<String>,
}

impl UpdateRequest {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RollbackRequest {
    pub plugin_id: String,
    pub version: String,
    pub dry_run: bool,
    pub correlation_id: Option<String>,
}

impl RollbackRequest {
    pub fn new(plugin_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            version: version.into(),
            ..Self::default()
        }
    }
}

/// What happens to cached versions when a plugin is uninstalled.
/// Pinned versions are kept either way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheRetention {
    /// Leave cached versions for a later reinstall or rollback
    #[default]
    Keep,
    Evict,
}

#[derive(Debug, Clone, Default)]
pub struct UninstallRequest {
    pub plugin_id: String,
    pub retention: CacheRetention,
    /// Skip the uninstall hook
    pub force: bool,
    pub dry_run: bool,
    pub allow_scripts: bool,
    pub correlation_id: Option<String>,
}

impl UninstallRequest {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseReport {
    pub phase: Phase,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub duration_ms: u64,
}

/// Undo step applied after a failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compensation {
    pub action: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionError {
    pub phase: Phase,
    /// `<PHASE>_FAILED`
    pub phase_code: String,
    /// Code of the underlying error
    pub code: String,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Recorded by updates: what changed between the two versions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTransition {
    pub from_version: String,
    pub to_version: String,
    pub permissions: PermissionDiff,
    pub compatibility: CompatibilityVerdict,
}

/// What a dry run would have done
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPreview {
    pub plugin_id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub phases: Vec<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility: Option<CompatibilityVerdict>,
    /// Cached versions of the plugin at preview time
    pub cached_versions: Vec<String>,
    pub notes: Vec<String>,
}

/// Outcome of one transaction. Failures are carried here rather than
/// returned as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResult {
    pub success: bool,
    pub transaction_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub operation: Operation,
    pub plugin_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    pub phases: Vec<PhaseReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TransactionError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensations: Vec<Compensation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<TransactionPreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdateTransition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction: Option<EvictionResult>,
    pub duration_ms: u64,
}

impl TransactionResult {
    /// Phase report by name
    pub fn phase(&self, phase: Phase) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

/// One check performed by `verify`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCheck {
    pub name: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub plugin_id: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_state: Option<InstallState>,
    pub checks: Vec<VerifyCheck>,
}

impl VerifyReport {
    pub fn check(&self, name: &str) -> Option<&VerifyCheck> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// A cached version a plugin could be rolled back to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackTarget {
    pub version: String,
    pub size_bytes: u64,
    pub last_access_time: DateTime<Utc>,
    pub pinned: bool,
    pub promoted_at: DateTime<Utc>,
}

/// Result of comparing one installed plugin with its source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheck {
    pub plugin_id: String,
    pub installed_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
    pub update_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
