//! Error types for plugin-depot
//!
//! All library modules use `DepotResult<T>` as their return type. The
//! orchestrator converts errors into structured transaction results using
//! [`DepotError::kind`] and [`DepotError::code`].

use crate::registry::InstallState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for depot operations
pub type DepotResult<T> = Result<T, DepotError>;

/// Coarse error taxonomy shared by every operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Plugin or version absent from the registry
    NotFound,
    /// Requested version has no cache entry
    NotCached,
    /// Checksum mismatch or inconsistent persisted state
    Corruption,
    /// Workspace provisioning or staged content verification failed
    StagingFailure,
    /// Compatibility gate returned a blocking verdict
    CompatibilityBlocked,
    /// A later phase failed and compensations were applied
    TransactionAborted,
    /// Another writer committed between our read and our write
    Conflict,
    /// Filesystem permission problem
    PermissionDenied,
    /// Any other filesystem or serialization failure
    IoFailure,
    /// Caller supplied an invalid request or configuration
    Invalid,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not_found",
            Self::NotCached => "not_cached",
            Self::Corruption => "corruption",
            Self::StagingFailure => "staging_failure",
            Self::CompatibilityBlocked => "compatibility_blocked",
            Self::TransactionAborted => "transaction_aborted",
            Self::Conflict => "conflict",
            Self::PermissionDenied => "permission_denied",
            Self::IoFailure => "io_failure",
            Self::Invalid => "invalid",
        };
        write!(f, "{}", name)
    }
}

/// All errors that can occur in plugin-depot
#[derive(Error, Debug)]
pub enum DepotError {
    // Registry errors
    #[error("Plugin not installed: {0}")]
    PluginNotFound(String),

    #[error("Plugin {plugin_id} is already installed at version {version}")]
    AlreadyInstalled { plugin_id: String, version: String },

    #[error("Registry at {path} is corrupted: {reason}")]
    RegistryCorrupted { path: PathBuf, reason: String },

    #[error("Unsupported registry schema version {found} (expected {expected})")]
    RegistrySchema { found: u32, expected: u32 },

    #[error("Backup not found: {0}")]
    BackupNotFound(PathBuf),

    #[error("{plugin_id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        plugin_id: String,
        from: InstallState,
        to: InstallState,
    },

    // Cache errors
    #[error("Version {version} of {plugin_id} is not cached")]
    VersionNotCached { plugin_id: String, version: String },

    #[error("Cache index at {path} is corrupted: {reason}")]
    IndexCorrupted { path: PathBuf, reason: String },

    #[error("Checksum mismatch for {subject}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("Staging failed for {path}: {reason}")]
    StagingFailed { path: PathBuf, reason: String },

    // Transaction errors
    #[error("Compatibility check blocked {plugin_id}: {reason}")]
    CompatibilityBlocked { plugin_id: String, reason: String },

    #[error("Invalid plugin manifest: {0}")]
    ManifestInvalid(String),

    #[error("Lifecycle hook '{hook}' requires consent (pass --allow-scripts)")]
    LifecycleConsentRequired { hook: String },

    #[error("Lifecycle hook '{hook}' failed: {reason}")]
    LifecycleFailed { hook: String, reason: String },

    #[error("Lifecycle hook '{hook}' timed out after {}s", timeout.as_secs())]
    LifecycleTimeout { hook: String, timeout: Duration },

    #[error("Activation failed for {plugin_id}: {reason}")]
    ActivationFailed { plugin_id: String, reason: String },

    #[error("No published versions found for {0}")]
    NoVersionsAvailable(String),

    #[error("Concurrent modification of {0} detected, retry the operation")]
    Conflict(PathBuf),

    // IO errors
    #[error("Permission denied: {context}")]
    PermissionDenied {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl DepotError {
    /// Create an IO error with context, classifying permission failures
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        let context = context.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied { context, source }
        } else {
            Self::Io { context, source }
        }
    }

    /// Create a version-not-cached error
    pub fn not_cached(plugin_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self::VersionNotCached {
            plugin_id: plugin_id.into(),
            version: version.into(),
        }
    }

    /// Create a staging failure
    pub fn staging(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::StagingFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Map the error onto the shared taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PluginNotFound(_) | Self::BackupNotFound(_) | Self::PathNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::NoVersionsAvailable(_) => ErrorKind::NotFound,
            Self::VersionNotCached { .. } => ErrorKind::NotCached,
            Self::RegistryCorrupted { .. }
            | Self::IndexCorrupted { .. }
            | Self::ChecksumMismatch { .. }
            | Self::RegistrySchema { .. } => ErrorKind::Corruption,
            Self::StagingFailed { .. } | Self::ManifestInvalid(_) => ErrorKind::StagingFailure,
            Self::CompatibilityBlocked { .. } => ErrorKind::CompatibilityBlocked,
            Self::LifecycleConsentRequired { .. }
            | Self::LifecycleFailed { .. }
            | Self::LifecycleTimeout { .. }
            | Self::ActivationFailed { .. } => ErrorKind::TransactionAborted,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::Io { .. } | Self::Json(_) | Self::TomlSerialize(_) | Self::Internal(_) => {
                ErrorKind::IoFailure
            }
            Self::AlreadyInstalled { .. }
            | Self::InvalidStateTransition { .. }
            | Self::ConfigInvalid { .. }
            | Self::TomlParse(_)
            | Self::User(_) => ErrorKind::Invalid,
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::PluginNotFound(_) => "PLUGIN_NOT_FOUND",
            Self::AlreadyInstalled { .. } => "ALREADY_INSTALLED",
            Self::RegistryCorrupted { .. } => "REGISTRY_CORRUPTED",
            Self::RegistrySchema { .. } => "REGISTRY_SCHEMA_UNSUPPORTED",
            Self::BackupNotFound(_) => "BACKUP_NOT_FOUND",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::VersionNotCached { .. } => "VERSION_NOT_CACHED",
            Self::IndexCorrupted { .. } => "INDEX_CORRUPTED",
            Self::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            Self::StagingFailed { .. } => "STAGING_FAILED",
            Self::CompatibilityBlocked { .. } => "COMPATIBILITY_BLOCKED",
            Self::ManifestInvalid(_) => "MANIFEST_INVALID",
            Self::LifecycleConsentRequired { .. } => "LIFECYCLE_CONSENT_REQUIRED",
            Self::LifecycleFailed { .. } => "LIFECYCLE_FAILED",
            Self::LifecycleTimeout { .. } => "LIFECYCLE_TIMEOUT",
            Self::ActivationFailed { .. } => "ACTIVATION_FAILED",
            Self::NoVersionsAvailable(_) => "NO_VERSIONS_AVAILABLE",
            Self::Conflict(_) => "CONFLICT",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::Io { .. } => "IO_FAILURE",
            Self::PathNotFound(_) => "PATH_NOT_FOUND",
            Self::ConfigInvalid { .. } => "CONFIG_INVALID",
            Self::Json(_) => "JSON_ERROR",
            Self::TomlParse(_) => "TOML_PARSE_ERROR",
            Self::TomlSerialize(_) => "TOML_SERIALIZE_ERROR",
            Self::Internal(_) => "INTERNAL",
            Self::User(_) => "USER_ERROR",
        }
    }

    /// Check if error is a transient IO failure worth one retry
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::IndexCorrupted { .. } => Some("Run: depot cache rebuild"),
            Self::RegistryCorrupted { .. } => Some("Run: depot registry restore <backup>"),
            Self::VersionNotCached { .. } => Some("Run: depot versions <plugin> to list cached versions"),
            Self::LifecycleConsentRequired { .. } => Some("Re-run with --allow-scripts"),
            Self::Conflict(_) => Some("Another depot process is running; retry when it finishes"),
            Self::AlreadyInstalled { .. } => Some("Use --force to reinstall"),
            _ => None,
        }
    }
}
