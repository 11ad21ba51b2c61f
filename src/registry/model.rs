//! Registry data model
//!
//! `registry.json` is one [`InstalledPluginRegistry`]. Plugin pins are stored
//! twice (the per-plugin flag and `activePins`); every mutation goes through
//! [`InstalledPluginRegistry::set_pinned`] or [`InstalledPluginRegistry::remove`]
//! so the two never diverge.

use crate::error::{DepotError, DepotResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Current registry schema version
pub const REGISTRY_SCHEMA_VERSION: u32 = 1;

/// Where a plugin is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallState {
    /// Promoted into the cache, not yet activated
    Staging,
    Installed,
    /// A transaction failed after the record was written
    Failed,
    Uninstalling,
    Disabled,
}

impl InstallState {
    /// Whether a record may move from `self` to `next`
    pub fn can_transition_to(self, next: InstallState) -> bool {
        use InstallState::*;
        matches!(
            (self, next),
            (Staging, Installed)
                | (Staging, Failed)
                | (Installed, Staging)
                | (Installed, Installed)
                | (Installed, Uninstalling)
                | (Installed, Disabled)
                | (Failed, Staging)
                | (Failed, Uninstalling)
                | (Disabled, Installed)
                | (Disabled, Uninstalling)
                | (Uninstalling, Installed)
                | (Uninstalling, Failed)
        )
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Staging => "STAGING",
            Self::Installed => "INSTALLED",
            Self::Failed => "FAILED",
            Self::Uninstalling => "UNINSTALLING",
            Self::Disabled => "DISABLED",
        };
        write!(f, "{}", name)
    }
}

/// Failure recorded on a plugin whose transaction did not complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub phase: String,
    pub code: String,
    pub message: String,
    pub transaction_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// One installed plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPlugin {
    pub plugin_id: String,
    pub version: String,
    /// Where the artifacts came from
    pub source: String,
    pub install_state: InstallState,
    pub installed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub cache_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<PathBuf>,
    pub transaction_id: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry_ref: Option<String>,
    /// Lifecycle hooks the operator consented to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lifecycle_consent: Vec<String>,
    /// Permissions declared by the installed manifest
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    /// Version active before the last update or rollback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

impl InstalledPlugin {
    pub fn new(
        plugin_id: impl Into<String>,
        version: impl Into<String>,
        source: impl Into<String>,
        cache_path: PathBuf,
        transaction_id: impl Into<String>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            version: version.into(),
            source: source.into(),
            install_state: InstallState::Staging,
            installed_at: Utc::now(),
            updated_at: None,
            cache_path,
            symlink_target: None,
            transaction_id: transaction_id.into(),
            pinned: false,
            telemetry_ref: None,
            lifecycle_consent: Vec::new(),
            permissions: Vec::new(),
            previous_version: None,
            error: None,
        }
    }

    /// Move to `next` if the lifecycle allows it
    pub fn transition_to(&mut self, next: InstallState) -> DepotResult<()> {
        if !self.install_state.can_transition_to(next) {
            return Err(DepotError::InvalidStateTransition {
                plugin_id: self.plugin_id.clone(),
                from: self.install_state,
                to: next,
            });
        }
        self.install_state = next;
        Ok(())
    }
}

/// Registry bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryMetadata {
    pub schema_version: u32,
    pub last_updated: DateTime<Utc>,
    pub total_installs: u64,
    /// Content checksum over plugins, pins and telemetry; empty before the first write
    #[serde(default)]
    pub checksum: String,
}

impl Default for RegistryMetadata {
    fn default() -> Self {
        Self {
            schema_version: REGISTRY_SCHEMA_VERSION,
            last_updated: Utc::now(),
            total_installs: 0,
            checksum: String::new(),
        }
    }
}

/// Last transaction seen for a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub last_operation: String,
    pub last_transaction_id: String,
    pub last_outcome: String,
    pub updated_at: DateTime<Utc>,
}

/// Contents of `registry.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPluginRegistry {
    pub metadata: RegistryMetadata,
    #[serde(default)]
    pub plugins: Vec<InstalledPlugin>,
    #[serde(default)]
    pub active_pins: Vec<String>,
    #[serde(default)]
    pub telemetry: BTreeMap<String, TelemetrySnapshot>,
}

/// Category of a registry health problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Unreadable,
    SchemaVersion,
    ChecksumMismatch,
    PinMismatch,
    DuplicatePlugin,
    CountMismatch,
}

/// One problem found by registry validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryViolation {
    pub kind: ViolationKind,
    pub message: String,
}

impl RegistryViolation {
    pub fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RegistryViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChecksumView<'a> {
    plugins: &'a [InstalledPlugin],
    active_pins: &'a [String],
    telemetry: &'a BTreeMap<String, TelemetrySnapshot>,
}

impl InstalledPluginRegistry {
    pub fn get(&self, plugin_id: &str) -> Option<&InstalledPlugin> {
        self.plugins.iter().find(|p| p.plugin_id == plugin_id)
    }

    pub fn get_mut(&mut self, plugin_id: &str) -> Option<&mut InstalledPlugin> {
        self.plugins.iter_mut().find(|p| p.plugin_id == plugin_id)
    }

    /// Insert or replace a plugin record, returning the replaced one.
    /// The pin flag is reconciled into `activePins`.
    pub fn upsert(&mut self, plugin: InstalledPlugin) -> Option<InstalledPlugin> {
        let plugin_id = plugin.plugin_id.clone();
        let pinned = plugin.pinned;
        let previous = match self.plugins.iter().position(|p| p.plugin_id == plugin_id) {
            Some(i) => Some(std::mem::replace(&mut self.plugins[i], plugin)),
            None => {
                self.plugins.push(plugin);
                self.plugins.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
                None
            }
        };
        self.set_pinned(&plugin_id, pinned);
        previous
    }

    /// Remove a plugin record together with its pin and telemetry
    pub fn remove(&mut self, plugin_id: &str) -> Option<InstalledPlugin> {
        let index = self.plugins.iter().position(|p| p.plugin_id == plugin_id)?;
        let removed = self.plugins.remove(index);
        self.active_pins.retain(|p| p != plugin_id);
        self.telemetry.remove(plugin_id);
        Some(removed)
    }

    /// Set both pin representations. Returns whether anything changed.
    /// Unknown plugins are left untouched.
    pub fn set_pinned(&mut self, plugin_id: &str, pinned: bool) -> bool {
        let Some(plugin) = self.get_mut(plugin_id) else {
            return false;
        };
        let mut changed = plugin.pinned != pinned;
        plugin.pinned = pinned;

        let listed = self.active_pins.iter().any(|p| p == plugin_id);
        if pinned && !listed {
            self.active_pins.push(plugin_id.to_string());
            self.active_pins.sort();
            changed = true;
        } else if !pinned && listed {
            self.active_pins.retain(|p| p != plugin_id);
            changed = true;
        }
        changed
    }

    /// SHA-256 over the content (metadata excluded)
    pub fn compute_checksum(&self) -> String {
        let view = ChecksumView {
            plugins: &self.plugins,
            active_pins: &self.active_pins,
            telemetry: &self.telemetry,
        };
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Refresh metadata before a write
    pub fn seal(&mut self) {
        self.metadata.schema_version = REGISTRY_SCHEMA_VERSION;
        self.metadata.last_updated = Utc::now();
        self.metadata.total_installs = self.plugins.len() as u64;
        self.metadata.checksum = self.compute_checksum();
    }

    /// Structural and consistency problems; empty when healthy
    pub fn violations(&self) -> Vec<RegistryViolation> {
        let mut violations = Vec::new();

        if self.metadata.schema_version != REGISTRY_SCHEMA_VERSION {
            violations.push(RegistryViolation::new(
                ViolationKind::SchemaVersion,
                format!(
                    "schema version {} (expected {})",
                    self.metadata.schema_version, REGISTRY_SCHEMA_VERSION
                ),
            ));
        }

        if !self.metadata.checksum.is_empty() {
            let actual = self.compute_checksum();
            if actual != self.metadata.checksum {
                violations.push(RegistryViolation::new(
                    ViolationKind::ChecksumMismatch,
                    format!(
                        "checksum {} does not match content ({})",
                        self.metadata.checksum, actual
                    ),
                ));
            }
        }

        let mut seen = BTreeSet::new();
        for plugin in &self.plugins {
            if !seen.insert(plugin.plugin_id.as_str()) {
                violations.push(RegistryViolation::new(
                    ViolationKind::DuplicatePlugin,
                    format!("plugin {} appears more than once", plugin.plugin_id),
                ));
            }
        }

        let flagged: BTreeSet<&str> = self
            .plugins
            .iter()
            .filter(|p| p.pinned)
            .map(|p| p.plugin_id.as_str())
            .collect();
        let listed: BTreeSet<&str> = self.active_pins.iter().map(String::as_str).collect();
        for id in flagged.difference(&listed) {
            violations.push(RegistryViolation::new(
                ViolationKind::PinMismatch,
                format!("{} is pinned but missing from activePins", id),
            ));
        }
        for id in listed.difference(&flagged) {
            violations.push(RegistryViolation::new(
                ViolationKind::PinMismatch,
                format!("{} is in activePins but not pinned", id),
            ));
        }

        if self.metadata.total_installs != self.plugins.len() as u64 && !self.metadata.checksum.is_empty() {
            violations.push(RegistryViolation::new(
                ViolationKind::CountMismatch,
                format!(
                    "totalInstalls is {} but {} plugins are recorded",
                    self.metadata.total_installs,
                    self.plugins.len()
                ),
            ));
        }

        violations
    }
}
