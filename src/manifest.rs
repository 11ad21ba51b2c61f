//! Plugin manifest (`plugin.json`)
//!
//! Only the fields the depot acts on are modeled; unknown fields are ignored.

use crate::error::{DepotError, DepotResult};
use crate::storage::StorageAdapter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Manifest locations tried in order, relative to the artifact root
pub const MANIFEST_CANDIDATES: [&str; 2] = ["plugin.json", ".claude-plugin/plugin.json"];

/// Lifecycle hook kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    Install,
    Uninstall,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Uninstall => write!(f, "uninstall"),
        }
    }
}

/// Shell commands declared by the plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleHooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstall: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub lifecycle: LifecycleHooks,
}

impl PluginManifest {
    /// Read the manifest from an artifact tree
    pub async fn load(storage: &dyn StorageAdapter, root: &Path) -> DepotResult<(Self, PathBuf)> {
        for candidate in MANIFEST_CANDIDATES {
            let path = root.join(candidate);
            if let Some(bytes) = storage.read_file(&path).await? {
                let manifest = serde_json::from_slice(&bytes).map_err(|e| {
                    DepotError::ManifestInvalid(format!("{}: {}", path.display(), e))
                })?;
                return Ok((manifest, path));
            }
        }
        Err(DepotError::ManifestInvalid(format!(
            "no plugin.json found under {}",
            root.display()
        )))
    }

    /// Check the manifest describes the plugin and version being installed
    pub fn validate(&self, plugin_id: &str, version: &str) -> DepotResult<()> {
        if self.name.trim().is_empty() {
            return Err(DepotError::ManifestInvalid("name is empty".to_string()));
        }
        if self.name != plugin_id {
            return Err(DepotError::ManifestInvalid(format!(
                "name '{}' does not match plugin id '{}'",
                self.name, plugin_id
            )));
        }
        if self.version != version {
            return Err(DepotError::ManifestInvalid(format!(
                "version '{}' does not match requested version '{}'",
                self.version, version
            )));
        }
        if self.permissions.iter().any(|p| p.trim().is_empty()) {
            return Err(DepotError::ManifestInvalid(
                "permissions must not contain empty entries".to_string(),
            ));
        }
        for (kind, hook) in [
            (HookKind::Install, &self.lifecycle.install),
            (HookKind::Uninstall, &self.lifecycle.uninstall),
        ] {
            if matches!(hook, Some(cmd) if cmd.trim().is_empty()) {
                return Err(DepotError::ManifestInvalid(format!(
                    "lifecycle.{} is empty",
                    kind
                )));
            }
        }
        Ok(())
    }

    /// Command declared for a hook
    pub fn hook(&self, kind: HookKind) -> Option<&str> {
        match kind {
            HookKind::Install => self.lifecycle.install.as_deref(),
            HookKind::Uninstall => self.lifecycle.uninstall.as_deref(),
        }
    }
}

/// Permission changes between two versions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl PermissionDiff {
    pub fn between(old: &[String], new: &[String]) -> Self {
        let old: BTreeSet<&String> = old.iter().collect();
        let new: BTreeSet<&String> = new.iter().collect();
        Self {
            added: new.difference(&old).map(|s| s.to_string()).collect(),
            removed: old.difference(&new).map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
