//! Services the orchestrator consults but does not own
//!
//! Each is a trait injected at construction time, with the default
//! implementation the `depot` binary wires up.

use crate::cache::index::compare_versions;
use crate::config::schema::{CompatibilityConfig, LifecycleConfig};
use crate::error::{DepotError, DepotResult};
use crate::layout::is_safe_segment;
use crate::manifest::HookKind;
use crate::storage::StorageAdapter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

// ---- compatibility ---------------------------------------------------------

/// Gate decision for one plugin version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum CompatibilityVerdict {
    Compatible,
    Warn { reason: String },
    Block { reason: String },
}

#[async_trait]
pub trait CompatibilityService: Send + Sync {
    async fn evaluate(&self, plugin_id: &str, version: &str) -> DepotResult<CompatibilityVerdict>;
}

/// Compatibility from operator-configured block and warn lists.
/// Patterns are `id` (any version) or `id@version`.
#[derive(Debug, Clone, Default)]
pub struct PolicyCompatibility {
    blocked: Vec<String>,
    warn: Vec<String>,
}

impl PolicyCompatibility {
    pub fn new(blocked: Vec<String>, warn: Vec<String>) -> Self {
        Self { blocked, warn }
    }

    pub fn from_config(config: &CompatibilityConfig) -> Self {
        Self::new(config.blocked.clone(), config.warn.clone())
    }

    fn matches(pattern: &str, plugin_id: &str, version: &str) -> bool {
        match pattern.split_once('@') {
            Some((id, v)) => id == plugin_id && v == version,
            None => pattern == plugin_id,
        }
    }
}

#[async_trait]
impl CompatibilityService for PolicyCompatibility {
    async fn evaluate(&self, plugin_id: &str, version: &str) -> DepotResult<CompatibilityVerdict> {
        if let Some(p) = self
            .blocked
            .iter()
            .find(|p| Self::matches(p, plugin_id, version))
        {
            return Ok(CompatibilityVerdict::Block {
                reason: format!("blocked by policy entry '{}'", p),
            });
        }
        if let Some(p) = self
            .warn
            .iter()
            .find(|p| Self::matches(p, plugin_id, version))
        {
            return Ok(CompatibilityVerdict::Warn {
                reason: format!("flagged by policy entry '{}'", p),
            });
        }
        Ok(CompatibilityVerdict::Compatible)
    }
}

// ---- artifact source -------------------------------------------------------

/// Where plugin artifact trees come from
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// URI recorded as the plugin's source
    fn describe(&self, plugin_id: &str) -> String;

    /// Published versions, oldest first
    async fn available_versions(&self, plugin_id: &str) -> DepotResult<Vec<String>>;

    /// Newest published version
    async fn latest_version(&self, plugin_id: &str) -> DepotResult<String> {
        self.available_versions(plugin_id)
            .await?
            .pop()
            .ok_or_else(|| DepotError::NoVersionsAvailable(plugin_id.to_string()))
    }

    /// Copy one version's tree into `dest`, returning bytes written
    async fn fetch(&self, plugin_id: &str, version: &str, dest: &Path) -> DepotResult<u64>;
}

/// Artifacts laid out as `<root>/<plugin_id>/<version>/`
pub struct LocalDirectorySource {
    root: PathBuf,
    storage: Arc<dyn StorageAdapter>,
}

impl LocalDirectorySource {
    pub fn new(root: impl Into<PathBuf>, storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            root: root.into(),
            storage,
        }
    }
}

#[async_trait]
impl ArtifactSource for LocalDirectorySource {
    fn describe(&self, plugin_id: &str) -> String {
        format!("file://{}", self.root.join(plugin_id).display())
    }

    async fn available_versions(&self, plugin_id: &str) -> DepotResult<Vec<String>> {
        if !is_safe_segment(plugin_id) {
            return Ok(Vec::new());
        }
        let mut versions: Vec<String> = self
            .storage
            .list_directory(&self.root.join(plugin_id))
            .await?
            .into_iter()
            .filter(|e| e.is_dir && is_safe_segment(&e.name))
            .map(|e| e.name)
            .collect();
        versions.sort_by(|a, b| compare_versions(a, b));
        Ok(versions)
    }

    async fn fetch(&self, plugin_id: &str, version: &str, dest: &Path) -> DepotResult<u64> {
        if !is_safe_segment(plugin_id) || !is_safe_segment(version) {
            return Err(DepotError::User(format!(
                "Invalid plugin reference {}@{}",
                plugin_id, version
            )));
        }
        let source = self.root.join(plugin_id).join(version);
        if !self.storage.exists(&source).await {
            return Err(DepotError::PathNotFound(source));
        }
        debug!("Fetching {} into {}", source.display(), dest.display());
        self.storage
            .copy_directory(&source, dest)
            .await
            .map_err(|e| DepotError::staging(dest, e.to_string()))
    }
}

// ---- lifecycle hooks -------------------------------------------------------

/// Captured result of a hook that ran to completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs lifecycle hooks under a deadline
#[async_trait]
pub trait LifecycleRunner: Send + Sync {
    /// Run `command` in `working_dir`. Non-zero exit and timeout are errors.
    async fn run(
        &self,
        hook: HookKind,
        command: &str,
        working_dir: &Path,
        timeout: Duration,
    ) -> DepotResult<HookOutput>;
}

/// Runs hooks through a shell (`sh -c <command>`)
#[derive(Debug, Clone)]
pub struct ShellLifecycleRunner {
    shell: String,
}

impl ShellLifecycleRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self::new(config.shell.clone())
    }
}

impl Default for ShellLifecycleRunner {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

#[async_trait]
impl LifecycleRunner for ShellLifecycleRunner {
    async fn run(
        &self,
        hook: HookKind,
        command: &str,
        working_dir: &Path,
        timeout: Duration,
    ) -> DepotResult<HookOutput> {
        info!("Running {} hook: {}", hook, command);

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(working_dir)
            .env("DEPOT_HOOK", hook.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(result) => result.map_err(|e| DepotError::LifecycleFailed {
                hook: hook.to_string(),
                reason: e.to_string(),
            })?,
            Err(_) => {
                warn!("{} hook exceeded {}s", hook, timeout.as_secs());
                return Err(DepotError::LifecycleTimeout {
                    hook: hook.to_string(),
                    timeout,
                });
            }
        };

        let result = HookOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !output.status.success() {
            let detail = result.stderr.trim();
            return Err(DepotError::LifecycleFailed {
                hook: hook.to_string(),
                reason: if detail.is_empty() {
                    format!("exit code {}", result.exit_code)
                } else {
                    format!("exit code {}: {}", result.exit_code, detail)
                },
            });
        }
        Ok(result)
    }
}
