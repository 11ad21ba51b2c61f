//! Configuration schema for plugin-depot
//!
//! Configuration is stored at `~/.config/depot/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Artifact cache limits
    pub cache: CacheConfig,

    /// Lifecycle hook execution
    pub lifecycle: LifecycleConfig,

    /// Compatibility policy
    pub compatibility: CompatibilityConfig,

    /// Where artifacts are fetched from
    pub source: SourceConfig,

    /// Batch operations
    pub batch: BatchConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Plugin directory; relative paths resolve against the home directory
    pub plugin_dir: PathBuf,

    /// Log format: "text" or "json"
    pub log_format: String,

    /// Record transaction telemetry
    pub telemetry: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from(".claude-plugin"),
            log_format: "text".to_string(),
            telemetry: true,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum total cache size in decimal megabytes
    pub max_size_mb: u64,

    /// Cached versions kept per plugin
    pub max_versions_per_plugin: usize,

    /// Staging workspaces older than this are reclaimed
    pub orphan_max_age_hours: i64,

    /// Run eviction after each promotion
    pub evict_on_promote: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_mb: 500,
            max_versions_per_plugin: 3,
            orphan_max_age_hours: 24,
            evict_on_promote: true,
        }
    }
}

/// Lifecycle hook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Seconds a hook may run before it is killed
    pub timeout_secs: u64,

    /// Shell used to run hook commands
    pub shell: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            shell: "/bin/sh".to_string(),
        }
    }
}

/// Compatibility policy (`"id"` or `"id@version"` patterns)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatibilityConfig {
    /// Refuse to install these
    pub blocked: Vec<String>,

    /// Install these with a warning
    pub warn: Vec<String>,
}

/// Local artifact source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Root holding `<id>/<version>/` trees; relative paths resolve against home
    pub root: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".claude-plugin-sources"),
        }
    }
}

/// Batch operation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Plugins checked concurrently
    pub concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}
