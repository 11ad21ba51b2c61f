//! On-disk layout of a plugin directory
//!
//! ```text
//! <plugin_dir>/cache/<plugin_id>/<version>/   artifact tree
//! <plugin_dir>/cache/index.json               cache index
//! <plugin_dir>/registry.json                  installed plugin registry
//! <plugin_dir>/tmp/<transaction_id>/           staging workspace
//! <plugin_dir>/plugins/<plugin_id>            activation symlink
//! <plugin_dir>/backups/                       registry backups
//! <plugin_dir>/telemetry.log                  transaction telemetry
//! ```

use std::path::{Path, PathBuf};

/// Resolves every path the depot reads or writes
#[derive(Debug, Clone)]
pub struct PluginLayout {
    root: PathBuf,
}

impl PluginLayout {
    /// Create a layout rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root plugin directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Artifact cache root
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Cache index file
    pub fn index_path(&self) -> PathBuf {
        self.cache_dir().join("index.json")
    }

    /// Directory holding every cached version of one plugin
    pub fn plugin_cache_dir(&self, plugin_id: &str) -> PathBuf {
        self.cache_dir().join(plugin_id)
    }

    /// Cache location of one plugin version
    pub fn version_dir(&self, plugin_id: &str, version: &str) -> PathBuf {
        self.plugin_cache_dir(plugin_id).join(version)
    }

    /// Registry file
    pub fn registry_path(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    /// Base for transaction workspaces (`tmp/` lives beneath it)
    pub fn workspace_base(&self) -> &Path {
        &self.root
    }

    /// Staging workspace root
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Directory of activation symlinks
    pub fn plugins_dir(&self) -> PathBuf {
        self.root.join("plugins")
    }

    /// Activation symlink for one plugin
    pub fn activation_link(&self, plugin_id: &str) -> PathBuf {
        self.plugins_dir().join(plugin_id)
    }

    /// Registry backup directory
    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    /// Transaction telemetry log
    pub fn telemetry_path(&self) -> PathBuf {
        self.root.join("telemetry.log")
    }
}

/// Validate that a plugin id or version is safe to use as a single path segment
pub fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.starts_with('.')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+' | '@'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let layout = PluginLayout::new("/home/u/.claude-plugin");
        assert_eq!(
            layout.version_dir("alpha", "1.2.0"),
            PathBuf::from("/home/u/.claude-plugin/cache/alpha/1.2.0")
        );
        assert_eq!(
            layout.index_path(),
            PathBuf::from("/home/u/.claude-plugin/cache/index.json")
        );
        assert_eq!(
            layout.registry_path(),
            PathBuf::from("/home/u/.claude-plugin/registry.json")
        );
        assert_eq!(
            layout.activation_link("alpha"),
            PathBuf::from("/home/u/.claude-plugin/plugins/alpha")
        );
    }

    #[test]
    fn safe_segments() {
        assert!(is_safe_segment("alpha"));
        assert!(is_safe_segment("1.2.0-beta.1+build"));
        assert!(!is_safe_segment(""));
        assert!(!is_safe_segment(".."));
        assert!(!is_safe_segment("a/b"));
        assert!(!is_safe_segment(".hidden"));
    }
}
