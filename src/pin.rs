//! Plugin pinning
//!
//! A pin lives in two places: the registry (`pinned` + `activePins`) and the
//! cache entry of the plugin's active version. [`PinService`] updates both.

use crate::cache::CacheService;
use crate::error::{DepotError, DepotResult, ErrorKind};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::registry::RegistryService;

/// Outcome of a pin or unpin request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PinResult {
    pub plugin_id: String,
    /// Active version whose cache entry was (un)pinned
    pub version: Option<String>,
    pub pinned: bool,
    /// Nothing changed on disk
    pub was_no_op: bool,
}

/// Keeps registry and cache pin state consistent
pub struct PinService {
    registry: Arc<RegistryService>,
    cache: Arc<CacheService>,
}

impl PinService {
    pub fn new(registry: Arc<RegistryService>, cache: Arc<CacheService>) -> Self {
        Self { registry, cache }
    }

    /// Pin an installed plugin
    pub async fn pin_plugin(&self, plugin_id: &str) -> DepotResult<PinResult> {
        let plugin = self
            .registry
            .get_plugin(plugin_id)
            .await?
            .ok_or_else(|| DepotError::PluginNotFound(plugin_id.to_string()))?;

        let cache_changed = match self.cache.pin_version(plugin_id, &plugin.version).await {
            Ok(changed) => changed,
            Err(e) if e.kind() == ErrorKind::NotCached => {
                warn!(
                    "{}@{} has no cache entry, pinning registry only",
                    plugin_id, plugin.version
                );
                false
            }
            Err(e) => return Err(e),
        };

        let registry_changed = match self.registry.pin_plugin(plugin_id).await {
            Ok(changed) => changed,
            Err(e) => {
                if cache_changed {
                    if let Err(undo) = self.cache.unpin_version(plugin_id, &plugin.version).await {
                        warn!("Could not undo cache pin for {}: {}", plugin_id, undo);
                    }
                }
                return Err(e);
            }
        };

        let was_no_op = !cache_changed && !registry_changed;
        if !was_no_op {
            info!("Pinned {}@{}", plugin_id, plugin.version);
        }
        Ok(PinResult {
            plugin_id: plugin_id.to_string(),
            version: Some(plugin.version),
            pinned: true,
            was_no_op,
        })
    }

    /// Unpin a plugin. Unknown plugins succeed as a no-op.
    pub async fn unpin_plugin(&self, plugin_id: &str) -> DepotResult<PinResult> {
        let Some(plugin) = self.registry.get_plugin(plugin_id).await? else {
            return Ok(PinResult {
                plugin_id: plugin_id.to_string(),
                version: None,
                pinned: false,
                was_no_op: true,
            });
        };

        let cache_changed = self.cache.unpin_version(plugin_id, &plugin.version).await?;
        let registry_changed = match self.registry.unpin_plugin(plugin_id).await {
            Ok(changed) => changed,
            Err(e) => {
                if cache_changed {
                    if let Err(undo) = self.cache.pin_version(plugin_id, &plugin.version).await {
                        warn!("Could not restore cache pin for {}: {}", plugin_id, undo);
                    }
                }
                return Err(e);
            }
        };

        let was_no_op = !cache_changed && !registry_changed;
        if !was_no_op {
            info!("Unpinned {}@{}", plugin_id, plugin.version);
        }
        Ok(PinResult {
            plugin_id: plugin_id.to_string(),
            version: Some(plugin.version),
            pinned: false,
            was_no_op,
        })
    }
}
