//! Switching the active version of a plugin, and undoing the switch

use super::phase::Transaction;
use super::InstallOrchestrator;
use crate::error::{DepotError, DepotResult};
use std::path::{Path, PathBuf};
use tracing::debug;

/// What an activation changed, in the order it changed it
#[derive(Debug, Default)]
pub(super) struct ActivationUndo {
    previous_link: Option<PathBuf>,
    link_swapped: bool,
    previous_current: Option<String>,
    current_marked: bool,
    pinned_new: Option<String>,
    unpinned_old: Option<String>,
}

impl InstallOrchestrator {
    /// Point the plugin's activation link at `cache_path`, mark `version`
    /// current in the cache, and move a plugin pin onto it
    pub(super) async fn switch_active_version(
        &self,
        undo: &mut ActivationUndo,
        plugin_id: &str,
        version: &str,
        cache_path: &Path,
        pinned: bool,
    ) -> DepotResult<()> {
        let link = self.layout.activation_link(plugin_id);
        undo.previous_link = self.storage.read_symlink(&link).await?;
        self.storage
            .swap_symlink(cache_path, &link)
            .await
            .map_err(|e| DepotError::ActivationFailed {
                plugin_id: plugin_id.to_string(),
                reason: e.to_string(),
            })?;
        undo.link_swapped = true;
        debug!("{} -> {}", link.display(), cache_path.display());

        undo.previous_current = self
            .cache
            .entries_for(plugin_id)
            .await?
            .into_iter()
            .find(|e| e.is_current_version)
            .map(|e| e.version);
        self.cache.mark_current(plugin_id, Some(version)).await?;
        undo.current_marked = true;

        if pinned {
            if self.cache.pin_version(plugin_id, version).await? {
                undo.pinned_new = Some(version.to_string());
            }
            if let Some(old) = undo.previous_current.clone().filter(|v| v != version) {
                if self.cache.unpin_version(plugin_id, &old).await? {
                    undo.unpinned_old = Some(old);
                }
            }
        }
        Ok(())
    }

    /// Reverse [`switch_active_version`](Self::switch_active_version), newest change first
    pub(super) async fn undo_activation(
        &self,
        tx: &mut Transaction,
        plugin_id: &str,
        undo: &ActivationUndo,
    ) {
        if let Some(old) = &undo.unpinned_old {
            let outcome = self.cache.pin_version(plugin_id, old).await.map(|_| ());
            tx.compensated(format!("re-pin cache entry {}@{}", plugin_id, old), outcome);
        }
        if let Some(new) = &undo.pinned_new {
            let outcome = self.cache.unpin_version(plugin_id, new).await.map(|_| ());
            tx.compensated(format!("unpin cache entry {}@{}", plugin_id, new), outcome);
        }
        if undo.current_marked {
            let outcome = self
                .cache
                .mark_current(plugin_id, undo.previous_current.as_deref())
                .await;
            tx.compensated("restore current cache version", outcome);
        }
        if undo.link_swapped {
            let link = self.layout.activation_link(plugin_id);
            let outcome = match &undo.previous_link {
                Some(target) => self.storage.swap_symlink(target, &link).await,
                None => self.storage.remove_symlink(&link).await,
            };
            tx.compensated("restore activation link", outcome);
        }
    }
}
