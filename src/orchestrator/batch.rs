//! Batch update checks across every installed plugin
//!
//! Checks only read the registry and query the artifact source, so they run
//! concurrently on a bounded pool. Updates themselves run one at a time
//! because every one of them writes the registry and the cache index.

use super::types::{TransactionResult, UpdateCheck, UpdateRequest};
use super::InstallOrchestrator;
use crate::cache::index::compare_versions;
use crate::error::DepotResult;
use crate::registry::{InstallState, InstalledPlugin};
use futures_util::stream::{self, StreamExt};
use std::cmp::Ordering;
use tracing::debug;

impl InstallOrchestrator {
    /// Compare every installed plugin with the newest published version
    pub async fn check_updates(&self) -> DepotResult<Vec<UpdateCheck>> {
        let plugins = self.registry.list_plugins().await?;
        let concurrency = self.settings.batch_concurrency.max(1);
        debug!(
            "Checking {} plugins for updates ({} workers)",
            plugins.len(),
            concurrency
        );

        let mut checks: Vec<UpdateCheck> = stream::iter(plugins)
            .map(|plugin| self.check_one(plugin))
            .buffer_unordered(concurrency)
            .collect()
            .await;
        checks.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        Ok(checks)
    }

    async fn check_one(&self, plugin: InstalledPlugin) -> UpdateCheck {
        match self.source.latest_version(&plugin.plugin_id).await {
            Ok(latest) => UpdateCheck {
                update_available: compare_versions(&latest, &plugin.version)
                    == Ordering::Greater,
                plugin_id: plugin.plugin_id,
                installed_version: plugin.version,
                latest_version: Some(latest),
                error: None,
            },
            Err(e) => UpdateCheck {
                plugin_id: plugin.plugin_id,
                installed_version: plugin.version,
                latest_version: None,
                update_available: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Update every installed plugin that has a newer version.
    /// Pinned plugins are left alone.
    pub async fn update_outdated(
        &self,
        dry_run: bool,
        allow_scripts: bool,
    ) -> DepotResult<Vec<TransactionResult>> {
        let held: Vec<String> = self
            .registry
            .list_plugins()
            .await?
            .into_iter()
            .filter(|p| p.pinned || p.install_state != InstallState::Installed)
            .map(|p| p.plugin_id)
            .collect();

        let mut results = Vec::new();
        for check in self.check_updates().await? {
            if !check.update_available || held.contains(&check.plugin_id) {
                continue;
            }
            let result = self
                .update(UpdateRequest {
                    version: check.latest_version,
                    dry_run,
                    allow_scripts,
                    ..UpdateRequest::new(check.plugin_id)
                })
                .await;
            results.push(result);
        }
        Ok(results)
    }
}
