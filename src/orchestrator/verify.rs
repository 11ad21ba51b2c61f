//! Read-only health checks and rollback target listing

use super::types::{RollbackTarget, VerifyCheck, VerifyReport};
use super::InstallOrchestrator;
use crate::error::{DepotError, DepotResult};
use crate::registry::InstallState;

fn check(name: &str, ok: bool, detail: Option<String>) -> VerifyCheck {
    VerifyCheck {
        name: name.to_string(),
        ok,
        detail,
    }
}

impl InstallOrchestrator {
    /// Cross-check a plugin's registry entry, cache entry and activation
    /// link. Nothing is modified, not even access times.
    pub async fn verify(&self, plugin_id: &str) -> DepotResult<VerifyReport> {
        let mut checks = Vec::new();

        let Some(record) = self.registry.get_plugin(plugin_id).await? else {
            checks.push(check(
                "registry_entry",
                false,
                Some("plugin is not installed".to_string()),
            ));
            return Ok(VerifyReport {
                plugin_id: plugin_id.to_string(),
                healthy: false,
                version: None,
                install_state: None,
                checks,
            });
        };

        let installed = record.install_state == InstallState::Installed;
        checks.push(check(
            "registry_entry",
            installed,
            (!installed).then(|| format!("install state is {}", record.install_state)),
        ));

        let entry = self.cache.lookup(plugin_id, &record.version).await?;
        checks.push(check(
            "cache_entry",
            entry.is_some(),
            entry
                .is_none()
                .then(|| format!("{} has no cache entry", record.version)),
        ));

        if let Some(entry) = &entry {
            match self.cache.verify_entry(plugin_id, &record.version).await {
                Ok(_) => checks.push(check("checksum", true, None)),
                Err(e @ DepotError::ChecksumMismatch { .. }) => {
                    checks.push(check("checksum", false, Some(e.to_string())))
                }
                Err(e) => return Err(e),
            }

            checks.push(check(
                "current_flag",
                entry.is_current_version,
                (!entry.is_current_version)
                    .then(|| "cache entry is not marked current".to_string()),
            ));

            let pins_agree = entry.pinned == record.pinned;
            checks.push(check(
                "pin_consistency",
                pins_agree,
                (!pins_agree).then(|| {
                    format!(
                        "registry pinned={} but cache entry pinned={}",
                        record.pinned, entry.pinned
                    )
                }),
            ));
        }

        let link = self.layout.activation_link(plugin_id);
        let expected = record.symlink_target.as_ref().unwrap_or(&record.cache_path);
        let detail = match self.storage.read_symlink(&link).await? {
            Some(target) if &target == expected => None,
            Some(target) => Some(format!(
                "{} points to {} instead of {}",
                link.display(),
                target.display(),
                expected.display()
            )),
            None => Some(format!("{} is missing", link.display())),
        };
        checks.push(check("symlink", detail.is_none(), detail));

        Ok(VerifyReport {
            plugin_id: plugin_id.to_string(),
            healthy: checks.iter().all(|c| c.ok),
            version: Some(record.version),
            install_state: Some(record.install_state),
            checks,
        })
    }

    /// Cached versions other than the active one, newest first
    pub async fn list_rollback_targets(&self, plugin_id: &str) -> DepotResult<Vec<RollbackTarget>> {
        let record = self.registry.get_plugin(plugin_id).await?;
        let entries = self.cache.versions_newest_first(plugin_id).await?;
        if record.is_none() && entries.is_empty() {
            return Err(DepotError::PluginNotFound(plugin_id.to_string()));
        }

        let active = record.map(|r| r.version);
        Ok(entries
            .into_iter()
            .filter(|e| active.as_deref() != Some(e.version.as_str()))
            .map(|e| RollbackTarget {
                version: e.version,
                size_bytes: e.size_bytes,
                last_access_time: e.last_access_time,
                pinned: e.pinned,
                promoted_at: e.promoted_at,
            })
            .collect())
    }
}
