//! Registry command - validation, backups and restore

use crate::cli::args::{RegistryAction, RegistryArgs};
use crate::error::DepotResult;
use crate::ui::{self, UiContext};
use crate::Depot;
use serde_json::json;
use std::path::PathBuf;

/// Execute the registry command
pub async fn execute(args: RegistryArgs, depot: &Depot, json: bool) -> DepotResult<bool> {
    let ctx = UiContext::detect().with_json(json);

    match args.action {
        RegistryAction::Validate => {
            let violations = depot.registry.validate_registry().await;
            if ctx.is_json() {
                ui::print_json(&violations)?;
            } else if violations.is_empty() {
                ui::step_ok(&ctx, "Registry is consistent");
            } else {
                for violation in &violations {
                    ui::step_error(&ctx, &violation.to_string());
                }
            }
            Ok(violations.is_empty())
        }
        RegistryAction::Backup { reason } => {
            let path = depot.registry.create_backup(&reason).await?;
            if ctx.is_json() {
                ui::print_json(&json!({ "path": path }))?;
            } else {
                ui::step_ok_detail(&ctx, "Registry backed up", &path.display().to_string());
            }
            Ok(true)
        }
        RegistryAction::Restore { backup } => {
            let path = resolve_backup(depot, &backup);
            let restored = depot.registry.restore_from_backup(&path).await?;
            if ctx.is_json() {
                ui::print_json(&restored)?;
            } else {
                ui::step_ok_detail(
                    &ctx,
                    "Registry restored",
                    &format!("{} plugin(s)", restored.plugins.len()),
                );
            }
            Ok(true)
        }
        RegistryAction::Backups => {
            let backups = depot.registry.list_backups().await?;
            if ctx.is_json() {
                ui::print_json(&backups)?;
            } else if backups.is_empty() {
                ui::step_info(&ctx, "No backups");
            } else {
                for backup in &backups {
                    ui::key_value(
                        &ctx,
                        &backup.created.format("%Y-%m-%d %H:%M:%S").to_string(),
                        &backup.name,
                    );
                }
            }
            Ok(true)
        }
    }
}

/// A bare file name refers to the backups directory
fn resolve_backup(depot: &Depot, backup: &str) -> PathBuf {
    let path = PathBuf::from(backup);
    if path.components().count() == 1 {
        depot.layout.backups_dir().join(path)
    } else {
        path
    }
}
