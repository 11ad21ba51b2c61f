//! List and outdated commands

use crate::cli::args::ListArgs;
use crate::error::DepotResult;
use crate::registry::{InstallState, InstalledPlugin};
use crate::ui::{self, TaskSpinner, UiContext};
use crate::Depot;
use console::style;

/// Execute the list command
pub async fn list(args: ListArgs, depot: &Depot, json: bool) -> DepotResult<bool> {
    let ctx = UiContext::detect().with_json(json);
    let plugins: Vec<InstalledPlugin> = depot
        .registry
        .list_plugins()
        .await?
        .into_iter()
        .filter(|p| !args.pinned || p.pinned)
        .collect();

    if ctx.is_json() {
        ui::print_json(&plugins)?;
        return Ok(true);
    }

    if plugins.is_empty() {
        ui::step_info(&ctx, "No plugins installed");
        return Ok(true);
    }

    println!(
        "{:<28} {:<14} {:<13} {:<6} {:<16}",
        style("PLUGIN").bold(),
        style("VERSION").bold(),
        style("STATE").bold(),
        style("PINNED").bold(),
        style("INSTALLED").bold()
    );
    println!("{}", "-".repeat(80));

    for plugin in &plugins {
        let state = match plugin.install_state {
            InstallState::Installed => style("installed").green(),
            InstallState::Staging => style("staging").yellow(),
            InstallState::Uninstalling => style("uninstalling").yellow(),
            InstallState::Disabled => style("disabled").dim(),
            InstallState::Failed => style("failed").red(),
        };
        println!(
            "{:<28} {:<14} {:<13} {:<6} {:<16}",
            plugin.plugin_id,
            plugin.version,
            state,
            if plugin.pinned { "yes" } else { "" },
            plugin.installed_at.format("%Y-%m-%d %H:%M").to_string()
        );
    }

    println!();
    println!("{} plugin(s)", plugins.len());
    Ok(true)
}

/// Execute the outdated command
pub async fn outdated(depot: &Depot, json: bool) -> DepotResult<bool> {
    let ctx = UiContext::detect().with_json(json);

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start("Checking for updates...");
    let checks = depot.orchestrator.check_updates().await?;
    let outdated = checks.iter().filter(|c| c.update_available).count();
    spinner.stop(&format!("{} of {} plugin(s) outdated", outdated, checks.len()));

    if ctx.is_json() {
        ui::print_json(&checks)?;
        return Ok(true);
    }

    for check in &checks {
        match (&check.latest_version, &check.error) {
            (_, Some(error)) => ui::step_warn_hint(
                &ctx,
                &format!("{} {}", check.plugin_id, check.installed_version),
                error,
            ),
            (Some(latest), None) if check.update_available => ui::step_warn(
                &ctx,
                &format!(
                    "{} {} -> {}",
                    check.plugin_id, check.installed_version, latest
                ),
            ),
            _ => ui::step_ok_detail(&ctx, &check.plugin_id, &check.installed_version),
        }
    }
    Ok(true)
}
