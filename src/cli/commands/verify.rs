//! Verify and versions commands

use crate::cache::format_bytes;
use crate::cli::args::PluginArgs;
use crate::error::DepotResult;
use crate::ui::{self, UiContext};
use crate::Depot;
use console::style;

/// Execute the verify command
pub async fn verify(args: PluginArgs, depot: &Depot, json: bool) -> DepotResult<bool> {
    let ctx = UiContext::detect().with_json(json);
    let report = depot.orchestrator.verify(&args.plugin).await?;

    if ctx.is_json() {
        ui::print_json(&report)?;
        return Ok(report.healthy);
    }

    ui::intro(&ctx, &format!("Verify {}", report.plugin_id));
    if let (Some(version), Some(state)) = (&report.version, &report.install_state) {
        ui::key_value(&ctx, "Version", version);
        ui::key_value(&ctx, "State", &state.to_string());
    }
    for check in &report.checks {
        match (&check.detail, check.ok) {
            (_, true) => ui::step_ok(&ctx, &check.name),
            (Some(detail), false) => ui::step_error_detail(&ctx, &check.name, detail),
            (None, false) => ui::step_error(&ctx, &check.name),
        }
    }

    if report.healthy {
        ui::outro_success(&ctx, "Healthy");
    } else {
        ui::outro_error(&ctx, "Problems found");
    }
    Ok(report.healthy)
}

/// Execute the versions command
pub async fn versions(args: PluginArgs, depot: &Depot, json: bool) -> DepotResult<bool> {
    let ctx = UiContext::detect().with_json(json);
    let targets = depot.orchestrator.list_rollback_targets(&args.plugin).await?;

    if ctx.is_json() {
        ui::print_json(&targets)?;
        return Ok(true);
    }

    if targets.is_empty() {
        ui::step_info(&ctx, &format!("No other cached versions of {}", args.plugin));
        return Ok(true);
    }

    println!(
        "{:<16} {:<10} {:<18} {:<6}",
        style("VERSION").bold(),
        style("SIZE").bold(),
        style("LAST USED").bold(),
        style("PINNED").bold()
    );
    println!("{}", "-".repeat(52));
    for target in &targets {
        println!(
            "{:<16} {:<10} {:<18} {:<6}",
            target.version,
            format_bytes(target.size_bytes),
            target.last_access_time.format("%Y-%m-%d %H:%M").to_string(),
            if target.pinned { "yes" } else { "" }
        );
    }
    println!();
    println!("{} version(s) available for rollback", targets.len());
    Ok(true)
}
