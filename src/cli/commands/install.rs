//! Install and update commands

use super::report_transaction;
use crate::cli::args::{parse_plugin_ref, InstallArgs, UpdateArgs};
use crate::error::DepotResult;
use crate::orchestrator::{InstallRequest, UpdateRequest};
use crate::ui::{self, TaskSpinner, UiContext};
use crate::Depot;

/// Execute the install command
pub async fn install(args: InstallArgs, depot: &Depot, json: bool) -> DepotResult<bool> {
    let ctx = UiContext::detect().with_json(json);
    let (plugin_id, version) = parse_plugin_ref(&args.plugin);

    let request = InstallRequest {
        version,
        force: args.force,
        dry_run: args.dry_run,
        allow_scripts: args.allow_scripts,
        expected_checksum: args.checksum,
        ..InstallRequest::new(plugin_id)
    };

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Installing {}...", args.plugin));
    let result = depot.orchestrator.install(request).await;
    finish_spinner(&mut spinner, result.success);

    report_transaction(&ctx, &result)
}

/// Execute the update command
pub async fn update(args: UpdateArgs, depot: &Depot, json: bool) -> DepotResult<bool> {
    let ctx = UiContext::detect().with_json(json);

    let Some(plugin) = args.plugin.filter(|_| !args.all) else {
        return update_all(&ctx, depot, args.dry_run, args.allow_scripts).await;
    };
    let (plugin_id, version) = parse_plugin_ref(&plugin);

    let request = UpdateRequest {
        version,
        dry_run: args.dry_run,
        allow_scripts: args.allow_scripts,
        expected_checksum: args.checksum,
        ..UpdateRequest::new(plugin_id)
    };

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Updating {}...", plugin));
    let result = depot.orchestrator.update(request).await;
    finish_spinner(&mut spinner, result.success);

    report_transaction(&ctx, &result)
}

async fn update_all(
    ctx: &UiContext,
    depot: &Depot,
    dry_run: bool,
    allow_scripts: bool,
) -> DepotResult<bool> {
    let mut spinner = TaskSpinner::new(ctx);
    spinner.start("Checking for updates...");
    let results = depot
        .orchestrator
        .update_outdated(dry_run, allow_scripts)
        .await?;
    spinner.stop(&format!("{} plugin(s) to update", results.len()));

    if ctx.is_json() {
        ui::print_json(&results)?;
        return Ok(results.iter().all(|r| r.success));
    }

    if results.is_empty() {
        ui::step_info(ctx, "Everything is up to date");
        return Ok(true);
    }

    let mut all_ok = true;
    for result in &results {
        all_ok &= report_transaction(ctx, result)?;
    }
    Ok(all_ok)
}

fn finish_spinner(spinner: &mut TaskSpinner, success: bool) {
    if success {
        spinner.stop("Done");
    } else {
        spinner.stop_error("Failed");
    }
}
