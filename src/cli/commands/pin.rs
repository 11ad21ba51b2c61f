//! Pin and unpin commands

use crate::cli::args::PluginArgs;
use crate::error::DepotResult;
use crate::pin::PinResult;
use crate::ui::{self, UiContext};
use crate::Depot;

/// Execute the pin command
pub async fn pin(args: PluginArgs, depot: &Depot, json: bool) -> DepotResult<bool> {
    let result = depot.pins.pin_plugin(&args.plugin).await?;
    report(&result, json)
}

/// Execute the unpin command
pub async fn unpin(args: PluginArgs, depot: &Depot, json: bool) -> DepotResult<bool> {
    let result = depot.pins.unpin_plugin(&args.plugin).await?;
    report(&result, json)
}

fn report(result: &PinResult, json: bool) -> DepotResult<bool> {
    let ctx = UiContext::detect().with_json(json);
    if ctx.is_json() {
        ui::print_json(result)?;
        return Ok(true);
    }

    let subject = match &result.version {
        Some(version) => format!("{}@{}", result.plugin_id, version),
        None => result.plugin_id.clone(),
    };
    let verb = if result.pinned { "Pinned" } else { "Unpinned" };
    if result.was_no_op {
        ui::step_info(&ctx, &format!("{} already {}", subject, verb.to_lowercase()));
    } else {
        ui::step_ok(&ctx, &format!("{} {}", verb, subject));
    }
    Ok(true)
}
