//! Uninstall command

use super::report_transaction;
use crate::cli::args::UninstallArgs;
use crate::error::DepotResult;
use crate::orchestrator::{CacheRetention, UninstallRequest};
use crate::ui::{TaskSpinner, UiContext};
use crate::Depot;

/// Execute the uninstall command
pub async fn execute(args: UninstallArgs, depot: &Depot, json: bool) -> DepotResult<bool> {
    let ctx = UiContext::detect().with_json(json);
    let retention = if args.evict {
        CacheRetention::Evict
    } else {
        CacheRetention::Keep
    };

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Uninstalling {}...", args.plugin));
    let result = depot
        .orchestrator
        .uninstall(UninstallRequest {
            retention,
            force: args.force,
            dry_run: args.dry_run,
            allow_scripts: args.allow_scripts,
            ..UninstallRequest::new(args.plugin)
        })
        .await;
    if result.success {
        spinner.stop("Done");
    } else {
        spinner.stop_error("Failed");
    }

    report_transaction(&ctx, &result)
}
