//! Rollback command - re-activate a cached version

use super::report_transaction;
use crate::cli::args::RollbackArgs;
use crate::error::DepotResult;
use crate::orchestrator::RollbackRequest;
use crate::ui::UiContext;
use crate::Depot;

/// Execute the rollback command
pub async fn execute(args: RollbackArgs, depot: &Depot, json: bool) -> DepotResult<bool> {
    let ctx = UiContext::detect().with_json(json);
    let request = RollbackRequest {
        dry_run: args.dry_run,
        ..RollbackRequest::new(args.plugin, args.target)
    };
    let result = depot.orchestrator.rollback(request).await;
    report_transaction(&ctx, &result)
}
