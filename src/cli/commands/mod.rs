//! CLI command implementations
//!
//! Handlers return `Ok(false)` when the operation ran but did not succeed, so
//! the binary can exit non-zero after printing a structured result.

pub mod cache;
pub mod config;
pub mod install;
pub mod list;
pub mod pin;
pub mod registry;
pub mod rollback;
pub mod uninstall;
pub mod verify;

pub use cache::execute as cache;
pub use config::execute as config;
pub use install::{install, update};
pub use list::{list, outdated};
pub use pin::{pin, unpin};
pub use registry::execute as registry;
pub use rollback::execute as rollback;
pub use uninstall::execute as uninstall;
pub use verify::{verify, versions};

use crate::cache::{format_bytes, EvictionResult};
use crate::error::DepotResult;
use crate::orchestrator::{PhaseStatus, TransactionResult};
use crate::ui::{self, UiContext};

/// Print a transaction result; returns its success flag
pub(crate) fn report_transaction(ctx: &UiContext, result: &TransactionResult) -> DepotResult<bool> {
    if ctx.is_json() {
        ui::print_json(result)?;
        return Ok(result.success);
    }

    let subject = match &result.version {
        Some(version) => format!("{}@{}", result.plugin_id, version),
        None => result.plugin_id.clone(),
    };
    ui::intro(ctx, &format!("{} {}", result.operation, subject));

    if let Some(preview) = &result.preview {
        ui::section(ctx, "Dry run");
        for phase in &preview.phases {
            ui::step_info(ctx, phase.name());
        }
        for note in &preview.notes {
            ui::remark(ctx, note);
        }
    } else {
        for report in &result.phases {
            let label = format!("{} ({} ms)", report.phase, report.duration_ms);
            match report.status {
                PhaseStatus::Completed => match &report.message {
                    Some(message) => ui::step_ok_detail(ctx, &label, message),
                    None => ui::step_ok(ctx, &label),
                },
                PhaseStatus::Failed => ui::step_error(ctx, &label),
                PhaseStatus::Skipped => ui::step_skipped(ctx, report.phase.name()),
            }
        }
    }

    if let Some(update) = &result.update {
        for added in &update.permissions.added {
            ui::step_warn(ctx, &format!("new permission: {}", added));
        }
        for removed in &update.permissions.removed {
            ui::remark(ctx, &format!("dropped permission: {}", removed));
        }
    }

    if let Some(eviction) = &result.eviction {
        report_eviction(ctx, eviction);
    }

    for warning in &result.warnings {
        ui::step_warn(ctx, warning);
    }

    if !result.compensations.is_empty() {
        ui::section(ctx, "Rolled back");
        for compensation in &result.compensations {
            match (&compensation.detail, compensation.succeeded) {
                (_, true) => ui::step_ok(ctx, &compensation.action),
                (Some(detail), false) => ui::step_error_detail(ctx, &compensation.action, detail),
                (None, false) => ui::step_error(ctx, &compensation.action),
            }
        }
    }

    match &result.error {
        Some(error) => {
            ui::outro_error(
                ctx,
                &format!("{} [{}]: {}", error.phase_code, error.code, error.message),
            );
            if let Some(hint) = &error.hint {
                ui::remark(ctx, hint);
            }
        }
        None if !result.warnings.is_empty() => ui::outro_warn(
            ctx,
            &format!(
                "{} {} in {} ms with {} warning(s)",
                result.operation,
                subject,
                result.duration_ms,
                result.warnings.len()
            ),
        ),
        None => ui::outro_success(
            ctx,
            &format!("{} {} in {} ms", result.operation, subject, result.duration_ms),
        ),
    }
    Ok(result.success)
}

/// Print what an eviction pass removed and protected
pub(crate) fn report_eviction(ctx: &UiContext, eviction: &EvictionResult) {
    if !eviction.triggered {
        ui::step_info(ctx, "Cache within limits, nothing evicted");
        return;
    }
    let verb = if eviction.dry_run { "Would evict" } else { "Evicted" };
    for entry in &eviction.evicted {
        ui::step_info(
            ctx,
            &format!(
                "{} {}@{} ({}, {})",
                verb,
                entry.plugin_id,
                entry.version,
                format_bytes(entry.size_bytes),
                entry.reason
            ),
        );
    }
    for entry in &eviction.protected {
        ui::remark(
            ctx,
            &format!("kept {}@{} ({})", entry.plugin_id, entry.version, entry.reason),
        );
    }
    ui::key_value(
        ctx,
        "Freed",
        &format!(
            "{} ({} -> {})",
            format_bytes(eviction.bytes_freed),
            format_bytes(eviction.total_before),
            format_bytes(eviction.total_after)
        ),
    );
}
