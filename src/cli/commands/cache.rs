//! Cache command - inspect and maintain the artifact cache

use super::report_eviction;
use crate::cache::{
    format_bytes, CacheSizeStatus, EvictionOptions, IntegrityIssue, IntegrityProblem,
};
use crate::cli::args::{CacheAction, CacheArgs};
use crate::error::DepotResult;
use crate::ui::{self, UiContext};
use crate::Depot;
use chrono::Duration;
use serde_json::json;

/// Execute the cache command
pub async fn execute(args: CacheArgs, depot: &Depot, json: bool) -> DepotResult<bool> {
    let ctx = UiContext::detect().with_json(json);

    match args.action {
        CacheAction::Stats => stats(&ctx, depot).await,
        CacheAction::Evict {
            max_size_mb,
            max_versions,
            dry_run,
        } => {
            let options = EvictionOptions {
                max_size_bytes: max_size_mb.map(|mb| mb * 1_000_000),
                max_versions_per_plugin: max_versions,
                dry_run,
            };
            let result = depot.cache.evict_cache(&options).await?;
            if ctx.is_json() {
                ui::print_json(&result)?;
            } else {
                report_eviction(&ctx, &result);
            }
            Ok(true)
        }
        CacheAction::Cleanup { max_age_hours } => {
            let removed = depot
                .cache
                .cleanup_orphaned_temp(max_age_hours.map(Duration::hours))
                .await?;
            if ctx.is_json() {
                ui::print_json(&removed)?;
            } else if removed.is_empty() {
                ui::step_info(&ctx, "No orphaned workspaces");
            } else {
                for orphan in &removed {
                    ui::step_ok_detail(
                        &ctx,
                        &format!("Removed {}", orphan.path.display()),
                        &format_bytes(orphan.size_bytes),
                    );
                }
            }
            Ok(true)
        }
        CacheAction::Rebuild => {
            let report = depot.cache.rebuild_index().await?;
            if ctx.is_json() {
                ui::print_json(&report)?;
                return Ok(true);
            }
            if report.previous_unreadable {
                ui::step_warn(&ctx, "Previous index was unreadable, metadata was reset");
            }
            for key in &report.added {
                ui::step_info(&ctx, &format!("Indexed {}", key));
            }
            for key in &report.dropped {
                ui::step_warn(&ctx, &format!("Dropped {} (no directory on disk)", key));
            }
            ui::outro_success(
                &ctx,
                &format!(
                    "{} entries, {}",
                    report.entries,
                    format_bytes(report.total_size_bytes)
                ),
            );
            Ok(true)
        }
        CacheAction::Validate { repair } => validate(&ctx, depot, repair).await,
    }
}

async fn stats(ctx: &UiContext, depot: &Depot) -> DepotResult<bool> {
    let stats = depot.cache.stats().await?;
    if ctx.is_json() {
        ui::print_json(&stats)?;
        return Ok(true);
    }

    ui::intro(ctx, "Cache");
    ui::key_value(ctx, "Location", &depot.layout.cache_dir().display().to_string());
    ui::key_value_status(
        ctx,
        "Usage",
        &format!(
            "{} / {} ({:.1}%, {})",
            format_bytes(stats.total_size_bytes),
            format_bytes(stats.max_size_bytes),
            stats.usage_percent,
            stats.status
        ),
        stats.status == CacheSizeStatus::Ok,
    );
    ui::key_value(ctx, "Entries", &stats.entry_count.to_string());
    ui::key_value(ctx, "Plugins", &stats.plugin_count.to_string());
    ui::key_value(ctx, "Pinned", &stats.pinned_count.to_string());
    if let Some(last) = &stats.last_eviction {
        ui::key_value(
            ctx,
            "Last eviction",
            &format!("{} ({})", last.timestamp.format("%Y-%m-%d %H:%M"), last.reason),
        );
    }
    Ok(true)
}

async fn validate(ctx: &UiContext, depot: &Depot, repair: bool) -> DepotResult<bool> {
    let issues = depot.cache.validate_integrity().await?;
    let repaired = if repair && !issues.is_empty() {
        Some(depot.cache.repair_corruption(&issues).await?)
    } else {
        None
    };

    if ctx.is_json() {
        ui::print_json(&json!({ "issues": issues, "repair": repaired }))?;
        return Ok(issues.is_empty() || repaired.is_some());
    }

    if issues.is_empty() {
        ui::step_ok(ctx, "All cache entries verified");
        return Ok(true);
    }
    for issue in &issues {
        ui::step_error_detail(
            ctx,
            &format!("{}@{}", issue.plugin_id, issue.version),
            &describe(issue),
        );
    }
    match &repaired {
        Some(result) => report_eviction(ctx, result),
        None => ui::remark(ctx, "Run with --repair to evict corrupted entries"),
    }
    Ok(repaired.is_some())
}

fn describe(issue: &IntegrityIssue) -> String {
    match &issue.problem {
        IntegrityProblem::Missing => format!("{} is missing", issue.path.display()),
        IntegrityProblem::ChecksumMismatch { expected, actual } => {
            format!("checksum {} does not match recorded {}", actual, expected)
        }
        IntegrityProblem::Unreadable { reason } => format!("unreadable: {}", reason),
    }
}
