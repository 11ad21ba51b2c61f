//! Output functions for consistent CLI formatting

use super::context::UiContext;
use crate::error::DepotResult;
use console::{style, Style};
use serde::Serialize;

/// Print any serializable result as pretty JSON on stdout
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> DepotResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Display intro banner
pub fn intro(ctx: &UiContext, title: &str) {
    if ctx.is_json() {
        return;
    }
    if ctx.use_fancy_output() {
        println!("{} {}", style("┌").dim(), style(title).cyan().bold());
    } else {
        println!("{}", style(title).cyan().bold());
    }
    println!();
}

fn outro(ctx: &UiContext, tag: &str, tag_style: Style, message: &str) {
    if ctx.is_json() {
        return;
    }
    println!();
    if ctx.use_fancy_output() {
        println!("{} {}", style("└").dim(), tag_style.bold().apply_to(message));
    } else {
        println!("{} {}", tag_style.apply_to(tag), message);
    }
}

/// Display success outro
pub fn outro_success(ctx: &UiContext, message: &str) {
    outro(ctx, "[OK]", Style::new().green(), message);
}

/// Display error outro
pub fn outro_error(ctx: &UiContext, message: &str) {
    outro(ctx, "[ERROR]", Style::new().red(), message);
}

/// Display warning outro
pub fn outro_warn(ctx: &UiContext, message: &str) {
    outro(ctx, "[WARN]", Style::new().yellow(), message);
}

/// Display a section header
pub fn section(ctx: &UiContext, title: &str) {
    if ctx.is_json() {
        return;
    }
    println!();
    println!("{}", style(title).bold());
}

fn step(ctx: &UiContext, fancy: &str, plain: &str, tag_style: Style, message: &str) {
    if ctx.is_json() {
        return;
    }
    let tag = if ctx.use_fancy_output() { fancy } else { plain };
    println!("  {} {}", tag_style.apply_to(tag), message);
}

/// Display a success step
pub fn step_ok(ctx: &UiContext, message: &str) {
    step(ctx, "✓", "[OK]", Style::new().green(), message);
}

/// Display a success step with detail
pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    step_ok(ctx, &format!("{} ({})", message, style(detail).dim()));
}

/// Display a warning step
pub fn step_warn(ctx: &UiContext, message: &str) {
    step(ctx, "!", "[WARN]", Style::new().yellow(), message);
}

/// Display a warning step with hint
pub fn step_warn_hint(ctx: &UiContext, message: &str, hint: &str) {
    step_warn(ctx, &format!("{} - {}", message, style(hint).dim()));
}

/// Display an error step
pub fn step_error(ctx: &UiContext, message: &str) {
    step(ctx, "✗", "[FAIL]", Style::new().red(), message);
}

/// Display an error step with detail
pub fn step_error_detail(ctx: &UiContext, message: &str, detail: &str) {
    step_error(ctx, &format!("{}: {}", message, style(detail).red()));
}

/// Display an info step
pub fn step_info(ctx: &UiContext, message: &str) {
    step(ctx, "•", "[INFO]", Style::new().cyan(), message);
}

/// Display a phase that never ran
pub fn step_skipped(ctx: &UiContext, message: &str) {
    step(ctx, "-", "[-]", Style::new().dim(), &style(message).dim().to_string());
}

/// Display a remark/hint
pub fn remark(ctx: &UiContext, message: &str) {
    if ctx.is_json() {
        return;
    }
    println!("  {}", style(message).dim());
}

/// Print styled key-value pair
pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    if ctx.is_json() {
        return;
    }
    if ctx.use_fancy_output() {
        println!("  {}: {}", style(key).dim(), value);
    } else {
        println!("  {}: {}", key, value);
    }
}

/// Print styled key-value with status color
pub fn key_value_status(ctx: &UiContext, key: &str, value: &str, ok: bool) {
    if ctx.is_json() {
        return;
    }
    let value_style = if ok {
        Style::new().green()
    } else {
        Style::new().yellow()
    };

    if ctx.use_fancy_output() {
        println!("  {}: {}", style(key).dim(), value_style.apply_to(value));
    } else {
        let prefix = if ok { "[OK]" } else { "[WARN]" };
        println!("  {} {}: {}", prefix, key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_plain() {
        let ctx = UiContext::plain();
        // These should not panic
        intro(&ctx, "Test");
        step_ok(&ctx, "Step completed");
        step_warn_hint(&ctx, "Warning", "try again");
        step_error_detail(&ctx, "Error", "detail");
        step_skipped(&ctx, "Skipped");
        outro_success(&ctx, "Done");
        outro_warn(&ctx, "Done with warnings");
    }

    #[test]
    fn print_json_serializes() {
        assert!(print_json(&serde_json::json!({"ok": true})).is_ok());
    }
}
