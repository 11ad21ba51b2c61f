//! Progress indicators with CI fallback

use super::context::UiContext;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<ProgressBar>,
    interactive: bool,
    quiet: bool,
}

impl TaskSpinner {
    /// Create a spinner; nothing is shown until [`start`](Self::start)
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
            quiet: ctx.is_json(),
        }
    }

    /// Start the spinner with a message
    pub fn start(&mut self, message: &str) {
        if self.quiet {
            return;
        }
        if self.interactive {
            let spinner = ProgressBar::new_spinner();
            if let Ok(template) = ProgressStyle::default_spinner().template("  {spinner:.cyan} {msg}")
            {
                spinner.set_style(template.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "));
            }
            spinner.set_message(message.to_string());
            spinner.enable_steady_tick(Duration::from_millis(120));
            self.spinner = Some(spinner);
        } else {
            println!("{} {}", style("...").dim(), message);
        }
    }

    /// Update the spinner message
    pub fn message(&mut self, message: &str) {
        if let Some(ref spinner) = self.spinner {
            spinner.set_message(message.to_string());
        }
    }

    fn finish(&mut self, fancy: String, plain: String) {
        if self.quiet {
            return;
        }
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
        if self.interactive {
            println!("  {}", fancy);
        } else {
            println!("{}", plain);
        }
    }

    /// Stop with success message
    pub fn stop(&mut self, message: &str) {
        self.finish(
            format!("{} {}", style("✓").green(), message),
            format!("{} {}", style("[OK]").green(), message),
        );
    }

    /// Stop with error message
    pub fn stop_error(&mut self, message: &str) {
        self.finish(
            format!("{} {}", style("✗").red(), message),
            format!("{} {}", style("[FAIL]").red(), message),
        );
    }

    /// Stop with warning message
    pub fn stop_warn(&mut self, message: &str) {
        self.finish(
            format!("{} {}", style("!").yellow(), message),
            format!("{} {}", style("[WARN]").yellow(), message),
        );
    }
}
