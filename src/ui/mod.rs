//! Terminal output for the depot CLI
//!
//! Human-readable output uses `console` styling, with a spinner from
//! `indicatif` while a transaction runs. Both fall back to plain lines in
//! CI and non-interactive environments, and stay silent under `--json`.

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{
    intro, key_value, key_value_status, outro_error, outro_success, outro_warn, print_json,
    remark, section, step_error, step_error_detail, step_info, step_ok, step_ok_detail,
    step_skipped, step_warn, step_warn_hint,
};
pub use progress::TaskSpinner;
