//! Output mode for the current invocation

/// Decides between decorated, plain and JSON output
#[derive(Debug, Clone, Copy)]
pub struct UiContext {
    /// Attended terminal outside CI
    fancy: bool,
    /// `--json` was passed; human-readable output is suppressed
    json: bool,
}

impl UiContext {
    /// Detect the current environment
    pub fn detect() -> Self {
        Self {
            fancy: console::user_attended() && std::env::var_os("CI").is_none(),
            json: false,
        }
    }

    /// Plain line output regardless of the terminal
    #[cfg(test)]
    pub fn plain() -> Self {
        Self {
            fancy: false,
            json: false,
        }
    }

    /// Switch to machine-readable output
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    /// Spinners and box-drawing glyphs
    pub fn use_fancy_output(&self) -> bool {
        self.fancy && !self.json
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_context() {
        let ctx = UiContext::plain();
        assert!(!ctx.use_fancy_output());
        assert!(!ctx.is_json());
    }

    #[test]
    fn json_disables_fancy_output() {
        let ctx = UiContext {
            fancy: true,
            json: false,
        };
        assert!(ctx.use_fancy_output());
        assert!(!ctx.with_json(true).use_fancy_output());
    }
}
