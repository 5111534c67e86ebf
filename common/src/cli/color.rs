//! Color policy for log output.
//!
//! - An explicit `always`/`never` wins.
//! - `NO_COLOR` or `EMACS` in the environment disable color in `auto`.
//! - Otherwise `auto` colors only when the stream is a TTY.

use std::env;

/// When to emit ANSI colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorWhen {
    /// Enable colors only when output is a TTY.
    Auto,

    /// Always enable colors.
    Always,

    /// Never enable colors.
    Never,
}

impl ColorWhen {
    // ---
    /// Returns whether ANSI color should be used on stderr, where logs go.
    pub fn should_color_stderr(self) -> bool {
        // ---
        self.resolve(
            env::var_os("NO_COLOR").is_some() || env::var_os("EMACS").is_some(),
            atty::is(atty::Stream::Stderr),
        )
    }

    fn resolve(self, env_disables: bool, is_tty: bool) -> bool {
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => !env_disables && is_tty,
        }
    }
}
