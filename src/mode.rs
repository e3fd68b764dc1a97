//! Live/preview execution mode.
//!
//! `--dry-run` runs the full decision logic but suppresses every mutating
//! boundary: remote calls that would change the server, file writes, staging,
//! commits, tag moves, and note writes. Each of those sites checks the mode
//! explicitly instead of being wrapped generically.

/// Execution mode threaded through the engine, repository, and transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Perform all mutations.
    Live,
    /// Log what would happen, mutate nothing.
    Preview,
}

impl Mode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            Mode::Preview
        } else {
            Mode::Live
        }
    }

    /// True when mutations must be suppressed.
    pub fn is_preview(self) -> bool {
        self == Mode::Preview
    }
}
