//! Reporting options
//!
//! Mirrors the tracer's command line: how deep to capture backtraces and
//! which optional behaviours the collector should know about.

use crate::protocol::{MODE_FOLLOW_EXEC, MODE_FOLLOW_FORK, MODE_VERBOSE};

/// Controls how allocation events are captured and reported
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportOptions {
    /// Maximum number of call-stack addresses per event (0 = no backtrace)
    pub bt_depth: u8,
    /// Report ABI specific operations and capture stacks for deallocations
    pub sanity: bool,
    /// Ignore mangled C++ operators
    pub nocpp: bool,
    /// Verbosity level
    pub verbose: u8,
    /// Follow forked children
    pub follow: bool,
    /// Follow exec'd programs
    pub follow_exec: bool,
}

impl ReportOptions {
    /// Builder-style helper to adjust the backtrace depth.
    #[must_use]
    pub fn with_bt_depth(mut self, depth: u8) -> Self {
        self.bt_depth = depth;
        self
    }

    #[must_use]
    pub fn with_sanity(mut self, sanity: bool) -> Self {
        self.sanity = sanity;
        self
    }

    #[must_use]
    pub fn with_nocpp(mut self, nocpp: bool) -> Self {
        self.nocpp = nocpp;
        self
    }

    #[must_use]
    pub fn with_verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    #[must_use]
    pub fn with_follow(mut self, follow: bool, follow_exec: bool) -> Self {
        self.follow = follow;
        self.follow_exec = follow_exec;
        self
    }

    /// Mode bits of the info record
    pub fn mode(&self) -> u8 {
        let mut mode = 0;
        if self.verbose > 0 {
            mode |= MODE_VERBOSE;
        }
        if self.follow_exec {
            mode |= MODE_FOLLOW_EXEC;
        }
        if self.follow {
            mode |= MODE_FOLLOW_FORK;
        }
        mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_no_backtrace() {
        let options = ReportOptions::default();
        assert_eq!(options.bt_depth, 0);
        assert!(!options.sanity);
        assert_eq!(options.mode(), 0);
    }

    #[test]
    fn test_mode_bits() {
        let options = ReportOptions::default()
            .with_verbose(1)
            .with_follow(true, true);
        assert_eq!(options.mode(), MODE_VERBOSE | MODE_FOLLOW_EXEC | MODE_FOLLOW_FORK);

        let options = ReportOptions::default().with_follow(true, false);
        assert_eq!(options.mode(), MODE_FOLLOW_FORK);
    }
}
