//! CLI argument parsing for alloctrace

use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::ReportOptions;

#[derive(Parser, Debug)]
#[command(name = "alloctrace")]
#[command(version)]
#[command(about = "Report memory allocation state of traced processes to a collector", long_about = None)]
pub struct Cli {
    /// Attach to running process by PID (mutually exclusive with command)
    #[arg(short = 'p', long = "pid", value_name = "PID")]
    pub pid: Option<i32>,

    /// Collector listening on a unix socket
    #[arg(short = 'u', long = "unix", value_name = "PATH", conflicts_with = "tcp")]
    pub unix: Option<PathBuf>,

    /// Collector listening on a TCP address
    #[arg(short = 't', long = "tcp", value_name = "HOST:PORT")]
    pub tcp: Option<String>,

    /// Maximum number of backtrace addresses per event (0 disables backtraces)
    #[arg(short = 'd', long = "depth", value_name = "DEPTH", default_value = "10")]
    pub depth: u8,

    /// Report C++ operators as their own kinds and capture stacks on free
    #[arg(short = 's', long = "sanity")]
    pub sanity: bool,

    /// Do not intercept mangled C++ operators
    #[arg(short = 'n', long = "nocpp")]
    pub nocpp: bool,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Follow forks (trace child processes)
    #[arg(short = 'f', long = "follow-forks")]
    pub follow: bool,

    /// Follow exec'd programs
    #[arg(short = 'e', long = "follow-exec")]
    pub follow_exec: bool,

    /// Print debug logging to stderr
    #[arg(long = "debug")]
    pub debug: bool,

    /// Command to trace (everything after --)
    #[arg(last = true)]
    pub command: Option<Vec<String>>,
}

impl Cli {
    pub fn report_options(&self) -> ReportOptions {
        ReportOptions::default()
            .with_bt_depth(self.depth)
            .with_sanity(self.sanity)
            .with_nocpp(self.nocpp)
            .with_verbose(self.verbose)
            .with_follow(self.follow, self.follow_exec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_command() {
        let cli = Cli::parse_from(["alloctrace", "-u", "/tmp/c.sock", "--", "echo", "hello"]);
        let cmd = cli.command.unwrap();
        assert_eq!(cmd[0], "echo");
        assert_eq!(cmd[1], "hello");
    }

    #[test]
    fn test_cli_empty_without_command() {
        let cli = Cli::parse_from(["alloctrace"]);
        assert!(cli.command.is_none());
        assert!(cli.pid.is_none());
    }

    #[test]
    fn test_cli_depth_default() {
        let cli = Cli::parse_from(["alloctrace", "-p", "1"]);
        assert_eq!(cli.depth, 10);
        assert_eq!(cli.pid, Some(1));
    }

    #[test]
    fn test_cli_depth_out_of_range() {
        assert!(Cli::try_parse_from(["alloctrace", "-d", "256"]).is_err());
    }

    #[test]
    fn test_cli_unix_and_tcp_conflict() {
        assert!(Cli::try_parse_from(["alloctrace", "-u", "/tmp/a", "-t", "127.0.0.1:1"]).is_err());
    }

    #[test]
    fn test_cli_report_options() {
        let cli = Cli::parse_from(["alloctrace", "-d", "4", "-s", "-n", "-vv", "-f"]);
        let options = cli.report_options();
        assert_eq!(options.bt_depth, 4);
        assert!(options.sanity);
        assert!(options.nocpp);
        assert_eq!(options.verbose, 2);
        assert!(options.follow);
        assert!(!options.follow_exec);
    }
}
