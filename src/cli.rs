//! Argument surface (§9). Out-of-core per spec.md but contracted: a
//! `--config` flag plus `--status` / `--list-symbols` / `--daemon` actions
//! and the exit-code convention (0 success, 1 configuration error, 2
//! signal-interrupted termination).
//!
//! Grounded on the teacher's `clap::Parser`/`Subcommand` surface in
//! `cli.rs`, pruned to this contract.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "binance-ingest")]
#[command(version, about = "Local order-book sync and market-data recorder", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Configuration file or config/ directory path.
    #[arg(short, long, default_value = "config/default.toml", global = true)]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the ingestion pipeline in the foreground (the default action).
    Run,
    /// Print the active mode's configuration summary and exit.
    Status,
    /// List the symbols configured for the active mode and exit.
    ListSymbols,
    /// Control the background daemon.
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand)]
pub enum DaemonAction {
    Start,
    Stop,
    Restart,
    Status,
}

/// Process exit codes (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    ConfigError = 1,
    SignalInterrupted = 2,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(ExitCode::Success as i32, 0);
        assert_eq!(ExitCode::ConfigError as i32, 1);
        assert_eq!(ExitCode::SignalInterrupted as i32, 2);
    }
}
