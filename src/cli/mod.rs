//! Command-Line Interface (CLI) logic.

mod agent;
mod configure;
mod updater;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::LevelFilter;

/// CLI configuration options.
#[derive(Debug, Parser)]
#[command(name = "outpost", about = "Endpoint management agent", version)]
pub(crate) struct CliOptions {
    /// Verbosity level (higher is more verbose).
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    verbosity: u8,

    /// CLI sub-command; without one the agent runs as a service.
    #[command(subcommand)]
    pub(crate) cmd: Option<CliCommand>,
}

impl CliOptions {
    /// Returns the log-level set via command-line flags.
    pub(crate) fn loglevel(&self) -> LevelFilter {
        let level = match self.verbosity {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Foreground debugging raises the floor to console-friendly output.
        if matches!(self.cmd, Some(CliCommand::Debug)) && level < LevelFilter::Debug {
            LevelFilter::Debug
        } else {
            level
        }
    }

    /// Dispatch CLI subcommand; returns the process exit code.
    pub(crate) fn run(self) -> Result<i32> {
        match self.cmd {
            None => agent::run_agent().map(|_| libc::EXIT_SUCCESS),
            Some(CliCommand::Debug) => agent::run_agent().map(|_| libc::EXIT_SUCCESS),
            Some(CliCommand::Configure(cmd)) => cmd.run().map(|_| libc::EXIT_SUCCESS),
            Some(CliCommand::Updater(cmd)) => Ok(cmd.run()),
        }
    }
}

/// CLI sub-commands.
#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// First-time registration with the control plane.
    Configure(configure::Cmd),
    /// Run in the foreground with console logging.
    Debug,
    /// File-replacement worker, spawned by the agent during self-updates.
    #[command(hide = true)]
    Updater(updater::Cmd),
}
