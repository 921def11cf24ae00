//! Endpoint management agent.

#![deny(missing_debug_implementations)]
#![deny(missing_docs)]

#[macro_use]
extern crate prometheus;

mod cli;
/// Remote command model and handlers.
mod commands;
/// File-based configuration.
mod config;
/// Control-plane HTTP client.
mod control_plane;
/// Agent identity.
mod identity;
/// Persisted set of update versions to skip.
mod ignored_versions;
/// Metrics service.
mod metrics;
/// Command pipeline.
mod pipeline;
/// Control-plane session.
mod session;
/// Host telemetry reporting.
mod telemetry;
/// Self-update orchestration.
mod update;
/// Updater process.
mod updater;
mod utils;

use clap::Parser;

/// Binary entrypoint, for all CLI subcommands.
fn main() {
    let exit_code = run();
    std::process::exit(exit_code);
}

/// Run till completion or failure, pretty-printing termination errors if any.
fn run() -> i32 {
    // Parse command-line options.
    let cli_opts = cli::CliOptions::parse();

    // Setup logging.
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .format_module_path(false)
        .filter(Some(clap::crate_name!()), cli_opts.loglevel())
        .init();

    // Dispatch CLI subcommand.
    match cli_opts.run() {
        Ok(code) => code,
        Err(e) => {
            log_error_chain(e);
            libc::EXIT_FAILURE
        }
    }
}

/// Pretty-print a chain of errors, as a series of error-priority log messages.
fn log_error_chain(err_chain: anyhow::Error) {
    let mut chain_iter = err_chain.chain();
    let top_err = match chain_iter.next() {
        Some(e) => e.to_string(),
        None => "(unspecified failure)".to_string(),
    };
    log::error!("critical error: {}", top_err);
    for err in chain_iter {
        log::error!(" -> {}", err);
    }
}
