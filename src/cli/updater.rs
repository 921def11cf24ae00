//! Logic for the hidden `updater` subcommand.

use crate::config;
use crate::ignored_versions::IgnoredVersions;
use crate::update::{DEFAULT_SERVICE_WAIT_TIMEOUT_SECS, DEFAULT_WATCHDOG_PERIOD_SECS};
use crate::updater::{self, ExcludePatterns, SystemdService, UpdaterConfig, UpdaterExitCode};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// File-replacement worker arguments, as passed by the agent.
///
/// Everything the updater needs travels on the command line: it must not
/// depend on in-memory agent state, and the agent is gone by the time the
/// interesting work happens.
#[derive(Debug, Args)]
pub(crate) struct Cmd {
    /// PID of the agent process being replaced.
    #[arg(long)]
    pid: u32,

    /// Version being replaced.
    #[arg(long)]
    old_version: String,

    /// Version being installed.
    #[arg(long)]
    new_version: String,

    /// Extracted package tree.
    #[arg(long)]
    source_path: PathBuf,

    /// Live installation directory.
    #[arg(long)]
    install_dir: PathBuf,

    /// Agent state directory.
    #[arg(long)]
    data_dir: PathBuf,

    /// Managed service unit name.
    #[arg(long, default_value = "outpost.service")]
    service_name: String,

    /// Bound for service stop/start waits, in seconds.
    #[arg(long, default_value_t = DEFAULT_SERVICE_WAIT_TIMEOUT_SECS)]
    service_wait_timeout: u64,

    /// Post-start health watch duration, in seconds.
    #[arg(long, default_value_t = DEFAULT_WATCHDOG_PERIOD_SECS)]
    watchdog_period: u64,
}

impl Cmd {
    /// Updater subcommand entry point; returns the process exit code.
    pub(crate) fn run(self) -> i32 {
        let cfg = UpdaterConfig {
            agent_pid: self.pid,
            old_version: self.old_version,
            new_version: self.new_version,
            source_path: self.source_path,
            install_dir: self.install_dir,
            data_dir: self.data_dir,
            service_name: self.service_name.clone(),
            service_wait_timeout: Duration::from_secs(self.service_wait_timeout),
            watchdog_period: Duration::from_secs(self.watchdog_period),
            poll_interval: updater::DEFAULT_POLL_INTERVAL,
        };

        // Exclude patterns come from the regular config tree, which lives
        // outside the install directory being replaced.
        let excludes = match config::Settings::assemble() {
            Ok(settings) => ExcludePatterns::parse(&settings.updates.exclude),
            Err(e) => {
                log::warn!("no usable configuration, deploying without excludes: {:#}", e);
                ExcludePatterns::default()
            }
        };

        let ignored = match IgnoredVersions::load(&cfg.data_dir) {
            Ok(store) => store,
            Err(e) => {
                log::error!("cannot open ignored-versions store: {:#}", e);
                return UpdaterExitCode::GeneralError.code();
            }
        };

        let service = SystemdService::new(&self.service_name);
        updater::run(&cfg, &excludes, &service, &ignored).code()
    }
}
