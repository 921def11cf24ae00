//! Updater process logic.
//!
//! The updater is a short-lived standalone process launched from the
//! freshly extracted package while the agent shuts down. All context
//! arrives on the command line; neither process trusts in-memory state
//! from the other. It waits for the old agent to stop, snapshots the
//! install directory, swaps in the new tree, restarts the service, and
//! watches it before declaring success; any failure past the backup rolls
//! the install back and blocks the version.

mod files;
mod service;

pub(crate) use files::ExcludePatterns;
pub(crate) use service::{ServiceControl, SystemdService};

use crate::ignored_versions::IgnoredVersions;
use crate::update::UpdateErrorType;
use crate::utils;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Default poll cadence for service status checks.
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Parameters handed over by the agent on the command line.
#[derive(Clone, Debug)]
pub(crate) struct UpdaterConfig {
    /// PID of the agent process being replaced.
    pub(crate) agent_pid: u32,
    /// Version being replaced.
    pub(crate) old_version: String,
    /// Version being installed.
    pub(crate) new_version: String,
    /// Extracted package tree.
    pub(crate) source_path: PathBuf,
    /// Live installation directory.
    pub(crate) install_dir: PathBuf,
    /// Agent state directory.
    pub(crate) data_dir: PathBuf,
    /// Managed service unit name.
    pub(crate) service_name: String,
    /// Bound for service stop/start waits.
    pub(crate) service_wait_timeout: Duration,
    /// Post-start health watch duration.
    pub(crate) watchdog_period: Duration,
    /// Status poll cadence.
    pub(crate) poll_interval: Duration,
}

impl UpdaterConfig {
    /// Snapshot location for the version being replaced.
    fn backup_dir(&self) -> PathBuf {
        self.data_dir
            .join("updates")
            .join("backup")
            .join(&self.old_version)
    }
}

/// Closed set of updater outcomes, mapped to process exit codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UpdaterExitCode {
    Success,
    AgentStopTimeout,
    StopAgentFailed,
    BackupFailed,
    DeployFailed,
    NewServiceStartFailed,
    WatchdogTriggeredRollback,
    RollbackFailed,
    GeneralError,
}

impl UpdaterExitCode {
    /// Process exit status.
    pub(crate) fn code(&self) -> i32 {
        match self {
            UpdaterExitCode::Success => 0,
            UpdaterExitCode::AgentStopTimeout => 1,
            UpdaterExitCode::StopAgentFailed => 2,
            UpdaterExitCode::BackupFailed => 3,
            UpdaterExitCode::DeployFailed => 4,
            UpdaterExitCode::NewServiceStartFailed => 5,
            UpdaterExitCode::WatchdogTriggeredRollback => 6,
            UpdaterExitCode::RollbackFailed => 7,
            UpdaterExitCode::GeneralError => 8,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            UpdaterExitCode::Success => "Success",
            UpdaterExitCode::AgentStopTimeout => "AgentStopTimeout",
            UpdaterExitCode::StopAgentFailed => "StopAgentFailed",
            UpdaterExitCode::BackupFailed => "BackupFailed",
            UpdaterExitCode::DeployFailed => "DeployFailed",
            UpdaterExitCode::NewServiceStartFailed => "NewServiceStartFailed",
            UpdaterExitCode::WatchdogTriggeredRollback => "WatchdogTriggeredRollback",
            UpdaterExitCode::RollbackFailed => "RollbackFailed",
            UpdaterExitCode::GeneralError => "GeneralError",
        }
    }
}

impl std::fmt::Display for UpdaterExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State machine for the updater.
#[derive(Clone, Debug, PartialEq, Eq)]
enum UpdaterState {
    /// Waiting for the old agent to stop.
    Waiting,
    /// Snapshotting the install directory.
    Backing,
    /// Swapping in the new tree.
    Deploying,
    /// Starting the new service.
    Starting,
    /// Watching the new service stay up.
    Watching,
    /// Restoring the backup after a failure.
    Rolling,
    /// Removing the snapshot and the staged tree.
    Cleanup,
}

impl UpdaterState {
    /// Transition to the Backing state.
    fn backing(&mut self) {
        let target = UpdaterState::Backing;
        // Allowed starting states.
        assert!(
            *self == UpdaterState::Waiting,
            "transition not allowed: {:?} to {:?}",
            self,
            target,
        );

        *self = target;
    }

    /// Transition to the Deploying state.
    fn deploying(&mut self) {
        let target = UpdaterState::Deploying;
        // Allowed starting states.
        assert!(
            *self == UpdaterState::Backing,
            "transition not allowed: {:?} to {:?}",
            self,
            target,
        );

        *self = target;
    }

    /// Transition to the Starting state.
    fn starting(&mut self) {
        let target = UpdaterState::Starting;
        // Allowed starting states.
        assert!(
            *self == UpdaterState::Deploying,
            "transition not allowed: {:?} to {:?}",
            self,
            target,
        );

        *self = target;
    }

    /// Transition to the Watching state.
    fn watching(&mut self) {
        let target = UpdaterState::Watching;
        // Allowed starting states.
        assert!(
            *self == UpdaterState::Starting,
            "transition not allowed: {:?} to {:?}",
            self,
            target,
        );

        *self = target;
    }

    /// Transition to the Rolling state.
    fn rolling(&mut self) {
        let target = UpdaterState::Rolling;
        // Allowed starting states.
        assert!(
            matches!(
                self,
                UpdaterState::Deploying | UpdaterState::Starting | UpdaterState::Watching
            ),
            "transition not allowed: {:?} to {:?}",
            self,
            target,
        );

        *self = target;
    }

    /// Transition to the Cleanup state.
    fn cleanup(&mut self) {
        let target = UpdaterState::Cleanup;
        // Allowed starting states.
        assert!(
            *self == UpdaterState::Watching,
            "transition not allowed: {:?} to {:?}",
            self,
            target,
        );

        *self = target;
    }
}

/// Drive the update to completion; never panics on operational failures.
pub(crate) fn run(
    cfg: &UpdaterConfig,
    excludes: &ExcludePatterns,
    service: &dyn ServiceControl,
    ignored: &IgnoredVersions,
) -> UpdaterExitCode {
    log::info!(
        "replacing {} with {} in '{}'",
        cfg.old_version,
        cfg.new_version,
        cfg.install_dir.display()
    );
    let mut state = UpdaterState::Waiting;

    if let Err(exit) = wait_for_agent_stop(cfg, service) {
        return fail(cfg, ignored, exit, "old agent did not stop");
    }

    state.backing();
    let backup_dir = cfg.backup_dir();
    if let Err(e) = files::backup(&cfg.install_dir, &backup_dir) {
        return fail(
            cfg,
            ignored,
            UpdaterExitCode::BackupFailed,
            &format!("{:#}", e),
        );
    }

    state.deploying();
    let deployed = files::stage(&cfg.source_path, &cfg.install_dir, excludes)
        .and_then(|staged| files::swap(&staged, &cfg.install_dir));
    if let Err(e) = deployed {
        log::error!("deploy failed: {:#}", e);
        state.rolling();
        return rollback(cfg, service, ignored, UpdaterExitCode::DeployFailed);
    }

    state.starting();
    if let Err(e) = start_and_wait(cfg, service) {
        log::error!("new agent service failed to start: {:#}", e);
        state.rolling();
        return rollback(cfg, service, ignored, UpdaterExitCode::NewServiceStartFailed);
    }

    state.watching();
    if let Err(e) = watchdog(cfg, service) {
        log::error!("{:#}", e);
        state.rolling();
        return rollback(cfg, service, ignored, UpdaterExitCode::WatchdogTriggeredRollback);
    }

    state.cleanup();
    if let Err(e) = std::fs::remove_dir_all(&backup_dir) {
        log::warn!("failed to remove backup: {}", e);
    }
    if let Err(e) = std::fs::remove_dir_all(&cfg.source_path) {
        log::warn!("failed to remove staged package: {}", e);
    }

    log::info!("update to {} complete", cfg.new_version);
    UpdaterExitCode::Success
}

fn agent_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Stop the managed service, then wait for the agent PID to exit.
///
/// After the timeout a forced kill is attempted through the service
/// manager; only when the process survives that too does the updater give
/// up.
fn wait_for_agent_stop(
    cfg: &UpdaterConfig,
    service: &dyn ServiceControl,
) -> Result<(), UpdaterExitCode> {
    if let Err(e) = service.stop() {
        // The agent may be stopping itself already; the PID wait decides.
        log::warn!("service stop request failed: {:#}", e);
    }

    let deadline = Instant::now() + cfg.service_wait_timeout;
    while agent_alive(cfg.agent_pid) {
        if Instant::now() >= deadline {
            log::warn!(
                "agent pid {} still alive after {:?}, forcing",
                cfg.agent_pid,
                cfg.service_wait_timeout
            );
            if let Err(e) = service.kill() {
                log::error!("forced kill failed: {:#}", e);
                return Err(UpdaterExitCode::StopAgentFailed);
            }
            std::thread::sleep(cfg.poll_interval);
            if agent_alive(cfg.agent_pid) {
                return Err(UpdaterExitCode::AgentStopTimeout);
            }
            break;
        }
        std::thread::sleep(cfg.poll_interval);
    }

    log::info!("old agent stopped");
    Ok(())
}

/// Start the service and wait for it to report running.
fn start_and_wait(cfg: &UpdaterConfig, service: &dyn ServiceControl) -> Result<()> {
    service
        .start()
        .with_context(|| format!("failed to start '{}'", cfg.service_name))?;

    let deadline = Instant::now() + cfg.service_wait_timeout;
    loop {
        if service.is_running().context("service status check failed")? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!(
                "'{}' not running after {:?}",
                cfg.service_name,
                cfg.service_wait_timeout
            );
        }
        std::thread::sleep(cfg.poll_interval);
    }
}

/// Watch the freshly started service for the configured period.
fn watchdog(cfg: &UpdaterConfig, service: &dyn ServiceControl) -> Result<()> {
    let deadline = Instant::now() + cfg.watchdog_period;
    while Instant::now() < deadline {
        std::thread::sleep(cfg.poll_interval);
        match service.is_running() {
            Ok(true) => {}
            Ok(false) => bail!("service stopped within the watchdog window"),
            Err(e) => bail!("service status check failed during watchdog: {:#}", e),
        }
    }

    log::info!(
        "service stayed up for {:?}, update looks healthy",
        cfg.watchdog_period
    );
    Ok(())
}

/// Restore the backup and restart the old agent.
///
/// The target version is blocked regardless of the rollback outcome.
fn rollback(
    cfg: &UpdaterConfig,
    service: &dyn ServiceControl,
    ignored: &IgnoredVersions,
    cause: UpdaterExitCode,
) -> UpdaterExitCode {
    record_ignored(cfg, ignored);
    log::warn!("rolling back to {}", cfg.old_version);

    if let Err(e) = service.stop() {
        log::warn!("failed to stop replacement service: {:#}", e);
    }

    let exit = match files::restore(&cfg.backup_dir(), &cfg.install_dir) {
        Ok(()) => match service.start() {
            Ok(()) => {
                log::info!("rollback to {} complete", cfg.old_version);
                cause
            }
            Err(e) => {
                log::error!("restored files but failed to start old agent: {:#}", e);
                UpdaterExitCode::RollbackFailed
            }
        },
        Err(e) => {
            log::error!("failed to restore backup: {:#}", e);
            UpdaterExitCode::RollbackFailed
        }
    };

    report_failure(cfg, exit, "rollback after failed update");
    exit
}

/// Terminal failure before any destructive step.
fn fail(
    cfg: &UpdaterConfig,
    ignored: &IgnoredVersions,
    exit: UpdaterExitCode,
    detail: &str,
) -> UpdaterExitCode {
    record_ignored(cfg, ignored);
    report_failure(cfg, exit, detail);
    log::error!("update aborted ({}): {}", exit, detail);
    exit
}

fn record_ignored(cfg: &UpdaterConfig, ignored: &IgnoredVersions) {
    if let Err(e) = ignored.add(&cfg.new_version) {
        log::error!("failed to record ignored version: {:#}", e);
    }
}

/// Map an exit outcome onto the shared update-failure taxonomy.
fn error_type_for(exit: UpdaterExitCode) -> UpdateErrorType {
    match exit {
        UpdaterExitCode::AgentStopTimeout | UpdaterExitCode::StopAgentFailed => {
            UpdateErrorType::AgentStopTimeout
        }
        UpdaterExitCode::BackupFailed => UpdateErrorType::BackupFailed,
        UpdaterExitCode::DeployFailed => UpdateErrorType::DeployFailed,
        UpdaterExitCode::NewServiceStartFailed => UpdateErrorType::StartAgentFailed,
        UpdaterExitCode::WatchdogTriggeredRollback => UpdateErrorType::WatchdogCrash,
        UpdaterExitCode::RollbackFailed => UpdateErrorType::RollbackFailed,
        UpdaterExitCode::Success | UpdaterExitCode::GeneralError => {
            UpdateErrorType::UpdateGeneralFailure
        }
    }
}

fn report_failure(cfg: &UpdaterConfig, exit: UpdaterExitCode, detail: &str) {
    utils::write_error_report(
        &cfg.data_dir,
        "updater_failure",
        &serde_json::json!({
            "old_version": cfg.old_version,
            "new_version": cfg.new_version,
            "exit_code": exit.as_str(),
            "error_type": error_type_for(exit).as_str(),
            "detail": detail,
        }),
    );
}
