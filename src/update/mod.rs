//! Self-update orchestration, agent side.
//!
//! Update notifications arrive through the session. The orchestrator checks
//! them against the ignored set and the running version, downloads and
//! verifies the package, stages it, and hands control to the updater
//! process spawned from the freshly extracted tree. Every failure is
//! reported to the control plane and leaves the agent running.

use crate::config::UpdateSettings;
use crate::control_plane;
use crate::ignored_versions::IgnoredVersions;
use crate::session::{SessionHandle, UpdateStatus, UpdateStatusKind};
use crate::utils;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default bound for service stop/start waits (in seconds).
pub(crate) const DEFAULT_SERVICE_WAIT_TIMEOUT_SECS: u64 = 120; // 2 minutes.

/// Default post-start health watch duration (in seconds).
pub(crate) const DEFAULT_WATCHDOG_PERIOD_SECS: u64 = 60;

/// Entrypoint binary expected inside an extracted package.
pub(crate) static ENTRYPOINT_BIN: &str = "outpost";

lazy_static! {
    static ref UPDATE_ATTEMPTS: IntCounter = register_int_counter!(opts!(
        "outpost_update_attempts_total",
        "Total number of update notifications acted upon."
    ))
    .unwrap();
    static ref UPDATE_FAILURES: IntCounterVec = register_int_counter_vec!(
        "outpost_update_failures_total",
        "Total number of failed update attempts, by error type.",
        &["error_type"]
    )
    .unwrap();
}

/// An update offer from the control plane.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub(crate) struct UpdateNotification {
    /// Offered version.
    pub(crate) version: String,
    /// Package location, fetched opaquely.
    pub(crate) download_url: String,
    /// Expected package digest, hex-encoded.
    pub(crate) checksum_sha256: String,
    /// Operator-facing release notes.
    #[serde(default)]
    pub(crate) notes: Option<String>,
}

/// Typed update failure classification, shared with the updater process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UpdateErrorType {
    DownloadFailed,
    ChecksumMismatch,
    ExtractionFailed,
    UpdateLaunchFailed,
    AgentStopTimeout,
    BackupFailed,
    DeployFailed,
    StartAgentFailed,
    WatchdogCrash,
    RollbackFailed,
    UpdateGeneralFailure,
}

impl UpdateErrorType {
    /// Stable wire identifier.
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            UpdateErrorType::DownloadFailed => "DownloadFailed",
            UpdateErrorType::ChecksumMismatch => "ChecksumMismatch",
            UpdateErrorType::ExtractionFailed => "ExtractionFailed",
            UpdateErrorType::UpdateLaunchFailed => "UpdateLaunchFailed",
            UpdateErrorType::AgentStopTimeout => "AgentStopTimeout",
            UpdateErrorType::BackupFailed => "BackupFailed",
            UpdateErrorType::DeployFailed => "DeployFailed",
            UpdateErrorType::StartAgentFailed => "StartAgentFailed",
            UpdateErrorType::WatchdogCrash => "WatchdogCrash",
            UpdateErrorType::RollbackFailed => "RollbackFailed",
            UpdateErrorType::UpdateGeneralFailure => "UpdateGeneralFailure",
        }
    }

    /// Whether this failure permanently blocks the target version.
    ///
    /// Download and extraction failures are considered transient; the
    /// control plane may legitimately re-offer the same version.
    pub(crate) fn records_ignored(&self) -> bool {
        !matches!(
            self,
            UpdateErrorType::DownloadFailed | UpdateErrorType::ExtractionFailed
        )
    }
}

impl std::fmt::Display for UpdateErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed update failure with its human-readable detail.
#[derive(Debug, Error)]
#[error("{error_type}: {message}")]
pub(crate) struct UpdateError {
    pub(crate) error_type: UpdateErrorType,
    pub(crate) message: String,
}

impl UpdateError {
    pub(crate) fn new(error_type: UpdateErrorType, err: impl std::fmt::Display) -> Self {
        Self {
            error_type,
            message: err.to_string(),
        }
    }
}

/// Agent-side update orchestrator.
#[derive(Debug)]
pub(crate) struct Orchestrator {
    settings: UpdateSettings,
    data_dir: PathBuf,
    install_dir: PathBuf,
    current_version: String,
    http: Arc<control_plane::Client>,
    ignored: Arc<IgnoredVersions>,
    session: SessionHandle,
    shutdown: CancellationToken,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        settings: UpdateSettings,
        data_dir: PathBuf,
        install_dir: PathBuf,
        current_version: String,
        http: Arc<control_plane::Client>,
        ignored: Arc<IgnoredVersions>,
        session: SessionHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            settings,
            data_dir,
            install_dir,
            current_version,
            http,
            ignored,
            session,
            shutdown,
        }
    }

    /// Consume update notifications until shutdown.
    pub(crate) async fn run(self, mut notifications: mpsc::Receiver<UpdateNotification>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                notification = notifications.recv() => match notification {
                    Some(n) => self.handle_notification(n).await,
                    None => return,
                },
            }
        }
    }

    /// Act on one notification; never propagates failures.
    pub(crate) async fn handle_notification(&self, notification: UpdateNotification) {
        if !self.settings.enabled {
            log::debug!(
                "updates disabled, discarding notification for {}",
                notification.version
            );
            return;
        }
        if notification.version == self.current_version {
            log::debug!("already running {}, discarding", notification.version);
            return;
        }
        if self.ignored.contains(&notification.version) {
            log::info!(
                "version {} is on the ignored list, skipping",
                notification.version
            );
            self.session.emit_update_status(UpdateStatus::progress(
                UpdateStatusKind::Skipped,
                &notification.version,
            ));
            return;
        }

        UPDATE_ATTEMPTS.inc();
        log::info!(
            "starting update {} -> {}",
            self.current_version,
            notification.version
        );
        match self.try_update(&notification).await {
            Ok(()) => {
                self.session.emit_update_status(UpdateStatus::progress(
                    UpdateStatusKind::HandingOff,
                    &notification.version,
                ));
                log::info!("updater launched, shutting down for file replacement");
                self.shutdown.cancel();
            }
            Err(e) => {
                UPDATE_FAILURES
                    .with_label_values(&[e.error_type.as_str()])
                    .inc();
                log::error!("update to {} failed: {}", notification.version, e);

                self.session.emit_update_status(UpdateStatus::failed(
                    &notification.version,
                    e.error_type.as_str(),
                    e.message.clone(),
                ));
                if e.error_type.records_ignored() {
                    if let Err(add_err) = self.ignored.add(&notification.version) {
                        log::error!("failed to record ignored version: {:#}", add_err);
                    }
                }
                utils::write_error_report(
                    &self.data_dir,
                    "update_failure",
                    &serde_json::json!({
                        "version": notification.version,
                        "error_type": e.error_type.as_str(),
                        "message": e.message,
                    }),
                );
            }
        }
    }

    /// Download, verify, extract, validate, and hand off.
    async fn try_update(&self, notification: &UpdateNotification) -> Result<(), UpdateError> {
        let version = &notification.version;

        self.progress(UpdateStatusKind::Downloading, version);
        let package = self
            .data_dir
            .join("updates")
            .join("download")
            .join(format!("{}.pkg", version));
        self.http
            .download(&notification.download_url, &package)
            .await
            .map_err(|e| UpdateError::new(UpdateErrorType::DownloadFailed, format!("{:#}", e)))?;

        self.progress(UpdateStatusKind::Verifying, version);
        verify_checksum(&package, &notification.checksum_sha256)
            .await
            .map_err(|e| {
                // A corrupt artifact must not linger in the staging area.
                std::fs::remove_file(&package).ok();
                e
            })?;

        self.progress(UpdateStatusKind::Extracting, version);
        let extracted = self
            .data_dir
            .join("updates")
            .join("extracted")
            .join(version);
        {
            let package = package.clone();
            let extracted = extracted.clone();
            tokio::task::spawn_blocking(move || extract_package(&package, &extracted))
                .await
                .map_err(|e| UpdateError::new(UpdateErrorType::UpdateGeneralFailure, e))?
                .map_err(|e| {
                    UpdateError::new(UpdateErrorType::ExtractionFailed, format!("{:#}", e))
                })?;
        }
        std::fs::remove_file(&package).ok();

        let entrypoint = extracted.join(ENTRYPOINT_BIN);
        if !entrypoint.is_file() {
            return Err(UpdateError::new(
                UpdateErrorType::ExtractionFailed,
                format!("package has no '{}' entrypoint", ENTRYPOINT_BIN),
            ));
        }

        self.progress(UpdateStatusKind::Starting, version);
        self.spawn_updater(notification, &extracted)
            .map_err(|e| UpdateError::new(UpdateErrorType::UpdateLaunchFailed, format!("{:#}", e)))
    }

    fn progress(&self, status: UpdateStatusKind, version: &str) {
        self.session
            .emit_update_status(UpdateStatus::progress(status, version));
    }

    /// Launch the updater from the extracted tree, detached.
    ///
    /// The new package's own updater performs the swap, so updater fixes
    /// take effect for the very update that ships them.
    fn spawn_updater(&self, notification: &UpdateNotification, source: &Path) -> Result<()> {
        use std::process::{Command, Stdio};

        let entrypoint = source.join(ENTRYPOINT_BIN);
        let timeout_secs = self.settings.service_wait_timeout.as_secs().to_string();
        let watchdog_secs = self.settings.watchdog_period.as_secs().to_string();
        let child = Command::new(&entrypoint)
            .arg("updater")
            .arg("--pid")
            .arg(std::process::id().to_string())
            .arg("--old-version")
            .arg(&self.current_version)
            .arg("--new-version")
            .arg(&notification.version)
            .arg("--source-path")
            .arg(source)
            .arg("--install-dir")
            .arg(&self.install_dir)
            .arg("--data-dir")
            .arg(&self.data_dir)
            .arg("--service-name")
            .arg(&self.settings.service_name)
            .arg("--service-wait-timeout")
            .arg(timeout_secs)
            .arg("--watchdog-period")
            .arg(watchdog_secs)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", entrypoint.display()))?;

        log::info!("updater running as pid {}", child.id());
        Ok(())
    }
}

/// Verify a downloaded package digest off the async runtime.
async fn verify_checksum(path: &Path, expected: &str) -> Result<(), UpdateError> {
    let path = path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || utils::sha256_file(&path))
        .await
        .map_err(|e| UpdateError::new(UpdateErrorType::UpdateGeneralFailure, e))?
        .map_err(|e| UpdateError::new(UpdateErrorType::UpdateGeneralFailure, format!("{:#}", e)))?;

    if !digest.eq_ignore_ascii_case(expected) {
        return Err(UpdateError::new(
            UpdateErrorType::ChecksumMismatch,
            format!("expected {}, got {}", expected, digest),
        ));
    }
    Ok(())
}

/// Extract a `.tar.gz` package into a clean destination directory.
pub(crate) fn extract_package(package: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        std::fs::remove_dir_all(dest)
            .with_context(|| format!("failed to clear '{}'", dest.display()))?;
    }
    std::fs::create_dir_all(dest)
        .with_context(|| format!("failed to create '{}'", dest.display()))?;

    let file = std::fs::File::open(package)
        .with_context(|| format!("failed to open '{}'", package.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .with_context(|| format!("failed to extract into '{}'", dest.display()))?;
    Ok(())
}
