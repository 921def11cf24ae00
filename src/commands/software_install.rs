//! Software installation handler.

use super::{CommandOutputResult, CommandRequest, HandlerCtx};
use crate::utils;
use anyhow::{Context, Result};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Download a package, verify it, and run its installer.
///
/// The package lands in a scoped temporary directory and is removed on
/// every outcome, success or failure.
pub(super) async fn run(
    req: &CommandRequest,
    cancel: CancellationToken,
    ctx: &HandlerCtx,
) -> Result<CommandOutputResult> {
    let download_url = match req.param_str("download_url") {
        Some(u) => u,
        None => {
            return Ok(CommandOutputResult::handler_error(
                "MissingParameter",
                "missing 'download_url' parameter",
            ))
        }
    };
    let checksum = match req.param_str("checksum_sha256") {
        Some(c) => c.to_string(),
        None => {
            return Ok(CommandOutputResult::handler_error(
                "MissingParameter",
                "missing 'checksum_sha256' parameter",
            ))
        }
    };
    let install_arguments = req.param_str("install_arguments").unwrap_or("");

    if cancel.is_cancelled() {
        anyhow::bail!("cancelled before package download");
    }

    // Dropping the tempdir removes the package in every outcome.
    let staging = tempfile::Builder::new()
        .prefix("outpost-pkg-")
        .tempdir()
        .context("failed to create package staging directory")?;
    let package = staging.path().join("package.bin");

    if let Err(e) = ctx.http.download(download_url, &package).await {
        return Ok(CommandOutputResult::handler_error(
            "DownloadFailed",
            format!("failed to download package: {:#}", e),
        ));
    }

    let digest = {
        let package = package.clone();
        tokio::task::spawn_blocking(move || utils::sha256_file(&package))
            .await
            .context("checksum task failed")??
    };
    if !digest.eq_ignore_ascii_case(&checksum) {
        std::fs::remove_file(&package).ok();
        return Ok(CommandOutputResult::handler_error(
            "ChecksumMismatch",
            format!("package checksum mismatch: expected {}, got {}", checksum, digest),
        ));
    }

    if cancel.is_cancelled() {
        anyhow::bail!("cancelled before running installer");
    }

    std::fs::set_permissions(&package, std::fs::Permissions::from_mode(0o755))
        .context("failed to mark installer executable")?;

    let output = Command::new(&package)
        .args(install_arguments.split_whitespace())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .context("failed to run installer")?;

    Ok(CommandOutputResult {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output
            .status
            .code()
            .unwrap_or_else(|| 128 + output.status.signal().unwrap_or(0)),
        error_message: None,
        error_code: None,
    })
}
