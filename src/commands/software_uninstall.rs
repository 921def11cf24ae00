//! Software removal handler.

use super::{CommandOutputResult, CommandRequest, HandlerCtx};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Index file location, relative to the data directory.
static SOFTWARE_INDEX_PATH: &str = "software_index.json";

/// One installed-software record.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub(crate) struct SoftwareEntry {
    /// Stable package identifier.
    pub(crate) product_code: String,
    /// Human-readable name, for display-name lookups.
    pub(crate) display_name: String,
    /// Interactive uninstall command line.
    pub(crate) uninstall_command: String,
    /// Non-interactive variant, preferred when present.
    #[serde(default)]
    pub(crate) quiet_uninstall_command: Option<String>,
}

/// Installed-software index.
///
/// This is the portable seam in front of the OS software registry: the
/// platform integration maintains `software_index.json` under the data
/// directory, and lookups here never touch the OS directly.
#[derive(Debug)]
pub(crate) struct SoftwareIndex {
    path: PathBuf,
}

impl SoftwareIndex {
    /// Create an index handle rooted at the given data directory.
    pub(crate) fn load(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SOFTWARE_INDEX_PATH),
        }
    }

    /// Look up an entry by product code, or by display-name containment.
    pub(crate) fn find(&self, product_code: Option<&str>, display_name: Option<&str>) -> Result<Option<SoftwareEntry>> {
        let entries = self.entries()?;

        if let Some(code) = product_code {
            if let Some(entry) = entries.iter().find(|e| e.product_code == code) {
                return Ok(Some(entry.clone()));
            }
        }
        if let Some(name) = display_name {
            let needle = name.to_ascii_lowercase();
            if let Some(entry) = entries
                .iter()
                .find(|e| e.display_name.to_ascii_lowercase().contains(&needle))
            {
                return Ok(Some(entry.clone()));
            }
        }
        Ok(None)
    }

    fn entries(&self) -> Result<Vec<SoftwareEntry>> {
        let content = match std::fs::read(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read '{}'", self.path.display()))
            }
        };
        serde_json::from_slice(&content)
            .with_context(|| format!("failed to parse '{}'", self.path.display()))
    }
}

/// Locate an uninstaller and run it.
pub(super) async fn run(
    req: &CommandRequest,
    cancel: CancellationToken,
    ctx: &HandlerCtx,
) -> Result<CommandOutputResult> {
    let product_code = req.param_str("product_code");
    let display_name = match (product_code, req.command_text.trim()) {
        (None, "") => None,
        (None, text) => Some(text),
        (Some(_), _) => req.param_str("display_name"),
    };
    if product_code.is_none() && display_name.is_none() {
        return Ok(CommandOutputResult::handler_error(
            "MissingParameter",
            "neither 'product_code' nor a display name given",
        ));
    }

    let entry = match ctx.software_index.find(product_code, display_name)? {
        Some(e) => e,
        None => {
            return Ok(CommandOutputResult::handler_error(
                "NotInstalled",
                format!(
                    "no installed software matches '{}'",
                    product_code.or(display_name).unwrap_or_default()
                ),
            ))
        }
    };

    // Prefer the quiet variant; only the interactive command accepts
    // caller-supplied arguments.
    let command_line = match &entry.quiet_uninstall_command {
        Some(quiet) => quiet.clone(),
        None => {
            let extra = req.param_str("uninstall_arguments").unwrap_or("");
            if extra.is_empty() {
                entry.uninstall_command.clone()
            } else {
                format!("{} {}", entry.uninstall_command, extra)
            }
        }
    };

    if cancel.is_cancelled() {
        anyhow::bail!("cancelled before running uninstaller");
    }

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(&command_line)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .context("failed to run uninstaller")?;

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
