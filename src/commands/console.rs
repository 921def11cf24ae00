//! Console command handler, shell execution.

use super::{CommandOutputResult, CommandRequest};
use anyhow::{Context, Result};
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Run a shell command and capture its output.
///
/// The command text is handed to the platform shell as a single argument,
/// never concatenated into a larger command line.
pub(super) async fn run(
    req: &CommandRequest,
    cancel: CancellationToken,
) -> Result<CommandOutputResult> {
    if req.command_text.trim().is_empty() {
        return Ok(CommandOutputResult::handler_error(
            "InvalidCommand",
            "empty command text",
        ));
    }
    if cancel.is_cancelled() {
        anyhow::bail!("cancelled before spawning shell");
    }

    let mut command = Command::new("/bin/sh");
    command
        .arg("-c")
        .arg(&req.command_text)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = req.param_str("working_directory") {
        command.current_dir(dir);
    }
    let output = command
        .output()
        .await
        .context("failed to run platform shell")?;

    Ok(CommandOutputResult {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: exit_code_of(&output.status),
        error_message: None,
        error_code: None,
    })
}

/// Map an exit status to a code, accounting for signal-terminated children.
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandKind;

    #[tokio::test]
    async fn echo_round_trip() {
        let req = CommandRequest::mock(CommandKind::Console, "echo hi");
        let out = run(&req, CancellationToken::new()).await.unwrap();

        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.starts_with("hi"));
        assert!(out.stderr.is_empty());
        assert_eq!(out.error_message, None);
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_reported() {
        let req = CommandRequest::mock(CommandKind::Console, "exit 3");
        let out = run(&req, CancellationToken::new()).await.unwrap();
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn stderr_is_captured() {
        let req = CommandRequest::mock(CommandKind::Console, "echo oops >&2; exit 1");
        let out = run(&req, CancellationToken::new()).await.unwrap();

        assert_eq!(out.exit_code, 1);
        assert!(out.stderr.starts_with("oops"));
    }

    #[tokio::test]
    async fn metacharacters_are_data() {
        // A single argv element reaches the shell; quoting survives intact.
        let req = CommandRequest::mock(CommandKind::Console, "echo '$(pwd); rm'");
        let out = run(&req, CancellationToken::new()).await.unwrap();

        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.starts_with("$(pwd); rm"));
    }

    #[tokio::test]
    async fn working_directory_is_honoured() {
        let tmpdir = tempfile::tempdir().unwrap();
        std::fs::write(tmpdir.path().join("marker.txt"), b"").unwrap();

        let mut req = CommandRequest::mock(CommandKind::Console, "ls");
        req.params.insert(
            "working_directory".to_string(),
            serde_json::Value::String(tmpdir.path().to_string_lossy().to_string()),
        );
        let out = run(&req, CancellationToken::new()).await.unwrap();

        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let req = CommandRequest::mock(CommandKind::Console, "   ");
        let out = run(&req, CancellationToken::new()).await.unwrap();

        assert_eq!(out.error_code.as_deref(), Some("InvalidCommand"));
        assert!(out.error_message.is_some());
    }

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let req = CommandRequest::mock(CommandKind::Console, "echo hi");
        run(&req, cancel).await.unwrap_err();
    }
}
