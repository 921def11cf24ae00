//! System action handler, host power-state changes.

use super::{CommandOutputResult, CommandRequest};
use anyhow::{Context, Result};
use std::process::Stdio;
use tokio_util::sync::CancellationToken;

/// Supported power-state actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    Restart,
    Shutdown,
    Logoff,
}

impl Action {
    fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "restart" => Some(Action::Restart),
            "shutdown" => Some(Action::Shutdown),
            "logoff" => Some(Action::Logoff),
            _ => None,
        }
    }

    fn systemctl_verb(&self) -> &'static str {
        match self {
            Action::Restart => "reboot",
            Action::Shutdown => "poweroff",
            Action::Logoff => unreachable!("logoff has no systemctl verb"),
        }
    }
}

/// Issue a host power-state action.
///
/// The action is fired detached and the handler returns immediately with
/// exit 0; the OS may terminate the agent before the result is flushed, in
/// which case the control plane sees the session drop instead.
pub(super) async fn run(
    req: &CommandRequest,
    cancel: CancellationToken,
) -> Result<CommandOutputResult> {
    let action = match Action::parse(&req.command_text) {
        Some(a) => a,
        None => {
            return Ok(CommandOutputResult::handler_error(
                "InvalidCommand",
                format!("unknown system action '{}'", req.command_text.trim()),
            ))
        }
    };

    // Running under a service account, there is no interactive session to
    // terminate. Exit 0 with an error code: the command was understood,
    // there is just nothing to do.
    if action == Action::Logoff {
        return Ok(CommandOutputResult {
            stdout: "logoff is not supported in service context".to_string(),
            error_code: Some("Unsupported".to_string()),
            ..Default::default()
        });
    }

    let delay_sec = req.param_u64("delay_sec").unwrap_or(0);
    let force = req.param_bool("force").unwrap_or(false);

    if cancel.is_cancelled() {
        anyhow::bail!("cancelled before issuing system action");
    }
    spawn_detached(action, delay_sec, force)?;

    Ok(CommandOutputResult {
        stdout: format!(
            "{} scheduled in {} second(s)",
            req.command_text.trim().to_ascii_lowercase(),
            delay_sec
        ),
        ..Default::default()
    })
}

/// Fire the action as a detached child so the result can still be flushed.
fn spawn_detached(action: Action, delay_sec: u64, force: bool) -> Result<()> {
    let force_flag = if force { " --force" } else { "" };
    let script = if delay_sec > 0 {
        format!(
            "sleep {} && systemctl {}{}",
            delay_sec,
            action.systemctl_verb(),
            force_flag
        )
    } else {
        format!("systemctl {}{}", action.systemctl_verb(), force_flag)
    };

    std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn system action")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandKind;

    #[test]
    fn action_parsing() {
        assert_eq!(Action::parse("restart"), Some(Action::Restart));
        assert_eq!(Action::parse(" Shutdown "), Some(Action::Shutdown));
        assert_eq!(Action::parse("LOGOFF"), Some(Action::Logoff));
        assert_eq!(Action::parse("hibernate"), None);
        assert_eq!(Action::parse(""), None);
    }

    #[tokio::test]
    async fn unknown_action_is_invalid() {
        let req = CommandRequest::mock(CommandKind::SystemAction, "hibernate");
        let out = run(&req, CancellationToken::new()).await.unwrap();

        assert_eq!(out.error_code.as_deref(), Some("InvalidCommand"));
        assert!(!crate::commands::is_success(&out, None));
    }

    #[tokio::test]
    async fn logoff_is_unsupported() {
        let req = CommandRequest::mock(CommandKind::SystemAction, "logoff");
        let out = run(&req, CancellationToken::new()).await.unwrap();

        assert_eq!(out.error_code.as_deref(), Some("Unsupported"));
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.error_message, None);
    }

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let req = CommandRequest::mock(CommandKind::SystemAction, "restart");
        run(&req, cancel).await.unwrap_err();
    }
}
