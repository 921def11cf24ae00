//! Remote command model and per-type handlers.
//!
//! Commands arrive as `command.execute` events, are queued by the pipeline,
//! and are dispatched here by variant tag. Each handler produces exactly one
//! [`CommandOutputResult`]; the pipeline wraps it into a [`CommandResult`]
//! by applying the success rule.

mod console;
mod get_logs;
mod software_install;
mod software_uninstall;
mod system_action;

pub(crate) use software_uninstall::SoftwareIndex;

use crate::control_plane;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exit code reserved for commands that hit their timeout.
pub(crate) const EXIT_TIMEOUT: i32 = -1;
/// Exit code reserved for commands cancelled by shutdown.
pub(crate) const EXIT_CANCELLED: i32 = -2;
/// Exit code reserved for commands evicted from a full queue.
pub(crate) const EXIT_REJECTED: i32 = -3;
/// Exit code reserved for handlers failing with an error.
pub(crate) const EXIT_HANDLER_ERROR: i32 = -99;

/// Command type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) enum CommandKind {
    /// Shell command execution.
    Console,
    /// Host power-state action.
    SystemAction,
    /// Package download and installation.
    SoftwareInstall,
    /// Package removal.
    SoftwareUninstall,
    /// Log collection into an archive.
    GetLogs,
}

impl CommandKind {
    /// Whether several commands of this type may execute concurrently.
    ///
    /// Non-reentrant types are serialized by the pipeline in enqueue order.
    pub(crate) fn is_reentrant(&self) -> bool {
        match self {
            CommandKind::Console | CommandKind::GetLogs => true,
            CommandKind::SystemAction
            | CommandKind::SoftwareInstall
            | CommandKind::SoftwareUninstall => false,
        }
    }

    /// Handler-specific fallback timeout, if any.
    pub(crate) fn default_timeout(&self) -> Option<Duration> {
        match self {
            CommandKind::Console => None,
            CommandKind::SystemAction => Some(Duration::from_secs(60)),
            CommandKind::SoftwareInstall => Some(Duration::from_secs(1800)),
            CommandKind::SoftwareUninstall => Some(Duration::from_secs(900)),
            CommandKind::GetLogs => Some(Duration::from_secs(300)),
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let label = match self {
            CommandKind::Console => "Console",
            CommandKind::SystemAction => "SystemAction",
            CommandKind::SoftwareInstall => "SoftwareInstall",
            CommandKind::SoftwareUninstall => "SoftwareUninstall",
            CommandKind::GetLogs => "GetLogs",
        };
        f.write_str(label)
    }
}

/// A command request, immutable after receipt.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct CommandRequest {
    /// Control-plane command identifier, unique per session lifetime.
    pub(crate) command_id: String,
    /// Command type tag.
    pub(crate) command_type: CommandKind,
    /// Type-specific command text.
    #[serde(default)]
    pub(crate) command_text: String,
    /// Free-form parameters.
    #[serde(default)]
    pub(crate) params: serde_json::Map<String, serde_json::Value>,
}

impl CommandRequest {
    /// Per-request timeout override, when present and positive.
    pub(crate) fn timeout_param(&self) -> Option<Duration> {
        let secs = self.params.get("timeout_sec")?.as_u64()?;
        if secs == 0 {
            return None;
        }
        Some(Duration::from_secs(secs))
    }

    /// Extra exit codes to treat as success.
    ///
    /// A malformed `expected_exit_codes` parameter falls back to the plain
    /// `exit_code == 0` rule with a warning; it never fails the command.
    pub(crate) fn expected_exit_codes(&self) -> Option<Vec<i32>> {
        let raw = self.params.get("expected_exit_codes")?;
        let parsed: Option<Vec<i32>> = raw.as_array().and_then(|items| {
            items
                .iter()
                .map(|v| v.as_i64().and_then(|n| i32::try_from(n).ok()))
                .collect()
        });
        if parsed.is_none() {
            log::warn!(
                "command {}: unparseable 'expected_exit_codes' {:?}, falling back to exit code 0",
                self.command_id,
                raw
            );
        }
        parsed
    }

    /// String-typed parameter accessor.
    pub(crate) fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key)?.as_str()
    }

    /// Unsigned-integer parameter accessor.
    pub(crate) fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key)?.as_u64()
    }

    /// Boolean parameter accessor.
    pub(crate) fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key)?.as_bool()
    }

    #[cfg(test)]
    pub(crate) fn mock(kind: CommandKind, text: &str) -> Self {
        Self {
            command_id: "mock-cmd-1".to_string(),
            command_type: kind,
            command_text: text.to_string(),
            params: serde_json::Map::new(),
        }
    }
}

/// Raw output of a single command execution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CommandOutputResult {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error_code: Option<String>,
}

impl CommandOutputResult {
    /// Output for a handler-level failure, before the process ran at all.
    pub(crate) fn handler_error(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            exit_code: 1,
            error_message: Some(message),
            error_code: Some(code.to_string()),
            ..Default::default()
        }
    }

    /// Output synthesized by the pipeline for a reserved exit code.
    pub(crate) fn synthesized(exit_code: i32, code: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            stderr: detail.clone(),
            exit_code,
            error_message: Some(detail),
            error_code: Some(code.to_string()),
            ..Default::default()
        }
    }
}

/// The completed command, as reported back to the control plane.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct CommandResult {
    pub(crate) command_id: String,
    pub(crate) command_type: CommandKind,
    pub(crate) success: bool,
    pub(crate) output: CommandOutputResult,
}

impl CommandResult {
    /// Wrap a handler output, applying the success rule.
    pub(crate) fn assemble(
        command_id: String,
        command_type: CommandKind,
        output: CommandOutputResult,
        expected_exit_codes: Option<&[i32]>,
    ) -> Self {
        let success = is_success(&output, expected_exit_codes);
        Self {
            command_id,
            command_type,
            success,
            output,
        }
    }
}

/// The success rule: the exit code is zero or explicitly expected, and no
/// error message was recorded.
pub(crate) fn is_success(output: &CommandOutputResult, expected: Option<&[i32]>) -> bool {
    let code_ok =
        output.exit_code == 0 || expected.map_or(false, |list| list.contains(&output.exit_code));
    let error_clear = output.error_message.as_deref().unwrap_or("").is_empty();
    code_ok && error_clear
}

/// Shared context handed to handlers.
#[derive(Debug)]
pub(crate) struct HandlerCtx {
    /// Agent state directory; log collection is confined to its `logs/`.
    pub(crate) data_dir: PathBuf,
    /// Control-plane HTTP client, for package downloads.
    pub(crate) http: Arc<control_plane::Client>,
    /// Installed-software index.
    pub(crate) software_index: SoftwareIndex,
}

/// Dispatch a request to its handler.
///
/// Handlers check the cancellation token before blocking calls; the process
/// timeout and shutdown enforcement live in the pipeline.
pub(crate) async fn execute(
    req: &CommandRequest,
    cancel: CancellationToken,
    ctx: &HandlerCtx,
) -> Result<CommandOutputResult> {
    match req.command_type {
        CommandKind::Console => console::run(req, cancel).await,
        CommandKind::SystemAction => system_action::run(req, cancel).await,
        CommandKind::SoftwareInstall => software_install::run(req, cancel, ctx).await,
        CommandKind::SoftwareUninstall => software_uninstall::run(req, cancel, ctx).await,
        CommandKind::GetLogs => get_logs::run(req, cancel, ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_with_code(exit_code: i32) -> CommandOutputResult {
        CommandOutputResult {
            exit_code,
            ..Default::default()
        }
    }

    #[test]
    fn command_request_wire_shape() {
        let raw = r#"{
            "command_id": "c1",
            "command_type": "Console",
            "command_text": "echo hi",
            "params": {"timeout_sec": 5}
        }"#;
        let req: CommandRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.command_id, "c1");
        assert_eq!(req.command_type, CommandKind::Console);
        assert_eq!(req.command_text, "echo hi");
        assert_eq!(req.timeout_param(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn missing_optional_fields_default() {
        let raw = r#"{"command_id": "c2", "command_type": "GetLogs"}"#;
        let req: CommandRequest = serde_json::from_str(raw).unwrap();
        assert!(req.command_text.is_empty());
        assert!(req.params.is_empty());
        assert_eq!(req.timeout_param(), None);
        assert_eq!(req.expected_exit_codes(), None);
    }

    #[test]
    fn zero_timeout_is_ignored() {
        let raw = r#"{"command_id": "c3", "command_type": "Console", "params": {"timeout_sec": 0}}"#;
        let req: CommandRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.timeout_param(), None);
    }

    #[test]
    fn expected_exit_codes_parsing() {
        let raw = r#"{
            "command_id": "c4",
            "command_type": "Console",
            "params": {"expected_exit_codes": [0, 3]}
        }"#;
        let req: CommandRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.expected_exit_codes(), Some(vec![0, 3]));
    }

    #[test]
    fn malformed_expected_exit_codes_fall_back() {
        let raw = r#"{
            "command_id": "c5",
            "command_type": "Console",
            "params": {"expected_exit_codes": "zero,three"}
        }"#;
        let req: CommandRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.expected_exit_codes(), None);
    }

    #[test]
    fn success_rule() {
        assert!(is_success(&output_with_code(0), None));
        assert!(!is_success(&output_with_code(3), None));
        assert!(is_success(&output_with_code(3), Some(&[0, 3])));
        assert!(!is_success(&output_with_code(4), Some(&[0, 3])));

        // An error message forces failure even with a matching exit code.
        let mut flagged = output_with_code(0);
        flagged.error_message = Some("boom".to_string());
        assert!(!is_success(&flagged, None));

        // An empty error message does not.
        let mut empty = output_with_code(0);
        empty.error_message = Some(String::new());
        assert!(is_success(&empty, None));
    }

    #[test]
    fn non_reentrant_kinds() {
        assert!(CommandKind::Console.is_reentrant());
        assert!(CommandKind::GetLogs.is_reentrant());
        assert!(!CommandKind::SystemAction.is_reentrant());
        assert!(!CommandKind::SoftwareInstall.is_reentrant());
        assert!(!CommandKind::SoftwareUninstall.is_reentrant());
    }

    proptest::proptest! {
        #[test]
        fn success_rule_law(
            code in -200i32..200,
            expected in proptest::collection::vec(-200i32..200, 0..8),
            has_msg in proptest::bool::ANY,
        ) {
            let output = CommandOutputResult {
                exit_code: code,
                error_message: if has_msg { Some("failed".to_string()) } else { None },
                ..Default::default()
            };
            let got = is_success(&output, Some(&expected));
            let want = (code == 0 || expected.contains(&code)) && !has_msg;
            proptest::prop_assert_eq!(got, want);
        }
    }

    #[test]
    fn result_assembly_applies_success_rule() {
        let result = CommandResult::assemble(
            "c6".to_string(),
            CommandKind::Console,
            output_with_code(3),
            Some(&[0, 3]),
        );
        assert!(result.success);

        let result = CommandResult::assemble(
            "c7".to_string(),
            CommandKind::Console,
            CommandOutputResult::synthesized(EXIT_TIMEOUT, "Timeout", "command timed out"),
            None,
        );
        assert!(!result.success);
        assert_eq!(result.output.exit_code, EXIT_TIMEOUT);
    }
}
