//! Control-plane event protocol, JSON envelopes in both directions.

use crate::commands::CommandResult;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Inbound: authentication accepted.
pub(crate) const AUTH_SUCCESS: &str = "auth_success";
/// Inbound: authentication rejected, terminal.
pub(crate) const AUTH_FAILED: &str = "auth_failed";
/// Inbound: command to execute.
pub(crate) const COMMAND_EXECUTE: &str = "command.execute";
/// Inbound: update notification.
pub(crate) const VERSION_AVAILABLE: &str = "version.available";

/// Outbound: periodic telemetry sample.
pub(crate) const STATUS_UPDATE: &str = "status.update";
/// Outbound: completed command.
pub(crate) const COMMAND_RESULT: &str = "command.result";
/// Outbound: update progress/failure report.
pub(crate) const UPDATE_STATUS: &str = "update.status";

/// A single event frame, either direction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Envelope {
    /// Event name.
    pub(crate) event: String,
    /// Event-specific payload.
    #[serde(default)]
    pub(crate) payload: serde_json::Value,
}

impl Envelope {
    /// Build an envelope from a serializable payload.
    pub(crate) fn new(event: &str, payload: &impl Serialize) -> Result<Self> {
        Ok(Self {
            event: event.to_string(),
            payload: serde_json::to_value(payload)
                .with_context(|| format!("failed to serialize '{}' payload", event))?,
        })
    }

    /// Parse the payload into a typed value.
    ///
    /// Payloads are mapped permissively: unknown fields are ignored and
    /// optional fields default.
    pub(crate) fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .with_context(|| format!("malformed '{}' payload", self.event))
    }
}

/// Payload of `auth_failed`.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct AuthFailedPayload {
    #[serde(default)]
    pub(crate) reason: String,
}

/// Payload of `status.update`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct StatusUpdate {
    pub(crate) cpu_usage: f64,
    pub(crate) ram_usage: f64,
    pub(crate) disk_usage: f64,
}

/// Update progress stages, as reported on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum UpdateStatusKind {
    Starting,
    Downloading,
    Verifying,
    Extracting,
    HandingOff,
    Skipped,
    Failed,
}

/// Payload of `update.status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct UpdateStatus {
    pub(crate) status: UpdateStatusKind,
    pub(crate) target_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error_message: Option<String>,
}

impl UpdateStatus {
    /// Progress report for a non-terminal stage.
    pub(crate) fn progress(status: UpdateStatusKind, target_version: &str) -> Self {
        Self {
            status,
            target_version: target_version.to_string(),
            error_type: None,
            error_message: None,
        }
    }

    /// Terminal failure report.
    pub(crate) fn failed(target_version: &str, error_type: &str, error_message: String) -> Self {
        Self {
            status: UpdateStatusKind::Failed,
            target_version: target_version.to_string(),
            error_type: Some(error_type.to_string()),
            error_message: Some(error_message),
        }
    }
}

/// Outbound events accepted by the session sender.
#[derive(Debug)]
pub(crate) enum OutboundEvent {
    Status(StatusUpdate),
    CommandResult(CommandResult),
    UpdateStatus(UpdateStatus),
}

impl OutboundEvent {
    /// Wire representation.
    pub(crate) fn into_envelope(self) -> Result<Envelope> {
        match self {
            OutboundEvent::Status(s) => Envelope::new(STATUS_UPDATE, &s),
            OutboundEvent::CommandResult(r) => Envelope::new(COMMAND_RESULT, &r),
            OutboundEvent::UpdateStatus(u) => Envelope::new(UPDATE_STATUS, &u),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandRequest;

    #[test]
    fn command_execute_round_trip() {
        let raw = r#"
{
  "event": "command.execute",
  "payload": {
    "command_id": "c1",
    "command_type": "Console",
    "command_text": "echo hi",
    "params": {"timeout_sec": 5},
    "unknown_extra": true
  }
}
"#;
        let env: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.event, COMMAND_EXECUTE);

        let req: CommandRequest = env.parse_payload().unwrap();
        assert_eq!(req.command_id, "c1");
        assert_eq!(req.command_text, "echo hi");
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let env: Envelope = serde_json::from_str(r#"{"event": "auth_success"}"#).unwrap();
        assert_eq!(env.event, AUTH_SUCCESS);
        assert!(env.payload.is_null());
    }

    #[test]
    fn malformed_payload_is_an_error_not_a_panic() {
        let env: Envelope = serde_json::from_str(
            r#"{"event": "command.execute", "payload": {"command_type": "Unknown"}}"#,
        )
        .unwrap();
        env.parse_payload::<CommandRequest>().unwrap_err();
    }

    #[test]
    fn auth_failed_reason_defaults() {
        let env: Envelope = serde_json::from_str(r#"{"event": "auth_failed", "payload": {}}"#).unwrap();
        let payload: AuthFailedPayload = env.parse_payload().unwrap();
        assert!(payload.reason.is_empty());
    }

    #[test]
    fn update_status_wire_shape() {
        let status = UpdateStatus::progress(UpdateStatusKind::HandingOff, "2.1.0");
        let env = OutboundEvent::UpdateStatus(status).into_envelope().unwrap();

        assert_eq!(env.event, UPDATE_STATUS);
        assert_eq!(env.payload["status"], "handing_off");
        assert_eq!(env.payload["target_version"], "2.1.0");
        assert!(env.payload.get("error_type").is_none());

        let failed = UpdateStatus::failed("2.1.0", "ChecksumMismatch", "digest mismatch".into());
        let env = OutboundEvent::UpdateStatus(failed).into_envelope().unwrap();
        assert_eq!(env.payload["status"], "failed");
        assert_eq!(env.payload["error_type"], "ChecksumMismatch");
    }

    #[test]
    fn status_update_wire_shape() {
        let env = OutboundEvent::Status(StatusUpdate {
            cpu_usage: 12.5,
            ram_usage: 40.0,
            disk_usage: 73.2,
        })
        .into_envelope()
        .unwrap();

        assert_eq!(env.event, STATUS_UPDATE);
        assert_eq!(env.payload["cpu_usage"], 12.5);
    }
}
