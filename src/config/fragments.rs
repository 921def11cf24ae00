//! TOML configuration fragments.

use serde::Deserialize;

/// Top-level configuration stanza.
#[derive(Debug, Deserialize, PartialEq)]
pub(crate) struct ConfigFragment {
    /// Agent base directories.
    pub(crate) agent: Option<AgentFragment>,
    /// Control-plane endpoints.
    pub(crate) server: Option<ServerFragment>,
    /// Session lifecycle tuning.
    pub(crate) session: Option<SessionFragment>,
    /// Telemetry reporting.
    pub(crate) telemetry: Option<TelemetryFragment>,
    /// Command pipeline tuning.
    pub(crate) pipeline: Option<PipelineFragment>,
    /// Self-update behavior.
    pub(crate) updates: Option<UpdateFragment>,
}

/// Config fragment for agent base directories.
#[derive(Debug, Deserialize, PartialEq)]
pub(crate) struct AgentFragment {
    /// State directory (default: '/var/lib/outpost').
    pub(crate) data_dir: Option<String>,
    /// Installation directory (default: '/usr/lib/outpost').
    pub(crate) install_dir: Option<String>,
}

/// Config fragment for control-plane endpoints.
#[derive(Debug, Deserialize, PartialEq)]
pub(crate) struct ServerFragment {
    /// Base URL for the HTTP API.
    pub(crate) api_url: Option<String>,
    /// URL for the bidirectional event transport.
    pub(crate) events_url: Option<String>,
}

/// Config fragment for session lifecycle tuning.
#[derive(Debug, Deserialize, PartialEq)]
pub(crate) struct SessionFragment {
    /// Reconnect backoff floor, in seconds.
    pub(crate) min_backoff_secs: Option<u64>,
    /// Reconnect backoff cap, in seconds.
    pub(crate) max_backoff_secs: Option<u64>,
    /// Reconnect attempts before giving up (0: never give up).
    pub(crate) max_reconnect_attempts: Option<u32>,
    /// How long to wait for the authentication verdict, in seconds.
    pub(crate) auth_timeout_secs: Option<u64>,
    /// Treat a successful transport connect as authentication.
    pub(crate) implicit_auth: Option<bool>,
}

/// Config fragment for telemetry reporting.
#[derive(Debug, Deserialize, PartialEq)]
pub(crate) struct TelemetryFragment {
    /// Status reporting interval, in seconds.
    pub(crate) interval_secs: Option<u64>,
}

/// Config fragment for the command pipeline.
#[derive(Debug, Deserialize, PartialEq)]
pub(crate) struct PipelineFragment {
    /// Pending commands bound.
    pub(crate) queue_capacity: Option<usize>,
    /// Maximum commands executing in parallel.
    pub(crate) workers: Option<usize>,
    /// Fallback per-command timeout, in seconds.
    pub(crate) default_timeout_secs: Option<u64>,
}

/// Config fragment for self-update behavior.
#[derive(Debug, Deserialize, PartialEq)]
pub(crate) struct UpdateFragment {
    /// Whether to honour update notifications.
    pub(crate) enabled: Option<bool>,
    /// Managed service unit name.
    pub(crate) service_name: Option<String>,
    /// Service stop/start wait bound, in seconds.
    pub(crate) service_wait_timeout_secs: Option<u64>,
    /// Post-start health watch duration, in seconds.
    pub(crate) watchdog_period_secs: Option<u64>,
    /// Install-dir patterns the updater must not overwrite.
    pub(crate) exclude: Option<Vec<String>>,
}
