//! Configuration parsing and validation.
//!
//! This module contains the following logical entities:
//!  * Fragments: TOML configuration entries.
//!  * Inputs: configuration fragments merged, but not yet validated.
//!  * Settings: validated settings for the agent.

/// TOML structures.
mod fragments;

/// Configuration fragments.
pub(crate) mod inputs;

use anyhow::{bail, Context, Result};
use clap::crate_name;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Runtime configuration for the agent.
///
/// It holds validated agent configuration.
#[derive(Clone, Debug)]
pub(crate) struct Settings {
    /// State directory.
    pub(crate) data_dir: PathBuf,
    /// Installation directory, the target of self-updates.
    pub(crate) install_dir: PathBuf,
    /// Base URL for the control-plane HTTP API.
    pub(crate) api_url: Url,
    /// URL for the bidirectional event transport.
    pub(crate) events_url: Url,
    /// Session lifecycle tuning.
    pub(crate) session: SessionSettings,
    /// Status reporting interval.
    pub(crate) status_interval: Duration,
    /// Command pipeline tuning.
    pub(crate) pipeline: PipelineSettings,
    /// Self-update behavior.
    pub(crate) updates: UpdateSettings,
}

/// Validated session lifecycle settings.
#[derive(Clone, Debug)]
pub(crate) struct SessionSettings {
    pub(crate) min_backoff: Duration,
    pub(crate) max_backoff: Duration,
    /// 0 is the "never give up" sentinel.
    pub(crate) max_reconnect_attempts: u32,
    pub(crate) auth_timeout: Duration,
    pub(crate) implicit_auth: bool,
}

/// Validated command pipeline settings.
#[derive(Clone, Debug)]
pub(crate) struct PipelineSettings {
    pub(crate) queue_capacity: usize,
    pub(crate) workers: usize,
    pub(crate) default_timeout: Duration,
}

/// Validated self-update settings.
#[derive(Clone, Debug)]
pub(crate) struct UpdateSettings {
    pub(crate) enabled: bool,
    pub(crate) service_name: String,
    pub(crate) service_wait_timeout: Duration,
    pub(crate) watchdog_period: Duration,
    pub(crate) exclude: Vec<String>,
}

impl Settings {
    /// Assemble runtime settings.
    pub(crate) fn assemble() -> Result<Self> {
        let prefixes = vec![
            "/usr/lib/".to_string(),
            "/run/".to_string(),
            "/etc/".to_string(),
        ];
        let common_path = format!("{}/config.d/", crate_name!());
        let extensions = vec!["toml".to_string()];
        let cfg = inputs::ConfigInput::read_configs(prefixes, &common_path, extensions)?;
        Self::validate(cfg)
    }

    /// Validate config and return valid agent settings.
    pub(crate) fn validate(cfg: inputs::ConfigInput) -> Result<Self> {
        if cfg.server.api_url.is_empty() {
            bail!("empty control-plane API URL");
        }
        if cfg.server.events_url.is_empty() {
            bail!("empty control-plane events URL");
        }
        let api_url = Url::parse(&cfg.server.api_url)
            .with_context(|| format!("failed to parse '{}'", cfg.server.api_url))?;
        let events_url = Url::parse(&cfg.server.events_url)
            .with_context(|| format!("failed to parse '{}'", cfg.server.events_url))?;

        if cfg.session.min_backoff_secs == 0
            || cfg.session.max_backoff_secs < cfg.session.min_backoff_secs
        {
            bail!(
                "invalid reconnect backoff range [{}, {}]",
                cfg.session.min_backoff_secs,
                cfg.session.max_backoff_secs
            );
        }
        if cfg.pipeline.queue_capacity == 0 || cfg.pipeline.workers == 0 {
            bail!("pipeline queue capacity and workers must be non-zero");
        }
        if cfg.updates.service_name.is_empty() {
            bail!("empty managed service name");
        }

        Ok(Self {
            data_dir: PathBuf::from(cfg.agent.data_dir),
            install_dir: PathBuf::from(cfg.agent.install_dir),
            api_url,
            events_url,
            session: SessionSettings {
                min_backoff: Duration::from_secs(cfg.session.min_backoff_secs),
                max_backoff: Duration::from_secs(cfg.session.max_backoff_secs),
                max_reconnect_attempts: cfg.session.max_reconnect_attempts,
                auth_timeout: Duration::from_secs(cfg.session.auth_timeout_secs),
                implicit_auth: cfg.session.implicit_auth,
            },
            status_interval: Duration::from_secs(cfg.telemetry.interval_secs.max(1)),
            pipeline: PipelineSettings {
                queue_capacity: cfg.pipeline.queue_capacity,
                workers: cfg.pipeline.workers,
                default_timeout: Duration::from_secs(cfg.pipeline.default_timeout_secs.max(1)),
            },
            updates: UpdateSettings {
                enabled: cfg.updates.enabled,
                service_name: cfg.updates.service_name,
                service_wait_timeout: Duration::from_secs(cfg.updates.service_wait_timeout_secs),
                watchdog_period: Duration::from_secs(cfg.updates.watchdog_period_secs),
                exclude: cfg.updates.exclude,
            },
        })
    }

    #[cfg(test)]
    pub(crate) fn mock_default(data_dir: PathBuf) -> Self {
        let mut cfg = inputs::ConfigInput::merge_fragments(vec![]);
        cfg.agent.data_dir = data_dir.to_string_lossy().to_string();
        cfg.agent.install_dir = data_dir.join("install").to_string_lossy().to_string();
        cfg.server.api_url = "https://mgmt.example.com/api/".to_string();
        cfg.server.events_url = "wss://mgmt.example.com/events".to_string();
        Self::validate(cfg).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_server_urls() {
        let cfg = inputs::ConfigInput::merge_fragments(vec![]);
        Settings::validate(cfg).unwrap_err();
    }

    #[test]
    fn validate_accepts_sane_input() {
        let tmpdir = tempfile::tempdir().unwrap();
        let settings = Settings::mock_default(tmpdir.path().to_path_buf());

        assert_eq!(settings.api_url.scheme(), "https");
        assert_eq!(settings.events_url.scheme(), "wss");
        assert!(settings.session.min_backoff <= settings.session.max_backoff);
        assert!(settings.pipeline.workers > 0);
        assert!(settings.updates.enabled);
    }

    #[test]
    fn validate_rejects_backoff_inversion() {
        let mut cfg = inputs::ConfigInput::merge_fragments(vec![]);
        cfg.server.api_url = "https://mgmt.example.com/api/".to_string();
        cfg.server.events_url = "wss://mgmt.example.com/events".to_string();
        cfg.session.min_backoff_secs = 60;
        cfg.session.max_backoff_secs = 5;
        Settings::validate(cfg).unwrap_err();
    }
}
