//! Configuration fragments merged, but not yet validated.

use crate::config::fragments;
use crate::pipeline::{DEFAULT_QUEUE_CAPACITY, DEFAULT_TIMEOUT_SECS, DEFAULT_WORKERS};
use crate::session::{
    DEFAULT_AUTH_TIMEOUT_SECS, DEFAULT_MAX_BACKOFF_SECS, DEFAULT_MIN_BACKOFF_SECS,
};
use crate::telemetry::DEFAULT_STATUS_INTERVAL_SECS;
use crate::update::{DEFAULT_SERVICE_WAIT_TIMEOUT_SECS, DEFAULT_WATCHDOG_PERIOD_SECS};
use anyhow::{Context, Result};
use log::trace;

/// Runtime configuration holding environmental inputs.
#[derive(Debug)]
pub(crate) struct ConfigInput {
    pub(crate) agent: AgentInput,
    pub(crate) server: ServerInput,
    pub(crate) session: SessionInput,
    pub(crate) telemetry: TelemetryInput,
    pub(crate) pipeline: PipelineInput,
    pub(crate) updates: UpdateInput,
}

impl ConfigInput {
    /// Read config fragments and merge them into a single config.
    pub(crate) fn read_configs(
        dirs: Vec<String>,
        common_path: &str,
        extensions: Vec<String>,
    ) -> Result<Self> {
        let extensions: Vec<&str> = extensions.iter().map(|s| s.as_str()).collect();
        let scanned = liboverdrop::scan(dirs, common_path, &extensions, true);

        let mut fragments = Vec::new();
        for (_, fpath) in scanned {
            trace!("reading config fragment '{}'", fpath.display());

            let content = std::fs::read(&fpath)
                .with_context(|| format!("failed to read file '{}'", fpath.display()))?;
            let frag: fragments::ConfigFragment =
                toml::from_slice(&content).context("failed to parse TOML")?;

            fragments.push(frag);
        }

        let cfg = Self::merge_fragments(fragments);
        Ok(cfg)
    }

    /// Merge multiple fragments into a single configuration.
    pub(crate) fn merge_fragments(fragments: Vec<fragments::ConfigFragment>) -> Self {
        let mut agents = vec![];
        let mut servers = vec![];
        let mut sessions = vec![];
        let mut telemetries = vec![];
        let mut pipelines = vec![];
        let mut updates = vec![];

        for snip in fragments {
            if let Some(a) = snip.agent {
                agents.push(a);
            }
            if let Some(s) = snip.server {
                servers.push(s);
            }
            if let Some(s) = snip.session {
                sessions.push(s);
            }
            if let Some(t) = snip.telemetry {
                telemetries.push(t);
            }
            if let Some(p) = snip.pipeline {
                pipelines.push(p);
            }
            if let Some(u) = snip.updates {
                updates.push(u);
            }
        }

        Self {
            agent: AgentInput::from_fragments(agents),
            server: ServerInput::from_fragments(servers),
            session: SessionInput::from_fragments(sessions),
            telemetry: TelemetryInput::from_fragments(telemetries),
            pipeline: PipelineInput::from_fragments(pipelines),
            updates: UpdateInput::from_fragments(updates),
        }
    }
}

/// Config for agent base directories.
#[derive(Debug)]
pub(crate) struct AgentInput {
    pub(crate) data_dir: String,
    pub(crate) install_dir: String,
}

impl AgentInput {
    fn from_fragments(fragments: Vec<fragments::AgentFragment>) -> Self {
        let mut cfg = Self {
            data_dir: "/var/lib/outpost".to_string(),
            install_dir: "/usr/lib/outpost".to_string(),
        };

        for snip in fragments {
            if let Some(d) = snip.data_dir {
                cfg.data_dir = d;
            }
            if let Some(i) = snip.install_dir {
                cfg.install_dir = i;
            }
        }

        cfg
    }
}

/// Config for control-plane endpoints.
#[derive(Debug)]
pub(crate) struct ServerInput {
    pub(crate) api_url: String,
    pub(crate) events_url: String,
}

impl ServerInput {
    fn from_fragments(fragments: Vec<fragments::ServerFragment>) -> Self {
        let mut cfg = Self {
            api_url: String::new(),
            events_url: String::new(),
        };

        for snip in fragments {
            if let Some(u) = snip.api_url {
                cfg.api_url = u;
            }
            if let Some(u) = snip.events_url {
                cfg.events_url = u;
            }
        }

        cfg
    }
}

/// Config for session lifecycle tuning.
#[derive(Debug)]
pub(crate) struct SessionInput {
    pub(crate) min_backoff_secs: u64,
    pub(crate) max_backoff_secs: u64,
    /// 0 is the "never give up" sentinel.
    pub(crate) max_reconnect_attempts: u32,
    pub(crate) auth_timeout_secs: u64,
    pub(crate) implicit_auth: bool,
}

impl SessionInput {
    fn from_fragments(fragments: Vec<fragments::SessionFragment>) -> Self {
        let mut cfg = Self {
            min_backoff_secs: DEFAULT_MIN_BACKOFF_SECS,
            max_backoff_secs: DEFAULT_MAX_BACKOFF_SECS,
            max_reconnect_attempts: 0,
            auth_timeout_secs: DEFAULT_AUTH_TIMEOUT_SECS,
            implicit_auth: false,
        };

        for snip in fragments {
            if let Some(s) = snip.min_backoff_secs {
                cfg.min_backoff_secs = s;
            }
            if let Some(s) = snip.max_backoff_secs {
                cfg.max_backoff_secs = s;
            }
            if let Some(n) = snip.max_reconnect_attempts {
                cfg.max_reconnect_attempts = n;
            }
            if let Some(s) = snip.auth_timeout_secs {
                cfg.auth_timeout_secs = s;
            }
            if let Some(b) = snip.implicit_auth {
                cfg.implicit_auth = b;
            }
        }

        cfg
    }
}

/// Config for telemetry reporting.
#[derive(Debug)]
pub(crate) struct TelemetryInput {
    pub(crate) interval_secs: u64,
}

impl TelemetryInput {
    fn from_fragments(fragments: Vec<fragments::TelemetryFragment>) -> Self {
        let mut cfg = Self {
            interval_secs: DEFAULT_STATUS_INTERVAL_SECS,
        };

        for snip in fragments {
            if let Some(s) = snip.interval_secs {
                cfg.interval_secs = s;
            }
        }

        cfg
    }
}

/// Config for the command pipeline.
#[derive(Debug)]
pub(crate) struct PipelineInput {
    pub(crate) queue_capacity: usize,
    pub(crate) workers: usize,
    pub(crate) default_timeout_secs: u64,
}

impl PipelineInput {
    fn from_fragments(fragments: Vec<fragments::PipelineFragment>) -> Self {
        let mut cfg = Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: DEFAULT_WORKERS,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
        };

        for snip in fragments {
            if let Some(c) = snip.queue_capacity {
                cfg.queue_capacity = c;
            }
            if let Some(w) = snip.workers {
                cfg.workers = w;
            }
            if let Some(s) = snip.default_timeout_secs {
                cfg.default_timeout_secs = s;
            }
        }

        cfg
    }
}

/// Config for self-update behavior.
#[derive(Debug)]
pub(crate) struct UpdateInput {
    pub(crate) enabled: bool,
    pub(crate) service_name: String,
    pub(crate) service_wait_timeout_secs: u64,
    pub(crate) watchdog_period_secs: u64,
    pub(crate) exclude: Vec<String>,
}

impl UpdateInput {
    fn from_fragments(fragments: Vec<fragments::UpdateFragment>) -> Self {
        let mut cfg = Self {
            enabled: true,
            service_name: "outpost.service".to_string(),
            service_wait_timeout_secs: DEFAULT_SERVICE_WAIT_TIMEOUT_SECS,
            watchdog_period_secs: DEFAULT_WATCHDOG_PERIOD_SECS,
            exclude: vec![],
        };

        for snip in fragments {
            if let Some(e) = snip.enabled {
                cfg.enabled = e;
            }
            if let Some(n) = snip.service_name {
                cfg.service_name = n;
            }
            if let Some(s) = snip.service_wait_timeout_secs {
                cfg.service_wait_timeout_secs = s;
            }
            if let Some(s) = snip.watchdog_period_secs {
                cfg.watchdog_period_secs = s;
            }
            if let Some(x) = snip.exclude {
                cfg.exclude = x;
            }
        }

        cfg
    }
}
