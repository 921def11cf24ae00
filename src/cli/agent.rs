//! Logic for the default (service) run mode.

use crate::commands::{HandlerCtx, SoftwareIndex};
use crate::config;
use crate::control_plane;
use crate::identity::{self, AgentIdentity, IdentityStore, NoopSealer};
use crate::ignored_versions::IgnoredVersions;
use crate::metrics;
use crate::pipeline;
use crate::session::{
    Identification, LifecycleEvent, SessionEnd, SessionManager, SessionSinks,
};
use crate::telemetry;
use crate::update;
use crate::utils;
use actix::Actor;
use anyhow::{bail, Context, Result};
use clap::{crate_name, crate_version};
use lazy_static::lazy_static;
use log::{info, trace};
use prometheus::IntGauge;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

lazy_static! {
    static ref PROCESS_START_TIME: IntGauge = register_int_gauge!(opts!(
        "process_start_time_seconds",
        "Start time of the process since unix epoch in seconds."
    ))
    .unwrap();
}

/// Agent entry-point.
pub(crate) fn run_agent() -> Result<()> {
    info!(
        "starting endpoint agent ({} {})",
        crate_name!(),
        crate_version!()
    );

    let settings = config::Settings::assemble()?;
    std::fs::create_dir_all(settings.data_dir.join("logs"))
        .with_context(|| format!("failed to create '{}'", settings.data_dir.display()))?;

    // Fatal when another instance holds the lock.
    let _instance_guard = utils::InstanceGuard::acquire(settings.data_dir.join("agent.lock"))
        .context("single-instance check failed")?;

    let store = Arc::new(IdentityStore::open(
        &settings.data_dir,
        Box::new(NoopSealer::default()),
    ));
    let ignored = Arc::new(
        IgnoredVersions::load(&settings.data_dir)
            .context("failed to load ignored-versions store")?,
    );

    // Expose process start timestamp.
    let start_time = chrono::Utc::now();
    PROCESS_START_TIME.set(start_time.timestamp());

    trace!("creating actor system");
    let shutdown = CancellationToken::new();
    let sys = actix::System::new();
    sys.block_on(run_services(settings, store, ignored, shutdown))
}

/// Wire up and supervise all long-running tasks.
async fn run_services(
    settings: config::Settings,
    store: Arc<IdentityStore>,
    ignored: Arc<IgnoredVersions>,
    shutdown: CancellationToken,
) -> Result<()> {
    // Termination signals drive the shared shutdown token.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};

            let mut term =
                signal(SignalKind::terminate()).expect("failed to set SIGTERM handler");
            let mut int = signal(SignalKind::interrupt()).expect("failed to set SIGINT handler");
            tokio::select! {
                _ = term.recv() => {}
                _ = int.recv() => {}
            }
            info!("termination signal received, shutting down");
            shutdown.cancel();
        });
    }

    trace!("creating metrics service");
    match metrics::MetricsService::bind_socket() {
        Ok(service) => {
            service.start();
        }
        // Non-fatal: the agent is useful without a local scrape endpoint.
        Err(e) => log::warn!("metrics service disabled: {:#}", e),
    }

    let http = Arc::new(
        control_plane::ClientBuilder::new(settings.api_url.as_str())
            .build()
            .context("failed to build control-plane client")?,
    );

    let identity = store.load()?;
    let identification = match &identity {
        Some(identity) => Some(Identification {
            agent_id: identity.agent_id.clone(),
            bearer_token: store.unseal_token(identity)?,
        }),
        None => None,
    };
    if let Some(identity) = &identity {
        info!("agent '{}' resuming session", identity.agent_id);
    }

    let (commands_tx, mut commands_rx) = mpsc::channel(settings.pipeline.queue_capacity.max(1));
    let (updates_tx, updates_rx) = mpsc::channel(4);
    let (lifecycle_tx, mut lifecycle_rx) = mpsc::channel(8);
    let (results_tx, mut results_rx) = mpsc::channel(64);

    trace!("creating session manager");
    let (session, session_task) = SessionManager::connect(
        settings.events_url.clone(),
        settings.session.clone(),
        identification,
        Arc::clone(&http),
        Arc::clone(&store),
        SessionSinks {
            commands: commands_tx,
            updates: updates_tx,
            lifecycle: lifecycle_tx,
        },
        shutdown.clone(),
    )?;

    trace!("creating command pipeline");
    let handler_ctx = Arc::new(HandlerCtx {
        data_dir: settings.data_dir.clone(),
        http: Arc::clone(&http),
        software_index: SoftwareIndex::load(&settings.data_dir),
    });
    let pipeline_addr = pipeline::CommandPipeline::new(
        settings.pipeline.clone(),
        handler_ctx,
        results_tx,
        shutdown.clone(),
    )
    .start();

    // Inbound commands feed the pipeline; results flow back to the session.
    tokio::spawn(async move {
        while let Some(request) = commands_rx.recv().await {
            if pipeline_addr.send(pipeline::Enqueue(request)).await.is_err() {
                break;
            }
        }
    });
    {
        let session = session.clone();
        tokio::spawn(async move {
            while let Some(result) = results_rx.recv().await {
                session.emit_command_result(result);
            }
        });
    }

    tokio::spawn(async move {
        while let Some(event) = lifecycle_rx.recv().await {
            match event {
                LifecycleEvent::Connected => info!("control-plane session established"),
                LifecycleEvent::Disconnected { reason } => {
                    log::warn!("control-plane session lost: {}", reason)
                }
                LifecycleEvent::AuthFailed { reason } => {
                    log::error!("control-plane rejected this agent: '{}'", reason)
                }
            }
        }
    });

    trace!("creating telemetry reporter");
    tokio::spawn(telemetry::report_loop(
        Box::new(telemetry::SysinfoSource::new()),
        session.clone(),
        settings.status_interval,
        shutdown.clone(),
    ));

    trace!("creating update orchestrator");
    let orchestrator = update::Orchestrator::new(
        settings.updates.clone(),
        settings.data_dir.clone(),
        settings.install_dir.clone(),
        crate_version!().to_string(),
        Arc::clone(&http),
        Arc::clone(&ignored),
        session.clone(),
        shutdown.clone(),
    );
    tokio::spawn(orchestrator.run(updates_rx));

    // The session runner's end is the agent's end.
    let end = session_task.await.unwrap_or(SessionEnd::Shutdown);
    shutdown.cancel();
    match end {
        SessionEnd::Shutdown => {
            info!("agent stopped");
            Ok(())
        }
        SessionEnd::AuthFailed { reason } => {
            re_register(&http, &store)
                .await
                .with_context(|| {
                    format!(
                        "authentication rejected ('{}') and re-registration failed; \
                         run 'outpost configure'",
                        reason
                    )
                })?;
            // The service manager restarts the agent, which then connects
            // with the fresh identity.
            bail!("re-registered after auth rejection ('{}'), restarting", reason)
        }
        SessionEnd::Exhausted => bail!("control plane unreachable, giving up"),
    }
}

/// Exchange the hardware fingerprint for a fresh identity.
async fn re_register(http: &control_plane::Client, store: &IdentityStore) -> Result<()> {
    log::warn!("attempting automatic re-registration");
    let fingerprint = identity::hardware_fingerprint()?;
    let response = http.identify(&fingerprint, None).await?;

    let identity = AgentIdentity {
        agent_id: response.agent_id.clone(),
        encrypted_token: store.seal_token(&response.token)?,
        position: response.position,
    };
    store.save(&identity)?;
    info!("re-registered as agent '{}'", response.agent_id);
    Ok(())
}
