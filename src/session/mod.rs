//! Control-plane session manager.
//!
//! Owns the event transport for the whole process: drives the connection
//! state machine (connect, authenticate, reconnect with backoff), fans
//! inbound events out to subscriber sinks, and forwards outbound events
//! fire-and-forget. Subscribers hand in their sinks once at start; there is
//! no dynamic subscription registry.

mod events;
mod transport;

pub(crate) use events::{OutboundEvent, StatusUpdate, UpdateStatus, UpdateStatusKind};
pub(crate) use transport::Identification;

use crate::commands::{CommandRequest, CommandResult};
use crate::config::SessionSettings;
use crate::control_plane;
use crate::identity::IdentityStore;
use crate::update::UpdateNotification;
use anyhow::{Context, Result};
use events::{AuthFailedPayload, Envelope};
use lazy_static::lazy_static;
use prometheus::IntCounter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use transport::Transport;
use url::Url;

/// Default reconnect backoff floor (in seconds).
pub(crate) const DEFAULT_MIN_BACKOFF_SECS: u64 = 1;

/// Default reconnect backoff cap (in seconds).
pub(crate) const DEFAULT_MAX_BACKOFF_SECS: u64 = 300; // 5 minutes.

/// Default wait for the authentication verdict (in seconds).
pub(crate) const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 30;

/// Outbound queue depth; overflow drops with a warning.
const OUTBOUND_QUEUE: usize = 64;

lazy_static! {
    static ref RECONNECT_ATTEMPTS: IntCounter = register_int_counter!(opts!(
        "outpost_session_reconnect_attempts_total",
        "Total number of transport reconnect attempts."
    ))
    .unwrap();
    static ref AUTH_FAILURES: IntCounter = register_int_counter!(opts!(
        "outpost_session_auth_failures_total",
        "Total number of terminal authentication failures."
    ))
    .unwrap();
    static ref DROPPED_OUTBOUND: IntCounter = register_int_counter!(opts!(
        "outpost_session_dropped_outbound_total",
        "Total number of outbound events dropped while not authenticated."
    ))
    .unwrap();
}

/// Terminal failure kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FailureKind {
    /// Authentication rejected; re-registration required.
    Auth,
    /// Reconnect attempts exhausted.
    Network,
}

/// State machine for the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SessionState {
    /// No transport, no retries pending.
    Disconnected,
    /// First transport attempt in flight.
    Connecting,
    /// Transport up, waiting for the authentication verdict.
    Authenticating,
    /// Session established; outbound events flow.
    Authenticated,
    /// Transport lost, retry number `attempt` pending.
    Reconnecting(u32),
    /// Terminal failure.
    Failed(FailureKind),
}

impl SessionState {
    /// Transition to the Connecting state.
    fn connecting(&mut self) {
        let target = SessionState::Connecting;
        // Allowed starting states.
        assert!(
            *self == SessionState::Disconnected,
            "transition not allowed: {:?} to {:?}",
            self,
            target,
        );

        *self = target;
    }

    /// Transition to the Authenticating state.
    fn authenticating(&mut self) {
        let target = SessionState::Authenticating;
        // Allowed starting states.
        assert!(
            *self == SessionState::Connecting
                || matches!(self, SessionState::Reconnecting(_)),
            "transition not allowed: {:?} to {:?}",
            self,
            target,
        );

        *self = target;
    }

    /// Transition to the Authenticated state.
    fn authenticated(&mut self) {
        let target = SessionState::Authenticated;
        // Allowed starting states.
        assert!(
            *self == SessionState::Authenticating,
            "transition not allowed: {:?} to {:?}",
            self,
            target,
        );

        *self = target;
    }

    /// Transition to the Reconnecting state for the given attempt.
    fn reconnecting(&mut self, attempt: u32) {
        let target = SessionState::Reconnecting(attempt);
        // Allowed starting states.
        assert!(
            matches!(
                self,
                SessionState::Connecting
                    | SessionState::Authenticating
                    | SessionState::Authenticated
                    | SessionState::Reconnecting(_)
            ),
            "transition not allowed: {:?} to {:?}",
            self,
            target,
        );

        *self = target;
    }

    /// Transition to a terminal Failed state.
    fn failed(&mut self, kind: FailureKind) {
        let target = SessionState::Failed(kind);
        // Allowed starting states.
        assert!(
            match kind {
                FailureKind::Auth => matches!(
                    self,
                    SessionState::Authenticating | SessionState::Authenticated
                ),
                FailureKind::Network => matches!(self, SessionState::Reconnecting(_)),
            },
            "transition not allowed: {:?} to {:?}",
            self,
            target,
        );

        *self = target;
    }

    /// Transition to the Disconnected state; allowed from anywhere.
    fn disconnected(&mut self) {
        *self = SessionState::Disconnected;
    }
}

/// Session lifecycle notifications, surfaced to the process root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum LifecycleEvent {
    Connected,
    Disconnected { reason: String },
    AuthFailed { reason: String },
}

/// Subscriber sinks, handed in once at connect time.
#[derive(Debug)]
pub(crate) struct SessionSinks {
    pub(crate) commands: mpsc::Sender<CommandRequest>,
    pub(crate) updates: mpsc::Sender<UpdateNotification>,
    pub(crate) lifecycle: mpsc::Sender<LifecycleEvent>,
}

/// Why the session runner ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// Orderly shutdown via `disconnect` or the process shutdown signal.
    Shutdown,
    /// The control plane rejected authentication; terminal.
    AuthFailed { reason: String },
    /// Reconnect attempts exhausted.
    Exhausted,
}

/// Cloneable handle for event emitters.
///
/// Emission is gated: while the session is not authenticated, events are
/// dropped with a warning rather than buffered.
#[derive(Clone, Debug)]
pub(crate) struct SessionHandle {
    outbound: mpsc::Sender<OutboundEvent>,
    state_rx: watch::Receiver<SessionState>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Current session state.
    pub(crate) fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    /// Queue a telemetry sample.
    pub(crate) fn emit_status(&self, status: StatusUpdate) {
        self.emit(OutboundEvent::Status(status));
    }

    /// Queue a completed command result.
    pub(crate) fn emit_command_result(&self, result: CommandResult) {
        self.emit(OutboundEvent::CommandResult(result));
    }

    /// Queue an update progress/failure report.
    pub(crate) fn emit_update_status(&self, status: UpdateStatus) {
        self.emit(OutboundEvent::UpdateStatus(status));
    }

    /// Tear the session down; idempotent.
    ///
    /// After this returns, no further outbound events are emitted.
    pub(crate) fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// Handle wired to an in-memory sink, pre-authenticated.
    #[cfg(test)]
    pub(crate) fn mock_authenticated() -> (Self, mpsc::Receiver<OutboundEvent>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        // The receiver keeps the last observed state after the sender drops.
        let (_state_tx, state_rx) = watch::channel(SessionState::Authenticated);
        (
            Self {
                outbound,
                state_rx,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    fn emit(&self, event: OutboundEvent) {
        if self.cancel.is_cancelled() || *self.state_rx.borrow() != SessionState::Authenticated {
            log::warn!("session not authenticated, dropping outbound {:?}", kind_of(&event));
            DROPPED_OUTBOUND.inc();
            return;
        }
        if self.outbound.try_send(event).is_err() {
            log::warn!("outbound queue full or closed, dropping event");
            DROPPED_OUTBOUND.inc();
        }
    }
}

fn kind_of(event: &OutboundEvent) -> &'static str {
    match event {
        OutboundEvent::Status(_) => "status.update",
        OutboundEvent::CommandResult(_) => "command.result",
        OutboundEvent::UpdateStatus(_) => "update.status",
    }
}

/// Session manager entry point.
pub(crate) struct SessionManager {}

impl SessionManager {
    /// Start the session runner.
    ///
    /// Fails up front when no identification is available: an unregistered
    /// agent cannot connect, and the caller must run registration first.
    pub(crate) fn connect(
        events_url: Url,
        cfg: SessionSettings,
        identification: Option<Identification>,
        http: Arc<control_plane::Client>,
        store: Arc<IdentityStore>,
        sinks: SessionSinks,
        shutdown: CancellationToken,
    ) -> Result<(SessionHandle, tokio::task::JoinHandle<SessionEnd>)> {
        let identification =
            identification.context("missing agent identity, run registration first")?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let cancel = shutdown.child_token();

        let runner = Runner {
            events_url,
            cfg,
            identification,
            http,
            store,
            sinks,
            outbound_rx,
            state_tx,
            cancel: cancel.clone(),
            state: SessionState::Disconnected,
        };
        let task = tokio::spawn(runner.run());

        Ok((
            SessionHandle {
                outbound: outbound_tx,
                state_rx,
                cancel,
            },
            task,
        ))
    }
}

/// Authentication verdict for one transport attempt.
enum AuthVerdict {
    Granted,
    Rejected(String),
    Dropped,
}

/// Why the serve loop ended.
enum ServeEnd {
    Shutdown,
    TransportDrop(String),
    AuthRejected(String),
}

struct Runner {
    events_url: Url,
    cfg: SessionSettings,
    identification: Identification,
    http: Arc<control_plane::Client>,
    store: Arc<IdentityStore>,
    sinks: SessionSinks,
    outbound_rx: mpsc::Receiver<OutboundEvent>,
    state_tx: watch::Sender<SessionState>,
    cancel: CancellationToken,
    state: SessionState,
}

impl Runner {
    async fn run(mut self) -> SessionEnd {
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return self.end_disconnected();
            }
            if attempt == 0 {
                self.state.connecting();
                self.publish_state();
            }

            match Transport::connect(&self.events_url, &self.identification).await {
                Ok(mut transport) => {
                    self.state.authenticating();
                    self.publish_state();

                    match self.authenticate(&mut transport).await {
                        AuthVerdict::Granted => {
                            attempt = 0;
                            self.state.authenticated();
                            self.publish_state();
                            log::info!("session established with the control plane");
                            let _ = self.sinks.lifecycle.send(LifecycleEvent::Connected).await;

                            let end = self.serve(&mut transport).await;
                            transport.close().await;
                            match end {
                                ServeEnd::Shutdown => return self.end_disconnected(),
                                ServeEnd::AuthRejected(reason) => {
                                    return self.end_auth_failed(reason).await
                                }
                                ServeEnd::TransportDrop(reason) => {
                                    log::warn!("session dropped: {}", reason);
                                    let _ = self
                                        .sinks
                                        .lifecycle
                                        .send(LifecycleEvent::Disconnected { reason })
                                        .await;
                                }
                            }
                        }
                        AuthVerdict::Rejected(reason) => {
                            transport.close().await;
                            return self.end_auth_failed(reason).await;
                        }
                        AuthVerdict::Dropped => {
                            log::warn!("transport dropped before authentication concluded");
                            transport.close().await;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("transport connect failed: {}", e);
                    if e.wants_token_refresh() {
                        self.try_refresh_token().await;
                    }
                }
            }

            attempt = attempt.saturating_add(1);
            if self.cfg.max_reconnect_attempts != 0 && attempt > self.cfg.max_reconnect_attempts {
                log::error!(
                    "giving up after {} reconnect attempts",
                    self.cfg.max_reconnect_attempts
                );
                self.state.failed(FailureKind::Network);
                self.publish_state();
                let _ = self
                    .sinks
                    .lifecycle
                    .send(LifecycleEvent::Disconnected {
                        reason: "reconnect attempts exhausted".to_string(),
                    })
                    .await;
                return SessionEnd::Exhausted;
            }

            RECONNECT_ATTEMPTS.inc();
            self.state.reconnecting(attempt);
            self.publish_state();
            let pause = backoff_delay(attempt, self.cfg.min_backoff, self.cfg.max_backoff);
            log::trace!("reconnect attempt {} in {:?}", attempt, pause);
            tokio::select! {
                _ = self.cancel.cancelled() => return self.end_disconnected(),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Wait for the authentication verdict on a fresh transport.
    ///
    /// With `implicit_auth`, a successful transport connect is the verdict;
    /// this accommodates control planes that never send `auth_success`.
    async fn authenticate(&mut self, transport: &mut Transport) -> AuthVerdict {
        if self.cfg.implicit_auth {
            return AuthVerdict::Granted;
        }

        let verdict = tokio::time::timeout(self.cfg.auth_timeout, async {
            loop {
                match transport.next_event().await {
                    Some(envelope) => match envelope.event.as_str() {
                        events::AUTH_SUCCESS => return AuthVerdict::Granted,
                        events::AUTH_FAILED => {
                            let reason = envelope
                                .parse_payload::<AuthFailedPayload>()
                                .map(|p| p.reason)
                                .unwrap_or_default();
                            return AuthVerdict::Rejected(reason);
                        }
                        other => {
                            log::debug!("ignoring '{}' event before authentication", other)
                        }
                    },
                    None => return AuthVerdict::Dropped,
                }
            }
        })
        .await;

        match verdict {
            Ok(v) => v,
            Err(_) => {
                log::warn!(
                    "no authentication verdict within {:?}",
                    self.cfg.auth_timeout
                );
                AuthVerdict::Dropped
            }
        }
    }

    /// Authenticated event loop: demultiplex inbound, drain outbound.
    async fn serve(&mut self, transport: &mut Transport) -> ServeEnd {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return ServeEnd::Shutdown,
                inbound = transport.next_event() => match inbound {
                    Some(envelope) => {
                        if let Some(end) = self.dispatch_inbound(envelope).await {
                            return end;
                        }
                    }
                    None => return ServeEnd::TransportDrop("transport closed".to_string()),
                },
                outbound = self.outbound_rx.recv() => match outbound {
                    Some(event) => self.forward_outbound(transport, event).await,
                    // All emitter handles are gone; the process is going down.
                    None => return ServeEnd::Shutdown,
                },
            }
        }
    }

    /// Route one inbound envelope; parse failures log and discard.
    async fn dispatch_inbound(&mut self, envelope: Envelope) -> Option<ServeEnd> {
        match envelope.event.as_str() {
            events::COMMAND_EXECUTE => match envelope.parse_payload::<CommandRequest>() {
                Ok(request) => {
                    log::info!(
                        "received command {} ({})",
                        request.command_id,
                        request.command_type
                    );
                    if self.sinks.commands.send(request).await.is_err() {
                        log::error!("command sink closed, dropping request");
                    }
                }
                Err(e) => log::warn!("{:#}", e),
            },
            events::VERSION_AVAILABLE => match envelope.parse_payload::<UpdateNotification>() {
                Ok(notification) => {
                    log::info!("update available: {}", notification.version);
                    if self.sinks.updates.send(notification).await.is_err() {
                        log::error!("update sink closed, dropping notification");
                    }
                }
                Err(e) => log::warn!("{:#}", e),
            },
            events::AUTH_FAILED => {
                let reason = envelope
                    .parse_payload::<AuthFailedPayload>()
                    .map(|p| p.reason)
                    .unwrap_or_default();
                return Some(ServeEnd::AuthRejected(reason));
            }
            events::AUTH_SUCCESS => log::debug!("redundant auth_success ignored"),
            other => log::warn!("unknown event '{}' discarded", other),
        }
        None
    }

    /// Fire-and-forget outbound send; failures are logged, not surfaced.
    async fn forward_outbound(&mut self, transport: &mut Transport, event: OutboundEvent) {
        let name = kind_of(&event);
        match event.into_envelope() {
            Ok(envelope) => {
                if let Err(e) = transport.send(&envelope).await {
                    log::warn!("failed to send '{}': {:#}", name, e);
                }
            }
            Err(e) => log::warn!("{:#}", e),
        }
    }

    /// Refresh the bearer token after a handshake-level auth rejection.
    ///
    /// Best effort: the refreshed token is persisted sealed so the next
    /// process start picks it up, and failures leave the old token in place
    /// for the normal reconnect path.
    async fn try_refresh_token(&mut self) {
        log::info!("transport identification rejected, attempting token refresh");
        let refreshed = self
            .http
            .refresh_token(&self.identification.agent_id, &self.identification.bearer_token)
            .await;
        let token = match refreshed {
            Ok(t) => t,
            Err(e) => {
                log::warn!("token refresh failed: {:#}", e);
                return;
            }
        };

        self.identification.bearer_token = token.clone();
        let persisted = self.store.load().and_then(|identity| match identity {
            Some(mut identity) => {
                identity.encrypted_token = self.store.seal_token(&token)?;
                self.store.save(&identity)
            }
            None => Ok(()),
        });
        if let Err(e) = persisted {
            log::warn!("failed to persist refreshed token: {:#}", e);
        }
    }

    fn publish_state(&self) {
        let _ = self.state_tx.send(self.state.clone());
    }

    fn end_disconnected(&mut self) -> SessionEnd {
        self.state.disconnected();
        self.publish_state();
        SessionEnd::Shutdown
    }

    async fn end_auth_failed(&mut self, reason: String) -> SessionEnd {
        AUTH_FAILURES.inc();
        log::error!("authentication rejected by the control plane: '{}'", reason);
        self.state.failed(FailureKind::Auth);
        self.publish_state();
        let _ = self
            .sinks
            .lifecycle
            .send(LifecycleEvent::AuthFailed {
                reason: reason.clone(),
            })
            .await;
        SessionEnd::AuthFailed { reason }
    }
}

/// Full-jitter exponential backoff: uniform over zero to the current
/// ceiling, which doubles per attempt from the floor up to the cap.
fn backoff_delay(attempt: u32, min_backoff: Duration, max_backoff: Duration) -> Duration {
    use rand::Rng;

    let exp = attempt.saturating_sub(1).min(16);
    let ceiling_ms = (min_backoff.as_millis() as u64)
        .saturating_mul(1u64 << exp)
        .min(max_backoff.as_millis() as u64);
    let jittered = rand::thread_rng().gen_range(0..=ceiling_ms);
    Duration::from_millis(jittered)
}
