//! Command pipeline: bounded queue plus dispatcher actor.
//!
//! Requests enter through [`Enqueue`] in arrival order. The dispatcher runs
//! up to the configured number of workers in parallel, serializes
//! non-reentrant command types, and enforces per-command timeouts against a
//! cancellation signal chained off process shutdown. Exactly one
//! [`CommandResult`] leaves the pipeline per accepted request.

use crate::commands::{
    self, CommandKind, CommandOutputResult, CommandRequest, CommandResult, EXIT_CANCELLED,
    EXIT_HANDLER_ERROR, EXIT_REJECTED, EXIT_TIMEOUT,
};
use crate::config::PipelineSettings;
use actix::prelude::*;
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default bound on pending commands.
pub(crate) const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Default worker parallelism.
pub(crate) const DEFAULT_WORKERS: usize = 4;

/// Default per-command timeout (in seconds).
pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 300; // 5 minutes.

lazy_static! {
    static ref COMMANDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "outpost_pipeline_commands_total",
        "Total number of commands accepted by the pipeline.",
        &["type"]
    )
    .unwrap();
    static ref COMMANDS_REJECTED: IntCounter = register_int_counter!(opts!(
        "outpost_pipeline_commands_rejected_total",
        "Total number of commands evicted from a full queue."
    ))
    .unwrap();
    static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(opts!(
        "outpost_pipeline_queue_depth",
        "Number of commands waiting for dispatch."
    ))
    .unwrap();
}

/// A queued request with its arrival sequence number.
#[derive(Debug)]
struct Queued {
    seq: u64,
    request: CommandRequest,
}

/// The pipeline actor.
pub(crate) struct CommandPipeline {
    settings: PipelineSettings,
    handler_ctx: Arc<commands::HandlerCtx>,
    results: mpsc::Sender<CommandResult>,
    shutdown: CancellationToken,
    queue: VecDeque<Queued>,
    running: Vec<(String, CommandKind)>,
    next_seq: u64,
}

impl CommandPipeline {
    pub(crate) fn new(
        settings: PipelineSettings,
        handler_ctx: Arc<commands::HandlerCtx>,
        results: mpsc::Sender<CommandResult>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            settings,
            handler_ctx,
            results,
            shutdown,
            queue: VecDeque::new(),
            running: Vec::new(),
            next_seq: 0,
        }
    }

    /// Timeout resolution: request parameter, then handler default, then
    /// the global default.
    fn resolve_timeout(&self, request: &CommandRequest) -> Duration {
        request
            .timeout_param()
            .or_else(|| request.command_type.default_timeout())
            .unwrap_or(self.settings.default_timeout)
    }

    fn kind_running(&self, kind: CommandKind) -> bool {
        self.running.iter().any(|(_, k)| *k == kind)
    }

    /// First queued request allowed to start right now.
    ///
    /// Scanning front-to-back keeps enqueue order as dispatch order within
    /// each serialized type.
    fn eligible_index(&self) -> Option<usize> {
        self.queue.iter().position(|q| {
            q.request.command_type.is_reentrant() || !self.kind_running(q.request.command_type)
        })
    }

    fn send_result(&self, result: CommandResult) {
        if self.results.try_send(result).is_err() {
            log::error!("result sink closed or full, dropping command result");
        }
    }

    fn reject(&self, request: &CommandRequest) {
        COMMANDS_REJECTED.inc();
        log::warn!(
            "queue full, rejecting oldest pending command {}",
            request.command_id
        );
        let output = CommandOutputResult::synthesized(
            EXIT_REJECTED,
            "Rejected",
            "evicted from full command queue",
        );
        self.send_result(CommandResult::assemble(
            request.command_id.clone(),
            request.command_type,
            output,
            None,
        ));
    }

    /// Synthesize a cancellation result for a request that never started.
    fn cancel_unstarted(&self, request: &CommandRequest) {
        let output = CommandOutputResult::synthesized(
            EXIT_CANCELLED,
            "Cancelled",
            "cancelled by shutdown before dispatch",
        );
        self.send_result(CommandResult::assemble(
            request.command_id.clone(),
            request.command_type,
            output,
            None,
        ));
    }

    fn dispatch(&mut self, ctx: &mut Context<Self>) {
        if self.shutdown.is_cancelled() {
            self.drain_cancelled();
            return;
        }

        while self.running.len() < self.settings.workers {
            let idx = match self.eligible_index() {
                Some(idx) => idx,
                None => break,
            };
            let queued = self.queue.remove(idx).expect("eligible index in bounds");
            QUEUE_DEPTH.set(self.queue.len() as i64);
            self.spawn_command(ctx, queued);
        }
    }

    fn drain_cancelled(&mut self) {
        while let Some(queued) = self.queue.pop_front() {
            self.cancel_unstarted(&queued.request);
        }
        QUEUE_DEPTH.set(0);
    }

    fn spawn_command(&mut self, ctx: &mut Context<Self>, queued: Queued) {
        let request = queued.request;
        let cancel = self.shutdown.child_token();
        let timeout = self.resolve_timeout(&request);
        let handler_ctx = Arc::clone(&self.handler_ctx);
        let addr = ctx.address();

        log::trace!(
            "dispatching command {} ({}, seq {}), timeout {:?}",
            request.command_id,
            request.command_type,
            queued.seq,
            timeout
        );
        self.running
            .push((request.command_id.clone(), request.command_type));

        actix::spawn(async move {
            let expected = request.expected_exit_codes();
            let output = run_with_limits(&request, cancel, &handler_ctx, timeout).await;
            let result = CommandResult::assemble(
                request.command_id.clone(),
                request.command_type,
                output,
                expected.as_deref(),
            );
            let _ = addr
                .send(Completed {
                    command_id: request.command_id,
                    result,
                })
                .await;
        });
    }
}

/// Execute one handler under timeout and shutdown enforcement.
///
/// Dropping the handler future on timeout or cancellation also kills any
/// child process it spawned (`kill_on_drop`).
async fn run_with_limits(
    request: &CommandRequest,
    cancel: CancellationToken,
    handler_ctx: &commands::HandlerCtx,
    timeout: Duration,
) -> CommandOutputResult {
    tokio::select! {
        _ = cancel.cancelled() => CommandOutputResult::synthesized(
            EXIT_CANCELLED,
            "Cancelled",
            "command cancelled by shutdown",
        ),
        outcome = tokio::time::timeout(
            timeout,
            commands::execute(request, cancel.clone(), handler_ctx),
        ) => match outcome {
            Err(_) => CommandOutputResult::synthesized(
                EXIT_TIMEOUT,
                "Timeout",
                format!("command timed out after {} seconds", timeout.as_secs()),
            ),
            Ok(Ok(output)) => output,
            Ok(Err(e)) => CommandOutputResult::synthesized(
                EXIT_HANDLER_ERROR,
                "HandlerError",
                format!("{:#}", e),
            ),
        },
    }
}

impl Actor for CommandPipeline {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        log::trace!(
            "command pipeline started: capacity {}, workers {}",
            self.settings.queue_capacity,
            self.settings.workers
        );

        // Drain pending requests once shutdown is signalled, so every
        // accepted command still gets its result.
        let addr = ctx.address();
        let shutdown = self.shutdown.clone();
        actix::spawn(async move {
            shutdown.cancelled().await;
            let _ = addr.send(Drain {}).await;
        });
    }
}

/// Request: accept a command into the queue.
#[derive(Debug)]
pub(crate) struct Enqueue(pub(crate) CommandRequest);

impl Message for Enqueue {
    type Result = ();
}

impl Handler<Enqueue> for CommandPipeline {
    type Result = ();

    fn handle(&mut self, msg: Enqueue, ctx: &mut Self::Context) -> Self::Result {
        let request = msg.0;
        COMMANDS_TOTAL
            .with_label_values(&[&request.command_type.to_string()])
            .inc();

        if self.shutdown.is_cancelled() {
            self.cancel_unstarted(&request);
            return;
        }

        // Overflow evicts the oldest request that has not started yet, so
        // the control plane is never left waiting on an evicted command.
        if self.queue.len() >= self.settings.queue_capacity {
            if let Some(evicted) = self.queue.pop_front() {
                self.reject(&evicted.request);
            }
        }

        self.next_seq += 1;
        self.queue.push_back(Queued {
            seq: self.next_seq,
            request,
        });
        QUEUE_DEPTH.set(self.queue.len() as i64);

        self.dispatch(ctx);
    }
}

/// Internal: a dispatched command finished.
struct Completed {
    command_id: String,
    result: CommandResult,
}

impl Message for Completed {
    type Result = ();
}

impl Handler<Completed> for CommandPipeline {
    type Result = ();

    fn handle(&mut self, msg: Completed, ctx: &mut Self::Context) -> Self::Result {
        self.running.retain(|(id, _)| *id != msg.command_id);
        self.send_result(msg.result);
        self.dispatch(ctx);
    }
}

/// Internal: shutdown observed, flush the queue.
struct Drain {}

impl Message for Drain {
    type Result = ();
}

impl Handler<Drain> for CommandPipeline {
    type Result = ();

    fn handle(&mut self, _msg: Drain, _ctx: &mut Self::Context) -> Self::Result {
        self.drain_cancelled();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{HandlerCtx, SoftwareIndex};
    use crate::control_plane::ClientBuilder;

    fn mock_settings(queue_capacity: usize, workers: usize) -> PipelineSettings {
        PipelineSettings {
            queue_capacity,
            workers,
            default_timeout: Duration::from_secs(10),
        }
    }

    fn mock_handler_ctx(dir: &std::path::Path) -> Arc<HandlerCtx> {
        Arc::new(HandlerCtx {
            data_dir: dir.to_path_buf(),
            http: Arc::new(ClientBuilder::new("http://localhost:9/").build().unwrap()),
            software_index: SoftwareIndex::load(dir),
        })
    }

    fn console_request(id: &str, text: &str) -> CommandRequest {
        CommandRequest {
            command_id: id.to_string(),
            command_type: CommandKind::Console,
            command_text: text.to_string(),
            params: serde_json::Map::new(),
        }
    }

    fn pipeline_in(
        dir: &std::path::Path,
        settings: PipelineSettings,
        shutdown: CancellationToken,
    ) -> (CommandPipeline, mpsc::Receiver<CommandResult>) {
        let (results_tx, results_rx) = mpsc::channel(32);
        let pipeline =
            CommandPipeline::new(settings, mock_handler_ctx(dir), results_tx, shutdown);
        (pipeline, results_rx)
    }

    async fn next_result(rx: &mut mpsc::Receiver<CommandResult>) -> CommandResult {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("result within deadline")
            .expect("result channel open")
    }

    #[test]
    fn eligible_index_serializes_non_reentrant_kinds() {
        let tmpdir = tempfile::tempdir().unwrap();
        let (mut pipeline, _rx) = pipeline_in(
            tmpdir.path(),
            mock_settings(8, 4),
            CancellationToken::new(),
        );

        let mut uninstall = console_request("u1", "");
        uninstall.command_type = CommandKind::SoftwareUninstall;
        pipeline.queue.push_back(Queued {
            seq: 1,
            request: uninstall,
        });
        pipeline.queue.push_back(Queued {
            seq: 2,
            request: console_request("c1", "echo hi"),
        });

        // Nothing running: the uninstall at the front is eligible.
        assert_eq!(pipeline.eligible_index(), Some(0));

        // With an uninstall in flight, the next uninstall must wait but the
        // console command may overtake it.
        pipeline
            .running
            .push(("u0".to_string(), CommandKind::SoftwareUninstall));
        assert_eq!(pipeline.eligible_index(), Some(1));

        // Reentrant kinds never block each other.
        pipeline.running.push(("c0".to_string(), CommandKind::Console));
        assert_eq!(pipeline.eligible_index(), Some(1));
    }

    #[test]
    fn timeout_resolution_order() {
        let tmpdir = tempfile::tempdir().unwrap();
        let (pipeline, _rx) = pipeline_in(
            tmpdir.path(),
            mock_settings(8, 4),
            CancellationToken::new(),
        );

        // Global default for Console without a parameter.
        let plain = console_request("c1", "true");
        assert_eq!(pipeline.resolve_timeout(&plain), Duration::from_secs(10));

        // Parameter wins.
        let mut parametrized = console_request("c2", "true");
        parametrized
            .params
            .insert("timeout_sec".to_string(), serde_json::json!(7));
        assert_eq!(
            pipeline.resolve_timeout(&parametrized),
            Duration::from_secs(7)
        );

        // Handler default beats the global one.
        let mut get_logs = console_request("c3", "");
        get_logs.command_type = CommandKind::GetLogs;
        assert_eq!(
            pipeline.resolve_timeout(&get_logs),
            CommandKind::GetLogs.default_timeout().unwrap()
        );
    }

    #[test]
    fn happy_command_produces_one_result() {
        actix::System::new().block_on(async {
            let tmpdir = tempfile::tempdir().unwrap();
            let (pipeline, mut results) = pipeline_in(
                tmpdir.path(),
                mock_settings(8, 2),
                CancellationToken::new(),
            );
            let addr = pipeline.start();

            let mut request = console_request("c1", "echo hi");
            request
                .params
                .insert("timeout_sec".to_string(), serde_json::json!(5));
            addr.send(Enqueue(request)).await.unwrap();

            let result = next_result(&mut results).await;
            assert_eq!(result.command_id, "c1");
            assert!(result.success);
            assert_eq!(result.output.exit_code, 0);
            assert!(result.output.stdout.starts_with("hi"));

            // Exactly one result.
            assert!(results.try_recv().is_err());
        });
    }

    #[test]
    fn timeout_yields_reserved_code_within_deadline() {
        actix::System::new().block_on(async {
            let tmpdir = tempfile::tempdir().unwrap();
            let (pipeline, mut results) = pipeline_in(
                tmpdir.path(),
                mock_settings(8, 2),
                CancellationToken::new(),
            );
            let addr = pipeline.start();

            let mut request = console_request("slow", "sleep 30");
            request
                .params
                .insert("timeout_sec".to_string(), serde_json::json!(1));
            let started = std::time::Instant::now();
            addr.send(Enqueue(request)).await.unwrap();

            let result = next_result(&mut results).await;
            assert!(started.elapsed() < Duration::from_secs(2));
            assert_eq!(result.command_id, "slow");
            assert!(!result.success);
            assert_eq!(result.output.exit_code, EXIT_TIMEOUT);
            assert!(result
                .output
                .error_message
                .as_deref()
                .unwrap_or_default()
                .contains("timed out"));
        });
    }

    #[test]
    fn expected_exit_codes_make_success() {
        actix::System::new().block_on(async {
            let tmpdir = tempfile::tempdir().unwrap();
            let (pipeline, mut results) = pipeline_in(
                tmpdir.path(),
                mock_settings(8, 2),
                CancellationToken::new(),
            );
            let addr = pipeline.start();

            let mut request = console_request("c3", "exit 3");
            request.params.insert(
                "expected_exit_codes".to_string(),
                serde_json::json!([0, 3]),
            );
            addr.send(Enqueue(request)).await.unwrap();

            let result = next_result(&mut results).await;
            assert!(result.success);
            assert_eq!(result.output.exit_code, 3);
        });
    }

    #[test]
    fn shutdown_cancels_running_and_queued() {
        actix::System::new().block_on(async {
            let tmpdir = tempfile::tempdir().unwrap();
            let shutdown = CancellationToken::new();
            let (pipeline, mut results) = pipeline_in(
                tmpdir.path(),
                // One worker: the second command stays queued.
                mock_settings(8, 1),
                shutdown.clone(),
            );
            let addr = pipeline.start();

            addr.send(Enqueue(console_request("running", "sleep 30")))
                .await
                .unwrap();
            addr.send(Enqueue(console_request("queued", "echo hi")))
                .await
                .unwrap();

            tokio::time::sleep(Duration::from_millis(200)).await;
            shutdown.cancel();

            let mut seen = std::collections::HashMap::new();
            for _ in 0..2 {
                let result = next_result(&mut results).await;
                seen.insert(result.command_id.clone(), result);
            }
            assert_eq!(seen["running"].output.exit_code, EXIT_CANCELLED);
            assert_eq!(seen["queued"].output.exit_code, EXIT_CANCELLED);
            assert!(seen.values().all(|r| !r.success));
        });
    }

    #[test]
    fn overflow_evicts_oldest_pending() {
        actix::System::new().block_on(async {
            let tmpdir = tempfile::tempdir().unwrap();
            let shutdown = CancellationToken::new();
            let (pipeline, mut results) = pipeline_in(
                tmpdir.path(),
                // Single worker, single queue slot.
                mock_settings(1, 1),
                shutdown.clone(),
            );
            let addr = pipeline.start();

            // "first" occupies the worker; "second" waits; "third" evicts it.
            addr.send(Enqueue(console_request("first", "sleep 30")))
                .await
                .unwrap();
            addr.send(Enqueue(console_request("second", "echo two")))
                .await
                .unwrap();
            addr.send(Enqueue(console_request("third", "echo three")))
                .await
                .unwrap();

            let rejected = next_result(&mut results).await;
            assert_eq!(rejected.command_id, "second");
            assert!(!rejected.success);
            assert_eq!(rejected.output.exit_code, EXIT_REJECTED);
            assert_eq!(rejected.output.error_code.as_deref(), Some("Rejected"));

            // Let the rest drain.
            shutdown.cancel();
            let mut remaining = vec![
                next_result(&mut results).await,
                next_result(&mut results).await,
            ];
            remaining.sort_by(|a, b| a.command_id.cmp(&b.command_id));
            assert_eq!(remaining[0].command_id, "first");
            assert_eq!(remaining[1].command_id, "third");
        });
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let tmpdir = tempfile::tempdir().unwrap();
        let shutdown = CancellationToken::new();
        let (mut pipeline, _rx) =
            pipeline_in(tmpdir.path(), mock_settings(8, 0), shutdown);

        // Zero workers: everything stays queued, in order.
        for i in 0..5 {
            pipeline.next_seq += 1;
            pipeline.queue.push_back(Queued {
                seq: pipeline.next_seq,
                request: console_request(&format!("c{}", i), "true"),
            });
        }
        let seqs: Vec<u64> = pipeline.queue.iter().map(|q| q.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }
}
