// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The per-session worker task: one `tokio::select!` loop multiplexing
//! child output, orchestrator commands, detector ticks, throttled output
//! emits, health checks, and the strictly-serial message-processing state
//! machine.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::detect::{PromptDetector, Verdict};
use crate::error::{ApiError, ErrorCode};
use crate::event::{EventSink, MessageLifecycle, SessionEvent};
use crate::process::{ProcessHandle, ProcessManager};
use crate::queue::store::QueueStore;
use crate::queue::{MessageStatus, Queue};
use crate::screen::ScreenBuffer;
use crate::throttle::{Coalescer, Decision};

use super::writer::{self, WriteError};
use super::{
    SessionCommand, SessionDetails, SessionHandle, SessionSettings, SessionShared, SessionStatus,
};

/// Stdin write attempts per message before it is marked errored.
const WRITE_ATTEMPTS: u32 = 3;
/// Base backoff between write attempts; doubles each retry.
const WRITE_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);
/// Length of the `currentTask` descriptor derived from the payload.
const TASK_PREVIEW_CHARS: usize = 50;

/// Everything needed to bring a session up.
pub struct SessionArgs {
    pub id: Uuid,
    /// Canonicalized working directory.
    pub working_dir: std::path::PathBuf,
    pub settings: SessionSettings,
    pub manager: ProcessManager,
    pub store: QueueStore,
    pub sink: Arc<dyn EventSink>,
    /// Load the persisted queue (restored sessions). Fresh creates start
    /// with a clean queue and never read another session's file.
    pub load_queue: bool,
    pub shutdown: CancellationToken,
}

/// Where the processing state machine currently is. At most one message is
/// referenced at any time; the single-processing invariant lives here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Chunked write task running.
    Writing { id: Uuid, started: Instant, attempt: u32 },
    /// Submitted; waiting for the detector to report readiness.
    Waiting { id: Uuid, started: Instant },
    /// A write failed; retrying after backoff.
    Backoff { id: Uuid, started: Instant, attempt: u32, at: Instant },
    /// Child was respawned mid-message; waiting for initial readiness
    /// before re-issuing the write.
    Reinit { id: Uuid, started: Instant, attempt: u32 },
}

impl Phase {
    fn message_id(&self) -> Option<Uuid> {
        match self {
            Phase::Idle => None,
            Phase::Writing { id, .. }
            | Phase::Waiting { id, .. }
            | Phase::Backoff { id, .. }
            | Phase::Reinit { id, .. } => Some(*id),
        }
    }
}

/// Messages the worker sends itself from spawned helpers.
#[derive(Debug)]
enum Internal {
    WriteDone(Result<(), WriteError>),
}

/// The session worker. Constructed by [`SessionInstance::launch`], which
/// returns the public handle once initial readiness is established.
pub struct SessionInstance {
    shared: Arc<SessionShared>,
    settings: SessionSettings,
    manager: ProcessManager,
    handle: ProcessHandle,
    output_rx: mpsc::Receiver<Bytes>,
    commands: mpsc::Receiver<SessionCommand>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    store: QueueStore,
    sink: Arc<dyn EventSink>,
    queue: Queue,
    screen: ScreenBuffer,
    output_gate: Coalescer,
    detector: PromptDetector,
    last_output: Instant,
    phase: Phase,
    write_task: Option<JoinHandle<()>>,
    /// Earliest instant the next processing pass may start (spacing delay
    /// and the re-entrancy guard in one).
    next_pass_at: Option<Instant>,
    auto_clear_at: Option<Instant>,
    output_closed: bool,
    stopping: bool,
    shutdown: CancellationToken,
}

impl SessionInstance {
    /// Spawn the child, wait for initial readiness, and hand back a live
    /// handle. On failure the child is torn down and nothing is retained.
    pub async fn launch(args: SessionArgs) -> Result<SessionHandle, ApiError> {
        let SessionArgs { id, working_dir, settings, manager, store, sink, load_queue, shutdown } =
            args;

        let queue = if load_queue {
            let mut items = store.load().await.map_err(|e| {
                ApiError::new(ErrorCode::Persistence, format!("queue load failed: {e:#}"))
            })?;
            for item in &mut items {
                item.session_id = id;
            }
            Queue::from_items(items)
        } else {
            Queue::default()
        };

        let shared =
            Arc::new(SessionShared::new(id, working_dir.clone(), SessionStatus::Initializing));

        let (handle, output_rx) = manager
            .spawn(&working_dir)
            .await
            .map_err(|e| ApiError::new(ErrorCode::Spawn, format!("{e:#}")))?;
        shared.child_pid.store(handle.pid(), Ordering::Relaxed);
        shared.queue_len.store(queue.len(), Ordering::Relaxed);

        let (command_tx, command_rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::channel(8);

        let mut worker = SessionInstance {
            shared: Arc::clone(&shared),
            detector: PromptDetector::new(settings.detector),
            screen: ScreenBuffer::new(settings.screen_max_bytes, settings.screen_trim_ratio),
            output_gate: Coalescer::new(settings.throttle),
            settings,
            manager,
            handle,
            output_rx,
            commands: command_rx,
            internal_tx,
            internal_rx,
            store,
            sink,
            queue,
            last_output: Instant::now(),
            phase: Phase::Idle,
            write_task: None,
            next_pass_at: None,
            auto_clear_at: None,
            output_closed: false,
            stopping: false,
            shutdown,
        };

        if let Err(e) = worker.await_initial_ready().await {
            worker.abort_launch().await;
            return Err(e);
        }

        // No status-change event here: the session is not registered yet,
        // and the orchestrator announces it with `session-created`.
        worker.shared.set_status(SessionStatus::Idle);
        info!(session = %id, dir = %worker.shared.working_dir.display(), "session ready");

        // A restored queue may already hold pending work.
        if worker.queue.next_pending().is_some() {
            worker.next_pass_at = Some(Instant::now());
        }

        tokio::spawn(worker.run());
        Ok(SessionHandle { shared, commands: command_tx })
    }

    /// Initial readiness: feed output and tick the detector until the
    /// ready verdict, its timeout, or child death.
    async fn await_initial_ready(&mut self) -> Result<(), ApiError> {
        self.detector.begin_wait(Instant::now(), self.settings.ready_timeout);
        let mut tick = tokio::time::interval(self.settings.detect_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                data = self.output_rx.recv() => {
                    match data {
                        Some(bytes) => self.on_output(&bytes),
                        None => {
                            return Err(ApiError::new(
                                ErrorCode::Spawn,
                                "child exited during initialization",
                            ));
                        }
                    }
                }
                _ = tick.tick() => {
                    let snapshot = self.screen.snapshot();
                    match self.detector.tick(&snapshot, self.last_output, Instant::now()) {
                        Verdict::Ready { method, pattern } => {
                            debug!(session = %self.shared.id, ?method, ?pattern, "initial ready");
                            return Ok(());
                        }
                        Verdict::TimedOut => {
                            return Err(ApiError::new(
                                ErrorCode::Timeout,
                                "session did not become ready in time",
                            ));
                        }
                        Verdict::Pending | Verdict::AwaitingPermission => {}
                    }
                }
            }
        }
    }

    /// Roll back a failed launch: kill the child, keep nothing.
    async fn abort_launch(mut self) {
        self.shared.set_status(SessionStatus::Error);
        let _ = self.manager.terminate(&self.handle).await;
        if let Some(task) = self.write_task.take() {
            task.abort();
        }
    }

    /// The main select-loop. Runs until stop, orchestrator shutdown, or
    /// command-channel closure.
    async fn run(mut self) {
        let mut detect_tick = tokio::time::interval(self.settings.detect_tick);
        detect_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut health_tick = tokio::time::interval(self.settings.health_interval);
        health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut autosave_tick = tokio::time::interval(self.settings.autosave_interval);
        autosave_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            // Timer state is snapshotted before the select so the arm
            // futures only capture plain values, never `&self`.
            let output_closed = self.output_closed;
            let gate_deadline = self.output_gate.deadline();
            let auto_clear_at = self.auto_clear_at;
            let backoff_at = self.backoff_at();
            let next_pass_at = self.next_pass_at;
            let detector_waiting = self.detector.waiting();

            tokio::select! {
                // 1. Child output → screen buffer, throttled snapshots.
                data = self.output_rx.recv(), if !output_closed => {
                    match data {
                        Some(bytes) => self.on_output(&bytes),
                        None => self.on_child_gone().await,
                    }
                }

                // 2. Orchestrator / boundary commands.
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.on_command(cmd).await {
                                break;
                            }
                        }
                        None => {
                            // Handle dropped; orchestrator is gone.
                            self.shutdown_session().await;
                            break;
                        }
                    }
                }

                // 3. Writer task results.
                Some(internal) = self.internal_rx.recv() => {
                    match internal {
                        Internal::WriteDone(result) => self.on_write_done(result).await,
                    }
                }

                // 4. Trailing throttled output emit.
                _ = sleep_until_opt(gate_deadline), if gate_deadline.is_some() => {
                    if self.output_gate.fire(Instant::now()) {
                        self.emit_screen();
                    }
                }

                // 5. Auto-clear after output silence.
                _ = sleep_until_opt(auto_clear_at), if auto_clear_at.is_some() => {
                    self.auto_clear_at = None;
                    self.screen.clear();
                    self.shared.screen_bytes.store(0, Ordering::Relaxed);
                    self.output_gate.force(Instant::now());
                    self.emit_screen();
                }

                // 6. Detector analysis tick.
                _ = detect_tick.tick(), if detector_waiting => {
                    self.on_detector_tick().await;
                }

                // 7. Write-retry backoff.
                _ = sleep_until_opt(backoff_at), if backoff_at.is_some() => {
                    self.on_backoff_elapsed().await;
                }

                // 8. Spacing delay → next processing pass.
                _ = sleep_until_opt(next_pass_at), if next_pass_at.is_some() => {
                    self.next_pass_at = None;
                    self.start_next_message().await;
                }

                // 9. Self-health.
                _ = health_tick.tick() => {
                    self.health_check();
                }

                // 10. Queue auto-save (backup suppressed).
                _ = autosave_tick.tick() => {
                    if !self.queue.is_empty() {
                        self.persist(true).await;
                    }
                }

                // 11. Orchestrator-wide shutdown.
                _ = self.shutdown.cancelled() => {
                    self.shutdown_session().await;
                    break;
                }
            }
        }
        debug!(session = %self.shared.id, "session loop ended");
    }

    // -- Output handling -------------------------------------------------

    fn on_output(&mut self, bytes: &[u8]) {
        let outcome = self.screen.feed(bytes);
        if let Some(trim) = outcome.trimmed {
            debug!(
                session = %self.shared.id,
                old = trim.old_len,
                new = trim.new_len,
                "screen buffer trimmed"
            );
        }
        self.last_output = Instant::now();
        self.shared.screen_bytes.store(self.screen.len(), Ordering::Relaxed);
        self.shared.touch();

        if self.settings.auto_clear > std::time::Duration::ZERO {
            self.auto_clear_at = Some(self.last_output + self.settings.auto_clear);
        }

        if let Decision::EmitNow = self.output_gate.offer(self.last_output) {
            self.emit_screen();
        }
    }

    fn emit_screen(&self) {
        let screen = self.screen.snapshot();
        self.shared.set_last_screen(screen.clone());
        self.sink.emit(SessionEvent::Output { session_id: self.shared.id, screen });
    }

    async fn on_child_gone(&mut self) {
        self.output_closed = true;
        if self.stopping {
            return;
        }
        warn!(session = %self.shared.id, "child output closed");

        match self.phase {
            // The detector would wait out its whole budget on a dead
            // process; fail the message now.
            Phase::Waiting { id, started } => {
                self.detector.cancel_wait();
                self.fail_message(id, started, ErrorCode::Unhealthy, "child process exited")
                    .await;
                self.set_status(SessionStatus::Unhealthy);
            }
            // The write path notices on its own and runs the retry /
            // re-initialize sequence.
            Phase::Writing { .. } | Phase::Backoff { .. } | Phase::Reinit { .. } => {}
            Phase::Idle => {
                self.set_status(SessionStatus::Unhealthy);
                self.sink.emit(SessionEvent::SessionError {
                    session_id: self.shared.id,
                    kind: ErrorCode::Unhealthy,
                    message: "child process exited".to_owned(),
                });
            }
        }
    }

    // -- Commands ---------------------------------------------------------

    /// Returns `true` when the loop should break (stop handled).
    async fn on_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Enqueue { payload, reply } => {
                let _ = reply.send(self.enqueue(payload).await);
                false
            }
            SessionCommand::Remove { id, reply } => {
                let _ = reply.send(self.remove_message(id).await);
                false
            }
            SessionCommand::Details { reply } => {
                let metrics = self.shared.metrics();
                let _ = reply.send(SessionDetails {
                    summary: self.shared.summary(),
                    queue: self.queue.snapshot(),
                    average_processing_ms: metrics.average_processing_ms,
                    error_rate_percent: metrics.error_rate_percent(),
                });
                false
            }
            SessionCommand::Stop { reply } => {
                self.shutdown_session().await;
                let _ = reply.send(());
                true
            }
        }
    }

    async fn enqueue(&mut self, payload: String) -> Result<crate::queue::MessageItem, ApiError> {
        if payload.trim().is_empty() {
            return Err(ApiError::new(ErrorCode::EmptyPayload, "message payload is empty"));
        }
        if payload.len() > self.settings.max_message_len {
            return Err(ApiError::new(
                ErrorCode::Validation,
                format!("message exceeds {} bytes", self.settings.max_message_len),
            ));
        }

        let item = self.queue.push(self.shared.id, payload);
        self.shared.queue_len.store(self.queue.len(), Ordering::Relaxed);
        self.shared.touch();
        self.persist(false).await;
        self.sink.emit(SessionEvent::MessageStatus {
            session_id: self.shared.id,
            lifecycle: MessageLifecycle::Queued,
            message: item.clone(),
        });

        // Single-pass guard: only arm a pass when none is scheduled and
        // nothing is in flight.
        if matches!(self.phase, Phase::Idle)
            && self.next_pass_at.is_none()
            && self.shared.status() == SessionStatus::Idle
        {
            self.next_pass_at = Some(Instant::now());
        }

        Ok(item)
    }

    async fn remove_message(&mut self, id: Uuid) -> Result<crate::queue::MessageItem, ApiError> {
        match self.queue.remove(id) {
            Err(()) => Err(ApiError::new(
                ErrorCode::Validation,
                "message is currently processing and cannot be removed",
            )),
            Ok(None) => Err(ApiError::new(ErrorCode::NotFound, "no such message")),
            Ok(Some(item)) => {
                self.shared.queue_len.store(self.queue.len(), Ordering::Relaxed);
                self.persist(false).await;
                self.sink.emit(SessionEvent::MessageStatus {
                    session_id: self.shared.id,
                    lifecycle: MessageLifecycle::Removed,
                    message: item.clone(),
                });
                Ok(item)
            }
        }
    }

    // -- Processing loop ---------------------------------------------------

    /// Step 1-3 of the processing loop: select the earliest pending item,
    /// mark it processing, and start the chunked write.
    async fn start_next_message(&mut self) {
        if self.stopping || !matches!(self.phase, Phase::Idle) {
            return;
        }
        match self.shared.status() {
            SessionStatus::Idle | SessionStatus::Busy => {}
            _ => return,
        }

        let Some(next) = self.queue.next_pending().map(|m| m.id) else {
            self.set_status(SessionStatus::Idle);
            return;
        };

        let started = Instant::now();
        let payload = {
            let Some(item) = self.queue.get_mut(next) else {
                return;
            };
            item.status = MessageStatus::Processing;
            item.processing_started_at = Some(Utc::now());
            item.payload.clone()
        };

        let preview: String = payload.chars().take(TASK_PREVIEW_CHARS).collect();
        self.shared.set_current_task(Some(preview));
        self.shared.set_processing_message(Some(next));
        self.shared.touch();
        self.set_status(SessionStatus::Busy);
        self.persist(false).await;

        if let Some(item) = self.queue.get(next) {
            self.sink.emit(SessionEvent::MessageStatus {
                session_id: self.shared.id,
                lifecycle: MessageLifecycle::Started,
                message: item.clone(),
            });
        }

        self.spawn_write(&payload, next, started, 1);
    }

    fn spawn_write(&mut self, payload: &str, id: Uuid, started: Instant, attempt: u32) {
        let plan = writer::plan(payload);
        let input_tx = self.handle.input_tx().clone();
        let internal = self.internal_tx.clone();
        self.write_task = Some(tokio::spawn(async move {
            let result = writer::execute(&input_tx, &plan).await;
            let _ = internal.send(Internal::WriteDone(result)).await;
        }));
        self.phase = Phase::Writing { id, started, attempt };
    }

    async fn on_write_done(&mut self, result: Result<(), WriteError>) {
        self.write_task = None;
        let Phase::Writing { id, started, attempt } = self.phase else {
            return;
        };

        match result {
            Ok(()) => {
                self.phase = Phase::Waiting { id, started };
                self.detector.begin_wait(Instant::now(), self.settings.completion_timeout);
            }
            Err(e) if attempt >= WRITE_ATTEMPTS => {
                self.fail_message(id, started, ErrorCode::Stdin, &e.to_string()).await;
            }
            Err(e) => {
                let delay = WRITE_BACKOFF * 2u32.pow(attempt - 1);
                warn!(session = %self.shared.id, attempt, ?delay, "stdin write failed, retrying: {e}");
                self.phase =
                    Phase::Backoff { id, started, attempt: attempt + 1, at: Instant::now() + delay };
            }
        }
    }

    fn backoff_at(&self) -> Option<Instant> {
        match self.phase {
            Phase::Backoff { at, .. } => Some(at),
            _ => None,
        }
    }

    /// A write retry is due. If the child died, re-initialize it first.
    async fn on_backoff_elapsed(&mut self) {
        let Phase::Backoff { id, started, attempt, .. } = self.phase else {
            return;
        };

        if self.handle.is_alive() {
            let Some(payload) = self.queue.get(id).map(|m| m.payload.clone()) else {
                self.phase = Phase::Idle;
                return;
            };
            self.spawn_write(&payload, id, started, attempt);
            return;
        }

        debug!(session = %self.shared.id, "child dead before retry, re-initializing");
        match self.manager.spawn(&self.shared.working_dir).await {
            Ok((handle, output_rx)) => {
                self.handle = handle;
                self.output_rx = output_rx;
                self.output_closed = false;
                self.screen.clear();
                self.shared.child_pid.store(self.handle.pid(), Ordering::Relaxed);
                self.detector.begin_wait(Instant::now(), self.settings.ready_timeout);
                self.phase = Phase::Reinit { id, started, attempt };
            }
            Err(e) => {
                self.fail_message(id, started, ErrorCode::Spawn, &format!("respawn failed: {e:#}"))
                    .await;
            }
        }
    }

    async fn on_detector_tick(&mut self) {
        let snapshot = self.screen.snapshot();
        let verdict = self.detector.tick(&snapshot, self.last_output, Instant::now());

        match verdict {
            Verdict::Pending | Verdict::AwaitingPermission => {}
            Verdict::Ready { method, pattern } => match self.phase {
                Phase::Waiting { id, started } => {
                    debug!(session = %self.shared.id, ?method, ?pattern, "message complete");
                    self.complete_message(id, started).await;
                }
                Phase::Reinit { id, started, attempt } => {
                    let Some(payload) = self.queue.get(id).map(|m| m.payload.clone()) else {
                        self.phase = Phase::Idle;
                        return;
                    };
                    self.spawn_write(&payload, id, started, attempt);
                }
                _ => {}
            },
            Verdict::TimedOut => match self.phase {
                Phase::Waiting { id, started } => {
                    self.fail_message(id, started, ErrorCode::Timeout, "completion_timeout").await;
                }
                Phase::Reinit { id, started, .. } => {
                    self.fail_message(
                        id,
                        started,
                        ErrorCode::Timeout,
                        "re-initialization timed out",
                    )
                    .await;
                }
                _ => {}
            },
        }
    }

    /// Step 5 (success): stamp, persist, update metrics, emit, schedule
    /// the next pass after the spacing delay.
    async fn complete_message(&mut self, id: Uuid, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if let Some(item) = self.queue.get_mut(id) {
            item.status = MessageStatus::Completed;
            item.completed_at = Some(Utc::now());
            item.processing_time_ms = Some(elapsed_ms);
        }
        self.shared.update_metrics(|m| m.record_success(elapsed_ms));
        self.finish_message(id, MessageLifecycle::Completed).await;
    }

    async fn fail_message(&mut self, id: Uuid, _started: Instant, kind: ErrorCode, reason: &str) {
        if let Some(item) = self.queue.get_mut(id) {
            item.status = MessageStatus::Error;
            item.error_at = Some(Utc::now());
            item.error = Some(reason.to_owned());
        }
        self.shared.update_metrics(|m| m.record_error());
        self.sink.emit(SessionEvent::SessionError {
            session_id: self.shared.id,
            kind,
            message: reason.to_owned(),
        });
        self.finish_message(id, MessageLifecycle::Error).await;
    }

    /// Step 6: shared tail of completion and error.
    async fn finish_message(&mut self, id: Uuid, lifecycle: MessageLifecycle) {
        self.phase = Phase::Idle;
        self.shared.set_current_task(None);
        self.shared.set_processing_message(None);
        self.shared.touch();
        self.persist(false).await;

        if let Some(item) = self.queue.get(id) {
            self.sink.emit(SessionEvent::MessageStatus {
                session_id: self.shared.id,
                lifecycle,
                message: item.clone(),
            });
        }

        self.set_status(SessionStatus::Idle);
        self.next_pass_at = Some(Instant::now() + self.settings.spacing);
    }

    // -- Health, persistence, teardown ------------------------------------

    fn health_check(&mut self) {
        if self.stopping {
            return;
        }
        let status = self.shared.status();
        if !matches!(status, SessionStatus::Idle | SessionStatus::Busy) {
            return;
        }

        if !self.handle.is_alive() && !matches!(self.phase, Phase::Reinit { .. }) {
            warn!(session = %self.shared.id, "health check: process dead");
            self.set_status(SessionStatus::Unhealthy);
            self.sink.emit(SessionEvent::SessionError {
                session_id: self.shared.id,
                kind: ErrorCode::Unhealthy,
                message: "health check failed: process dead".to_owned(),
            });
            return;
        }

        if let Some(started) = match self.phase {
            Phase::Writing { started, .. }
            | Phase::Waiting { started, .. }
            | Phase::Backoff { started, .. }
            | Phase::Reinit { started, .. } => Some(started),
            Phase::Idle => None,
        } {
            if started.elapsed() > self.settings.stuck_after {
                warn!(session = %self.shared.id, "health check: processing stuck");
                self.set_status(SessionStatus::Unhealthy);
                self.sink.emit(SessionEvent::SessionError {
                    session_id: self.shared.id,
                    kind: ErrorCode::Unhealthy,
                    message: "processing_stuck".to_owned(),
                });
            }
        }
    }

    async fn persist(&mut self, suppress_backup: bool) {
        if let Err(e) = self.store.save(self.queue.snapshot(), suppress_backup).await {
            warn!(session = %self.shared.id, "queue save failed: {e:#}");
            self.sink.emit(SessionEvent::SessionError {
                session_id: self.shared.id,
                kind: ErrorCode::Persistence,
                message: format!("queue save failed: {e:#}"),
            });
        }
    }

    fn set_status(&self, new_status: SessionStatus) {
        let old_status = self.shared.status();
        if old_status == new_status {
            return;
        }
        self.shared.set_status(new_status);
        self.sink.emit(SessionEvent::SessionStatusChanged {
            session_id: self.shared.id,
            old_status,
            new_status,
            current_task: self.shared.current_task(),
        });
    }

    /// Idempotent stop: downgrade any in-flight message, final save,
    /// two-phase child termination.
    async fn shutdown_session(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;

        if let Some(task) = self.write_task.take() {
            task.abort();
        }
        self.detector.cancel_wait();

        if let Some(id) = self.phase.message_id() {
            if let Some(item) = self.queue.get_mut(id) {
                item.status = MessageStatus::Pending;
                item.processing_started_at = None;
            }
        }
        self.phase = Phase::Idle;
        self.shared.set_current_task(None);
        self.shared.set_processing_message(None);

        self.set_status(SessionStatus::Terminating);
        self.persist(false).await;

        let outcome = self.manager.terminate(&self.handle).await;
        if matches!(outcome, crate::process::TerminateOutcome::ForceKillTimeout) {
            self.sink.emit(SessionEvent::SessionError {
                session_id: self.shared.id,
                kind: ErrorCode::Unhealthy,
                message: "force-kill-timeout: child did not die".to_owned(),
            });
        }

        self.set_status(SessionStatus::Terminated);
        info!(session = %self.shared.id, "session stopped");
    }
}

/// Sleep until the deadline, or forever when there is none. Guarded arms
/// only poll this while the deadline is set.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
