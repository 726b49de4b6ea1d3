// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide session registry and policy: concurrency cap,
//! reuse-by-directory, boot-time restore, health sweep, and aggregated
//! statistics. Owns the event hub wiring for every session it runs.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ApiError, ErrorCode};
use crate::event::{EventSink, MessageLifecycle, SessionEvent};
use crate::hub::EventHub;
use crate::process::{is_process_alive, ProcessManager, SpawnOptions};
use crate::queue::store::QueueStore;
use crate::queue::MessageItem;
use crate::registry::{RowPatch, SessionRegistry, SessionRow};
use crate::session::{
    SessionCommand, SessionDetails, SessionHandle, SessionInstance, SessionSettings,
    SessionShared, SessionStatus, SessionSummary,
};
use crate::session::run::SessionArgs;

/// How long a terminate call waits for a session's stop to conclude
/// before giving up on the reply (the two-phase kill has its own windows).
const STOP_REPLY_TIMEOUT: Duration = Duration::from_secs(15);

/// Orchestrator-wide tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Concurrency cap on simultaneously active sessions.
    pub max_sessions: usize,
    /// State directory holding queues and the session registry file.
    pub data_root: PathBuf,
    /// Defaults applied to every new session.
    pub defaults: SessionSettings,
    /// Child process command and termination windows.
    pub spawn: SpawnOptions,
    /// Rotated queue backups kept per directory.
    pub backup_retention: usize,
    /// Flag appended to the child command when a session opts out of
    /// interactive permission prompts.
    pub skip_permissions_arg: String,
    /// Health sweep cadence.
    pub health_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            data_root: PathBuf::from(".corral"),
            defaults: SessionSettings::default(),
            spawn: SpawnOptions::default(),
            backup_retention: 5,
            skip_permissions_arg: "--dangerously-skip-permissions".to_owned(),
            health_interval: Duration::from_secs(30),
        }
    }
}

/// Per-create options accepted at the boundary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOptions {
    pub skip_permissions: Option<bool>,
    pub throttle_ms: Option<u64>,
    pub auto_clear_ms: Option<u64>,
}

/// Result of a create call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOutcome {
    pub session_id: Uuid,
    pub status: SessionStatus,
    /// An existing session for the same directory was returned instead of
    /// spawning a new one.
    pub reused: bool,
}

/// Aggregated statistics across all registered sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStats {
    pub active_sessions: usize,
    pub healthy_sessions: usize,
    pub total_messages_processed: u64,
    pub total_processing_ms: u64,
    pub average_processing_ms: u64,
    pub total_queue_length: usize,
    pub screen_buffer_bytes: usize,
    pub connected_clients: usize,
}

/// A registered session: live worker or boot-time placeholder.
#[derive(Clone)]
enum Entry {
    Live(SessionHandle),
    Restored(Arc<SessionShared>),
}

impl Entry {
    fn shared(&self) -> &Arc<SessionShared> {
        match self {
            Entry::Live(handle) => &handle.shared,
            Entry::Restored(shared) => shared,
        }
    }
}

/// The orchestrator. Constructed once at startup, shared behind `Arc`.
pub struct Orchestrator {
    cfg: OrchestratorConfig,
    hub: Arc<EventHub>,
    registry: Arc<dyn SessionRegistry>,
    entries: RwLock<IndexMap<Uuid, Entry>>,
    /// Serializes create/promote so reuse and capacity are checked
    /// atomically.
    create_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        cfg: OrchestratorConfig,
        hub: Arc<EventHub>,
        registry: Arc<dyn SessionRegistry>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            hub,
            registry,
            entries: RwLock::new(IndexMap::new()),
            create_lock: tokio::sync::Mutex::new(()),
            shutdown,
        })
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// The sink handed to every session; holds a weak reference so session
    /// tasks never keep the orchestrator alive.
    fn event_sink(self: &Arc<Self>) -> Arc<dyn EventSink> {
        Arc::new(OrchestratorSink { orch: Arc::downgrade(self) })
    }

    // -- Create / reuse ----------------------------------------------------

    /// Create a session for `working_dir`, or return the existing one
    /// targeting the same canonical directory.
    pub async fn create(
        self: &Arc<Self>,
        working_dir: &str,
        opts: CreateOptions,
    ) -> Result<CreateOutcome, ApiError> {
        let canonical = canonicalize_dir(working_dir)?;
        let _guard = self.create_lock.lock().await;

        // Reuse-by-directory: at most one active session per canonical dir.
        let existing = self.entries.read().values().find_map(|entry| {
            let shared = entry.shared();
            (shared.working_dir == canonical && shared.status().is_active())
                .then(|| (shared.id, matches!(entry, Entry::Restored(_))))
        });
        if let Some((id, restored)) = existing {
            debug!(session = %id, "reusing session for {}", canonical.display());
            if restored {
                self.promote_locked(id).await?;
            }
            let status = self
                .entries
                .read()
                .get(&id)
                .map(|e| e.shared().status())
                .unwrap_or(SessionStatus::Terminated);
            return Ok(CreateOutcome { session_id: id, status, reused: true });
        }

        self.check_capacity()?;

        let id = Uuid::new_v4();
        let handle = self.launch_session(id, canonical.clone(), &opts, false).await?;
        let summary = handle.shared.summary();
        self.entries.write().insert(id, Entry::Live(handle));

        if let Err(e) = self.registry.create(session_row(&summary)) {
            warn!("session registry create failed: {e:#}");
        }

        info!(session = %id, dir = %canonical.display(), "session created");
        self.hub.publish(SessionEvent::SessionCreated { session: summary });
        self.publish_list_update();

        Ok(CreateOutcome { session_id: id, status: SessionStatus::Idle, reused: false })
    }

    fn check_capacity(&self) -> Result<(), ApiError> {
        let active =
            self.entries.read().values().filter(|e| e.shared().status().is_active()).count();
        if active >= self.cfg.max_sessions {
            return Err(ApiError::new(
                ErrorCode::Capacity,
                format!("session cap of {} reached", self.cfg.max_sessions),
            ));
        }
        Ok(())
    }

    async fn launch_session(
        self: &Arc<Self>,
        id: Uuid,
        canonical: PathBuf,
        opts: &CreateOptions,
        load_queue: bool,
    ) -> Result<SessionHandle, ApiError> {
        let mut settings = self.cfg.defaults.clone();
        if let Some(ms) = opts.throttle_ms {
            settings.throttle = Duration::from_millis(ms);
        }
        if let Some(ms) = opts.auto_clear_ms {
            settings.auto_clear = Duration::from_millis(ms);
        }
        if let Some(skip) = opts.skip_permissions {
            settings.skip_permissions = skip;
        }

        let mut spawn = self.cfg.spawn.clone();
        if settings.skip_permissions {
            spawn.command.push(self.cfg.skip_permissions_arg.clone());
        }

        SessionInstance::launch(SessionArgs {
            id,
            working_dir: canonical.clone(),
            settings,
            manager: ProcessManager::new(spawn),
            store: QueueStore::new(&self.cfg.data_root, &canonical, self.cfg.backup_retention),
            sink: self.event_sink(),
            load_queue,
            shutdown: self.shutdown.child_token(),
        })
        .await
    }

    /// Promote a restored placeholder into a live session. Caller holds
    /// the create lock.
    async fn promote_locked(self: &Arc<Self>, id: Uuid) -> Result<(), ApiError> {
        let Some(shared) = self.entries.read().get(&id).and_then(|e| match e {
            Entry::Restored(shared) => Some(Arc::clone(shared)),
            Entry::Live(_) => None,
        }) else {
            return Ok(());
        };

        info!(session = %id, "promoting restored session");
        shared.set_status(SessionStatus::Initializing);
        match self.launch_session(id, shared.working_dir.clone(), &CreateOptions::default(), true).await
        {
            Ok(handle) => {
                self.entries.write().insert(id, Entry::Live(handle));
                if let Err(e) = self.registry.update(
                    id,
                    RowPatch {
                        status: Some(SessionStatus::Idle.as_str().to_owned()),
                        last_activity: Some(Utc::now()),
                        ..RowPatch::default()
                    },
                ) {
                    warn!("registry update failed: {e:#}");
                }
                self.forward(SessionEvent::SessionStatusChanged {
                    session_id: id,
                    old_status: SessionStatus::Restored,
                    new_status: SessionStatus::Idle,
                    current_task: None,
                });
                Ok(())
            }
            Err(e) => {
                shared.set_status(SessionStatus::Error);
                self.forward(SessionEvent::SessionError {
                    session_id: id,
                    kind: e.code,
                    message: e.error.clone(),
                });
                Err(e)
            }
        }
    }

    // -- Message routing ---------------------------------------------------

    /// Enqueue a message on a session, promoting a restored placeholder on
    /// this first use.
    pub async fn enqueue(
        self: &Arc<Self>,
        session_id: Uuid,
        payload: String,
    ) -> Result<MessageItem, ApiError> {
        let entry = self.lookup(session_id)?;

        let handle = match entry {
            Entry::Live(handle) => handle,
            Entry::Restored(_) => {
                let _guard = self.create_lock.lock().await;
                self.promote_locked(session_id).await?;
                match self.lookup(session_id)? {
                    Entry::Live(handle) => handle,
                    Entry::Restored(_) => {
                        return Err(ApiError::new(ErrorCode::Internal, "promotion did not settle"));
                    }
                }
            }
        };

        let (reply, rx) = oneshot::channel();
        handle
            .commands
            .send(SessionCommand::Enqueue { payload, reply })
            .await
            .map_err(|_| session_gone())?;
        rx.await.map_err(|_| session_gone())?
    }

    /// Remove a queued message; processing items are refused.
    pub async fn remove_message(
        &self,
        session_id: Uuid,
        message_id: Uuid,
    ) -> Result<MessageItem, ApiError> {
        let Entry::Live(handle) = self.lookup(session_id)? else {
            return Err(ApiError::new(ErrorCode::NotFound, "no such message"));
        };
        let (reply, rx) = oneshot::channel();
        handle
            .commands
            .send(SessionCommand::Remove { id: message_id, reply })
            .await
            .map_err(|_| session_gone())?;
        rx.await.map_err(|_| session_gone())?
    }

    // -- Lifecycle ---------------------------------------------------------

    /// Stop and deregister a session. Returns `false` when the id is
    /// unknown.
    pub async fn terminate(self: &Arc<Self>, session_id: Uuid) -> bool {
        let Some(entry) = self.entries.read().get(&session_id).cloned() else {
            return false;
        };

        if let Entry::Live(handle) = &entry {
            let (reply, rx) = oneshot::channel();
            if handle.commands.send(SessionCommand::Stop { reply }).await.is_ok() {
                if tokio::time::timeout(STOP_REPLY_TIMEOUT, rx).await.is_err() {
                    warn!(session = %session_id, "stop did not conclude in time");
                }
            }
        }
        entry.shared().set_status(SessionStatus::Terminated);
        self.entries.write().shift_remove(&session_id);

        // Archive final metrics before the row goes terminal.
        let metrics = entry.shared().metrics();
        if let Err(e) = self.registry.update(
            session_id,
            RowPatch {
                status: Some(SessionStatus::Terminated.as_str().to_owned()),
                terminated_at: Some(Utc::now()),
                last_activity: Some(Utc::now()),
                message_count: Some(metrics.messages_processed),
                total_processing_ms: Some(metrics.total_processing_ms),
                error_count: Some(metrics.error_count),
                ..RowPatch::default()
            },
        ) {
            warn!("registry update failed: {e:#}");
        }

        info!(session = %session_id, "session terminated");
        self.hub.publish(SessionEvent::SessionTerminated { session_id });
        self.publish_list_update();
        true
    }

    /// Stop every session; used on process shutdown.
    pub async fn shutdown_all(self: &Arc<Self>) {
        let ids: Vec<Uuid> = self.entries.read().keys().copied().collect();
        for id in ids {
            self.terminate(id).await;
        }
    }

    // -- Views -------------------------------------------------------------

    fn lookup(&self, session_id: Uuid) -> Result<Entry, ApiError> {
        self.entries
            .read()
            .get(&session_id)
            .cloned()
            .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "no such session"))
    }

    /// Snapshots of all registered sessions, newest first.
    pub fn list_active(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> =
            self.entries.read().values().map(|e| e.shared().summary()).collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    pub fn status(&self, session_id: Uuid) -> Result<SessionSummary, ApiError> {
        Ok(self.lookup(session_id)?.shared().summary())
    }

    /// Latest throttled screen for a session, if it is registered.
    pub fn screen_snapshot(&self, session_id: Uuid) -> Option<String> {
        self.entries.read().get(&session_id).map(|e| e.shared().last_screen())
    }

    /// Extended view including the queue and derived performance numbers.
    pub async fn details(&self, session_id: Uuid) -> Result<SessionDetails, ApiError> {
        match self.lookup(session_id)? {
            Entry::Live(handle) => {
                let (reply, rx) = oneshot::channel();
                handle
                    .commands
                    .send(SessionCommand::Details { reply })
                    .await
                    .map_err(|_| session_gone())?;
                rx.await.map_err(|_| session_gone())
            }
            Entry::Restored(shared) => {
                // Placeholder: the queue lives only on disk.
                let store = QueueStore::new(
                    &self.cfg.data_root,
                    &shared.working_dir,
                    self.cfg.backup_retention,
                );
                let queue = store.load().await.unwrap_or_default();
                let metrics = shared.metrics();
                Ok(SessionDetails {
                    summary: shared.summary(),
                    queue,
                    average_processing_ms: metrics.average_processing_ms,
                    error_rate_percent: metrics.error_rate_percent(),
                })
            }
        }
    }

    pub fn stats(&self) -> OrchestratorStats {
        let summaries = self.list_active();
        let total_messages: u64 = summaries.iter().map(|s| s.metrics.messages_processed).sum();
        let total_ms: u64 = summaries.iter().map(|s| s.metrics.total_processing_ms).sum();
        let screen_bytes: usize = self
            .entries
            .read()
            .values()
            .map(|e| e.shared().screen_bytes.load(Ordering::Relaxed))
            .sum();

        OrchestratorStats {
            active_sessions: summaries.iter().filter(|s| s.status.is_active()).count(),
            healthy_sessions: summaries
                .iter()
                .filter(|s| matches!(s.status, SessionStatus::Idle | SessionStatus::Busy))
                .count(),
            total_messages_processed: total_messages,
            total_processing_ms: total_ms,
            average_processing_ms: if total_messages == 0 { 0 } else { total_ms / total_messages },
            total_queue_length: summaries.iter().map(|s| s.queue_length).sum(),
            screen_buffer_bytes: screen_bytes,
            connected_clients: self.hub.client_count(),
        }
    }

    // -- Boot restore and health sweep ------------------------------------

    /// Recreate placeholder entries for sessions persisted by a previous
    /// run. Directories that vanished are marked terminated instead.
    pub fn restore_from_registry(&self) {
        let rows = match self.registry.active_sessions() {
            Ok(rows) => rows,
            Err(e) => {
                warn!("session registry unreadable, starting empty: {e:#}");
                return;
            }
        };

        let mut entries = self.entries.write();
        for row in rows {
            let dir = PathBuf::from(&row.working_directory);
            let canonical = match dir.canonicalize() {
                Ok(c) if c.is_dir() => c,
                _ => {
                    info!(session = %row.id, "restored directory gone, marking terminated");
                    let _ = self.registry.update(
                        row.id,
                        RowPatch {
                            status: Some(SessionStatus::Terminated.as_str().to_owned()),
                            terminated_at: Some(Utc::now()),
                            ..RowPatch::default()
                        },
                    );
                    continue;
                }
            };
            info!(session = %row.id, dir = %canonical.display(), "restored session placeholder");
            let shared = Arc::new(SessionShared::restored(row.id, canonical, row.created_at));
            entries.insert(row.id, Entry::Restored(shared));
        }
    }

    /// Periodic liveness audit at the registry level. Sessions whose
    /// worker or child died without a clean stop are flipped to
    /// unhealthy.
    pub fn spawn_health_sweep(self: &Arc<Self>) {
        let orch = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(orch.cfg.health_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = orch.shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }

                let live: Vec<SessionHandle> = orch
                    .entries
                    .read()
                    .values()
                    .filter_map(|e| match e {
                        Entry::Live(handle) => Some(handle.clone()),
                        Entry::Restored(_) => None,
                    })
                    .collect();

                for handle in live {
                    let status = handle.shared.status();
                    if !matches!(status, SessionStatus::Idle | SessionStatus::Busy) {
                        continue;
                    }
                    let pid = handle.shared.child_pid.load(Ordering::Relaxed);
                    let worker_dead = handle.commands.is_closed();
                    let process_dead = pid != 0 && !is_process_alive(pid);
                    if worker_dead || process_dead {
                        warn!(session = %handle.shared.id, worker_dead, process_dead, "health sweep failed");
                        handle.shared.set_status(SessionStatus::Unhealthy);
                        orch.forward(SessionEvent::SessionStatusChanged {
                            session_id: handle.shared.id,
                            old_status: status,
                            new_status: SessionStatus::Unhealthy,
                            current_task: handle.shared.current_task(),
                        });
                    }
                }
            }
        });
    }

    // -- Event forwarding --------------------------------------------------

    /// Session events land here: fan out to the hub, mirror the registry,
    /// and append the consolidated list update where the contract asks
    /// for one.
    fn forward(self: &Arc<Self>, event: SessionEvent) {
        match &event {
            SessionEvent::SessionStatusChanged { session_id, new_status, .. } => {
                let patch = RowPatch {
                    status: Some(new_status.as_str().to_owned()),
                    last_activity: Some(Utc::now()),
                    ..RowPatch::default()
                };
                if let Err(e) = self.registry.update(*session_id, patch) {
                    warn!("registry update failed: {e:#}");
                }
                self.hub.publish(event);
                self.publish_list_update();
            }
            SessionEvent::MessageStatus {
                session_id,
                lifecycle: MessageLifecycle::Completed | MessageLifecycle::Error,
                ..
            } => {
                if let Ok(entry) = self.lookup(*session_id) {
                    let metrics = entry.shared().metrics();
                    let patch = RowPatch {
                        last_activity: Some(Utc::now()),
                        message_count: Some(metrics.messages_processed),
                        total_processing_ms: Some(metrics.total_processing_ms),
                        error_count: Some(metrics.error_count),
                        ..RowPatch::default()
                    };
                    if let Err(e) = self.registry.update(*session_id, patch) {
                        warn!("registry update failed: {e:#}");
                    }
                }
                self.hub.publish(event);
            }
            _ => self.hub.publish(event),
        }
    }

    /// Consolidated `session-list-update`, observing all prior lifecycle
    /// events.
    pub fn publish_list_update(self: &Arc<Self>) {
        self.hub.publish(SessionEvent::SessionListUpdate {
            sessions: self.list_active(),
            stats: self.stats(),
        });
    }
}

/// Sink adapter handed to session workers.
struct OrchestratorSink {
    orch: Weak<Orchestrator>,
}

impl EventSink for OrchestratorSink {
    fn emit(&self, event: SessionEvent) {
        if let Some(orch) = self.orch.upgrade() {
            orch.forward(event);
        }
    }
}

fn session_gone() -> ApiError {
    ApiError::new(ErrorCode::NotFound, "session is no longer available")
}

/// Validate and canonicalize a working directory argument.
fn canonicalize_dir(raw: &str) -> Result<PathBuf, ApiError> {
    let path = Path::new(raw);
    if !path.is_dir() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("working directory does not exist: {raw}"),
        ));
    }
    path.canonicalize().map_err(|e| {
        ApiError::new(ErrorCode::Validation, format!("cannot canonicalize {raw}: {e}"))
    })
}

fn session_row(summary: &SessionSummary) -> SessionRow {
    SessionRow {
        id: summary.id,
        working_directory: summary.working_directory.clone(),
        status: summary.status.as_str().to_owned(),
        created_at: summary.created_at,
        started_at: Some(summary.created_at),
        terminated_at: None,
        last_activity: summary.last_activity,
        message_count: summary.metrics.messages_processed,
        total_processing_ms: summary.metrics.total_processing_ms,
        error_count: summary.metrics.error_count,
        metadata: serde_json::Value::Null,
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
