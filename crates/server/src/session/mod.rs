// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-session state machine: status model, shared snapshot state, and
//! the command surface the orchestrator drives.

pub mod run;
pub mod writer;

pub use run::SessionInstance;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::detect::DetectorConfig;
use crate::error::ApiError;
use crate::queue::MessageItem;

/// Coarse session status, as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Child spawn / initial readiness in progress.
    Initializing,
    /// Ready; queue empty or between messages.
    Idle,
    /// Exactly one message in flight.
    Busy,
    /// Health check observed a dead process or a stuck message.
    Unhealthy,
    /// Stop requested; teardown running.
    Terminating,
    /// Stopped; removed from the registry shortly after.
    Terminated,
    /// Loaded from persistence at boot; child not respawned yet.
    Restored,
    /// Spawn or initial readiness failed.
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Unhealthy => "unhealthy",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Restored => "restored",
            Self::Error => "error",
        }
    }

    /// Whether this session still occupies its working directory for the
    /// reuse-by-directory rule.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session counters, updated by the processing loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub messages_processed: u64,
    pub total_processing_ms: u64,
    pub error_count: u64,
    pub average_processing_ms: u64,
}

impl SessionMetrics {
    pub fn record_success(&mut self, elapsed_ms: u64) {
        self.messages_processed += 1;
        self.total_processing_ms += elapsed_ms;
        self.average_processing_ms = self.total_processing_ms / self.messages_processed;
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    /// Errors as a percentage of all attempts.
    pub fn error_rate_percent(&self) -> f64 {
        let attempts = self.messages_processed + self.error_count;
        if attempts == 0 {
            return 0.0;
        }
        (self.error_count as f64) * 100.0 / (attempts as f64)
    }
}

/// Client-facing status snapshot of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: Uuid,
    pub working_directory: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    pub queue_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_message_id: Option<Uuid>,
    pub metrics: SessionMetrics,
}

/// Mutable state shared between the session task and read-side callers
/// (orchestrator listings, transport snapshots). The session task is the
/// only writer.
#[derive(Debug)]
pub struct SessionShared {
    pub id: Uuid,
    /// Canonicalized; immutable after creation.
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    status: RwLock<SessionStatus>,
    last_activity: RwLock<DateTime<Utc>>,
    current_task: RwLock<Option<String>>,
    processing_message: RwLock<Option<Uuid>>,
    metrics: RwLock<SessionMetrics>,
    last_screen: RwLock<String>,
    pub queue_len: AtomicUsize,
    pub child_pid: AtomicU32,
    pub screen_bytes: AtomicUsize,
}

impl SessionShared {
    pub fn new(id: Uuid, working_dir: PathBuf, status: SessionStatus) -> Self {
        let now = Utc::now();
        Self {
            id,
            working_dir,
            created_at: now,
            status: RwLock::new(status),
            last_activity: RwLock::new(now),
            current_task: RwLock::new(None),
            processing_message: RwLock::new(None),
            metrics: RwLock::new(SessionMetrics::default()),
            last_screen: RwLock::new(String::new()),
            queue_len: AtomicUsize::new(0),
            child_pid: AtomicU32::new(0),
            screen_bytes: AtomicUsize::new(0),
        }
    }

    /// Placeholder for a session restored from the registry at boot; keeps
    /// its original id and creation time, child not spawned yet.
    pub fn restored(id: Uuid, working_dir: PathBuf, created_at: DateTime<Utc>) -> Self {
        let mut shared = Self::new(id, working_dir, SessionStatus::Restored);
        shared.created_at = created_at;
        shared
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.write() = status;
    }

    pub fn touch(&self) {
        *self.last_activity.write() = Utc::now();
    }

    pub fn set_current_task(&self, task: Option<String>) {
        *self.current_task.write() = task;
    }

    pub fn current_task(&self) -> Option<String> {
        self.current_task.read().clone()
    }

    pub fn set_processing_message(&self, id: Option<Uuid>) {
        *self.processing_message.write() = id;
    }

    /// Latest throttled screen snapshot, served to reconnecting clients.
    pub fn last_screen(&self) -> String {
        self.last_screen.read().clone()
    }

    pub fn set_last_screen(&self, screen: String) {
        *self.last_screen.write() = screen;
    }

    pub fn metrics(&self) -> SessionMetrics {
        self.metrics.read().clone()
    }

    pub fn update_metrics(&self, f: impl FnOnce(&mut SessionMetrics)) {
        f(&mut self.metrics.write());
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            working_directory: self.working_dir.display().to_string(),
            status: self.status(),
            created_at: self.created_at,
            last_activity: *self.last_activity.read(),
            current_task: self.current_task(),
            queue_length: self.queue_len.load(Ordering::Relaxed),
            processing_message_id: *self.processing_message.read(),
            metrics: self.metrics(),
        }
    }
}

/// Extended view for the session-details endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetails {
    #[serde(flatten)]
    pub summary: SessionSummary,
    pub queue: Vec<MessageItem>,
    pub average_processing_ms: u64,
    pub error_rate_percent: f64,
}

/// Commands a session accepts from the orchestrator / boundary.
#[derive(Debug)]
pub enum SessionCommand {
    Enqueue { payload: String, reply: oneshot::Sender<Result<MessageItem, ApiError>> },
    Remove { id: Uuid, reply: oneshot::Sender<Result<MessageItem, ApiError>> },
    Details { reply: oneshot::Sender<SessionDetails> },
    Stop { reply: oneshot::Sender<()> },
}

/// Handle to a live session task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub shared: Arc<SessionShared>,
    pub commands: mpsc::Sender<SessionCommand>,
}

/// Session tuning derived from orchestrator config plus per-create options.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Minimum interval between `claude-output` snapshots.
    pub throttle: Duration,
    /// Idle interval after which the screen is cleared; zero disables.
    pub auto_clear: Duration,
    /// Screen buffer cap in bytes.
    pub screen_max_bytes: usize,
    /// Retained fraction after an overflow trim.
    pub screen_trim_ratio: f64,
    /// Detector analysis tick.
    pub detect_tick: Duration,
    /// Budget for initial readiness after spawn.
    pub ready_timeout: Duration,
    /// Budget for one message to complete.
    pub completion_timeout: Duration,
    /// Pause between finishing one message and starting the next.
    pub spacing: Duration,
    /// Self-health cadence.
    pub health_interval: Duration,
    /// A processing item older than this marks the session unhealthy.
    pub stuck_after: Duration,
    /// Queue auto-save cadence.
    pub autosave_interval: Duration,
    /// Maximum accepted payload length in bytes.
    pub max_message_len: usize,
    /// Detector pattern/debounce tuning.
    pub detector: DetectorConfig,
    /// Append the assistant's permission-bypass flag to the child command.
    pub skip_permissions: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(1000),
            auto_clear: Duration::ZERO,
            screen_max_bytes: 100 * 1024,
            screen_trim_ratio: 0.75,
            detect_tick: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(60),
            completion_timeout: Duration::from_secs(300),
            spacing: Duration::from_secs(1),
            health_interval: Duration::from_secs(30),
            stuck_after: Duration::from_secs(600),
            autosave_interval: Duration::from_secs(30),
            max_message_len: 100 * 1024,
            detector: DetectorConfig::default(),
            skip_permissions: false,
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
