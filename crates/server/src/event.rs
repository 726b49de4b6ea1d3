// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Variant event records fanned out to subscribed clients.
//!
//! Every event maps onto exactly one wire channel; delivery policy (session
//! scoping, debouncing) is table-driven off [`Channel`] so the hub stays a
//! plain dispatcher.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::orchestrator::OrchestratorStats;
use crate::queue::MessageItem;
use crate::session::{SessionStatus, SessionSummary};

/// Wire channels clients subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    SessionListUpdate,
    SessionCreated,
    SessionTerminated,
    SessionStatusChanged,
    ClaudeOutput,
    MessageStatus,
    SessionError,
}

impl Channel {
    pub const ALL: &'static [Channel] = &[
        Channel::SessionListUpdate,
        Channel::SessionCreated,
        Channel::SessionTerminated,
        Channel::SessionStatusChanged,
        Channel::ClaudeOutput,
        Channel::MessageStatus,
        Channel::SessionError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionListUpdate => "session-list-update",
            Self::SessionCreated => "session-created",
            Self::SessionTerminated => "session-terminated",
            Self::SessionStatusChanged => "session-status-changed",
            Self::ClaudeOutput => "claude-output",
            Self::MessageStatus => "message-status",
            Self::SessionError => "session-error",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == name)
    }

    /// High-churn channels coalesce into a single trailing delivery per
    /// debounce window; everything else goes out immediately.
    pub fn is_debounced(&self) -> bool {
        matches!(self, Self::SessionListUpdate)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue-item lifecycle step carried on the `message-status` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLifecycle {
    Queued,
    Removed,
    Started,
    Completed,
    Error,
}

/// An event as emitted by sessions and the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionEvent {
    SessionCreated {
        session: SessionSummary,
    },
    SessionTerminated {
        session_id: Uuid,
    },
    SessionStatusChanged {
        session_id: Uuid,
        old_status: SessionStatus,
        new_status: SessionStatus,
        current_task: Option<String>,
    },
    SessionListUpdate {
        sessions: Vec<SessionSummary>,
        stats: OrchestratorStats,
    },
    Output {
        session_id: Uuid,
        screen: String,
    },
    MessageStatus {
        session_id: Uuid,
        lifecycle: MessageLifecycle,
        message: MessageItem,
    },
    SessionError {
        session_id: Uuid,
        kind: ErrorCode,
        message: String,
    },
}

impl SessionEvent {
    pub fn channel(&self) -> Channel {
        match self {
            Self::SessionCreated { .. } => Channel::SessionCreated,
            Self::SessionTerminated { .. } => Channel::SessionTerminated,
            Self::SessionStatusChanged { .. } => Channel::SessionStatusChanged,
            Self::SessionListUpdate { .. } => Channel::SessionListUpdate,
            Self::Output { .. } => Channel::ClaudeOutput,
            Self::MessageStatus { .. } => Channel::MessageStatus,
            Self::SessionError { .. } => Channel::SessionError,
        }
    }

    /// Session scope of the event. List updates are unscoped and reach
    /// every client whose channel filter matches.
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            Self::SessionCreated { session } => Some(session.id),
            Self::SessionTerminated { session_id }
            | Self::SessionStatusChanged { session_id, .. }
            | Self::Output { session_id, .. }
            | Self::MessageStatus { session_id, .. }
            | Self::SessionError { session_id, .. } => Some(*session_id),
            Self::SessionListUpdate { .. } => None,
        }
    }

    /// The `data` half of the wire envelope.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::SessionCreated { session } => {
                serde_json::json!({ "session": session })
            }
            Self::SessionTerminated { session_id } => {
                serde_json::json!({ "sessionId": session_id })
            }
            Self::SessionStatusChanged { session_id, old_status, new_status, current_task } => {
                serde_json::json!({
                    "sessionId": session_id,
                    "oldStatus": old_status,
                    "newStatus": new_status,
                    "currentTask": current_task,
                })
            }
            Self::SessionListUpdate { sessions, stats } => {
                serde_json::json!({ "sessions": sessions, "stats": stats })
            }
            Self::Output { screen, .. } => {
                serde_json::json!({ "output": screen })
            }
            Self::MessageStatus { lifecycle, message, .. } => {
                serde_json::json!({ "lifecycle": lifecycle, "message": message })
            }
            Self::SessionError { session_id, kind, message } => {
                serde_json::json!({
                    "sessionId": session_id,
                    "kind": kind,
                    "message": message,
                })
            }
        }
    }
}

/// Where sessions hand their events.
///
/// In production this is the orchestrator, which forwards to the hub,
/// mirrors registry rows, and appends the consolidated list update where
/// the contract requires one. Tests substitute a recording sink.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
