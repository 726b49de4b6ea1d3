// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session message queue: item model, in-memory ordering, and the
//! normalization rules shared by load and save.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

/// One user-submitted prompt awaiting (or done) processing.
///
/// Only `id`, `payload`, and `status` are required when loading from disk;
/// everything else defaults so older queue files still parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageItem {
    pub id: Uuid,
    pub payload: String,
    pub status: MessageStatus,
    #[serde(default)]
    pub session_id: Uuid,
    /// Position within the session's queue. Strictly increasing, never
    /// reused.
    #[serde(default)]
    pub seq: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}

impl MessageItem {
    pub fn new(session_id: Uuid, payload: String, seq: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            status: MessageStatus::Pending,
            session_id,
            seq,
            created_at: Utc::now(),
            processing_started_at: None,
            completed_at: None,
            error_at: None,
            error: None,
            processing_time_ms: None,
        }
    }
}

/// In-memory queue for one session. The authoritative copy while the
/// session is active; the store trails it.
#[derive(Debug, Default)]
pub struct Queue {
    items: Vec<MessageItem>,
    next_seq: u64,
}

impl Queue {
    /// Adopt previously-persisted items, continuing the sequence after the
    /// highest seq ever used.
    pub fn from_items(items: Vec<MessageItem>) -> Self {
        let next_seq = items.iter().map(|m| m.seq + 1).max().unwrap_or(0);
        Self { items, next_seq }
    }

    /// Append a new pending item and return a clone of it.
    pub fn push(&mut self, session_id: Uuid, payload: String) -> MessageItem {
        let item = MessageItem::new(session_id, payload, self.next_seq);
        self.next_seq += 1;
        self.items.push(item.clone());
        item
    }

    /// The earliest-sequenced pending item, if any.
    pub fn next_pending(&self) -> Option<&MessageItem> {
        self.items
            .iter()
            .filter(|m| m.status == MessageStatus::Pending)
            .min_by_key(|m| m.seq)
    }

    pub fn get(&self, id: Uuid) -> Option<&MessageItem> {
        self.items.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut MessageItem> {
        self.items.iter_mut().find(|m| m.id == id)
    }

    /// Remove an item unless it is currently processing.
    ///
    /// `Ok(None)` means no such item; `Err(())` means it was processing.
    #[allow(clippy::result_unit_err)]
    pub fn remove(&mut self, id: Uuid) -> Result<Option<MessageItem>, ()> {
        match self.items.iter().position(|m| m.id == id) {
            None => Ok(None),
            Some(idx) if self.items[idx].status == MessageStatus::Processing => Err(()),
            Some(idx) => Ok(Some(self.items.remove(idx))),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Snapshot for persistence.
    pub fn snapshot(&self) -> Vec<MessageItem> {
        self.items.clone()
    }
}

/// Normalize a persisted item list.
///
/// Coerces `processing` back to `pending` (at most one item may ever be
/// processing, and never across a restart) and drops duplicate
/// double-writes keyed on `(payload, created_at)`; repeated prompts with
/// distinct creation times are legitimate and survive.
pub fn normalize(items: &mut Vec<MessageItem>) {
    for item in items.iter_mut() {
        if item.status == MessageStatus::Processing {
            item.status = MessageStatus::Pending;
        }
    }
    let mut seen: Vec<(String, DateTime<Utc>)> = Vec::new();
    items.retain(|m| {
        let key = (m.payload.clone(), m.created_at);
        if seen.contains(&key) {
            false
        } else {
            seen.push(key);
            true
        }
    });
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
