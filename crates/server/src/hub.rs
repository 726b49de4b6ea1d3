// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscription-aware event fan-out.
//!
//! Each connected client registers a filter (session IDs and channels, both
//! wildcardable) and gets its own FIFO delivery queue. High-churn channels
//! are debounced through the shared [`Coalescer`] before they reach any
//! client; everything else is delivered on the spot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::{Channel, SessionEvent};
use crate::throttle::{Coalescer, Decision};

/// Wildcard token accepted in subscription lists.
const WILDCARD: &str = "*";

/// Per-client delivery queue depth. A client that falls this far behind
/// starts losing events; the heartbeat will reap it soon after.
const CLIENT_QUEUE_DEPTH: usize = 256;

/// A client's declared interests.
#[derive(Debug, Clone)]
pub struct Subscription {
    all_sessions: bool,
    sessions: HashSet<Uuid>,
    all_channels: bool,
    channels: HashSet<Channel>,
}

impl Subscription {
    /// Build from raw subscription lists; `"*"` in either list subscribes
    /// to everything on that axis. Unknown channel names and malformed
    /// session IDs are ignored.
    pub fn new(session_ids: &[String], channels: &[String]) -> Self {
        let all_sessions = session_ids.iter().any(|s| s == WILDCARD);
        let sessions = session_ids.iter().filter_map(|s| s.parse().ok()).collect();
        let all_channels = channels.iter().any(|c| c == WILDCARD);
        let channels = channels.iter().filter_map(|c| Channel::parse(c)).collect();
        Self { all_sessions, sessions, all_channels, channels }
    }

    /// Subscribe to every session and channel.
    pub fn everything() -> Self {
        Self {
            all_sessions: true,
            sessions: HashSet::new(),
            all_channels: true,
            channels: HashSet::new(),
        }
    }

    /// Delivery rule: the channel must match, and session-scoped events
    /// additionally need a session match. Unscoped events pass the session
    /// axis unconditionally.
    pub fn wants(&self, channel: Channel, session: Option<Uuid>) -> bool {
        if !self.all_channels && !self.channels.contains(&channel) {
            return false;
        }
        match session {
            None => true,
            Some(id) => self.all_sessions || self.sessions.contains(&id),
        }
    }
}

/// Server-to-client wire envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: serde_json::Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn from_event(event: &SessionEvent) -> Self {
        Self {
            kind: event.channel().as_str(),
            data: event.payload(),
            session_id: event.session_id(),
            timestamp: Utc::now(),
        }
    }
}

struct ClientEntry {
    subscription: Subscription,
    tx: mpsc::Sender<Envelope>,
}

/// Debounce state for one (channel, session) key.
struct DebounceSlot {
    gate: Coalescer,
    latest: Option<SessionEvent>,
    armed: bool,
}

/// The fan-out hub. One per process; owned by the orchestrator and shared
/// with the transport layer.
pub struct EventHub {
    clients: RwLock<HashMap<Uuid, ClientEntry>>,
    debounce_window: Duration,
    debounce: Mutex<HashMap<(Channel, Option<Uuid>), DebounceSlot>>,
}

impl EventHub {
    pub fn new(debounce_window: Duration) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            debounce_window,
            debounce: Mutex::new(HashMap::new()),
        }
    }

    /// Add a client; returns its ID and the receiving end of its queue.
    pub fn register(&self, subscription: Subscription) -> (Uuid, mpsc::Receiver<Envelope>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        self.clients.write().insert(id, ClientEntry { subscription, tx });
        debug!(client = %id, "hub client registered");
        (id, rx)
    }

    /// Replace a client's filter (the `subscribe` control message).
    pub fn update_subscription(&self, client: Uuid, subscription: Subscription) {
        if let Some(entry) = self.clients.write().get_mut(&client) {
            entry.subscription = subscription;
        }
    }

    pub fn unregister(&self, client: Uuid) {
        self.clients.write().remove(&client);
        debug!(client = %client, "hub client removed");
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Publish an event, routing through the debounce table when its
    /// channel calls for coalescing.
    pub fn publish(self: &Arc<Self>, event: SessionEvent) {
        if !event.channel().is_debounced() {
            self.deliver(&event);
            return;
        }

        let key = (event.channel(), event.session_id());
        let now = Instant::now();
        let mut table = self.debounce.lock();
        let slot = table.entry(key).or_insert_with(|| DebounceSlot {
            gate: Coalescer::new(self.debounce_window),
            latest: None,
            armed: false,
        });

        match slot.gate.offer(now) {
            Decision::EmitNow => {
                drop(table);
                self.deliver(&event);
            }
            Decision::Scheduled(deadline) => {
                slot.latest = Some(event);
                if !slot.armed {
                    slot.armed = true;
                    let hub = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::time::sleep_until(deadline).await;
                        hub.flush_debounced(key);
                    });
                }
            }
        }
    }

    /// Trailing-edge flush for one debounce key.
    fn flush_debounced(self: &Arc<Self>, key: (Channel, Option<Uuid>)) {
        let event = {
            let mut table = self.debounce.lock();
            let Some(slot) = table.get_mut(&key) else {
                return;
            };
            slot.armed = false;
            if !slot.gate.fire(Instant::now()) {
                return;
            }
            slot.latest.take()
        };
        if let Some(event) = event {
            self.deliver(&event);
        }
    }

    /// Hand the event to every matching client queue, in registration-set
    /// snapshot order. Per-client FIFO comes from the per-client channel.
    fn deliver(&self, event: &SessionEvent) {
        let envelope = Envelope::from_event(event);
        let targets: Vec<(Uuid, mpsc::Sender<Envelope>)> = {
            let clients = self.clients.read();
            clients
                .iter()
                .filter(|(_, entry)| {
                    entry.subscription.wants(event.channel(), event.session_id())
                })
                .map(|(id, entry)| (*id, entry.tx.clone()))
                .collect()
        };

        for (client, tx) in targets {
            match tx.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client = %client, channel = %event.channel(), "client queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Connection loop is gone; reaped on its own path.
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
