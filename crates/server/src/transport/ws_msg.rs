// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client-to-server WebSocket control messages.
//!
//! Messages are adjacently tagged (`{"type": ..., "data": ...}`) to match
//! the server-to-client envelope shape.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Control messages a dashboard client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Replace this client's subscription filter.
    Subscribe(SubscribeData),
    /// Request current snapshots after a reconnect.
    Reconnect(ReconnectData),
    /// Application-level liveness probe; answered with `pong`.
    Ping,
    /// Request the current session list and stats.
    GetSessionState,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeData {
    /// Session UUIDs, or `"*"` for all.
    #[serde(default)]
    pub session_ids: Vec<String>,
    /// Channel names, or `"*"` for all.
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectData {
    /// Advisory only: no historical replay exists beyond current state.
    #[serde(default)]
    pub last_event_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requested_sessions: Vec<String>,
}

#[cfg(test)]
#[path = "ws_msg_tests.rs"]
mod tests;
