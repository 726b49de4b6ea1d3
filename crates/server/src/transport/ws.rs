// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket endpoint: subscription management, event forwarding, and
//! heartbeat liveness for dashboard clients.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::hub::Subscription;
use crate::orchestrator::Orchestrator;

use super::ws_msg::{ClientMessage, ReconnectData, SubscribeData};

/// Heartbeat cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A client is dead after this long without a pong (or app-level ping).
const PONG_TIMEOUT: Duration = Duration::from_secs(60);
/// Grace between the close frame and forced socket teardown.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// `GET /` upgrade handler.
pub async fn ws_handler(
    State(orch): State<Arc<Orchestrator>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(orch, socket))
}

/// Per-connection event loop.
async fn handle_connection(orch: Arc<Orchestrator>, socket: WebSocket) {
    // Clients start wide open; a `subscribe` control message narrows the
    // filter from that moment on.
    let (client_id, mut events_rx) = orch.hub().register(Subscription::everything());
    let (mut ws_tx, mut ws_rx) = socket.split();

    let greeting = serde_json::json!({
        "type": "connection",
        "data": { "clientId": client_id },
        "timestamp": Utc::now(),
    });
    if send_json(&mut ws_tx, &greeting).await.is_err() {
        orch.hub().unregister(client_id);
        return;
    }

    let mut ping_tick = tokio::time::interval(PING_INTERVAL);
    ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            // Hub events for this client, already filtered, FIFO.
            envelope = events_rx.recv() => {
                let Some(envelope) = envelope else { break };
                let Ok(json) = serde_json::to_value(&envelope) else { continue };
                if send_json(&mut ws_tx, &json).await.is_err() {
                    break;
                }
            }

            // Heartbeat: ping, and reap the client when pongs stop.
            _ = ping_tick.tick() => {
                if last_pong.elapsed() > PONG_TIMEOUT {
                    debug!(client = %client_id, "heartbeat lapsed, closing");
                    close_gracefully(ws_tx).await;
                    orch.hub().unregister(client_id);
                    return;
                }
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }

            // Client traffic.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => {
                                if handle_client_message(&orch, client_id, msg, &mut ws_tx, &mut last_pong)
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(client = %client_id, "unparseable control message: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client = %client_id, "socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    orch.hub().unregister(client_id);
    debug!(client = %client_id, "ws client disconnected");
}

async fn handle_client_message(
    orch: &Arc<Orchestrator>,
    client_id: Uuid,
    msg: ClientMessage,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    last_pong: &mut Instant,
) -> Result<(), ()> {
    match msg {
        ClientMessage::Subscribe(SubscribeData { session_ids, channels }) => {
            orch.hub().update_subscription(client_id, Subscription::new(&session_ids, &channels));
            let ack = serde_json::json!({
                "type": "subscribed",
                "data": { "sessionIds": session_ids, "channels": channels },
                "timestamp": Utc::now(),
            });
            send_json(ws_tx, &ack).await
        }
        ClientMessage::Reconnect(ReconnectData { requested_sessions, .. }) => {
            send_json(ws_tx, &reconnect_snapshot(orch, &requested_sessions)).await
        }
        ClientMessage::Ping => {
            *last_pong = Instant::now();
            let pong = serde_json::json!({ "type": "pong", "timestamp": Utc::now() });
            send_json(ws_tx, &pong).await
        }
        ClientMessage::GetSessionState => {
            let state = serde_json::json!({
                "type": "session-state",
                "data": { "sessions": orch.list_active(), "stats": orch.stats() },
                "timestamp": Utc::now(),
            });
            send_json(ws_tx, &state).await
        }
    }
}

/// Current snapshot for a reconnecting client: summaries plus the latest
/// screen per requested session. No historical replay.
fn reconnect_snapshot(orch: &Arc<Orchestrator>, requested: &[String]) -> serde_json::Value {
    let wanted: Vec<Uuid> = requested.iter().filter_map(|s| s.parse().ok()).collect();
    let sessions: Vec<serde_json::Value> = orch
        .list_active()
        .into_iter()
        .filter(|s| wanted.is_empty() || wanted.contains(&s.id))
        .map(|summary| {
            let screen = orch.screen_snapshot(summary.id);
            serde_json::json!({ "session": summary, "screen": screen })
        })
        .collect();

    serde_json::json!({
        "type": "session-state",
        "data": { "sessions": sessions },
        "timestamp": Utc::now(),
    })
}

async fn send_json(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    value: &serde_json::Value,
) -> Result<(), ()> {
    let Ok(text) = serde_json::to_string(value) else {
        return Ok(());
    };
    ws_tx.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// Graceful close, then let the socket drop (forced teardown) after the
/// grace period.
async fn close_gracefully(mut ws_tx: SplitSink<WebSocket, Message>) {
    let _ = ws_tx.send(Message::Close(None)).await;
    tokio::time::sleep(CLOSE_GRACE).await;
}
