// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn subscribe_parses_with_lists() -> anyhow::Result<()> {
    let msg: ClientMessage = serde_json::from_str(
        r#"{"type":"subscribe","data":{"sessionIds":["*"],"channels":["claude-output"]}}"#,
    )?;
    let ClientMessage::Subscribe(data) = msg else {
        anyhow::bail!("wrong variant");
    };
    assert_eq!(data.session_ids, vec!["*"]);
    assert_eq!(data.channels, vec!["claude-output"]);
    Ok(())
}

#[test]
fn ping_parses_without_data() -> anyhow::Result<()> {
    let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#)?;
    assert!(matches!(msg, ClientMessage::Ping));
    Ok(())
}

#[test]
fn get_session_state_parses() -> anyhow::Result<()> {
    let msg: ClientMessage = serde_json::from_str(r#"{"type":"get-session-state"}"#)?;
    assert!(matches!(msg, ClientMessage::GetSessionState));
    Ok(())
}

#[test]
fn reconnect_parses_with_sessions() -> anyhow::Result<()> {
    let msg: ClientMessage = serde_json::from_str(
        r#"{"type":"reconnect","data":{"lastEventTimestamp":"2026-07-01T10:00:00Z","requestedSessions":["0b7f9f4e-9f0f-4a4a-8a39-0d9fd94adbb1"]}}"#,
    )?;
    let ClientMessage::Reconnect(data) = msg else {
        anyhow::bail!("wrong variant");
    };
    assert!(data.last_event_timestamp.is_some());
    assert_eq!(data.requested_sessions.len(), 1);
    Ok(())
}

#[test]
fn unknown_type_is_an_error() {
    assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
}
