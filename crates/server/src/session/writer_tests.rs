// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use tokio::time::Instant;

#[test]
fn small_payload_uses_small_chunks() {
    let payload = "x".repeat(5000);
    let p = plan(&payload);
    assert_eq!(p.chunk_delay, Duration::from_millis(100));
    assert_eq!(p.chunks.len(), 3);
    assert!(p.chunks.iter().all(|c| c.len() <= 2048));
    let total: usize = p.chunks.iter().map(Bytes::len).sum();
    assert_eq!(total, 5000);
}

#[test]
fn large_payload_uses_large_chunks() {
    let payload = "y".repeat(20 * 1024);
    let p = plan(&payload);
    assert_eq!(p.chunk_delay, Duration::from_millis(150));
    assert!(p.chunks.iter().all(|c| c.len() <= 4096));
    assert_eq!(p.chunks.len(), 5);
}

#[test]
fn empty_payload_still_submits() {
    let p = plan("");
    assert!(p.chunks.is_empty());
    assert_eq!(p.submit_delay, Duration::from_millis(300));
}

/// Drive the backend side of the channel, recording writes and the
/// instants they arrived, acking drains immediately.
async fn pump_backend(
    mut rx: tokio::sync::mpsc::Receiver<BackendInput>,
) -> Vec<(Instant, Bytes)> {
    let mut writes = Vec::new();
    while let Some(input) = rx.recv().await {
        match input {
            BackendInput::Write(data) => writes.push((Instant::now(), data)),
            BackendInput::Drain(ack) => {
                let _ = ack.send(());
            }
        }
    }
    writes
}

#[tokio::test(start_paused = true)]
async fn execute_paces_chunks_and_submits_cr() -> anyhow::Result<()> {
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let backend = tokio::spawn(pump_backend(rx));

    let payload = "z".repeat(5000);
    let p = plan(&payload);
    execute(&tx, &p).await?;
    drop(tx);

    let writes = backend.await?;
    // 3 chunks plus the submit character.
    assert_eq!(writes.len(), 4);

    let (last_at, last) = &writes[3];
    assert_eq!(last.as_ref(), b"\r");

    // Each chunk is ≤ 2 KB and ≥ 100 ms of quiescence follows it.
    for window in writes.windows(2) {
        let (prev_at, prev) = &window[0];
        let (next_at, _) = &window[1];
        assert!(prev.len() <= 2048);
        assert!(*next_at - *prev_at >= Duration::from_millis(100));
    }

    // The submit character trails the final chunk by ≥ 300 ms.
    let (third_at, _) = &writes[2];
    assert!(*last_at - *third_at >= Duration::from_millis(300));
    Ok(())
}

#[tokio::test]
async fn execute_reports_closed_stdin() {
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    drop(rx);
    let p = plan("hello");
    assert_eq!(execute(&tx, &p).await, Err(WriteError::StdinClosed));
}
