// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Chunk-paced delivery of a message into the child's stdin.
//!
//! The PTY layer will happily collapse a payload and its terminating
//! carriage return into a single read, which the TUI then misreads as
//! plain text rather than a submission. Pacing each chunk behind a drain
//! barrier and delaying the final `\r` guarantees the submit character
//! arrives as its own read.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::pty::BackendInput;

/// Payloads below this size use the small chunk profile.
const LARGE_PAYLOAD: usize = 10 * 1024;
const SMALL_CHUNK: usize = 2 * 1024;
const LARGE_CHUNK: usize = 4 * 1024;
const SMALL_DELAY: Duration = Duration::from_millis(100);
const LARGE_DELAY: Duration = Duration::from_millis(150);
/// Quiet period between the last chunk and the submit character.
const SUBMIT_DELAY: Duration = Duration::from_millis(300);

/// A fully-planned write: chunks, inter-chunk pacing, and the submit gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlan {
    pub chunks: Vec<Bytes>,
    pub chunk_delay: Duration,
    pub submit_delay: Duration,
}

/// Split a payload by size class: 2 KB chunks at 100 ms for small
/// payloads, 4 KB at 150 ms for large ones.
pub fn plan(payload: &str) -> WritePlan {
    let bytes = payload.as_bytes();
    let (chunk_size, chunk_delay) = if bytes.len() < LARGE_PAYLOAD {
        (SMALL_CHUNK, SMALL_DELAY)
    } else {
        (LARGE_CHUNK, LARGE_DELAY)
    };

    let chunks = bytes.chunks(chunk_size).map(Bytes::copy_from_slice).collect();
    WritePlan { chunks, chunk_delay, submit_delay: SUBMIT_DELAY }
}

/// Why a write could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// The backend input channel is gone; stdin is unwritable.
    StdinClosed,
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StdinClosed => f.write_str("child stdin is not writable"),
        }
    }
}

impl std::error::Error for WriteError {}

/// Execute a plan against the backend input channel.
///
/// Each chunk is written, drained (the backend acks once the bytes are on
/// the PTY), then paced by the chunk delay. After the final chunk and the
/// submit gap, exactly `\r` is written as its own read.
pub async fn execute(
    input_tx: &mpsc::Sender<BackendInput>,
    plan: &WritePlan,
) -> Result<(), WriteError> {
    for chunk in &plan.chunks {
        write_drained(input_tx, chunk.clone()).await?;
        tokio::time::sleep(plan.chunk_delay).await;
    }

    tokio::time::sleep(plan.submit_delay).await;
    write_drained(input_tx, Bytes::from_static(b"\r")).await
}

async fn write_drained(
    input_tx: &mpsc::Sender<BackendInput>,
    data: Bytes,
) -> Result<(), WriteError> {
    input_tx.send(BackendInput::Write(data)).await.map_err(|_| WriteError::StdinClosed)?;

    let (ack_tx, ack_rx) = oneshot::channel();
    input_tx.send(BackendInput::Drain(ack_tx)).await.map_err(|_| WriteError::StdinClosed)?;
    ack_rx.await.map_err(|_| WriteError::StdinClosed)
}

#[cfg(test)]
#[path = "writer_tests.rs"]
mod tests;
