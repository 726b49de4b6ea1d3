// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod nbio;
pub mod spawn;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Input sent to the PTY backend: raw bytes or a write barrier.
#[derive(Debug)]
pub enum BackendInput {
    /// Raw bytes to write to the child's terminal.
    Write(Bytes),
    /// Drain marker: the backend processes inputs sequentially, so all
    /// prior writes have reached the PTY when this is answered.  The
    /// chunked writer uses this as its per-chunk barrier.
    Drain(tokio::sync::oneshot::Sender<()>),
}

/// Exit status of the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Terminal backend abstraction over the native PTY.
///
/// Object-safe for use as `Box<dyn Backend>` so tests can substitute a
/// scripted fake for the real child process.
pub trait Backend: Send + 'static {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        input_rx: mpsc::Receiver<BackendInput>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ExitStatus>> + Send + '_>>;

    fn child_pid(&self) -> Option<u32>;
}

/// Conversion trait so both concrete backends and `Box<dyn Backend>` can be
/// handed to the process manager without explicit boxing.
pub trait Boxed {
    fn boxed(self) -> Box<dyn Backend>;
}

impl<T: Backend> Boxed for T {
    fn boxed(self) -> Box<dyn Backend> {
        Box::new(self)
    }
}

impl Boxed for Box<dyn Backend> {
    fn boxed(self) -> Box<dyn Backend> {
        self
    }
}
