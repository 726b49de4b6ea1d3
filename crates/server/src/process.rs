// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child process supervision: spawn with retry, liveness, and the
//! graceful-then-forceful termination sequence.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::pty::spawn::NativePty;
use crate::pty::{Backend, BackendInput, Boxed, ExitStatus};

/// Environment variables forwarded from this process to the child.
/// Everything else is dropped.
const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "USER", "LANG", "LC_ALL", "TERM", "PWD"];

/// Graceful exit request written to the child's stdin before signalling.
const EXIT_REQUEST: &[u8] = b"{\"action\":\"exit\"}\n";

/// Spawn and termination tuning for one session's child process.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Program and arguments to launch.
    pub command: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    /// TERM value the child sees.
    pub term: String,
    /// Spawn attempts before giving up.
    pub attempts: u32,
    /// Base backoff between attempts; doubles each retry.
    pub backoff: Duration,
    /// Phase-1 wait after the graceful exit request.
    pub graceful_timeout: Duration,
    /// Phase-2 watchdog after the kill signal.
    pub force_timeout: Duration,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_owned()],
            cols: 200,
            rows: 50,
            term: "xterm-256color".to_owned(),
            attempts: 3,
            backoff: Duration::from_secs(1),
            graceful_timeout: Duration::from_secs(2),
            force_timeout: Duration::from_secs(3),
        }
    }
}

/// Handle to a supervised child. Output bytes arrive on the receiver
/// returned from [`ProcessManager::spawn`]; input goes through `input_tx`;
/// exit is observed on the watch channel.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    input_tx: mpsc::Sender<BackendInput>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn input_tx(&self) -> &mpsc::Sender<BackendInput> {
        &self.input_tx
    }

    /// Exit status if the child has already been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit_rx.borrow()
    }

    /// Whether the manager still considers the child alive: no reaped exit
    /// and the OS confirms the pid.
    pub fn is_alive(&self) -> bool {
        self.exit_status().is_none() && is_process_alive(self.pid)
    }

    /// Wait up to `timeout` for the child to exit.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<ExitStatus> {
        let mut rx = self.exit_rx.clone();
        tokio::time::timeout(timeout, async move {
            loop {
                if let Some(status) = *rx.borrow_and_update() {
                    return status;
                }
                if rx.changed().await.is_err() {
                    // Supervisor task gone without reaping; treat as exited.
                    return ExitStatus { code: None, signal: None };
                }
            }
        })
        .await
        .ok()
    }
}

/// How a termination concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The child was already gone before phase 1 started.
    AlreadyExited(ExitStatus),
    /// Phase 1 (exit request / SIGTERM) sufficed.
    Graceful(ExitStatus),
    /// Phase 2 SIGKILL was needed.
    Forced(ExitStatus),
    /// The watchdog expired after SIGKILL; the process is leaked.
    ForceKillTimeout,
}

/// Spawns and supervises one PTY-backed child per call.
#[derive(Debug, Clone)]
pub struct ProcessManager {
    opts: SpawnOptions,
}

impl ProcessManager {
    pub fn new(opts: SpawnOptions) -> Self {
        Self { opts }
    }

    /// Spawn the configured command under `working_dir`.
    ///
    /// Validates the directory, retries failed spawns with doubling
    /// backoff, and runs the backend pump on its own task. Returns the
    /// handle plus the raw output receiver.
    pub async fn spawn(
        &self,
        working_dir: &Path,
    ) -> anyhow::Result<(ProcessHandle, mpsc::Receiver<Bytes>)> {
        if !working_dir.is_dir() {
            anyhow::bail!("working directory does not exist: {}", working_dir.display());
        }

        let env = child_env(working_dir, &self.opts.term);

        let mut attempt = 0u32;
        let backend = loop {
            match NativePty::spawn(
                &self.opts.command,
                working_dir,
                &env,
                self.opts.cols,
                self.opts.rows,
            ) {
                Ok(pty) => break pty,
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.opts.attempts {
                        return Err(e.context(format!("spawn failed after {attempt} attempts")));
                    }
                    let delay = self.opts.backoff * 2u32.pow(attempt - 1);
                    warn!(attempt, ?delay, "spawn failed, retrying: {e:#}");
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let pid = backend.child_pid().unwrap_or_default();
        let (output_tx, output_rx) = mpsc::channel(256);
        let (input_tx, input_rx) = mpsc::channel::<BackendInput>(256);
        let (exit_tx, exit_rx) = watch::channel(None);

        let mut backend = backend.boxed();
        tokio::spawn(async move {
            let status = match backend.run(output_tx, input_rx).await {
                Ok(status) => status,
                Err(e) => {
                    warn!("backend pump error: {e:#}");
                    ExitStatus { code: Some(1), signal: None }
                }
            };
            debug!(code = ?status.code, signal = ?status.signal, "child exited");
            let _ = exit_tx.send(Some(status));
        });

        Ok((ProcessHandle { pid, input_tx, exit_rx }, output_rx))
    }

    /// Two-phase shutdown.
    ///
    /// Phase 1: write the exit request to stdin when writable (else send
    /// SIGTERM) and wait the graceful window. Phase 2: SIGKILL with a
    /// watchdog; the watchdog is cancelled by any observed exit.
    pub async fn terminate(&self, handle: &ProcessHandle) -> TerminateOutcome {
        if let Some(status) = handle.exit_status() {
            return TerminateOutcome::AlreadyExited(status);
        }

        // Phase 1: graceful.
        let wrote = handle
            .input_tx
            .send(BackendInput::Write(Bytes::from_static(EXIT_REQUEST)))
            .await
            .is_ok();
        if !wrote {
            debug!(pid = handle.pid, "stdin gone, sending SIGTERM");
            signal_pid(handle.pid, Signal::SIGTERM);
        }
        if let Some(status) = handle.wait_exit(self.opts.graceful_timeout).await {
            return TerminateOutcome::Graceful(status);
        }

        // Phase 2: forceful.
        debug!(pid = handle.pid, "graceful window elapsed, sending SIGKILL");
        signal_pid(handle.pid, Signal::SIGKILL);
        match handle.wait_exit(self.opts.force_timeout).await {
            Some(status) => TerminateOutcome::Forced(status),
            None => {
                warn!(pid = handle.pid, "child survived SIGKILL watchdog, declaring leak");
                TerminateOutcome::ForceKillTimeout
            }
        }
    }
}

/// Checks whether a process with the given PID is alive.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(pid_i32), None).is_ok()
}

fn signal_pid(pid: u32, sig: Signal) {
    if let Ok(pid_i32) = i32::try_from(pid) {
        let _ = kill(Pid::from_raw(pid_i32), sig);
    }
}

/// Build the child's environment: the allowlisted subset of this process's
/// environment, PWD pinned to the working directory, TERM from config, and
/// the unbuffered-output hint.
pub fn child_env(working_dir: &Path, term: &str) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars()
        .filter(|(k, _)| ENV_ALLOWLIST.contains(&k.as_str()))
        .filter(|(k, _)| k != "PWD" && k != "TERM")
        .collect();
    env.push(("PWD".to_owned(), working_dir.display().to_string()));
    env.push(("TERM".to_owned(), term.to_owned()));
    env.push(("PYTHONUNBUFFERED".to_owned(), "1".to_owned()));
    env
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
