// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::ffi::CString;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use bytes::Bytes;
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, execvpe, Pid};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

use super::nbio::{read_chunk, set_nonblocking, write_all, MasterFd};
use super::{Backend, BackendInput, ExitStatus};

/// Native PTY backend that spawns a child process via `forkpty`.
///
/// The child receives exactly the environment it is given (the caller is
/// responsible for allowlist filtering), is `chdir`ed into its working
/// directory, and gets the PTY as its controlling terminal.
pub struct NativePty {
    master: AsyncFd<MasterFd>,
    child_pid: Pid,
}

impl NativePty {
    /// Spawn `command` on a new PTY rooted at `working_dir`.
    ///
    /// `command` must have at least one element (the program to run);
    /// `env` is the complete child environment as `KEY=VALUE` pairs.
    // forkpty requires unsafe: post-fork child is partially initialized
    #[allow(unsafe_code)]
    pub fn spawn(
        command: &[String],
        working_dir: &Path,
        env: &[(String, String)],
        cols: u16,
        rows: u16,
    ) -> anyhow::Result<Self> {
        if command.is_empty() {
            bail!("empty command");
        }

        let winsize = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };

        // Prepare all allocations before forking; the child must only
        // chdir and exec.
        let c_args: Vec<CString> = command
            .iter()
            .map(|s| CString::new(s.as_bytes()))
            .collect::<Result<_, _>>()
            .context("invalid command argument")?;
        let c_env: Vec<CString> = env
            .iter()
            .map(|(k, v)| CString::new(format!("{k}={v}")))
            .collect::<Result<_, _>>()
            .context("invalid environment entry")?;
        let dir: PathBuf = working_dir.to_path_buf();

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork. We immediately chdir+exec
        // using only pre-allocated data.
        let result = unsafe { forkpty(&winsize, None) }.context("forkpty failed")?;

        match result {
            ForkptyResult::Child => {
                chdir(dir.as_path()).context("chdir failed")?;
                execvpe(&c_args[0], &c_args, &c_env).context("execvpe failed")?;
                unreachable!();
            }
            ForkptyResult::Parent { child, master } => {
                set_nonblocking(&master)?;
                let afd = AsyncFd::new(MasterFd(master)).context("AsyncFd::new failed")?;
                Ok(Self { master: afd, child_pid: child })
            }
        }
    }
}

impl Backend for NativePty {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<BackendInput>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<ExitStatus>> + Send + '_>>
    {
        let pid = self.child_pid;
        Box::pin(async move {
            let mut buf = vec![0u8; 8192];
            let mut input_closed = false;

            loop {
                if input_closed {
                    // Input side hung up; drain remaining output only.
                    match read_chunk(&self.master, &mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            if output_tx.send(data).await.is_err() {
                                break;
                            }
                        }
                        Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                        Err(e) => return Err(e.into()),
                    }
                } else {
                    tokio::select! {
                        result = read_chunk(&self.master, &mut buf) => {
                            match result {
                                Ok(0) => break,
                                Ok(n) => {
                                    let data = Bytes::copy_from_slice(&buf[..n]);
                                    if output_tx.send(data).await.is_err() {
                                        break;
                                    }
                                }
                                // EIO from the master means the child side closed.
                                Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                                Err(e) => return Err(e.into()),
                            }
                        }
                        input = input_rx.recv() => {
                            match input {
                                Some(BackendInput::Write(data)) => {
                                    write_all(&self.master, &data).await?;
                                }
                                Some(BackendInput::Drain(tx)) => {
                                    // Sequential processing: prior writes are
                                    // already on the PTY by the time this
                                    // marker is handled.
                                    let _ = tx.send(());
                                }
                                None => input_closed = true,
                            }
                        }
                    }
                }
            }

            // Reap on a blocking thread to avoid stalling the runtime.
            let status = tokio::task::spawn_blocking(move || wait_for_exit(pid))
                .await
                .context("join wait thread")??;
            Ok(status)
        })
    }

    fn child_pid(&self) -> Option<u32> {
        Some(self.child_pid.as_raw() as u32)
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        // Best-effort cleanup if the two-phase terminate never ran.
        let _ = kill(self.child_pid, Signal::SIGHUP);
        std::thread::sleep(std::time::Duration::from_millis(50));
        let _ = kill(self.child_pid, Signal::SIGKILL);
        let _ = waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG));
    }
}

/// Block until the child exits and convert to our `ExitStatus`.
fn wait_for_exit(pid: Pid) -> anyhow::Result<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return Ok(ExitStatus { code: Some(code), signal: None });
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return Ok(ExitStatus { code: None, signal: Some(sig as i32) });
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => bail!("waitpid failed: {e}"),
        }
    }
}
