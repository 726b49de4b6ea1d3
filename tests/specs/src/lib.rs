// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `corral` binary with a scripted fake agent and
//! exercises it over HTTP and WebSocket.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Once;
use std::time::Duration;

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times; only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Resolve the path to the compiled `corral` binary.
pub fn corral_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("corral")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// The scripted assistant used by every smoke test: prints the ready
/// sentinel, redraws on each submitted line, then reports ready again.
pub const FAKE_AGENT: &str = r#"echo "? for shortcuts"
while read line; do
  printf '\033[2J'
  echo "working on: $line"
  echo "done"
  echo "? for shortcuts"
done"#;

/// A running `corral` server with its own state and workspace roots.
pub struct CorralProcess {
    child: Child,
    port: u16,
    _data_root: tempfile::TempDir,
}

impl CorralProcess {
    /// Start the binary with fast detector timings and the fake agent.
    pub fn start() -> anyhow::Result<Self> {
        ensure_crypto();
        let data_root = tempfile::tempdir()?;
        let port = free_port()?;

        let child = Command::new(corral_binary())
            .args([
                "--host",
                "127.0.0.1",
                "--port",
                &port.to_string(),
                "--data-root",
                &data_root.path().display().to_string(),
                "--log-format",
                "text",
                "--log-level",
                "warn",
                "--debounce-ms",
                "250",
                "--stabilization-ms",
                "2000",
                "--long-stabilization-ms",
                "4000",
                "--detect-tick-ms",
                "50",
                "--throttle-ms",
                "100",
                "--spacing-ms",
                "50",
                "--ready-timeout-secs",
                "20",
                "--completion-timeout-secs",
                "20",
                "--graceful-ms",
                "500",
                "--",
                "sh",
                "-c",
                FAKE_AGENT,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Self { child, port, _data_root: data_root })
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/", self.port)
    }

    /// Poll `/health` until the server answers or the timeout elapses.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let url = format!("{}/health", self.base_url());
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("server never became healthy");
            }
            if let Ok(resp) = reqwest::get(&url).await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Drop for CorralProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
