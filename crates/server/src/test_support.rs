// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for unit and integration tests: a recording event sink,
//! scripted fake agents, and fast timing profiles.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::detect::DetectorConfig;
use crate::event::{EventSink, SessionEvent};
use crate::process::SpawnOptions;
use crate::session::SessionSettings;

/// Sink that forwards every emitted event into an unbounded channel.
pub struct RecordingSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink for RecordingSink {
    fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}

/// Build a recording sink plus the receiving end for assertions.
pub fn recording_sink() -> (Arc<RecordingSink>, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingSink { tx }), rx)
}

/// A scripted stand-in for the assistant: prints the ready sentinel, then
/// answers each submitted line with a screen redraw, some work output, and
/// the sentinel again.
pub fn fake_agent() -> Vec<String> {
    shell(
        r#"echo "? for shortcuts"
while read line; do
  printf '\033[2J'
  echo "working on: $line"
  echo "done"
  echo "? for shortcuts"
done"#,
    )
}

/// Fake agent that raises a permission prompt on the first message, then
/// reports completion.
pub fn permission_agent() -> Vec<String> {
    shell(
        r#"echo "? for shortcuts"
read line
printf '\033[2J'
echo "Do you want to apply this edit? [y/N]"
sleep 1
printf '\033[2J'
echo "changes applied"
echo "? for shortcuts"
read line2"#,
    )
}

/// Fake agent that clears the screen on input and then stays busy forever.
pub fn silent_agent() -> Vec<String> {
    shell(r#"echo "? for shortcuts"; read line; printf '\033[2J'; exec sleep 600"#)
}

fn shell(script: &str) -> Vec<String> {
    vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()]
}

/// Detector timings scaled down so tests settle in tens of milliseconds
/// of silence instead of seconds.
pub fn quick_detector() -> DetectorConfig {
    DetectorConfig {
        debounce: Duration::from_millis(250),
        stabilization: Duration::from_secs(2),
        long_stabilization: Duration::from_secs(4),
        min_content_len: 10,
        overall_cap: Duration::from_secs(30),
    }
}

/// Session settings tuned for fast tests.
pub fn quick_settings() -> SessionSettings {
    SessionSettings {
        throttle: Duration::from_millis(50),
        detect_tick: Duration::from_millis(50),
        ready_timeout: Duration::from_secs(15),
        completion_timeout: Duration::from_secs(15),
        spacing: Duration::from_millis(50),
        detector: quick_detector(),
        ..SessionSettings::default()
    }
}

/// Spawn options wrapping a fake agent command with short termination
/// windows.
pub fn quick_spawn(command: Vec<String>) -> SpawnOptions {
    SpawnOptions {
        command,
        graceful_timeout: Duration::from_millis(400),
        force_timeout: Duration::from_secs(2),
        ..SpawnOptions::default()
    }
}
