// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tick-driven classification of the child's screen into ready, busy, or
//! awaiting-permission.
//!
//! The child is an opaque TUI, so sentinel patterns are combined with
//! output-silence debouncing: a ready pattern only counts once the screen
//! has been quiet for the debounce interval, and two stabilization fallbacks
//! cover redraws that never show a recognizable prompt.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::time::Instant;

/// CSI and OSC escape sequences, stripped before pattern matching.
static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // static pattern, validated by tests
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-_]").unwrap()
});

/// `[y/N]`, `[Y/n]`, `(y/n)` and friends, matched case-insensitively.
static YES_NO_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // static pattern, validated by tests
    Regex::new(r"(?i)\[y/n\]|\(y/n\)").unwrap()
});

/// Phrases that mean the child is waiting for an inline confirmation.
const PERMISSION_PHRASES: &[&str] = &[
    "do you want to",
    "proceed with",
    "continue?",
    "are you sure",
    "press enter to continue",
];

/// Phrases that release the permission latch: the in-flight operation
/// finished even though the ready sentinel has not reappeared yet.
const COMPLETION_PHRASES: &[&str] = &["successfully", "changes applied", "task finished"];

/// The assistant's idle sentinel. Highest-priority ready pattern and the
/// only one that releases the permission latch by itself.
const READY_SENTINEL: &str = "? for shortcuts";

/// How readiness was established, reported with the `ready` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadyMethod {
    /// A ready pattern matched after the debounce interval of silence.
    Pattern,
    /// No pattern, but the screen stabilized and ends in a prompt character.
    StabilizationWithPrompt,
    /// No pattern, but the screen has been still for the long interval.
    LongStabilization,
}

/// Outcome of one 500 ms analysis tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Still busy; keep ticking.
    Pending,
    /// A permission prompt is on screen; readiness is latched off.
    AwaitingPermission,
    /// The child is accepting input.
    Ready { method: ReadyMethod, pattern: Option<&'static str> },
    /// The wait budget expired. Not an error; the caller decides.
    TimedOut,
}

/// Detector tuning. Defaults match the session loop's expectations.
#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// Output silence required before a ready pattern counts.
    pub debounce: Duration,
    /// Silence required for the prompt-suffix fallback.
    pub stabilization: Duration,
    /// Silence required for the last-resort fallback.
    pub long_stabilization: Duration,
    /// Minimum screen content for the fallbacks to apply.
    pub min_content_len: usize,
    /// Hard cap on any single wait, whatever budget the caller asks for.
    pub overall_cap: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            stabilization: Duration::from_secs(4),
            long_stabilization: Duration::from_secs(8),
            min_content_len: 10,
            overall_cap: Duration::from_secs(3600),
        }
    }
}

/// Prompt-detection state machine. Owned by one session; driven by that
/// session's select-loop on a fixed tick while a wait is active.
#[derive(Debug)]
pub struct PromptDetector {
    cfg: DetectorConfig,
    awaiting_permission: bool,
    deadline: Option<Instant>,
}

impl PromptDetector {
    pub fn new(cfg: DetectorConfig) -> Self {
        Self { cfg, awaiting_permission: false, deadline: None }
    }

    /// Arm a wait with the given budget (clamped to the overall cap).
    /// Resets the permission latch: a new wait starts from a clean read
    /// of the screen.
    pub fn begin_wait(&mut self, now: Instant, budget: Duration) {
        self.deadline = Some(now + budget.min(self.cfg.overall_cap));
        self.awaiting_permission = false;
    }

    /// Abandon the current wait without a verdict.
    pub fn cancel_wait(&mut self) {
        self.deadline = None;
        self.awaiting_permission = false;
    }

    pub fn waiting(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn awaiting_permission(&self) -> bool {
        self.awaiting_permission
    }

    /// Run one analysis tick against the current screen snapshot.
    ///
    /// `last_output` is the instant the child last produced bytes; the gap
    /// to `now` is the silence interval all debounce checks use.
    pub fn tick(&mut self, screen: &str, last_output: Instant, now: Instant) -> Verdict {
        let Some(deadline) = self.deadline else {
            return Verdict::Pending;
        };
        if now >= deadline {
            self.deadline = None;
            self.awaiting_permission = false;
            return Verdict::TimedOut;
        }

        let text = strip_ansi(screen);
        let lower = text.to_lowercase();

        // Permission latch: once a confirmation prompt is seen, readiness
        // stays off until the sentinel reappears or the operation reports
        // completion.
        if self.awaiting_permission {
            let released = lower.contains(READY_SENTINEL)
                || COMPLETION_PHRASES.iter().any(|p| lower.contains(p));
            if !released {
                return Verdict::AwaitingPermission;
            }
            self.awaiting_permission = false;
        } else if is_permission_prompt(&lower) {
            self.awaiting_permission = true;
            return Verdict::AwaitingPermission;
        }

        let silence = now.saturating_duration_since(last_output);

        if let Some(pattern) = match_ready_pattern(&text, &lower) {
            if silence >= self.cfg.debounce {
                self.deadline = None;
                return Verdict::Ready { method: ReadyMethod::Pattern, pattern: Some(pattern) };
            }
            return Verdict::Pending;
        }

        // Stabilization fallbacks for screens with no recognizable pattern.
        let content = text.trim();
        if content.len() > self.cfg.min_content_len {
            if silence >= self.cfg.stabilization && ends_with_prompt_char(&text) {
                self.deadline = None;
                return Verdict::Ready {
                    method: ReadyMethod::StabilizationWithPrompt,
                    pattern: None,
                };
            }
            if silence >= self.cfg.long_stabilization {
                self.deadline = None;
                return Verdict::Ready { method: ReadyMethod::LongStabilization, pattern: None };
            }
        }

        Verdict::Pending
    }
}

/// Remove ANSI escape sequences so pattern matching sees plain text.
pub fn strip_ansi(input: &str) -> String {
    ANSI_RE.replace_all(input, "").into_owned()
}

/// Match the highest-priority ready pattern present on the screen.
///
/// `text` is the ANSI-stripped snapshot, `lower` its lowercase form.
fn match_ready_pattern(text: &str, lower: &str) -> Option<&'static str> {
    // Primary: the shortcut hint and the framed input box.
    if lower.contains(READY_SENTINEL) {
        return Some("shortcut-hint");
    }
    if text.contains("\u{2502} >") {
        return Some("input-box");
    }
    // Secondary: a bare prompt character closing the last line.
    if ends_with_prompt_char(text) {
        return Some("trailing-prompt");
    }
    // Tertiary: contextual banners and prompt glyphs.
    if lower.contains("bypassing permissions") {
        return Some("bypassing-permissions");
    }
    if lower.contains("welcome to claude") {
        return Some("welcome-banner");
    }
    if text.lines().any(|l| l.trim_start().starts_with('\u{276f}')) || text.contains('\u{27e9}') {
        return Some("prompt-glyph");
    }
    None
}

fn is_permission_prompt(lower: &str) -> bool {
    PERMISSION_PHRASES.iter().any(|p| lower.contains(p)) || YES_NO_RE.is_match(lower)
}

/// Whether the last non-empty line ends with `>` or `$`.
fn ends_with_prompt_char(text: &str) -> bool {
    text.lines()
        .rev()
        .map(str::trim_end)
        .find(|l| !l.trim().is_empty())
        .is_some_and(|l| l.ends_with('>') || l.ends_with('$'))
}

#[cfg(test)]
#[path = "detect_tests.rs"]
mod tests;
