// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::detect::DetectorConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::process::SpawnOptions;
use crate::session::SessionSettings;

/// Session orchestrator for interactive AI coding assistants.
#[derive(Debug, Parser)]
#[command(name = "corral", version, about)]
pub struct Config {
    /// HTTP/WebSocket port to listen on.
    #[arg(long, env = "PORT", default_value = "5001")]
    pub port: u16,

    /// Host address to bind to.
    #[arg(long, env = "CORRAL_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// State directory for queues and the session registry.
    /// Defaults to `$XDG_STATE_HOME/corral`.
    #[arg(long, env = "CORRAL_DATA_ROOT")]
    pub data_root: Option<PathBuf>,

    /// Maximum simultaneously active sessions.
    #[arg(long, env = "CORRAL_MAX_SESSIONS", default_value = "10")]
    pub max_sessions: usize,

    /// Minimum interval between terminal snapshots per session, in ms.
    #[arg(long, env = "CORRAL_THROTTLE_MS", default_value = "1000")]
    pub throttle_ms: u64,

    /// Clear an idle screen after this many ms of silence (0 = disabled).
    #[arg(long, env = "CORRAL_AUTO_CLEAR_MS", default_value = "0")]
    pub auto_clear_ms: u64,

    /// Screen buffer cap per session, in bytes.
    #[arg(long, env = "CORRAL_SCREEN_BYTES", default_value = "102400")]
    pub screen_max_bytes: usize,

    /// Fraction of the cap retained after an overflow trim.
    #[arg(long, env = "CORRAL_SCREEN_TRIM_RATIO", default_value = "0.75")]
    pub screen_trim_ratio: f64,

    /// Output silence required before a ready pattern counts, in ms.
    #[arg(long, env = "CORRAL_DEBOUNCE_MS", default_value = "2000")]
    pub debounce_ms: u64,

    /// Silence for the prompt-suffix readiness fallback, in ms.
    #[arg(long, env = "CORRAL_STABILIZATION_MS", default_value = "4000")]
    pub stabilization_ms: u64,

    /// Silence for the last-resort readiness fallback, in ms.
    #[arg(long, env = "CORRAL_LONG_STABILIZATION_MS", default_value = "8000")]
    pub long_stabilization_ms: u64,

    /// Screen analysis tick, in ms.
    #[arg(long, env = "CORRAL_DETECT_TICK_MS", default_value = "500")]
    pub detect_tick_ms: u64,

    /// Budget for initial readiness after spawn, in seconds.
    #[arg(long, env = "CORRAL_READY_TIMEOUT_SECS", default_value = "60")]
    pub ready_timeout_secs: u64,

    /// Budget for one message to complete, in seconds.
    #[arg(long, env = "CORRAL_COMPLETION_TIMEOUT_SECS", default_value = "300")]
    pub completion_timeout_secs: u64,

    /// Hard cap on any single readiness wait, in seconds.
    #[arg(long, env = "CORRAL_DETECTOR_CAP_SECS", default_value = "3600")]
    pub detector_cap_secs: u64,

    /// Pause between messages within a session, in ms.
    #[arg(long, env = "CORRAL_SPACING_MS", default_value = "1000")]
    pub spacing_ms: u64,

    /// Health check cadence, in seconds.
    #[arg(long, env = "CORRAL_HEALTH_SECS", default_value = "30")]
    pub health_secs: u64,

    /// A message processing longer than this marks the session unhealthy,
    /// in seconds.
    #[arg(long, env = "CORRAL_STUCK_SECS", default_value = "600")]
    pub stuck_secs: u64,

    /// Queue auto-save cadence, in seconds.
    #[arg(long, env = "CORRAL_AUTOSAVE_SECS", default_value = "30")]
    pub autosave_secs: u64,

    /// Maximum message payload, in bytes.
    #[arg(long, env = "CORRAL_MAX_MESSAGE_BYTES", default_value = "102400")]
    pub max_message_len: usize,

    /// Rotated queue backups kept per working directory.
    #[arg(long, env = "CORRAL_BACKUP_RETENTION", default_value = "5")]
    pub backup_retention: usize,

    /// Phase-1 graceful termination window, in ms.
    #[arg(long, env = "CORRAL_GRACEFUL_MS", default_value = "2000")]
    pub graceful_ms: u64,

    /// Phase-2 force-kill watchdog, in ms.
    #[arg(long, env = "CORRAL_FORCE_MS", default_value = "3000")]
    pub force_ms: u64,

    /// Child spawn attempts before giving up.
    #[arg(long, env = "CORRAL_SPAWN_ATTEMPTS", default_value = "3")]
    pub spawn_attempts: u32,

    /// Terminal columns for child PTYs.
    #[arg(long, env = "CORRAL_COLS", default_value = "200")]
    pub cols: u16,

    /// Terminal rows for child PTYs.
    #[arg(long, env = "CORRAL_ROWS", default_value = "50")]
    pub rows: u16,

    /// TERM value for child processes.
    #[arg(long, env = "TERM", default_value = "xterm-256color")]
    pub term: String,

    /// Flag appended to the child command when a session skips
    /// permission prompts.
    #[arg(long, env = "CORRAL_SKIP_PERMISSIONS_ARG", default_value = "--dangerously-skip-permissions")]
    pub skip_permissions_arg: String,

    /// Log format (json or text).
    #[arg(long, env = "CORRAL_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CORRAL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Assistant command to run per session (after --). Defaults to
    /// `claude`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.screen_trim_ratio) || self.screen_trim_ratio <= 0.0 {
            anyhow::bail!("--screen-trim-ratio must be within (0, 1]");
        }
        if self.max_sessions == 0 {
            anyhow::bail!("--max-sessions must be at least 1");
        }
        if self.log_format != "json" && self.log_format != "text" {
            anyhow::bail!("invalid log format: {}", self.log_format);
        }
        Ok(())
    }

    /// The child command, defaulting to the assistant binary.
    pub fn child_command(&self) -> Vec<String> {
        if self.command.is_empty() {
            vec!["claude".to_owned()]
        } else {
            self.command.clone()
        }
    }

    /// State directory, defaulting to `$XDG_STATE_HOME/corral`
    /// (`~/.local/state/corral` when unset).
    pub fn resolved_data_root(&self) -> PathBuf {
        if let Some(ref root) = self.data_root {
            return root.clone();
        }
        let state_home = std::env::var("XDG_STATE_HOME").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_default();
            format!("{home}/.local/state")
        });
        PathBuf::from(state_home).join("corral")
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            stabilization: Duration::from_millis(self.stabilization_ms),
            long_stabilization: Duration::from_millis(self.long_stabilization_ms),
            min_content_len: 10,
            overall_cap: Duration::from_secs(self.detector_cap_secs),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            throttle: Duration::from_millis(self.throttle_ms),
            auto_clear: Duration::from_millis(self.auto_clear_ms),
            screen_max_bytes: self.screen_max_bytes,
            screen_trim_ratio: self.screen_trim_ratio,
            detect_tick: Duration::from_millis(self.detect_tick_ms),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            completion_timeout: Duration::from_secs(self.completion_timeout_secs),
            spacing: Duration::from_millis(self.spacing_ms),
            health_interval: Duration::from_secs(self.health_secs),
            stuck_after: Duration::from_secs(self.stuck_secs),
            autosave_interval: Duration::from_secs(self.autosave_secs),
            max_message_len: self.max_message_len,
            detector: self.detector_config(),
            skip_permissions: false,
        }
    }

    pub fn spawn_options(&self) -> SpawnOptions {
        SpawnOptions {
            command: self.child_command(),
            cols: self.cols,
            rows: self.rows,
            term: self.term.clone(),
            attempts: self.spawn_attempts,
            backoff: Duration::from_secs(1),
            graceful_timeout: Duration::from_millis(self.graceful_ms),
            force_timeout: Duration::from_millis(self.force_ms),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_sessions: self.max_sessions,
            data_root: self.resolved_data_root(),
            defaults: self.session_settings(),
            spawn: self.spawn_options(),
            backup_retention: self.backup_retention,
            skip_permissions_arg: self.skip_permissions_arg.clone(),
            health_interval: Duration::from_secs(self.health_secs),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
