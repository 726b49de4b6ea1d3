// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use clap::Parser;
use serial_test::serial;

// Parsing honors env fallbacks, and one test clears PORT, so everything
// here runs serialized against the shared process environment.

fn parse(args: &[&str]) -> Config {
    let mut argv = vec!["corral"];
    argv.extend_from_slice(args);
    match Config::try_parse_from(argv) {
        Ok(c) => c,
        Err(e) => {
            // Surface parse failures as assertions rather than panics.
            assert!(false, "parse failed: {e}");
            unreachable!()
        }
    }
}

#[test]
#[serial(config_env)]
fn defaults_match_the_contract() -> anyhow::Result<()> {
    // The listener port honors the PORT env var; clear it so the default
    // is what gets asserted.
    std::env::remove_var("PORT");
    let config = parse(&[]);
    assert_eq!(config.port, 5001);
    assert_eq!(config.max_sessions, 10);
    assert_eq!(config.throttle_ms, 1000);
    assert_eq!(config.screen_max_bytes, 100 * 1024);
    assert_eq!(config.ready_timeout_secs, 60);
    assert_eq!(config.completion_timeout_secs, 300);
    assert_eq!(config.detector_cap_secs, 3600);
    assert_eq!(config.backup_retention, 5);
    config.validate()?;
    Ok(())
}

#[test]
#[serial(config_env)]
fn port_env_var_overrides_the_default() -> anyhow::Result<()> {
    std::env::set_var("PORT", "7170");
    let config = parse(&[]);
    std::env::remove_var("PORT");
    assert_eq!(config.port, 7170);
    config.validate()?;
    Ok(())
}

#[test]
#[serial(config_env)]
fn child_command_defaults_to_assistant() {
    let config = parse(&[]);
    assert_eq!(config.child_command(), vec!["claude".to_owned()]);

    let config = parse(&["--", "my-agent", "--flag"]);
    assert_eq!(config.child_command(), vec!["my-agent".to_owned(), "--flag".to_owned()]);
}

#[test]
#[serial(config_env)]
fn trim_ratio_bounds_are_validated() {
    let config = parse(&["--screen-trim-ratio", "1.5"]);
    assert!(config.validate().is_err());

    let config = parse(&["--screen-trim-ratio", "0"]);
    assert!(config.validate().is_err());
}

#[test]
#[serial(config_env)]
fn zero_sessions_is_rejected() {
    let config = parse(&["--max-sessions", "0"]);
    assert!(config.validate().is_err());
}

#[test]
#[serial(config_env)]
fn bad_log_format_is_rejected() {
    let config = parse(&["--log-format", "yaml"]);
    assert!(config.validate().is_err());
}

#[test]
#[serial(config_env)]
fn settings_carry_contract_timeouts() {
    let config = parse(&[]);
    let settings = config.session_settings();
    assert_eq!(settings.ready_timeout, Duration::from_secs(60));
    assert_eq!(settings.completion_timeout, Duration::from_secs(300));
    assert_eq!(settings.detector.debounce, Duration::from_secs(2));
    assert_eq!(settings.detector.stabilization, Duration::from_secs(4));
    assert_eq!(settings.detector.long_stabilization, Duration::from_secs(8));

    let spawn = config.spawn_options();
    assert_eq!(spawn.graceful_timeout, Duration::from_millis(2000));
    assert_eq!(spawn.force_timeout, Duration::from_millis(3000));
    assert_eq!(spawn.attempts, 3);
}
