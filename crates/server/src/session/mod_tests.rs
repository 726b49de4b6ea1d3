// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn metrics_average_tracks_successes() {
    let mut m = SessionMetrics::default();
    m.record_success(100);
    m.record_success(300);
    assert_eq!(m.messages_processed, 2);
    assert_eq!(m.total_processing_ms, 400);
    assert_eq!(m.average_processing_ms, 200);
}

#[test]
fn error_rate_counts_errors_against_all_attempts() {
    let mut m = SessionMetrics::default();
    assert_eq!(m.error_rate_percent(), 0.0);
    m.record_success(50);
    m.record_error();
    assert!((m.error_rate_percent() - 50.0).abs() < f64::EPSILON);
}

#[test]
fn terminated_is_the_only_inactive_status() {
    for status in [
        SessionStatus::Initializing,
        SessionStatus::Idle,
        SessionStatus::Busy,
        SessionStatus::Unhealthy,
        SessionStatus::Terminating,
        SessionStatus::Restored,
        SessionStatus::Error,
    ] {
        assert!(status.is_active(), "{status} should count as active");
    }
    assert!(!SessionStatus::Terminated.is_active());
}

#[test]
fn status_serializes_lowercase() -> anyhow::Result<()> {
    let json = serde_json::to_value(SessionStatus::Initializing)?;
    assert_eq!(json, "initializing");
    Ok(())
}

#[test]
fn summary_reflects_shared_state() {
    let shared = SessionShared::new(
        uuid::Uuid::new_v4(),
        std::path::PathBuf::from("/tmp/proj"),
        SessionStatus::Idle,
    );
    shared.set_current_task(Some("fix the tests".to_owned()));
    shared.queue_len.store(3, std::sync::atomic::Ordering::Relaxed);
    shared.update_metrics(|m| m.record_success(120));

    let summary = shared.summary();
    assert_eq!(summary.status, SessionStatus::Idle);
    assert_eq!(summary.working_directory, "/tmp/proj");
    assert_eq!(summary.current_task.as_deref(), Some("fix the tests"));
    assert_eq!(summary.queue_length, 3);
    assert_eq!(summary.metrics.messages_processed, 1);
}
