// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn row(id: Uuid, dir: &str, status: &str) -> SessionRow {
    let now = Utc::now();
    SessionRow {
        id,
        working_directory: dir.to_owned(),
        status: status.to_owned(),
        created_at: now,
        started_at: Some(now),
        terminated_at: None,
        last_activity: now,
        message_count: 0,
        total_processing_ms: 0,
        error_count: 0,
        metadata: serde_json::Value::Null,
    }
}

#[test]
fn create_and_reload_roundtrips() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let id = Uuid::new_v4();
    {
        let reg = FileRegistry::open(root.path())?;
        reg.create(row(id, "/tmp/a", "idle"))?;
    }

    let reg = FileRegistry::open(root.path())?;
    let active = reg.active_sessions()?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, id);
    assert_eq!(active[0].status, "idle");
    Ok(())
}

#[test]
fn update_patches_only_given_fields() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let reg = FileRegistry::open(root.path())?;
    let id = Uuid::new_v4();
    reg.create(row(id, "/tmp/a", "idle"))?;

    reg.update(
        id,
        RowPatch { status: Some("busy".to_owned()), message_count: Some(4), ..RowPatch::default() },
    )?;

    let active = reg.active_sessions()?;
    assert_eq!(active[0].status, "busy");
    assert_eq!(active[0].message_count, 4);
    assert_eq!(active[0].working_directory, "/tmp/a");
    Ok(())
}

#[test]
fn terminated_rows_leave_the_active_view() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let reg = FileRegistry::open(root.path())?;
    let keep = Uuid::new_v4();
    let done = Uuid::new_v4();
    reg.create(row(keep, "/tmp/a", "idle"))?;
    reg.create(row(done, "/tmp/b", "idle"))?;

    reg.update(
        done,
        RowPatch {
            status: Some("terminated".to_owned()),
            terminated_at: Some(Utc::now()),
            ..RowPatch::default()
        },
    )?;

    let active = reg.active_sessions()?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, keep);

    let stats = reg.stats()?;
    assert_eq!(stats.total_sessions, 2);
    assert_eq!(stats.active_sessions, 1);
    Ok(())
}

#[test]
fn update_of_unknown_row_is_a_no_op() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let reg = FileRegistry::open(root.path())?;
    reg.update(Uuid::new_v4(), RowPatch::default())?;
    assert!(reg.active_sessions()?.is_empty());
    Ok(())
}

#[test]
fn corrupt_file_starts_empty() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    std::fs::write(root.path().join("sessions.json"), "{ not json")?;
    let reg = FileRegistry::open(root.path())?;
    assert!(reg.active_sessions()?.is_empty());
    Ok(())
}
