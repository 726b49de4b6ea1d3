// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::queue::{MessageStatus, Queue};
use uuid::Uuid;

fn store_in(root: &Path) -> QueueStore {
    QueueStore::new(root, Path::new("/home/u/projA"), 5)
}

fn seeded_items(count: usize) -> Vec<MessageItem> {
    let sid = Uuid::new_v4();
    let mut q = Queue::default();
    for i in 0..count {
        q.push(sid, format!("message {i}"));
    }
    q.snapshot()
}

#[tokio::test]
async fn save_then_load_roundtrips() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let store = store_in(root.path());
    let items = seeded_items(3);

    store.save(items.clone(), false).await?;
    let loaded = store.load().await?;
    assert_eq!(loaded, items);
    Ok(())
}

#[tokio::test]
async fn load_of_missing_file_is_empty() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let store = store_in(root.path());
    assert!(store.load().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn processing_items_load_as_pending() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let store = store_in(root.path());

    let mut items = seeded_items(3);
    items[1].status = MessageStatus::Processing;
    // Write the raw file directly; save() would already coerce.
    let dir = store.queue_path();
    std::fs::create_dir_all(dir.parent().map(Path::to_path_buf).unwrap_or_default())?;
    std::fs::write(&dir, serde_json::to_string_pretty(&items)?)?;

    let loaded = store.load().await?;
    assert!(loaded.iter().all(|m| m.status != MessageStatus::Processing));
    assert_eq!(loaded.len(), 3);
    Ok(())
}

#[tokio::test]
async fn load_then_save_is_idempotent_after_normalization() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let store = store_in(root.path());

    let mut items = seeded_items(4);
    items[2].status = MessageStatus::Processing;
    store.save(items, false).await?;

    let first = store.load().await?;
    store.save(first.clone(), false).await?;
    let second = store.load().await?;
    assert_eq!(first, second);
    Ok(())
}

#[tokio::test]
async fn malformed_entries_are_dropped() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let store = store_in(root.path());

    let good = seeded_items(1).remove(0);
    let raw = serde_json::json!([
        good,
        { "payload": "no id or status" },
        { "id": Uuid::new_v4(), "status": "pending" },
        "not even an object",
    ]);
    let path = store.queue_path();
    std::fs::create_dir_all(path.parent().map(Path::to_path_buf).unwrap_or_default())?;
    std::fs::write(&path, serde_json::to_string(&raw)?)?;

    let loaded = store.load().await?;
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, good.id);
    Ok(())
}

#[tokio::test]
async fn backups_rotate_down_to_retention() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let store = QueueStore::new(root.path(), Path::new("/home/u/projA"), 2);

    for round in 0..6 {
        store.save(seeded_items(round + 1), false).await?;
        // Distinct timestamps for distinct backup names.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let dir = store.queue_path().parent().map(Path::to_path_buf).unwrap_or_default();
    let backups: Vec<_> = std::fs::read_dir(&dir)?
        .flatten()
        .filter(|e| {
            e.file_name().to_string_lossy().starts_with("queue.json.backup-")
        })
        .collect();
    assert!(backups.len() <= 2, "expected at most 2 backups, found {}", backups.len());
    Ok(())
}

#[tokio::test]
async fn suppressed_backup_leaves_no_sidecar() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let store = store_in(root.path());

    store.save(seeded_items(1), true).await?;
    store.save(seeded_items(2), true).await?;

    let dir = store.queue_path().parent().map(Path::to_path_buf).unwrap_or_default();
    let extra: Vec<_> = std::fs::read_dir(&dir)?
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().contains("backup"))
        .collect();
    assert!(extra.is_empty());
    Ok(())
}

#[tokio::test]
async fn legacy_file_migrates_on_first_load() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let items = seeded_items(2);
    std::fs::write(root.path().join("queue.json"), serde_json::to_string(&items)?)?;

    let store = store_in(root.path());
    let loaded = store.load().await?;
    assert_eq!(loaded.len(), 2);
    assert!(!root.path().join("queue.json").exists(), "legacy file should be consumed");
    assert!(store.queue_path().exists());
    Ok(())
}

#[tokio::test]
async fn distinct_directories_use_distinct_folders() {
    let a = queue_dir_name(Path::new("/home/u/projA"));
    let b = queue_dir_name(Path::new("/home/u/projB"));
    assert_ne!(a, b);
    assert_eq!(a.len(), 16);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn concurrent_saves_settle_on_a_consistent_file() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let store = std::sync::Arc::new(store_in(root.path()));

    let mut handles = Vec::new();
    for round in 1..=8usize {
        let store = std::sync::Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.save(seeded_items(round), true).await
        }));
    }
    for h in handles {
        h.await??;
    }

    // Whatever interleaving happened, the live file must parse cleanly.
    let loaded = store.load().await?;
    assert!(!loaded.is_empty());
    Ok(())
}
