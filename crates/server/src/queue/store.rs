// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable queue persistence: per-working-directory layout, atomic
//! temp-file-plus-rename saves, backup rotation, and crash-recovery
//! normalization.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{normalize, MessageItem};

/// Live queue file name inside the per-directory subfolder.
const QUEUE_FILE: &str = "queue.json";
/// Transient sidecar used to roll back a failed save.
const BACKUP_SIDECAR: &str = "queue.json.backup";
/// Prefix of rotated, timestamped backups.
const BACKUP_PREFIX: &str = "queue.json.backup-";

/// Durable store for one session's queue.
///
/// The on-disk location is derived from the canonicalized working
/// directory, so independent projects never share a queue file. Saves are
/// coalesced: while one is in flight, later callers queue on the lock and
/// only the newest snapshot is actually written.
pub struct QueueStore {
    dir: PathBuf,
    legacy_file: PathBuf,
    retention: usize,
    save_lock: tokio::sync::Mutex<()>,
    requested: AtomicU64,
}

impl QueueStore {
    /// `data_root` is the orchestrator-wide state directory;
    /// `canonical_dir` must already be canonicalized.
    pub fn new(data_root: &Path, canonical_dir: &Path, retention: usize) -> Self {
        let dir = data_root.join("queues").join(queue_dir_name(canonical_dir));
        Self {
            dir,
            legacy_file: data_root.join(QUEUE_FILE),
            retention,
            save_lock: tokio::sync::Mutex::new(()),
            requested: AtomicU64::new(0),
        }
    }

    pub fn queue_path(&self) -> PathBuf {
        self.dir.join(QUEUE_FILE)
    }

    /// Load the persisted queue, migrating the legacy single-file layout
    /// on first use and applying the normalization pass.
    pub async fn load(&self) -> anyhow::Result<Vec<MessageItem>> {
        let path = self.queue_path();

        if !path.exists() && self.legacy_file.exists() {
            self.migrate_legacy().await?;
        }

        if !path.exists() {
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        Ok(parse_items(&raw))
    }

    /// Atomically persist a snapshot.
    ///
    /// Steps: back up the live file, normalize the snapshot, write a temp
    /// file in the same directory, rename it over the live file, then drop
    /// the sidecar and prune old backups. Any failure after the backup
    /// restores the sidecar and surfaces the error.
    pub async fn save(&self, snapshot: Vec<MessageItem>, suppress_backup: bool) -> anyhow::Result<()> {
        let my_gen = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = self.save_lock.lock().await;
        // A newer snapshot is queued behind us, so ours is stale. Skip it.
        if self.requested.load(Ordering::SeqCst) > my_gen {
            debug!("queue save coalesced away");
            return Ok(());
        }
        self.write_atomic(snapshot, suppress_backup)
    }

    fn write_atomic(&self, mut items: Vec<MessageItem>, suppress_backup: bool) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create {}", self.dir.display()))?;

        let live = self.queue_path();
        let sidecar = self.dir.join(BACKUP_SIDECAR);
        let mut backed_up = false;

        if live.exists() && !suppress_backup {
            std::fs::copy(&live, &sidecar).context("write backup sidecar")?;
            let stamped = self.dir.join(format!("{BACKUP_PREFIX}{}", backup_stamp()));
            std::fs::copy(&live, stamped).context("write rotated backup")?;
            backed_up = true;
        }

        normalize(&mut items);

        let result = (|| -> anyhow::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
                .context("create temp queue file")?;
            serde_json::to_writer_pretty(&mut tmp, &items).context("serialize queue")?;
            tmp.write_all(b"\n")?;
            tmp.flush()?;
            // Rename within the same directory, atomic on POSIX
            // filesystems. Non-POSIX network mounts may not guarantee this;
            // the sidecar covers that case.
            tmp.persist(&live).context("rename temp over live queue file")?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                if backed_up {
                    let _ = std::fs::remove_file(&sidecar);
                }
                self.prune_backups();
                Ok(())
            }
            Err(e) => {
                if backed_up {
                    if let Err(restore) = std::fs::copy(&sidecar, &live) {
                        warn!("backup restore failed: {restore}");
                    }
                }
                Err(e)
            }
        }
    }

    /// Move the legacy root-level queue file into the per-directory layout.
    async fn migrate_legacy(&self) -> anyhow::Result<()> {
        let raw = std::fs::read_to_string(&self.legacy_file).context("read legacy queue")?;
        let items = parse_items(&raw);
        debug!(count = items.len(), "migrating legacy queue file");
        self.save(items, true).await?;
        std::fs::remove_file(&self.legacy_file).context("remove legacy queue")?;
        Ok(())
    }

    /// Delete timestamped backups beyond the retention count, oldest first.
    fn prune_backups(&self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let mut backups: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(BACKUP_PREFIX))
            })
            .collect();
        if backups.len() <= self.retention {
            return;
        }
        backups.sort();
        let excess = backups.len() - self.retention;
        for stale in backups.into_iter().take(excess) {
            let _ = std::fs::remove_file(stale);
        }
    }
}

/// Stable per-working-directory folder name: a 16-hex-char prefix of
/// SHA-256 over the canonical path.
pub fn queue_dir_name(canonical_dir: &Path) -> String {
    let digest = Sha256::digest(canonical_dir.display().to_string().as_bytes());
    hex::encode(&digest[..8])
}

/// Filesystem-safe ISO-8601 timestamp for rotated backups.
fn backup_stamp() -> String {
    Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ").to_string()
}

/// Decode a queue file, dropping malformed entries.
///
/// An entry is malformed when it is not an object or lacks `id`,
/// `payload`, or `status`; everything else defaults. The normalization
/// pass (processing→pending, dedup) runs on the survivors.
fn parse_items(raw: &str) -> Vec<MessageItem> {
    let values: Vec<serde_json::Value> = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!("queue file unparseable, starting empty: {e}");
            return Vec::new();
        }
    };

    let mut items: Vec<MessageItem> = values
        .into_iter()
        .filter_map(|v| match serde_json::from_value::<MessageItem>(v) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("dropping malformed queue item: {e}");
                None
            }
        })
        .collect();
    normalize(&mut items);
    items
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
