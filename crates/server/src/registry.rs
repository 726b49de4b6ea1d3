// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persisted session registry, consumed as a key-value store by contract.
//!
//! The orchestrator restores placeholder sessions from here at boot and
//! mirrors lifecycle changes into it. Any equivalent key-value persistence
//! satisfies the trait; the default implementation is a JSON file written
//! with the same temp-file-plus-rename idiom as the queue store.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One persisted session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SessionRow {
    pub id: Uuid,
    pub working_directory: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub total_processing_ms: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Partial update applied to a row. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct RowPatch {
    pub status: Option<String>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub message_count: Option<u64>,
    pub total_processing_ms: Option<u64>,
    pub error_count: Option<u64>,
}

/// Aggregates over all rows ever recorded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub total_messages: u64,
    pub total_processing_ms: u64,
}

/// The registry contract.
pub trait SessionRegistry: Send + Sync {
    fn create(&self, row: SessionRow) -> anyhow::Result<()>;
    fn update(&self, id: Uuid, patch: RowPatch) -> anyhow::Result<()>;
    /// Rows whose status is not `terminated`.
    fn active_sessions(&self) -> anyhow::Result<Vec<SessionRow>>;
    fn stats(&self) -> anyhow::Result<RegistryStats>;
}

/// JSON-file registry: a map of id to row, rewritten atomically on every
/// mutation.
pub struct FileRegistry {
    path: PathBuf,
    state: Mutex<HashMap<Uuid, SessionRow>>,
}

impl FileRegistry {
    /// Open (or start empty) at `<data_root>/sessions.json`.
    pub fn open(data_root: &std::path::Path) -> anyhow::Result<Self> {
        let path = data_root.join("sessions.json");
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self { path, state: Mutex::new(state) })
    }

    fn flush(&self, state: &HashMap<Uuid, SessionRow>) -> anyhow::Result<()> {
        let Some(dir) = self.path.parent() else {
            anyhow::bail!("registry path has no parent directory");
        };
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).context("create temp registry")?;
        serde_json::to_writer_pretty(&mut tmp, state).context("serialize registry")?;
        tmp.write_all(b"\n")?;
        tmp.persist(&self.path).context("rename registry")?;
        Ok(())
    }
}

impl SessionRegistry for FileRegistry {
    fn create(&self, row: SessionRow) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.insert(row.id, row);
        self.flush(&state)
    }

    fn update(&self, id: Uuid, patch: RowPatch) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let Some(row) = state.get_mut(&id) else {
            // Row may predate the registry file (e.g. wiped data root);
            // updates on unknown ids are not an error.
            return Ok(());
        };
        if let Some(status) = patch.status {
            row.status = status;
        }
        if let Some(at) = patch.terminated_at {
            row.terminated_at = Some(at);
        }
        if let Some(at) = patch.last_activity {
            row.last_activity = at;
        }
        if let Some(n) = patch.message_count {
            row.message_count = n;
        }
        if let Some(n) = patch.total_processing_ms {
            row.total_processing_ms = n;
        }
        if let Some(n) = patch.error_count {
            row.error_count = n;
        }
        self.flush(&state)
    }

    fn active_sessions(&self) -> anyhow::Result<Vec<SessionRow>> {
        let state = self.state.lock();
        Ok(state.values().filter(|r| r.status != "terminated").cloned().collect())
    }

    fn stats(&self) -> anyhow::Result<RegistryStats> {
        let state = self.state.lock();
        Ok(RegistryStats {
            total_sessions: state.len(),
            active_sessions: state.values().filter(|r| r.status != "terminated").count(),
            total_messages: state.values().map(|r| r.message_count).sum(),
            total_processing_ms: state.values().map(|r| r.total_processing_ms).sum(),
        })
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
