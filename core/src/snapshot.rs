//! Durable configuration snapshot and the policy-change audit log.
//!
//! The snapshot is a single JSON document rewritten atomically (tmp
//! sibling + rename) on every committed change, so a crash mid-write
//! never leaves a torn file. The audit log is append-only JSON lines.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use monitord_protocol::ConfigSnapshot;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot, if one has ever been written.
    pub async fn load(&self) -> Result<Option<ConfigSnapshot>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically replace the snapshot.
    pub async fn save(&self, snapshot: &ConfigSnapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "snapshot written");
        Ok(())
    }

    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// One committed (or abandoned) policy change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    pub formula: String,
    pub negate: bool,
    /// Which replay plan ran, `"minimal"` or `"naive"`.
    pub plan: String,
    /// Timepoints replayed into the new engine.
    pub replayed_timepoints: usize,
    pub committed: bool,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn append(&self, record: &AuditRecord) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn read_all(&self) -> Result<Vec<AuditRecord>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Ok(serde_json::from_str(l)?))
            .collect()
    }
}
