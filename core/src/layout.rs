//! Directory layout as a pure data value.
//!
//! ```text
//! <root>/
//!   signatures/sig          canonical signature text
//!   signatures/sig.json     engine-derived JSON form
//!   policies/policy         active policy formula
//!   policies/candidate      staged formula during a policy change
//!   sql/create.sql          engine-derived schema
//!   sql/drop.sql            exact inverse; its existence marks "tables exist"
//!   events/                 uploaded event files
//!   events/replay.scratch   scratch replay log for cutover
//!   engine-logs/            engine stdout tee + stderr
//!   engine.state            saved engine state blob (opaque)
//!   snapshot.json           durable config snapshot
//!   policy_changes.jsonl    append-only policy-change audit log
//! ```

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn signatures_dir(&self) -> PathBuf {
        self.root.join("signatures")
    }

    pub fn policies_dir(&self) -> PathBuf {
        self.root.join("policies")
    }

    pub fn sql_dir(&self) -> PathBuf {
        self.root.join("sql")
    }

    pub fn events_dir(&self) -> PathBuf {
        self.root.join("events")
    }

    pub fn engine_logs_dir(&self) -> PathBuf {
        self.root.join("engine-logs")
    }

    pub fn signature_path(&self) -> PathBuf {
        self.signatures_dir().join("sig")
    }

    pub fn signature_json_path(&self) -> PathBuf {
        self.signatures_dir().join("sig.json")
    }

    pub fn policy_path(&self) -> PathBuf {
        self.policies_dir().join("policy")
    }

    pub fn candidate_policy_path(&self) -> PathBuf {
        self.policies_dir().join("candidate")
    }

    pub fn create_sql_path(&self) -> PathBuf {
        self.sql_dir().join("create.sql")
    }

    pub fn drop_sql_path(&self) -> PathBuf {
        self.sql_dir().join("drop.sql")
    }

    pub fn replay_log_path(&self) -> PathBuf {
        self.events_dir().join("replay.scratch")
    }

    pub fn engine_state_path(&self) -> PathBuf {
        self.root.join("engine.state")
    }

    pub fn engine_stdout_log_path(&self) -> PathBuf {
        self.engine_logs_dir().join("engine_stdout.log")
    }

    pub fn engine_stderr_log_path(&self) -> PathBuf {
        self.engine_logs_dir().join("engine_stderr.log")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join("snapshot.json")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join("policy_changes.jsonl")
    }

    /// Create every directory the layout names.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.signatures_dir(),
            self.policies_dir(),
            self.sql_dir(),
            self.events_dir(),
            self.engine_logs_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Remove the contents of the mutable directories, keeping the layout
    /// itself. Used by reset.
    pub fn clear(&self) -> std::io::Result<()> {
        for dir in [
            self.signatures_dir(),
            self.policies_dir(),
            self.sql_dir(),
            self.events_dir(),
            self.engine_logs_dir(),
        ] {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
        }
        for file in [
            self.engine_state_path(),
            self.snapshot_path(),
            self.audit_log_path(),
        ] {
            if file.exists() {
                std::fs::remove_file(&file)?;
            }
        }
        self.ensure()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn ensure_creates_all_directories() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = DataLayout::new(tmp.path().join("data"));
        layout.ensure().unwrap();
        assert!(layout.signatures_dir().is_dir());
        assert!(layout.policies_dir().is_dir());
        assert!(layout.sql_dir().is_dir());
        assert!(layout.events_dir().is_dir());
        assert!(layout.engine_logs_dir().is_dir());
    }

    #[test]
    fn clear_removes_state_but_keeps_layout() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = DataLayout::new(tmp.path().join("data"));
        layout.ensure().unwrap();
        std::fs::write(layout.signature_path(), "P(int)").unwrap();
        std::fs::write(layout.snapshot_path(), "{}").unwrap();

        layout.clear().unwrap();
        assert!(!layout.signature_path().exists());
        assert!(!layout.snapshot_path().exists());
        assert!(layout.signatures_dir().is_dir());
    }
}
