//! One-shot engine invocations.
//!
//! Besides its streaming mode, the engine doubles as a set of pure
//! command-line tools: formula checking (`-check`), signature-to-SQL
//! compilation (`-sql` / `-sql_drop`), signature-to-JSON (`-sig_to_json`)
//! and the relative-interval query used by the policy-change planner.
//! This control plane never reimplements any of them; it shells out and
//! interprets the output.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use monitord_protocol::{Monitorability, RelativeInterval};
use tokio::process::Command;
use tracing::debug;

use crate::error::{MonitorError, Result};

/// Sentence the check mode prints when it accepts a formula.
pub const MONITORABLE_SENTENCE: &str = "The analyzed formula is monitorable.";

/// Engine tool surface, mockable for planner and monitor tests.
#[async_trait]
pub trait EngineTool: Send + Sync {
    /// Run the check mode. `Ok` carries the verdict either way; `Err` is
    /// reserved for failures to run the engine at all.
    async fn check(&self, sig: &Path, policy: &Path, negate: bool) -> Result<Monitorability>;

    /// Compile the signature into schema-definition statements.
    async fn create_sql(&self, sig: &Path) -> Result<String>;

    /// Exact inverse of [`EngineTool::create_sql`].
    async fn drop_sql(&self, sig: &Path) -> Result<String>;

    /// Derived JSON form of the signature.
    async fn sig_to_json(&self, sig: &Path) -> Result<String>;

    /// Per-predicate relative replay intervals for a candidate policy.
    async fn relative_intervals(&self, sig: &Path, policy: &Path)
    -> Result<Vec<RelativeInterval>>;
}

/// Subprocess-backed implementation.
#[derive(Debug, Clone)]
pub struct EngineCli {
    binary: PathBuf,
}

impl EngineCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn run(&self, args: &[&str]) -> Result<(String, String)> {
        debug!(binary = %self.binary.display(), ?args, "running engine tool");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Ok((stdout, stderr))
    }
}

#[async_trait]
impl EngineTool for EngineCli {
    async fn check(&self, sig: &Path, policy: &Path, negate: bool) -> Result<Monitorability> {
        let sig = sig.to_string_lossy();
        let policy = policy.to_string_lossy();
        let mut args = vec!["-check", "-sig", sig.as_ref(), "-formula", policy.as_ref()];
        if negate {
            args.push("-negate");
        }
        let (stdout, stderr) = self.run(&args).await?;
        // Both streams carry diagnostics; keep them in the caller-visible text.
        let diagnostic = format!("{stderr} \n {stdout}");
        Ok(Monitorability {
            monitorable: diagnostic.contains(MONITORABLE_SENTENCE),
            diagnostic,
        })
    }

    async fn create_sql(&self, sig: &Path) -> Result<String> {
        let sig = sig.to_string_lossy();
        let (stdout, _) = self.run(&["-sql", sig.as_ref()]).await?;
        Ok(stdout.trim().to_string())
    }

    async fn drop_sql(&self, sig: &Path) -> Result<String> {
        let sig = sig.to_string_lossy();
        let (stdout, _) = self.run(&["-sql_drop", sig.as_ref()]).await?;
        Ok(stdout.trim().to_string())
    }

    async fn sig_to_json(&self, sig: &Path) -> Result<String> {
        let sig = sig.to_string_lossy();
        let (stdout, _) = self.run(&["-sig_to_json", sig.as_ref()]).await?;
        Ok(stdout.trim().to_string())
    }

    async fn relative_intervals(
        &self,
        sig: &Path,
        policy: &Path,
    ) -> Result<Vec<RelativeInterval>> {
        let sig = sig.to_string_lossy();
        let policy = policy.to_string_lossy();
        let (stdout, _) = self
            .run(&[
                "-get_relative_intervals",
                "-sig",
                sig.as_ref(),
                "-formula",
                policy.as_ref(),
            ])
            .await?;
        stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| {
                l.parse::<RelativeInterval>()
                    .map_err(|e| MonitorError::EngineOutput(e.to_string()))
            })
            .collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Install a shell script standing in for the engine binary.
    fn fake_engine(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("engine");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn check_accepts_on_sentence() {
        let tmp = tempfile::TempDir::new().unwrap();
        let bin = fake_engine(
            tmp.path(),
            r#"echo "The analyzed formula is monitorable.""#,
        );
        let tool = EngineCli::new(bin);
        let verdict = tool
            .check(Path::new("sig"), Path::new("pol"), false)
            .await
            .unwrap();
        assert!(verdict.monitorable);
        assert!(verdict.diagnostic.contains("monitorable"));
    }

    #[tokio::test]
    async fn check_reports_diagnostic_from_both_streams() {
        let tmp = tempfile::TempDir::new().unwrap();
        let bin = fake_engine(
            tmp.path(),
            r#"echo "the formula cannot be monitored" >&2; echo "details""#,
        );
        let tool = EngineCli::new(bin);
        let verdict = tool
            .check(Path::new("sig"), Path::new("pol"), false)
            .await
            .unwrap();
        assert!(!verdict.monitorable);
        assert!(verdict.diagnostic.contains("cannot be monitored"));
        assert!(verdict.diagnostic.contains("details"));
    }

    #[tokio::test]
    async fn relative_intervals_parse_line_per_predicate() {
        let tmp = tempfile::TempDir::new().unwrap();
        let bin = fake_engine(tmp.path(), "echo 'P: [0,30)'; echo 'Q{1=5}: (0,*)'");
        let tool = EngineCli::new(bin);
        let intervals = tool
            .relative_intervals(Path::new("sig"), Path::new("pol"))
            .await
            .unwrap();
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].predicate, "P");
        assert_eq!(intervals[1].constraints.len(), 1);
    }

    #[tokio::test]
    async fn garbage_interval_output_is_surfaced() {
        let tmp = tempfile::TempDir::new().unwrap();
        let bin = fake_engine(tmp.path(), "echo 'not an interval'");
        let tool = EngineCli::new(bin);
        let err = tool
            .relative_intervals(Path::new("sig"), Path::new("pol"))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::EngineOutput(_)));
    }

    #[tokio::test]
    async fn missing_binary_is_io_error() {
        let tool = EngineCli::new("/nonexistent/engine-binary");
        let err = tool.create_sql(Path::new("sig")).await.unwrap_err();
        assert!(matches!(err, MonitorError::Io(_)));
    }
}
