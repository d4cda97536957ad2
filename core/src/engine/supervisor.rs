//! Lifecycle of the long-lived engine process.
//!
//! At most one engine child exists at a time. The supervisor owns the
//! spawned process and the sentinel-framed pipes to it, tracks the
//! lifecycle state machine, and tees everything the engine prints to an
//! on-disk log so operators can inspect verdicts after the fact.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{info, warn};

use crate::error::{MonitorError, Result};
use crate::engine::pipe::{
    EngineResponse, REPLAY_DONE_MARKER, SentinelFramed, save_and_exit_directive,
};

/// How long a save-and-exit gets before the child is killed anyway.
const SAVE_EXIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Supervisor-visible lifecycle state.
///
/// There is no separate terminating state: `stop` holds `&mut self` and
/// completes the teardown (save directive, wait, kill) before returning,
/// so the engine is never observable mid-shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No child process. `resumable` means a saved state blob exists and
    /// the next launch may load it.
    Stopped { resumable: bool },
    /// Child alive and accepting live input.
    Running,
    /// Child alive but still consuming a replay file; live input must
    /// wait for the replay-done marker.
    Draining,
}

/// Everything needed to spawn one engine child.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub signature: PathBuf,
    pub policy: PathBuf,
    pub negate: bool,
    /// Saved state blob to resume from.
    pub load_state: Option<PathBuf>,
    /// Log file the engine consumes before switching to stdin.
    pub replay: Option<PathBuf>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
}

/// What `launch` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Fresh start, ready for live input.
    Started,
    /// Started against a replay file; call `drain_replay` before
    /// submitting live input.
    Replaying,
    /// A child was already up; nothing happened.
    AlreadyRunning,
}

/// What `stop` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Engine persisted its state and exited on its own.
    Saved,
    /// Engine was killed without saving.
    Killed,
    /// There was nothing to stop.
    NotRunning,
}

struct EngineHandle {
    child: Child,
    framed: SentinelFramed<ChildStdin, ChildStdout>,
    stdout_log: tokio::fs::File,
}

/// Owns at most one engine child at a time.
pub struct EngineSupervisor {
    handle: Option<EngineHandle>,
    draining: bool,
    resumable: bool,
}

impl Default for EngineSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineSupervisor {
    pub fn new() -> Self {
        Self {
            handle: None,
            draining: false,
            resumable: false,
        }
    }

    pub fn state(&self) -> EngineState {
        match (&self.handle, self.draining) {
            (Some(_), true) => EngineState::Draining,
            (Some(_), false) => EngineState::Running,
            (None, _) => EngineState::Stopped {
                resumable: self.resumable,
            },
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawn the engine child. A second launch while one is up is a
    /// no-op.
    pub async fn launch(&mut self, spec: &LaunchSpec) -> Result<LaunchOutcome> {
        if self.handle.is_some() {
            return Ok(LaunchOutcome::AlreadyRunning);
        }

        let mut cmd = Command::new(&spec.binary);
        cmd.arg("-sig")
            .arg(&spec.signature)
            .arg("-formula")
            .arg(&spec.policy);
        if spec.negate {
            cmd.arg("-negate");
        }
        if let Some(state) = &spec.load_state {
            cmd.arg("-load").arg(state);
        }
        if let Some(replay) = &spec.replay {
            cmd.arg("-replay").arg(replay);
        }

        let stderr_log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.stderr_log)?;
        let stdout_log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.stdout_log)
            .await?;

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr_log))
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MonitorError::BrokenPipe("engine stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MonitorError::BrokenPipe("engine stdout unavailable".to_string()))?;

        info!(
            binary = %spec.binary.display(),
            negate = spec.negate,
            resume = spec.load_state.is_some(),
            replay = spec.replay.is_some(),
            "engine launched"
        );

        self.handle = Some(EngineHandle {
            child,
            framed: SentinelFramed::new(stdin, stdout),
            stdout_log,
        });
        self.draining = spec.replay.is_some();
        Ok(if self.draining {
            LaunchOutcome::Replaying
        } else {
            LaunchOutcome::Started
        })
    }

    /// Block until the engine reports the replay file fully consumed.
    pub async fn drain_replay(&mut self) -> Result<EngineResponse> {
        if !self.draining {
            return Err(MonitorError::EngineNotRunning);
        }
        let handle = self.handle.as_mut().ok_or(MonitorError::EngineNotRunning)?;
        let response = match handle.framed.read_until_marker(REPLAY_DONE_MARKER).await {
            Ok(response) => response,
            Err(err) => return Err(self.on_pipe_error(err).await),
        };
        Self::tee(handle, &response).await;
        self.draining = false;
        Ok(response)
    }

    /// Send one log line and collect the engine's verdict for it.
    pub async fn submit(&mut self, line: &str) -> Result<EngineResponse> {
        if self.draining {
            return Err(MonitorError::BrokenPipe(
                "engine still draining replay input".to_string(),
            ));
        }
        let handle = self.handle.as_mut().ok_or(MonitorError::EngineNotRunning)?;
        match handle.framed.request(line).await {
            Ok(response) => {
                Self::tee(handle, &response).await;
                Ok(response)
            }
            Err(err) => Err(self.on_pipe_error(err).await),
        }
    }

    /// Stop the engine. With `save_to`, ask it to persist state and exit
    /// on its own; kill it only if that times out. Without, kill outright.
    pub async fn stop(&mut self, save_to: Option<&Path>) -> Result<StopOutcome> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(StopOutcome::NotRunning);
        };
        self.draining = false;

        if let Some(path) = save_to {
            let directive = save_and_exit_directive(path);
            if let Err(err) = handle.framed.send(&directive).await {
                warn!(%err, "engine save directive failed, killing");
                handle.child.start_kill()?;
                let _ = handle.child.wait().await;
                return Ok(StopOutcome::Killed);
            }
            match tokio::time::timeout(SAVE_EXIT_TIMEOUT, handle.child.wait()).await {
                Ok(status) => {
                    let status = status?;
                    if status.success() && path.exists() {
                        info!(state = %path.display(), "engine saved state and exited");
                        self.resumable = true;
                        return Ok(StopOutcome::Saved);
                    }
                    warn!(%status, "engine exited without a usable state blob");
                    return Ok(StopOutcome::Killed);
                }
                Err(_) => {
                    warn!("engine did not exit after save directive, killing");
                    handle.child.start_kill()?;
                    let _ = handle.child.wait().await;
                    return Ok(StopOutcome::Killed);
                }
            }
        }

        handle.child.start_kill()?;
        let _ = handle.child.wait().await;
        info!("engine killed");
        Ok(StopOutcome::Killed)
    }

    /// Forget any saved state blob (reset path).
    pub fn clear_resumable(&mut self) {
        self.resumable = false;
    }

    pub fn set_resumable(&mut self, resumable: bool) {
        self.resumable = resumable;
    }

    /// A pipe error usually means the child died mid-exchange. Reap it so
    /// the state machine lands back in Stopped and the caller gets the
    /// more precise error.
    async fn on_pipe_error(&mut self, err: std::io::Error) -> MonitorError {
        if let Some(mut handle) = self.handle.take() {
            self.draining = false;
            match handle.child.try_wait() {
                Ok(Some(status)) => {
                    warn!(%status, "engine exited unexpectedly");
                    return MonitorError::BrokenPipe(format!(
                        "engine exited unexpectedly with {status}: {err}"
                    ));
                }
                Ok(None) => {
                    let _ = handle.child.start_kill();
                    let _ = handle.child.wait().await;
                }
                Err(wait_err) => {
                    warn!(%wait_err, "could not reap engine child");
                }
            }
        }
        MonitorError::BrokenPipe(err.to_string())
    }

    async fn tee(handle: &mut EngineHandle, response: &EngineResponse) {
        if response.lines.is_empty() {
            return;
        }
        let mut text = response.text();
        text.push('\n');
        if let Err(err) = handle.stdout_log.write_all(text.as_bytes()).await {
            warn!(%err, "could not append to engine stdout log");
        }
    }
}
