//! The `Monitor` façade: one value owning the engine supervisor, store
//! gateway, watermark tracker and durable state, exposing the operations
//! the HTTP layer calls. The server serializes access behind a mutex, so
//! every method takes `&mut self` and can assume it is alone.

use std::path::PathBuf;

use chrono::Utc;
use monitord_protocol::{
    ConfigSnapshot, DbParams, Policy, RawEvent, Signature, SkipReason, Watermark,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::codec::{normalize, to_engine_line, to_store_rows};
use crate::engine::supervisor::{EngineState, EngineSupervisor, LaunchSpec, StopOutcome};
use crate::engine::tool::{EngineCli, EngineTool};
use crate::error::{MonitorError, Result};
use crate::layout::DataLayout;
use crate::planner::{PolicyChangePlanner, PolicyChangeReport, PolicyChangeRequest};
use crate::snapshot::{AuditLog, SnapshotStore};
use crate::store::gateway::{QuestDbGateway, StoreGateway};
use crate::store::sql::{
    ReplayRow, rows_into_replay, split_statements, watermark_create, watermark_drop,
    window_select,
};
use crate::watermark::{Barrier, WatermarkTracker};

/// Everything needed to build a monitor instance.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub data_dir: PathBuf,
    pub engine_binary: PathBuf,
    pub db: DbParams,
    pub barrier: Barrier,
}

/// Per-timepoint ingest outcome, reported back to the uploader.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TimepointOutcome {
    pub index: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub skipped: usize,
    pub outcomes: Vec<TimepointOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub engine: String,
    pub resumable: bool,
    pub signature_bound: bool,
    pub policy_set: bool,
    pub negate: bool,
    pub watermark_index: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watermark_timestamp: Option<String>,
}

pub struct Monitor {
    layout: DataLayout,
    engine_binary: PathBuf,
    db: DbParams,
    negate: bool,
    signature: Option<Signature>,
    tracker: WatermarkTracker,
    supervisor: EngineSupervisor,
    snapshot: SnapshotStore,
    audit: AuditLog,
    gateway: Box<dyn StoreGateway>,
    tool: Box<dyn EngineTool>,
    barrier: Barrier,
}

impl Monitor {
    /// Assemble with explicit collaborators. Tests inject fakes here.
    pub fn with_parts(
        config: MonitorConfig,
        tool: Box<dyn EngineTool>,
        gateway: Box<dyn StoreGateway>,
    ) -> Result<Self> {
        let layout = DataLayout::new(&config.data_dir);
        layout.ensure()?;
        let snapshot = SnapshotStore::new(layout.snapshot_path());
        let audit = AuditLog::new(layout.audit_log_path());
        Ok(Self {
            layout,
            engine_binary: config.engine_binary,
            db: config.db,
            negate: false,
            signature: None,
            tracker: WatermarkTracker::default(),
            supervisor: EngineSupervisor::new(),
            snapshot,
            audit,
            gateway,
            tool,
            barrier: config.barrier,
        })
    }

    /// Restore durable state from disk and build the real collaborators.
    /// Snapshot-recorded store parameters win over the passed-in ones so
    /// a restart reconnects to the same database. If a saved engine state
    /// blob exists the engine is relaunched from it; a failure there is
    /// logged, not fatal, so the control plane always comes up.
    pub async fn bootstrap(mut config: MonitorConfig) -> Result<Self> {
        let layout = DataLayout::new(&config.data_dir);
        layout.ensure()?;
        let snapshot_store = SnapshotStore::new(layout.snapshot_path());
        let snapshot = snapshot_store.load().await?;
        if let Some(snap) = &snapshot {
            config.db = snap.db.clone();
        }

        let tool = Box::new(EngineCli::new(&config.engine_binary));
        let gateway = Box::new(QuestDbGateway::new(&config.db));
        let mut monitor = Self::with_parts(config, tool, gateway)?;
        monitor.restore(snapshot).await?;
        Ok(monitor)
    }

    /// Second phase of bootstrap, shared with tests that inject fakes.
    pub async fn restore(&mut self, snapshot: Option<ConfigSnapshot>) -> Result<()> {
        if let Some(snap) = snapshot {
            self.negate = snap.policy_negate;
            self.db = snap.db;
            let timestamp = snap
                .last_timestamp
                .as_deref()
                .and_then(crate::codec::parse_timestamp);
            self.tracker.restore(Watermark {
                index: snap.last_sequence_index,
                timestamp,
            });
        }

        let sig_path = self.layout.signature_path();
        if sig_path.exists() {
            let text = tokio::fs::read_to_string(&sig_path).await?;
            self.signature = Some(Signature::parse(&text)?);
        }

        if self.layout.engine_state_path().exists() {
            self.supervisor.set_resumable(true);
            match self.start(true).await {
                Ok(_) => info!("engine resumed from saved state"),
                Err(err) => warn!(%err, "engine resume failed, staying stopped"),
            }
        }
        Ok(())
    }

    pub fn status(&self) -> MonitorStatus {
        let (engine, resumable) = match self.supervisor.state() {
            EngineState::Running => ("running".to_string(), false),
            EngineState::Draining => ("draining".to_string(), false),
            EngineState::Stopped { resumable } => ("stopped".to_string(), resumable),
        };
        let watermark = self.tracker.current();
        MonitorStatus {
            engine,
            resumable,
            signature_bound: self.signature.is_some(),
            policy_set: self.layout.policy_path().exists(),
            negate: self.negate,
            watermark_index: watermark.index,
            watermark_timestamp: watermark.timestamp.map(|t| t.to_rfc3339()),
        }
    }

    pub async fn signature_text(&self) -> Result<String> {
        self.signature
            .as_ref()
            .map(Signature::canonical_text)
            .ok_or(MonitorError::NotConfigured {
                missing: "signature",
            })
    }

    pub async fn policy(&self) -> Result<Policy> {
        match tokio::fs::read_to_string(self.layout.policy_path()).await {
            Ok(formula) => Ok(Policy::new(formula, self.negate)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(MonitorError::NotConfigured { missing: "policy" })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Bind the signature: parse, persist canonical + JSON forms, derive
    /// the schema through the engine compiler and create the tables.
    /// Immutable once bound; reset first to change it.
    pub async fn set_signature(&mut self, text: &str) -> Result<()> {
        if self.signature.is_some() {
            return Err(MonitorError::SignatureBound);
        }
        let signature = Signature::parse(text)?;
        tokio::fs::write(self.layout.signature_path(), signature.canonical_text()).await?;

        let sig_path = self.layout.signature_path();
        let create_sql = self.tool.create_sql(&sig_path).await?;
        let drop_sql = self.tool.drop_sql(&sig_path).await?;
        let sig_json = self.tool.sig_to_json(&sig_path).await?;
        tokio::fs::write(self.layout.create_sql_path(), &create_sql).await?;
        tokio::fs::write(self.layout.drop_sql_path(), &drop_sql).await?;
        tokio::fs::write(self.layout.signature_json_path(), &sig_json).await?;

        for statement in split_statements(&create_sql) {
            self.gateway.execute(&statement).await?;
        }
        self.gateway.execute(&watermark_create()).await?;

        info!(
            predicates = signature.decls().len(),
            "signature bound, tables created"
        );
        self.signature = Some(signature);
        self.persist().await
    }

    /// Direct policy set, only valid while the engine is down. A running
    /// monitor must go through `change_policy`.
    pub async fn set_policy(&mut self, formula: &str, negate: bool) -> Result<()> {
        if self.supervisor.is_running() {
            return Err(MonitorError::PolicyBound);
        }
        tokio::fs::write(self.layout.policy_path(), formula).await?;
        self.negate = negate;
        // A policy swap invalidates any saved engine state.
        self.supervisor.clear_resumable();
        let _ = tokio::fs::remove_file(self.layout.engine_state_path()).await;
        self.persist().await
    }

    /// Launch the engine. With `resume`, load the saved state blob and
    /// skip the monitorability check (it passed when the state was made).
    pub async fn start(&mut self, resume: bool) -> Result<EngineState> {
        if self.signature.is_none() {
            return Err(MonitorError::NotConfigured {
                missing: "signature",
            });
        }
        if !self.layout.policy_path().exists() {
            return Err(MonitorError::NotConfigured { missing: "policy" });
        }
        if self.supervisor.is_running() {
            return Ok(self.supervisor.state());
        }

        let state_path = self.layout.engine_state_path();
        let resume = resume && state_path.exists();
        if !resume {
            let verdict = self
                .tool
                .check(
                    &self.layout.signature_path(),
                    &self.layout.policy_path(),
                    self.negate,
                )
                .await?;
            if !verdict.monitorable {
                return Err(MonitorError::NotMonitorable {
                    diagnostic: verdict.diagnostic,
                });
            }
        }

        let spec = LaunchSpec {
            binary: self.engine_binary.clone(),
            signature: self.layout.signature_path(),
            policy: self.layout.policy_path(),
            negate: self.negate,
            load_state: resume.then(|| state_path.clone()),
            replay: None,
            stdout_log: self.layout.engine_stdout_log_path(),
            stderr_log: self.layout.engine_stderr_log_path(),
        };
        self.supervisor.launch(&spec).await?;
        Ok(self.supervisor.state())
    }

    /// Stop the engine. With `save`, ask it to persist resumable state.
    pub async fn stop(&mut self, save: bool) -> Result<StopOutcome> {
        let state_path = self.layout.engine_state_path();
        let outcome = self
            .supervisor
            .stop(save.then_some(state_path.as_path()))
            .await?;
        self.persist().await?;
        Ok(outcome)
    }

    /// Ingest one uploaded batch. Every timepoint gets a sequence index;
    /// ones the engine rejects (out of order, errors) are marked skipped
    /// and excluded from event-table persistence, but still reported and
    /// still advance the watermark.
    pub async fn ingest(&mut self, events: Vec<RawEvent>) -> Result<IngestReport> {
        if self.signature.is_none() {
            return Err(MonitorError::NotConfigured {
                missing: "signature",
            });
        }
        if !self.supervisor.is_running() {
            return Err(MonitorError::EngineNotRunning);
        }
        if events.is_empty() {
            return Err(MonitorError::InvalidEvents("empty batch".to_string()));
        }

        let mut timepoints = normalize(events, Utc::now());

        let mut outcomes = Vec::with_capacity(timepoints.len());
        let mut rows = Vec::new();
        for tp in &mut timepoints {
            // Index assignment is per timepoint so a mid-batch engine
            // failure can roll the watermark back to the last position
            // the engine actually saw.
            let before = self.tracker.current();
            self.tracker.assign(std::slice::from_mut(tp));
            let mut verdict = None;
            if tp.skipped.is_none() {
                match self.supervisor.submit(&to_engine_line(tp)).await {
                    Ok(response) => {
                        tp.skipped = response.skip_reason();
                        if tp.skipped.is_none() && !response.lines.is_empty() {
                            verdict = Some(response.text());
                        }
                    }
                    Err(err) => {
                        self.tracker.restore(before);
                        if !rows.is_empty() {
                            self.gateway.insert_rows(&rows).await?;
                        }
                        self.persist().await?;
                        return Err(err);
                    }
                }
            }
            rows.extend(to_store_rows(tp));
            outcomes.push(TimepointOutcome {
                index: tp.index,
                skipped: tp.skipped,
                verdict,
            });
        }

        self.gateway.insert_rows(&rows).await?;
        self.persist().await?;

        let skipped = outcomes.iter().filter(|o| o.skipped.is_some()).count();
        Ok(IngestReport {
            accepted: outcomes.len() - skipped,
            skipped,
            outcomes,
        })
    }

    /// Swap the monitored formula while running. Exclusive with ingest by
    /// construction (single `&mut self`).
    pub async fn change_policy(
        &mut self,
        request: PolicyChangeRequest,
    ) -> Result<PolicyChangeReport> {
        let Some(signature) = self.signature.clone() else {
            return Err(MonitorError::NotConfigured {
                missing: "signature",
            });
        };
        if !self.supervisor.is_running() {
            return Err(MonitorError::EngineNotRunning);
        }

        let mut planner = PolicyChangePlanner {
            tool: self.tool.as_ref(),
            gateway: self.gateway.as_ref(),
            supervisor: &mut self.supervisor,
            layout: &self.layout,
            audit: &self.audit,
            barrier: self.barrier,
            engine_binary: self.engine_binary.clone(),
        };
        let report = planner
            .execute(&signature, self.tracker.current(), &request)
            .await?;

        self.negate = request.negate;
        self.persist().await?;
        Ok(report)
    }

    /// Time-windowed read of everything the store holds, keyed by
    /// predicate.
    pub async fn events_between(
        &self,
        start: Option<chrono::DateTime<Utc>>,
        end: Option<chrono::DateTime<Utc>>,
    ) -> Result<std::collections::BTreeMap<String, Vec<ReplayRow>>> {
        let Some(signature) = &self.signature else {
            return Err(MonitorError::NotConfigured {
                missing: "signature",
            });
        };
        let mut out = std::collections::BTreeMap::new();
        for decl in signature.decls() {
            let sql = window_select(&decl.name, start, end);
            let output = self.gateway.execute(&sql).await?;
            out.insert(decl.name.clone(), rows_into_replay(&output)?);
        }
        Ok(out)
    }

    /// Tail of the engine's teed stdout log.
    pub async fn engine_log(&self, max_lines: usize) -> Result<String> {
        let text = match tokio::fs::read_to_string(self.layout.engine_stdout_log_path()).await
        {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        Ok(lines[start..].join("\n"))
    }

    /// Tear everything down: kill the engine, drop the event tables via
    /// the stored drop SQL, clear the on-disk state.
    pub async fn reset(&mut self) -> Result<()> {
        self.supervisor.stop(None).await?;
        self.supervisor.clear_resumable();

        match tokio::fs::read_to_string(self.layout.drop_sql_path()).await {
            Ok(drop_sql) => {
                for statement in split_statements(&drop_sql) {
                    if let Err(err) = self.gateway.execute(&statement).await {
                        warn!(%err, statement, "drop statement failed during reset");
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Err(err) = self.gateway.execute(&watermark_drop()).await {
            warn!(%err, "watermark drop failed during reset");
        }

        self.layout.clear()?;
        self.snapshot.remove().await?;
        self.signature = None;
        self.negate = false;
        self.tracker = WatermarkTracker::default();
        info!("monitor reset");
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let watermark = self.tracker.current();
        let snapshot = ConfigSnapshot {
            policy_negate: self.negate,
            db: self.db.clone(),
            last_timestamp: watermark
                .timestamp
                .map(|t| t.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
            last_sequence_index: watermark.index,
        };
        self.snapshot.save(&snapshot).await
    }
}
