//! Policy change without losing history.
//!
//! Swapping the monitored formula invalidates the engine's internal
//! state, so the new engine must be fed enough past events to answer
//! correctly from its first live timepoint. The naive plan replays every
//! stored event. The minimal plan asks the engine which slice of history
//! the candidate formula can actually observe (per-predicate relative
//! intervals) and replays only that.
//!
//! Ordering of the steps is what makes the change safe: nothing visible
//! happens until the candidate is validated and the store has caught up
//! to the in-memory watermark; the old engine is only torn down once the
//! replay file is fully materialized on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use monitord_protocol::{PredicateOccurrence, RelativeInterval, Signature, Timepoint, Watermark};
use tracing::{info, warn};

use crate::codec::{WATERMARK_TABLE, to_engine_line};
use crate::engine::supervisor::{EngineSupervisor, LaunchOutcome, LaunchSpec};
use crate::engine::tool::EngineTool;
use crate::error::{MonitorError, Result};
use crate::layout::DataLayout;
use crate::snapshot::{AuditLog, AuditRecord};
use crate::store::gateway::StoreGateway;
use crate::store::sql::{
    full_select, replay_select, rows_into_replay, watermark_full_replay_select,
    watermark_window_replay_select,
};
use crate::watermark::Barrier;

#[derive(Debug, Clone)]
pub struct PolicyChangeRequest {
    pub formula: String,
    pub negate: bool,
    /// Replay the full history instead of the minimal slice.
    pub naive: bool,
}

#[derive(Debug, Clone, serde::Serialize, PartialEq, Eq)]
pub struct PolicyChangeReport {
    pub plan: String,
    pub replayed_timepoints: usize,
}

/// Runs one policy change end to end. Borrowed mutably for the whole
/// change; the caller's lock makes the change exclusive with ingest.
pub struct PolicyChangePlanner<'a> {
    pub tool: &'a dyn EngineTool,
    pub gateway: &'a dyn StoreGateway,
    pub supervisor: &'a mut EngineSupervisor,
    pub layout: &'a DataLayout,
    pub audit: &'a AuditLog,
    pub barrier: Barrier,
    pub engine_binary: PathBuf,
}

impl PolicyChangePlanner<'_> {
    /// Validate, barrier, plan, fetch, cut over, commit.
    ///
    /// Any failure before the cutover leaves the running engine and the
    /// active policy untouched. Failures during cutover are fatal and
    /// reported as such.
    pub async fn execute(
        &mut self,
        signature: &Signature,
        watermark: Watermark,
        request: &PolicyChangeRequest,
    ) -> Result<PolicyChangeReport> {
        let candidate = self.layout.candidate_policy_path();
        tokio::fs::write(&candidate, &request.formula).await?;

        match self
            .prepare(signature, watermark, request, &candidate)
            .await
        {
            Ok(replayed) => self.cutover(request, &candidate, replayed).await,
            Err(err) => {
                // Pre-cutover failure: discard the candidate, old engine
                // keeps running.
                let _ = tokio::fs::remove_file(&candidate).await;
                Err(err)
            }
        }
    }

    /// Steps 1-4: validate the candidate, wait out the store lag, build
    /// the replay file. Touches nothing the old engine depends on.
    async fn prepare(
        &mut self,
        signature: &Signature,
        watermark: Watermark,
        request: &PolicyChangeRequest,
        candidate: &Path,
    ) -> Result<usize> {
        let sig_path = self.layout.signature_path();
        let verdict = self
            .tool
            .check(&sig_path, candidate, request.negate)
            .await?;
        if !verdict.monitorable {
            return Err(MonitorError::NotMonitorable {
                diagnostic: verdict.diagnostic,
            });
        }

        self.barrier.wait(self.gateway, watermark.index).await?;

        // Both plans carry the watermark-table skeleton alongside the
        // event tables: a committed timepoint with no occurrences exists
        // only there, and the new engine must still see it in sequence.
        let queries = if request.naive {
            let mut queries: Vec<(String, String)> = signature
                .decls()
                .iter()
                .map(|decl| (decl.name.clone(), full_select(&decl.name)))
                .collect();
            queries.push((WATERMARK_TABLE.to_string(), watermark_full_replay_select()));
            queries
        } else {
            let intervals = self
                .tool
                .relative_intervals(&sig_path, candidate)
                .await?;
            self.minimal_queries(&intervals, watermark)
        };

        let timepoints = self.fetch(queries).await?;
        let replayed = timepoints.len();
        let mut replay_text = String::new();
        for tp in timepoints.values() {
            replay_text.push_str(&to_engine_line(tp));
        }
        tokio::fs::write(self.layout.replay_log_path(), replay_text).await?;
        info!(
            replayed,
            naive = request.naive,
            "replay file materialized"
        );
        Ok(replayed)
    }

    /// Translate interval reports into one bounded select per predicate,
    /// plus the skeleton slice over their union. With no watermark
    /// timestamp there is no history to anchor to, and with no intervals
    /// the candidate observes no past at all; either way the plan is
    /// empty.
    fn minimal_queries(
        &self,
        intervals: &[RelativeInterval],
        watermark: Watermark,
    ) -> Vec<(String, String)> {
        let Some(pivot) = watermark.timestamp else {
            return Vec::new();
        };
        if intervals.is_empty() {
            return Vec::new();
        }
        let mut queries: Vec<(String, String)> = intervals
            .iter()
            .map(|interval| (interval.predicate.clone(), replay_select(interval, pivot)))
            .collect();
        queries.push((
            WATERMARK_TABLE.to_string(),
            watermark_window_replay_select(intervals, pivot),
        ));
        queries
    }

    /// Run the plan's queries and regroup rows into ordered timepoints.
    async fn fetch(
        &self,
        queries: Vec<(String, String)>,
    ) -> Result<BTreeMap<u64, Timepoint>> {
        let mut timepoints: BTreeMap<u64, Timepoint> = BTreeMap::new();
        for (predicate, sql) in queries {
            let output = self.gateway.execute(&sql).await?;
            for row in rows_into_replay(&output)? {
                let tp = timepoints.entry(row.index).or_insert_with(|| Timepoint {
                    index: row.index,
                    timestamp: row.timestamp,
                    predicates: Vec::new(),
                    skipped: None,
                });
                // Skeleton rows only establish that the timepoint existed.
                if predicate == WATERMARK_TABLE {
                    continue;
                }
                match tp.predicates.iter_mut().find(|p| p.name == predicate) {
                    Some(occurrence) => occurrence.tuples.push(row.tuple),
                    None => tp.predicates.push(PredicateOccurrence {
                        name: predicate.clone(),
                        tuples: vec![row.tuple],
                    }),
                }
            }
        }
        Ok(timepoints)
    }

    /// Steps 5-6: tear down the old engine, promote the candidate, bring
    /// the new engine up through the replay, record the change.
    async fn cutover(
        &mut self,
        request: &PolicyChangeRequest,
        candidate: &Path,
        replayed: usize,
    ) -> Result<PolicyChangeReport> {
        let plan = if request.naive { "naive" } else { "minimal" };

        let result = self.try_cutover(request, candidate, replayed).await;
        let committed = result.is_ok();
        if let Err(err) = self
            .audit
            .append(&AuditRecord {
                at: Utc::now(),
                formula: request.formula.clone(),
                negate: request.negate,
                plan: plan.to_string(),
                replayed_timepoints: replayed,
                committed,
            })
            .await
        {
            warn!(%err, "could not append policy-change audit record");
        }

        result.map(|()| PolicyChangeReport {
            plan: plan.to_string(),
            replayed_timepoints: replayed,
        })
    }

    async fn try_cutover(
        &mut self,
        request: &PolicyChangeRequest,
        candidate: &Path,
        replayed: usize,
    ) -> Result<()> {
        self.supervisor
            .stop(None)
            .await
            .map_err(|e| MonitorError::CutoverFailed(e.to_string()))?;

        // The new engine launches against the candidate file; the rename
        // onto the active policy path happens only once it is up, so a
        // failed launch leaves the old formula in place for readers.
        let replay_path = self.layout.replay_log_path();
        let spec = LaunchSpec {
            binary: self.engine_binary.clone(),
            signature: self.layout.signature_path(),
            policy: candidate.to_path_buf(),
            negate: request.negate,
            load_state: None,
            replay: (replayed > 0).then(|| replay_path.clone()),
            stdout_log: self.layout.engine_stdout_log_path(),
            stderr_log: self.layout.engine_stderr_log_path(),
        };
        let outcome = self
            .supervisor
            .launch(&spec)
            .await
            .map_err(|e| MonitorError::CutoverFailed(e.to_string()))?;
        if outcome == LaunchOutcome::Replaying {
            self.supervisor
                .drain_replay()
                .await
                .map_err(|e| MonitorError::CutoverFailed(e.to_string()))?;
        }
        tokio::fs::rename(candidate, self.layout.policy_path())
            .await
            .map_err(|e| MonitorError::CutoverFailed(format!("promoting candidate: {e}")))?;
        let _ = tokio::fs::remove_file(&replay_path).await;
        info!(plan = %if request.naive { "naive" } else { "minimal" }, "policy change committed");
        Ok(())
    }
}
