//! Sequence-index assignment and the store-side consistency barrier.
//!
//! Every accepted batch gets consecutive sequence indices, skipped
//! timepoints included, so the index stream never has silent gaps. The
//! barrier compares the store's applied watermark (max over the
//! synthetic watermark table) against the in-memory one; equality means
//! the asynchronous inserts have all landed and a consistent replay
//! read is possible.

use std::time::Duration;

use monitord_protocol::{Timepoint, Watermark};
use tracing::debug;

use crate::error::{MonitorError, Result};
use crate::store::gateway::StoreGateway;
use crate::store::sql::watermark_select;

/// Owns the in-memory watermark and hands out sequence indices.
#[derive(Debug, Clone, Default)]
pub struct WatermarkTracker {
    watermark: Watermark,
}

impl WatermarkTracker {
    pub fn new(watermark: Watermark) -> Self {
        Self { watermark }
    }

    pub fn current(&self) -> Watermark {
        self.watermark
    }

    /// Assign the next consecutive indices to an ordered batch and
    /// advance the watermark past it. Skipped timepoints consume an
    /// index too.
    pub fn assign(&mut self, timepoints: &mut [Timepoint]) {
        for tp in timepoints.iter_mut() {
            let next = self.watermark.index + 1;
            tp.index = next;
            self.watermark.advance_to(next, tp.timestamp);
        }
    }

    /// Seed after a restart from the snapshot's persisted position.
    pub fn restore(&mut self, watermark: Watermark) {
        self.watermark = watermark;
    }
}

/// Bounded-retry probe of the store's applied watermark.
#[derive(Debug, Clone, Copy)]
pub struct Barrier {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for Barrier {
    fn default() -> Self {
        Self {
            attempts: 20,
            delay: Duration::from_millis(250),
        }
    }
}

impl Barrier {
    /// Wait until the store has applied everything up to `expected`.
    /// Gives up after the configured attempts with a retryable error
    /// carrying both positions.
    pub async fn wait(&self, gateway: &dyn StoreGateway, expected: u64) -> Result<()> {
        let mut observed = 0;
        for attempt in 0..self.attempts {
            observed = probe(gateway).await?;
            if observed >= expected {
                debug!(observed, expected, attempt, "store watermark caught up");
                return Ok(());
            }
            tokio::time::sleep(self.delay).await;
        }
        Err(MonitorError::RetryLater { observed, expected })
    }
}

/// One watermark probe. An empty watermark table reads as zero.
pub async fn probe(gateway: &dyn StoreGateway) -> Result<u64> {
    let output = gateway.execute(&watermark_select()).await?;
    Ok(output
        .scalar()
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::codec::StoreRow;
    use crate::store::gateway::QueryOutput;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    /// Gateway whose watermark probe pops from a scripted sequence,
    /// repeating the final value once the script runs out.
    struct ScriptedGateway {
        script: Mutex<Vec<Option<u64>>>,
    }

    impl ScriptedGateway {
        fn new(script: Vec<Option<u64>>) -> Self {
            Self {
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait]
    impl StoreGateway for ScriptedGateway {
        async fn execute(&self, _sql: &str) -> crate::Result<QueryOutput> {
            let mut script = self.script.lock().unwrap();
            let value = if script.len() > 1 {
                script.remove(0)
            } else {
                script.first().copied().flatten()
            };
            Ok(QueryOutput::Rows {
                columns: vec!["max".to_string()],
                rows: vec![vec![match value {
                    Some(v) => serde_json::json!(v),
                    None => serde_json::Value::Null,
                }]],
            })
        }

        async fn insert_rows(&self, _rows: &[StoreRow]) -> crate::Result<()> {
            Ok(())
        }
    }

    fn fast_barrier(attempts: u32) -> Barrier {
        Barrier {
            attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn assign_numbers_all_timepoints_including_skipped() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut tracker = WatermarkTracker::default();
        let mut tps = vec![
            Timepoint {
                index: 0,
                timestamp: ts,
                predicates: vec![],
                skipped: Some(monitord_protocol::SkipReason::MalformedPredicate),
            },
            Timepoint {
                index: 0,
                timestamp: ts,
                predicates: vec![],
                skipped: None,
            },
        ];
        tracker.assign(&mut tps);
        assert_eq!(tps[0].index, 1);
        assert_eq!(tps[1].index, 2);
        assert_eq!(tracker.current().index, 2);
        assert_eq!(tracker.current().timestamp, Some(ts));
    }

    #[tokio::test]
    async fn barrier_passes_once_store_catches_up() {
        let gateway = ScriptedGateway::new(vec![Some(3), Some(4), Some(5)]);
        fast_barrier(10).wait(&gateway, 5).await.unwrap();
    }

    #[tokio::test]
    async fn barrier_gives_up_with_both_positions() {
        let gateway = ScriptedGateway::new(vec![Some(3)]);
        let err = fast_barrier(3).wait(&gateway, 9).await.unwrap_err();
        match err {
            MonitorError::RetryLater { observed, expected } => {
                assert_eq!(observed, 3);
                assert_eq!(expected, 9);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_watermark_table_reads_as_zero() {
        let gateway = ScriptedGateway::new(vec![None]);
        assert_eq!(probe(&gateway).await.unwrap(), 0);
        fast_barrier(1).wait(&gateway, 0).await.unwrap();
    }
}
