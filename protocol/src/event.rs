//! Raw ingest shapes and the normalized timepoint.
//!
//! Raw events arrive as JSON with optional timestamps and possibly
//! malformed predicates; the codec in `monitord-core` turns them into
//! ordered [`Timepoint`]s. Sequence indices are assigned by the watermark
//! tracker at ingest time, never by the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An uploaded events document: either a batch array or a single event.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawEventDocument {
    Batch(Vec<RawEvent>),
    Single(RawEvent),
}

impl RawEventDocument {
    pub fn into_events(self) -> Vec<RawEvent> {
        match self {
            RawEventDocument::Batch(events) => events,
            RawEventDocument::Single(event) => vec![event],
        }
    }
}

/// One raw event as uploaded. A missing timestamp means "stamp with the
/// batch reference time".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub predicates: Vec<RawPredicate>,
}

/// A predicate occurrence inside a raw event. `name` is optional so a
/// malformed occurrence can be detected per event instead of failing the
/// whole batch.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPredicate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub occurrences: Vec<Vec<serde_json::Value>>,
}

/// Why a timepoint was excluded from persistence. Skipped timepoints are
/// still reported to the caller and still consume a sequence index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A predicate occurrence had no name.
    MalformedPredicate,
    /// The engine warned about an out-of-order timestamp.
    OutOfOrder,
    /// The engine reported an error for this timepoint.
    EngineError,
}

/// A normalized predicate occurrence: one name, one or more value tuples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateOccurrence {
    pub name: String,
    pub tuples: Vec<Vec<String>>,
}

/// One instant in the monitored stream.
///
/// Invariant: committed timepoints have non-decreasing indices and
/// timestamps in commit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timepoint {
    /// Sequence index assigned by the watermark tracker; 0 until assigned.
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub predicates: Vec<PredicateOccurrence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
}

impl Timepoint {
    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}
