//! Event codec: raw JSON batches → ordered timepoints → engine log lines
//! and store rows.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use monitord_protocol::{PredicateOccurrence, RawEvent, SkipReason, Timepoint};
use tracing::debug;

/// Table receiving one synthetic row per timepoint. The store needs at
/// least two columns per table, hence index + timestamp. Also serves as
/// the barrier table for policy changes.
pub const WATERMARK_TABLE: &str = "timepoint_index";

/// Positional column name for argument `i` (1-based).
pub fn arg_column(i: usize) -> String {
    format!("x{i}")
}

/// Column tagging every predicate row with its timepoint's sequence index.
pub const INDEX_COLUMN: &str = "tp_index";

/// One row bound for the store: table, named column values, designated
/// timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRow {
    pub table: String,
    pub columns: Vec<(String, String)>,
    pub timestamp: DateTime<Utc>,
}

/// Permissive timestamp parser. Accepts RFC 3339 plus the common
/// space/`T`-separated forms, with or without fractional seconds, and a
/// bare date. Naive timestamps are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Normalize one uploaded batch into ordered timepoints.
///
/// `now` is the single reference time for the whole batch: every event
/// without a timestamp (or with one the permissive parser rejects) is
/// stamped with it, so all "now"-stamped events in one batch compare
/// equal. A predicate occurrence without a name marks that one timepoint
/// skipped; the batch continues. Sequence indices are left at 0 for the
/// watermark tracker to assign.
pub fn normalize(events: Vec<RawEvent>, now: DateTime<Utc>) -> Vec<Timepoint> {
    let mut out = Vec::with_capacity(events.len());
    for event in events {
        let timestamp = match event.timestamp.as_deref() {
            Some(raw) => parse_timestamp(raw).unwrap_or_else(|| {
                debug!(raw, "unparseable event timestamp, stamping with now");
                now
            }),
            None => now,
        };

        let mut skipped = None;
        let mut predicates = Vec::with_capacity(event.predicates.len());
        for pred in event.predicates {
            match pred.name {
                Some(name) if !name.is_empty() => {
                    let tuples = pred
                        .occurrences
                        .iter()
                        .map(|tuple| tuple.iter().map(render_value).collect())
                        .collect();
                    predicates.push(PredicateOccurrence { name, tuples });
                }
                _ => {
                    skipped = Some(SkipReason::MalformedPredicate);
                }
            }
        }

        out.push(Timepoint {
            index: 0,
            timestamp,
            predicates,
            skipped,
        });
    }
    out
}

/// Render one timepoint in the engine's log line format:
/// `@<unix-seconds> name (v1,v2) (v3,v4) other () ;` with a trailing
/// newline. Tuples of one predicate repeat as parenthesized groups after
/// its name; values are comma-joined with no trailing separator.
pub fn to_engine_line(tp: &Timepoint) -> String {
    let mut line = format!("@{}", tp.timestamp.timestamp());
    for pred in &tp.predicates {
        line.push(' ');
        line.push_str(&pred.name);
        if pred.tuples.is_empty() {
            line.push_str(" ()");
        }
        for tuple in &pred.tuples {
            line.push_str(" (");
            line.push_str(&tuple.join(","));
            line.push(')');
        }
    }
    line.push_str(" ;\n");
    line
}

/// Expand one timepoint into store rows: one row per tuple of each
/// predicate occurrence (positional columns plus the sequence index tag)
/// and one synthetic watermark row. The watermark row is emitted for
/// skipped timepoints too, so index gaps in predicate tables stay
/// explainable and the barrier can always catch up.
pub fn to_store_rows(tp: &Timepoint) -> Vec<StoreRow> {
    let mut rows = Vec::new();
    if !tp.is_skipped() {
        for pred in &tp.predicates {
            for tuple in &pred.tuples {
                let mut columns: Vec<(String, String)> = tuple
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (arg_column(i + 1), v.clone()))
                    .collect();
                columns.push((INDEX_COLUMN.to_string(), tp.index.to_string()));
                rows.push(StoreRow {
                    table: pred.name.clone(),
                    columns,
                    timestamp: tp.timestamp,
                });
            }
        }
    }
    rows.push(StoreRow {
        table: WATERMARK_TABLE.to_string(),
        columns: vec![("idx".to_string(), tp.index.to_string())],
        timestamp: tp.timestamp,
    });
    rows
}
