//! SQL the control plane derives itself: schema statement splitting,
//! the watermark probe, and the replay selects built from relative
//! intervals. Everything here is pure so it can be tested without a
//! database.

use chrono::{DateTime, Duration, Utc};
use monitord_protocol::{IntervalBound, RelativeInterval};

use crate::codec::{INDEX_COLUMN, WATERMARK_TABLE, parse_timestamp};
use crate::error::{MonitorError, Result};
use crate::store::gateway::QueryOutput;

/// Designated timestamp column in every event table.
pub const TS_COLUMN: &str = "timestamp";

/// Split an engine-produced SQL blob into individual statements.
pub fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_str(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn ts_literal(ts: DateTime<Utc>) -> String {
    quote_str(&ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string())
}

/// `select max(idx)` over the synthetic watermark table. The result is
/// the highest sequence index the store has actually applied.
pub fn watermark_select() -> String {
    format!("select max(idx) from {}", quote_ident(WATERMARK_TABLE))
}

/// The watermark table is ours, not the engine compiler's, so its DDL
/// lives here.
pub fn watermark_create() -> String {
    format!(
        "create table if not exists {} (idx long, {ts} timestamp) timestamp({ts})",
        quote_ident(WATERMARK_TABLE),
        ts = quote_ident(TS_COLUMN)
    )
}

pub fn watermark_drop() -> String {
    format!("drop table if exists {}", quote_ident(WATERMARK_TABLE))
}

/// Full-history select for one event table, in ingestion order. The
/// naive replay plan is one of these per predicate.
pub fn full_select(table: &str) -> String {
    format!(
        "select * from {} order by {}",
        quote_ident(table),
        quote_ident(INDEX_COLUMN)
    )
}

/// Replay select for one predicate from its relative interval.
///
/// Offsets are seconds of lookback from `pivot` (the watermark
/// timestamp): an interval `[l, u)` keeps rows whose age is at least
/// `l` and strictly less than `u`, so the time predicate becomes
/// `timestamp <= pivot - l and timestamp > pivot - u`. An unbounded far
/// edge drops the lower time cut entirely. Argument constraints narrow
/// by positional column equality.
pub fn replay_select(interval: &RelativeInterval, pivot: DateTime<Utc>) -> String {
    let mut clauses = time_window_clauses(interval.lower, interval.upper, pivot);
    for constraint in &interval.constraints {
        clauses.push(format!(
            "{} = {}",
            quote_ident(&crate::codec::arg_column(constraint.position)),
            quote_str(&constraint.value)
        ));
    }

    let mut sql = format!("select * from {}", quote_ident(&interval.predicate));
    if !clauses.is_empty() {
        sql.push_str(" where ");
        sql.push_str(&clauses.join(" and "));
    }
    sql.push_str(&format!(" order by {}", quote_ident(INDEX_COLUMN)));
    sql
}

fn time_window_clauses(
    lower: IntervalBound,
    upper: IntervalBound,
    pivot: DateTime<Utc>,
) -> Vec<String> {
    let mut clauses = Vec::new();
    match lower {
        IntervalBound::Closed(l) => clauses.push(format!(
            "{} <= {}",
            quote_ident(TS_COLUMN),
            ts_literal(pivot - Duration::seconds(l))
        )),
        IntervalBound::Open(l) => clauses.push(format!(
            "{} < {}",
            quote_ident(TS_COLUMN),
            ts_literal(pivot - Duration::seconds(l))
        )),
        IntervalBound::Unbounded => {}
    }
    match upper {
        IntervalBound::Closed(u) => clauses.push(format!(
            "{} >= {}",
            quote_ident(TS_COLUMN),
            ts_literal(pivot - Duration::seconds(u))
        )),
        IntervalBound::Open(u) => clauses.push(format!(
            "{} > {}",
            quote_ident(TS_COLUMN),
            ts_literal(pivot - Duration::seconds(u))
        )),
        IntervalBound::Unbounded => {}
    }
    clauses
}

/// Index skeleton of the full history: every committed timepoint as
/// (sequence index, timestamp), whether or not any predicate held at it.
/// Timepoints without occurrences exist only in the watermark table, so
/// a replay built solely from the event tables would drop them and hand
/// the new engine a different timepoint sequence than history.
pub fn watermark_full_replay_select() -> String {
    watermark_skeleton_select(Vec::new())
}

/// Skeleton slice restricted to the widest window any of the intervals
/// can observe.
pub fn watermark_window_replay_select(
    intervals: &[RelativeInterval],
    pivot: DateTime<Utc>,
) -> String {
    let (lower, upper) = union_window(intervals);
    watermark_skeleton_select(time_window_clauses(lower, upper, pivot))
}

fn watermark_skeleton_select(clauses: Vec<String>) -> String {
    let mut sql = format!(
        "select idx as {}, {} from {}",
        quote_ident(INDEX_COLUMN),
        quote_ident(TS_COLUMN),
        quote_ident(WATERMARK_TABLE)
    );
    if !clauses.is_empty() {
        sql.push_str(" where ");
        sql.push_str(&clauses.join(" and "));
    }
    sql.push_str(" order by idx");
    sql
}

/// Union of the intervals' windows: the nearest lower edge and the
/// farthest upper edge, ties resolved toward the inclusive bound.
fn union_window(intervals: &[RelativeInterval]) -> (IntervalBound, IntervalBound) {
    let mut lower: Option<IntervalBound> = None;
    let mut upper: Option<IntervalBound> = None;
    for interval in intervals {
        lower = Some(match lower {
            None => interval.lower,
            Some(held) => nearer_bound(held, interval.lower),
        });
        upper = Some(match upper {
            None => interval.upper,
            Some(held) => farther_bound(held, interval.upper),
        });
    }
    (
        lower.unwrap_or(IntervalBound::Unbounded),
        upper.unwrap_or(IntervalBound::Unbounded),
    )
}

fn nearer_bound(a: IntervalBound, b: IntervalBound) -> IntervalBound {
    match (a, b) {
        (IntervalBound::Unbounded, _) | (_, IntervalBound::Unbounded) => IntervalBound::Unbounded,
        (IntervalBound::Closed(x), IntervalBound::Closed(y)) => IntervalBound::Closed(x.min(y)),
        (IntervalBound::Open(x), IntervalBound::Open(y)) => IntervalBound::Open(x.min(y)),
        (IntervalBound::Closed(x), IntervalBound::Open(y))
        | (IntervalBound::Open(y), IntervalBound::Closed(x)) => {
            if x <= y {
                IntervalBound::Closed(x)
            } else {
                IntervalBound::Open(y)
            }
        }
    }
}

fn farther_bound(a: IntervalBound, b: IntervalBound) -> IntervalBound {
    match (a, b) {
        (IntervalBound::Unbounded, _) | (_, IntervalBound::Unbounded) => IntervalBound::Unbounded,
        (IntervalBound::Closed(x), IntervalBound::Closed(y)) => IntervalBound::Closed(x.max(y)),
        (IntervalBound::Open(x), IntervalBound::Open(y)) => IntervalBound::Open(x.max(y)),
        (IntervalBound::Closed(x), IntervalBound::Open(y))
        | (IntervalBound::Open(y), IntervalBound::Closed(x)) => {
            if x >= y {
                IntervalBound::Closed(x)
            } else {
                IntervalBound::Open(y)
            }
        }
    }
}

/// Time-window select over one event table for the read API.
pub fn window_select(
    table: &str,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> String {
    let mut clauses = Vec::new();
    if let Some(from) = from {
        clauses.push(format!("{} >= {}", quote_ident(TS_COLUMN), ts_literal(from)));
    }
    if let Some(to) = to {
        clauses.push(format!("{} <= {}", quote_ident(TS_COLUMN), ts_literal(to)));
    }
    let mut sql = format!("select * from {}", quote_ident(table));
    if !clauses.is_empty() {
        sql.push_str(" where ");
        sql.push_str(&clauses.join(" and "));
    }
    sql.push_str(&format!(" order by {}", quote_ident(INDEX_COLUMN)));
    sql
}

/// One event-table row pulled back out of the store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ReplayRow {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub tuple: Vec<String>,
}

fn cell_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Reassemble a `select *` result set into replay rows. Positional
/// argument columns are ordered by their numeric suffix regardless of
/// the order the store returned them in.
pub fn rows_into_replay(output: &QueryOutput) -> Result<Vec<ReplayRow>> {
    let QueryOutput::Rows { columns, rows } = output else {
        return Ok(Vec::new());
    };

    let index_col = columns
        .iter()
        .position(|c| c == INDEX_COLUMN)
        .ok_or_else(|| MonitorError::Store(format!("result set without {INDEX_COLUMN}")))?;
    let ts_col = columns
        .iter()
        .position(|c| c == TS_COLUMN)
        .ok_or_else(|| MonitorError::Store(format!("result set without {TS_COLUMN}")))?;
    let mut arg_cols: Vec<(usize, usize)> = columns
        .iter()
        .enumerate()
        .filter_map(|(i, c)| {
            c.strip_prefix('x')
                .and_then(|n| n.parse::<usize>().ok())
                .map(|n| (n, i))
        })
        .collect();
    arg_cols.sort_unstable();

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let index = row
            .get(index_col)
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| MonitorError::Store("non-numeric sequence index".to_string()))?;
        let timestamp = row
            .get(ts_col)
            .and_then(serde_json::Value::as_str)
            .and_then(parse_timestamp)
            .ok_or_else(|| MonitorError::Store("unparseable row timestamp".to_string()))?;
        let tuple = arg_cols
            .iter()
            .filter_map(|&(_, i)| row.get(i))
            .filter(|v| !v.is_null())
            .map(cell_to_string)
            .collect();
        out.push(ReplayRow {
            index,
            timestamp,
            tuple,
        });
    }
    Ok(out)
}
