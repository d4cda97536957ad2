//! Relative replay intervals reported by the engine's interval-query mode.
//!
//! The engine prints one line per (predicate, constant-argument mask):
//!
//! ```text
//! P: [0,30)
//! Q{2=alice}: (15,120]
//! R: [0,*)
//! ```
//!
//! Offsets are seconds before "now". The lower bound is the near (recent)
//! edge, the upper bound the far (old) edge; `*` means unbounded lookback.
//! An optional `{pos=value,...}` mask restricts the interval to rows whose
//! argument at 1-based `pos` equals `value`. Bracket shape carries open/
//! closed fidelity and must be preserved all the way into store queries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One edge of a relative interval, in seconds before now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalBound {
    Closed(i64),
    Open(i64),
    Unbounded,
}

impl IntervalBound {
    pub fn offset(self) -> Option<i64> {
        match self {
            IntervalBound::Closed(s) | IntervalBound::Open(s) => Some(s),
            IntervalBound::Unbounded => None,
        }
    }
}

/// Constant-argument restriction attached to an interval. Positions are
/// 1-based, matching the store's positional column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgConstraint {
    pub position: usize,
    pub value: String,
}

/// How far back one predicate's history must be replayed for a candidate
/// policy to be evaluated correctly from a cold engine start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelativeInterval {
    pub predicate: String,
    pub constraints: Vec<ArgConstraint>,
    pub lower: IntervalBound,
    pub upper: IntervalBound,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntervalParseError {
    #[error("malformed interval line: {line:?}")]
    Malformed { line: String },

    #[error("malformed constraint {constraint:?} in line {line:?}")]
    BadConstraint { constraint: String, line: String },

    #[error("malformed bound {bound:?} in line {line:?}")]
    BadBound { bound: String, line: String },
}

impl FromStr for RelativeInterval {
    type Err = IntervalParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let malformed = || IntervalParseError::Malformed {
            line: line.to_string(),
        };
        let trimmed = line.trim();
        let (head, tail) = trimmed.split_once(':').ok_or_else(malformed)?;
        let head = head.trim();
        let tail = tail.trim();

        let (predicate, constraints) = match head.split_once('{') {
            Some((name, rest)) => {
                let inner = rest.strip_suffix('}').ok_or_else(malformed)?;
                let mut constraints = Vec::new();
                for part in inner.split(',').filter(|p| !p.trim().is_empty()) {
                    let (pos, value) =
                        part.split_once('=')
                            .ok_or_else(|| IntervalParseError::BadConstraint {
                                constraint: part.to_string(),
                                line: line.to_string(),
                            })?;
                    let position = pos.trim().parse::<usize>().map_err(|_| {
                        IntervalParseError::BadConstraint {
                            constraint: part.to_string(),
                            line: line.to_string(),
                        }
                    })?;
                    constraints.push(ArgConstraint {
                        position,
                        value: value.trim().to_string(),
                    });
                }
                (name.trim().to_string(), constraints)
            }
            None => (head.to_string(), Vec::new()),
        };
        if predicate.is_empty() {
            return Err(malformed());
        }

        let mut chars = tail.chars();
        let open_ch = chars.next().ok_or_else(malformed)?;
        let close_ch = tail.chars().last().ok_or_else(malformed)?;
        if !matches!(open_ch, '[' | '(') || !matches!(close_ch, ']' | ')') {
            return Err(malformed());
        }
        let inner = &tail[open_ch.len_utf8()..tail.len() - close_ch.len_utf8()];
        let (lo, hi) = inner.split_once(',').ok_or_else(malformed)?;

        let parse_bound = |raw: &str, closed: bool| -> Result<IntervalBound, IntervalParseError> {
            let raw = raw.trim();
            if raw == "*" {
                return Ok(IntervalBound::Unbounded);
            }
            let secs = raw
                .parse::<i64>()
                .ok()
                .filter(|s| *s >= 0)
                .ok_or_else(|| IntervalParseError::BadBound {
                    bound: raw.to_string(),
                    line: line.to_string(),
                })?;
            Ok(if closed {
                IntervalBound::Closed(secs)
            } else {
                IntervalBound::Open(secs)
            })
        };

        Ok(RelativeInterval {
            predicate,
            constraints,
            lower: parse_bound(lo, open_ch == '[')?,
            upper: parse_bound(hi, close_ch == ']')?,
        })
    }
}

impl fmt::Display for RelativeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.predicate)?;
        if !self.constraints.is_empty() {
            let parts: Vec<String> = self
                .constraints
                .iter()
                .map(|c| format!("{}={}", c.position, c.value))
                .collect();
            write!(f, "{{{}}}", parts.join(","))?;
        }
        let (open_ch, lo) = match self.lower {
            IntervalBound::Closed(s) => ('[', s.to_string()),
            IntervalBound::Open(s) => ('(', s.to_string()),
            IntervalBound::Unbounded => ('(', "*".to_string()),
        };
        let (close_ch, hi) = match self.upper {
            IntervalBound::Closed(s) => (']', s.to_string()),
            IntervalBound::Open(s) => (')', s.to_string()),
            IntervalBound::Unbounded => (')', "*".to_string()),
        };
        write!(f, ": {open_ch}{lo},{hi}{close_ch}")
    }
}
