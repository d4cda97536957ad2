use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Highest sequence index / timestamp known to have been handed to the
/// engine. Monotonic by construction: the only mutator is
/// [`Watermark::advance_to`], which ignores regressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub index: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Watermark {
    pub const ZERO: Watermark = Watermark {
        index: 0,
        timestamp: None,
    };

    pub fn advance_to(&mut self, index: u64, timestamp: DateTime<Utc>) {
        if index > self.index {
            self.index = index;
        }
        match self.timestamp {
            Some(current) if timestamp <= current => {}
            _ => self.timestamp = Some(timestamp),
        }
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Watermark::ZERO
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::TimeZone;

    #[test]
    fn advance_is_monotonic() {
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();

        let mut wm = Watermark::ZERO;
        wm.advance_to(3, t1);
        assert_eq!(wm.index, 3);
        assert_eq!(wm.timestamp, Some(t1));

        // A lower index and older timestamp never move the mark backwards.
        wm.advance_to(2, t0);
        assert_eq!(wm.index, 3);
        assert_eq!(wm.timestamp, Some(t1));
    }
}
