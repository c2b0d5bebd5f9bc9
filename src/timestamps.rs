//! Timestamp lists and floor matching.
//!
//! A [`Timestamps`] value is the ordered, deduplicated list of instants a query
//! is evaluated at. Snapshot queries produce one state per listed instant;
//! contribution queries cover the half-open interval `[first, last)` and bucket
//! each edit under the largest listed instant that is `<=` the edit time.

use crate::error::{Error, Result};
use chrono::{DateTime, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Milliseconds since UNIX epoch (UTC).
pub type TimestampMs = i64;

/// A non-empty, sorted, deduplicated list of query instants.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamps {
    list: Vec<TimestampMs>,
}

impl Timestamps {
    /// Build from arbitrary instants; sorts and removes duplicates.
    pub fn new(instants: impl IntoIterator<Item = TimestampMs>) -> Result<Self> {
        let mut list: Vec<TimestampMs> = instants.into_iter().collect();
        list.sort_unstable();
        list.dedup();
        if list.is_empty() {
            return Err(Error::InvalidTimestamp("timestamp list is empty".into()));
        }
        Ok(Self { list })
    }

    #[must_use]
    pub fn single(instant: TimestampMs) -> Self {
        Self {
            list: vec![instant],
        }
    }

    /// Parse a list of ISO-8601 dates or date-times.
    pub fn parse<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        let parsed = values
            .iter()
            .map(|s| parse_instant(s.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Self::new(parsed)
    }

    /// Regularly spaced instants from `start` to `end` (inclusive when it falls on a step).
    ///
    /// `period` is an ISO-8601 duration such as `P1M`, `P1Y`, `P7D` or `PT6H`.
    ///
    /// ```
    /// use histbeam::Timestamps;
    /// let ts = Timestamps::range("2020-01-01", "2020-04-01", "P1M")?;
    /// assert_eq!(ts.len(), 4);
    /// # Ok::<_, histbeam::Error>(())
    /// ```
    pub fn range(start: &str, end: &str, period: &str) -> Result<Self> {
        let start = parse_datetime(start)?;
        let end = parse_datetime(end)?;
        if end < start {
            return Err(Error::InvalidTimestamp(format!(
                "range end {end} precedes start {start}"
            )));
        }
        let step = Period::parse(period)?;
        let mut list = Vec::new();
        let mut cur = start;
        while cur <= end {
            list.push(cur.timestamp_millis());
            cur = step.advance(cur)?;
        }
        Self::new(list)
    }

    #[must_use]
    pub fn first(&self) -> TimestampMs {
        self.list[0]
    }

    #[must_use]
    pub fn last(&self) -> TimestampMs {
        self.list[self.list.len() - 1]
    }

    #[must_use]
    pub fn as_slice(&self) -> &[TimestampMs] {
        &self.list
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = TimestampMs> + '_ {
        self.list.iter().copied()
    }

    /// Interval covered by contribution queries: `[first, last)`.
    #[must_use]
    pub fn interval(&self) -> (TimestampMs, TimestampMs) {
        (self.first(), self.last())
    }

    /// Floor-match an edit time into the list.
    ///
    /// Valid edit times lie in `[first, last)`; a single-entry list only accepts
    /// its own instant.
    pub fn floor(&self, t: TimestampMs) -> Result<TimestampMs> {
        let in_span = if self.list.len() == 1 {
            t == self.first()
        } else {
            t >= self.first() && t < self.last()
        };
        if !in_span {
            return Err(self.out_of_range(t));
        }
        Ok(self.floor_unchecked(t))
    }

    /// Floor-match with an inclusive upper bound: valid times lie in `[first, last]`.
    pub fn floor_inclusive(&self, t: TimestampMs) -> Result<TimestampMs> {
        if t < self.first() || t > self.last() {
            return Err(self.out_of_range(t));
        }
        Ok(self.floor_unchecked(t))
    }

    /// Buckets a contribution aggregation can produce: every instant but the last.
    #[must_use]
    pub fn contribution_buckets(&self) -> Vec<TimestampMs> {
        if self.list.len() == 1 {
            return self.list.clone();
        }
        self.list[..self.list.len() - 1].to_vec()
    }

    fn floor_unchecked(&self, t: TimestampMs) -> TimestampMs {
        // partition_point returns the count of entries <= t, which is >= 1 here.
        let idx = self.list.partition_point(|&x| x <= t);
        self.list[idx - 1]
    }

    fn out_of_range(&self, t: TimestampMs) -> Error {
        Error::TimestampOutOfRange {
            timestamp: t,
            first: self.first(),
            last: self.last(),
        }
    }
}

/// Parse `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS` (UTC) or a full RFC 3339 date-time.
pub fn parse_instant(s: &str) -> Result<TimestampMs> {
    parse_datetime(s).map(|dt| dt.timestamp_millis())
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&ndt));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| Error::InvalidTimestamp(format!("{s:?}: {e}")))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| Error::InvalidTimestamp(format!("{s:?}: no midnight")))?;
    Ok(Utc.from_utc_datetime(&midnight))
}

/// A calendar-aware ISO-8601 duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Period {
    months: u32,
    seconds: i64,
}

impl Period {
    fn parse(s: &str) -> Result<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let re = PATTERN.get_or_init(|| {
            Regex::new(
                r"^P(?:(\d+)Y)?(?:(\d+)M)?(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$",
            )
            .expect("period pattern is valid")
        });
        let caps = re
            .captures(s.trim())
            .ok_or_else(|| Error::InvalidTimestamp(format!("{s:?} is not an ISO-8601 period")))?;
        let field = |i: usize| -> Result<i64> {
            caps.get(i)
                .map_or(Ok(0), |m| m.as_str().parse::<i64>())
                .map_err(|e| Error::InvalidTimestamp(format!("{s:?}: {e}")))
        };
        let months = field(1)? * 12 + field(2)?;
        let seconds = field(3)? * 7 * 86_400
            + field(4)? * 86_400
            + field(5)? * 3_600
            + field(6)? * 60
            + field(7)?;
        if months == 0 && seconds == 0 {
            return Err(Error::InvalidTimestamp(format!("{s:?} is an empty period")));
        }
        let months = u32::try_from(months)
            .map_err(|_| Error::InvalidTimestamp(format!("{s:?}: period too long")))?;
        Ok(Self { months, seconds })
    }

    fn advance(&self, t: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let shifted = if self.months > 0 {
            t.checked_add_months(Months::new(self.months))
                .ok_or_else(|| Error::InvalidTimestamp("period overflows the calendar".into()))?
        } else {
            t
        };
        Ok(shifted + chrono::Duration::seconds(self.seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_parses_calendar_and_clock_parts() {
        assert_eq!(
            Period::parse("P1Y2M").unwrap(),
            Period {
                months: 14,
                seconds: 0
            }
        );
        assert_eq!(Period::parse("PT6H").unwrap().seconds, 6 * 3_600);
        assert_eq!(Period::parse("P1W").unwrap().seconds, 7 * 86_400);
        assert!(Period::parse("P").is_err());
        assert!(Period::parse("1M").is_err());
    }

    #[test]
    fn new_sorts_and_dedups() {
        let ts = Timestamps::new([30, 10, 20, 10]).unwrap();
        assert_eq!(ts.as_slice(), &[10, 20, 30]);
        assert!(Timestamps::new([]).is_err());
    }

    #[test]
    fn floor_matches_into_the_half_open_span() {
        let ts = Timestamps::new([100, 200, 300]).unwrap();
        assert_eq!(ts.floor(100).unwrap(), 100);
        assert_eq!(ts.floor(199).unwrap(), 100);
        assert_eq!(ts.floor(200).unwrap(), 200);
        assert!(matches!(ts.floor(99), Err(Error::TimestampOutOfRange { .. })));
        assert!(ts.floor(300).is_err());
        assert_eq!(ts.floor_inclusive(300).unwrap(), 300);
        assert_eq!(ts.contribution_buckets(), vec![100, 200]);
    }

    #[test]
    fn dates_parse_to_utc_midnight() {
        assert_eq!(parse_instant("1970-01-02").unwrap(), 86_400_000);
        assert_eq!(parse_instant("1970-01-01T00:00:01Z").unwrap(), 1_000);
        assert_eq!(parse_instant("1970-01-01T00:01:00").unwrap(), 60_000);
    }
}
