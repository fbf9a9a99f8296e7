//! Phenomenon time handling.
//!
//! SensorThings encodes `phenomenonTime` either as an ISO 8601 instant
//! (`2024-01-01T12:00:00Z`) or as an interval (`start/end`). Ordering
//! between observations uses the latest instant covered: the instant itself,
//! or the interval end.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The time at which an observed phenomenon occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhenomenonTime {
    /// Instant, or interval start
    pub start: DateTime<Utc>,
    /// Interval end, if this is an interval
    pub end: Option<DateTime<Utc>>,
}

impl PhenomenonTime {
    /// Create an instant phenomenon time.
    #[must_use]
    pub fn instant(at: DateTime<Utc>) -> Self {
        Self {
            start: at,
            end: None,
        }
    }

    /// Create an interval phenomenon time.
    ///
    /// # Errors
    ///
    /// Returns error if `end` precedes `start`.
    pub fn interval(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, TimeError> {
        if end < start {
            return Err(TimeError::ReversedInterval {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self {
            start,
            end: Some(end),
        })
    }

    /// Parse an ISO 8601 instant or `start/end` interval.
    ///
    /// # Errors
    ///
    /// Returns error if either side is not an RFC 3339 timestamp.
    pub fn parse(input: &str) -> Result<Self, TimeError> {
        let input = input.trim();
        match input.split_once('/') {
            Some((start, end)) => Self::interval(parse_instant(start)?, parse_instant(end)?),
            None => Ok(Self::instant(parse_instant(input)?)),
        }
    }

    /// The latest instant covered by this phenomenon time.
    #[must_use]
    pub fn latest(&self) -> DateTime<Utc> {
        self.end.unwrap_or(self.start)
    }

    /// Whether this time is strictly newer than `other`.
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.latest() > other.latest()
    }
}

impl fmt::Display for PhenomenonTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.start.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        match self.end {
            Some(end) => write!(
                f,
                "{start}/{}",
                end.to_rfc3339_opts(SecondsFormat::AutoSi, true)
            ),
            None => f.write_str(&start),
        }
    }
}

/// Parse an RFC 3339 timestamp into UTC.
///
/// # Errors
///
/// Returns error if the input is not RFC 3339.
pub fn parse_instant(input: &str) -> Result<DateTime<Utc>, TimeError> {
    DateTime::parse_from_rfc3339(input.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TimeError::Invalid {
            input: input.to_string(),
            reason: e.to_string(),
        })
}

/// Errors that can occur parsing phenomenon times.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TimeError {
    /// Not an RFC 3339 timestamp
    #[error("invalid timestamp '{input}': {reason}")]
    Invalid {
        /// Offending input
        input: String,
        /// Parser message
        reason: String,
    },
    /// Interval end before start
    #[error("interval end {end} precedes start {start}")]
    ReversedInterval {
        /// Interval start
        start: String,
        /// Interval end
        end: String,
    },
}
