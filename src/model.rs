//! Event model: hashtag occurrences, windows and window counts
//!
//! All values are immutable once built. Timestamps are milliseconds since the
//! Unix epoch.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Position of a record in the upstream source
pub type Offset = u64;

/// A single hashtag seen in the stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashtagOccurrence {
    pub topic: String,
    pub event_time: Timestamp,
}

impl HashtagOccurrence {
    pub fn new(topic: impl Into<String>, event_time: Timestamp) -> Self {
        Self {
            topic: topic.into(),
            event_time,
        }
    }
}

/// Half-open interval `[start, end)`
///
/// Ordering compares `start` first, so windows sort chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeWindow {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (
            DateTime::from_timestamp_millis(self.start),
            DateTime::from_timestamp_millis(self.end),
        ) {
            (Some(start), Some(end)) => write!(f, "[{}, {})", start.to_rfc3339(), end.to_rfc3339()),
            _ => write!(f, "[{}, {})", self.start, self.end),
        }
    }
}

/// Identity of one aggregate
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    pub window: TimeWindow,
    pub topic: String,
}

/// Fully aggregated count for one (window, topic)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowCount {
    pub window: TimeWindow,
    pub topic: String,
    pub count: u64,
}

impl WindowCount {
    pub fn new(window: TimeWindow, topic: impl Into<String>, count: u64) -> Self {
        Self {
            window,
            topic: topic.into(),
            count,
        }
    }

    pub fn key(&self) -> WindowKey {
        WindowKey {
            window: self.window,
            topic: self.topic.clone(),
        }
    }
}
