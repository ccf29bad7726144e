//! Window assignment for hashtag occurrences

use crate::config::ConfigError;
use crate::model::{TimeWindow, Timestamp};

/// Maps an event time to the windows it belongs to
///
/// Assignment is a pure function of the event time, so arrival order never
/// changes which window an occurrence lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAssigner {
    /// Fixed, non-overlapping windows anchored at the epoch
    Tumbling { size_ms: i64 },
    /// Windows of `size_ms` starting every `slide_ms`
    Sliding { size_ms: i64, slide_ms: i64 },
}

impl WindowAssigner {
    pub fn tumbling(size_ms: i64) -> Result<Self, ConfigError> {
        if size_ms <= 0 {
            return Err(ConfigError::InvalidValue(format!(
                "window size must be positive, got {}ms",
                size_ms
            )));
        }
        Ok(WindowAssigner::Tumbling { size_ms })
    }

    pub fn sliding(size_ms: i64, slide_ms: i64) -> Result<Self, ConfigError> {
        if size_ms <= 0 || slide_ms <= 0 {
            return Err(ConfigError::InvalidValue(format!(
                "window size and slide must be positive, got {}ms/{}ms",
                size_ms, slide_ms
            )));
        }
        if slide_ms == size_ms {
            return Ok(WindowAssigner::Tumbling { size_ms });
        }
        Ok(WindowAssigner::Sliding { size_ms, slide_ms })
    }

    pub fn size_ms(&self) -> i64 {
        match self {
            WindowAssigner::Tumbling { size_ms } => *size_ms,
            WindowAssigner::Sliding { size_ms, .. } => *size_ms,
        }
    }

    /// Windows containing `event_time`, ascending by start
    pub fn assign(&self, event_time: Timestamp) -> Vec<TimeWindow> {
        match *self {
            // bounds saturate at the ends of the i64 range
            WindowAssigner::Tumbling { size_ms } => {
                let start = event_time.saturating_sub(event_time.rem_euclid(size_ms));
                vec![TimeWindow::new(start, start.saturating_add(size_ms))]
            }
            WindowAssigner::Sliding { size_ms, slide_ms } => {
                let last_start = event_time.saturating_sub(event_time.rem_euclid(slide_ms));
                let earliest = event_time.saturating_sub(size_ms);
                let mut windows = Vec::with_capacity((size_ms / slide_ms + 1) as usize);
                let mut start = Some(last_start);
                while let Some(s) = start.filter(|s| *s > earliest) {
                    windows.push(TimeWindow::new(s, s.saturating_add(size_ms)));
                    start = s.checked_sub(slide_ms);
                }
                windows.reverse();
                windows
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            WindowAssigner::Tumbling { size_ms } => format!("tumbling {}ms", size_ms),
            WindowAssigner::Sliding { size_ms, slide_ms } => {
                format!("sliding {}ms every {}ms", size_ms, slide_ms)
            }
        }
    }
}

/// Parse a duration such as `500ms`, `30s`, `5m` or `1h` into milliseconds.
/// A bare integer is taken as milliseconds.
pub fn parse_duration_ms(s: &str) -> Option<i64> {
    let s = s.trim();
    let (digits, multiplier) = if let Some(v) = s.strip_suffix("ms") {
        (v, 1)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1_000)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60 * 1_000)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 60 * 60 * 1_000)
    } else {
        (s, 1)
    };

    digits
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|v| *v >= 0)
        .and_then(|v| v.checked_mul(multiplier))
}
