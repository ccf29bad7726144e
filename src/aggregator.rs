//! Per-(window, topic) counting with watermark-driven window closing
//!
//! The aggregator is owned by a single ingestion path: every `ingest`,
//! `close_ready` and `drain_all` call mutates it through `&mut self`, and
//! closed windows leave it by value.

use crate::model::{HashtagOccurrence, Offset, TimeWindow, Timestamp, WindowCount};
use crate::window::WindowAssigner;
use std::collections::{BTreeMap, HashMap};

/// What happens to an occurrence whose window is already closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatePolicy {
    /// Count it in `late_dropped` and forget it
    Drop,
    /// Keep closed totals for `retention_ms` past the lateness bound and
    /// re-emit the corrected total when a late occurrence lands in them
    Correct { retention_ms: i64 },
}

/// Where watermark progress comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkMode {
    /// Watermark trails the highest event time seen by a fixed bound
    EventTime { max_out_of_orderness_ms: i64 },
    /// Watermark is pushed by the driver's clock through `advance_watermark`
    ProcessingTime,
}

#[derive(Debug, Clone)]
struct OpenWindow {
    counts: HashMap<String, u64>,
    min_offset: Offset,
}

/// A finalized window handed to the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedWindow {
    pub window: TimeWindow,
    /// One entry per topic seen in the window, sorted by topic
    pub counts: Vec<WindowCount>,
    /// Lowest source offset that contributed to this window
    pub min_offset: Offset,
}

/// Result of routing one occurrence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub accepted: usize,
    pub late_dropped: usize,
    pub corrections: Vec<WindowCount>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub open_windows: usize,
    pub open_keys: usize,
    pub windows_closed: u64,
    pub late_dropped: u64,
    pub corrections: u64,
}

pub struct WindowAggregator {
    assigner: WindowAssigner,
    allowed_lateness_ms: i64,
    late_policy: LatePolicy,
    watermark_mode: WatermarkMode,
    open: BTreeMap<TimeWindow, OpenWindow>,
    /// Closed totals kept for corrections (only with `LatePolicy::Correct`)
    retained: BTreeMap<TimeWindow, HashMap<String, u64>>,
    watermark: Option<Timestamp>,
    /// Watermark restored from a previous run's checkpoint
    resumed_at: Option<Timestamp>,
    max_event_time: Option<Timestamp>,
    windows_closed: u64,
    late_dropped: u64,
    corrections: u64,
}

impl WindowAggregator {
    pub fn new(assigner: WindowAssigner) -> Self {
        Self {
            assigner,
            allowed_lateness_ms: 0,
            late_policy: LatePolicy::Drop,
            watermark_mode: WatermarkMode::EventTime {
                max_out_of_orderness_ms: 0,
            },
            open: BTreeMap::new(),
            retained: BTreeMap::new(),
            watermark: None,
            resumed_at: None,
            max_event_time: None,
            windows_closed: 0,
            late_dropped: 0,
            corrections: 0,
        }
    }

    pub fn with_allowed_lateness(mut self, allowed_lateness_ms: i64) -> Self {
        self.allowed_lateness_ms = allowed_lateness_ms.max(0);
        self
    }

    pub fn with_late_policy(mut self, late_policy: LatePolicy) -> Self {
        self.late_policy = late_policy;
        self
    }

    pub fn with_watermark_mode(mut self, watermark_mode: WatermarkMode) -> Self {
        self.watermark_mode = watermark_mode;
        self
    }

    /// Start from the watermark a previous run committed. Windows it had
    /// already closed stay closed, so replayed occurrences for them are late.
    pub fn with_initial_watermark(mut self, watermark: Timestamp) -> Self {
        self.advance_watermark(watermark);
        self.resumed_at = Some(watermark);
        self
    }

    pub fn assigner(&self) -> &WindowAssigner {
        &self.assigner
    }

    pub fn watermark_mode(&self) -> WatermarkMode {
        self.watermark_mode
    }

    pub fn watermark(&self) -> Option<Timestamp> {
        self.watermark
    }

    /// Route one occurrence into every window it is assigned to
    ///
    /// The lateness check uses the watermark as it stood before this
    /// occurrence; in event-time mode the occurrence then moves it forward.
    pub fn ingest(&mut self, offset: Offset, occurrence: &HashtagOccurrence) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();

        for window in self.assigner.assign(occurrence.event_time) {
            if self.is_closed(&window) {
                self.handle_late(window, offset, &occurrence.topic, &mut outcome);
                continue;
            }

            let open = self.open.entry(window).or_insert_with(|| OpenWindow {
                counts: HashMap::new(),
                min_offset: offset,
            });
            open.min_offset = open.min_offset.min(offset);
            *open.counts.entry(occurrence.topic.clone()).or_insert(0) += 1;
            outcome.accepted += 1;
        }

        if let WatermarkMode::EventTime {
            max_out_of_orderness_ms,
        } = self.watermark_mode
        {
            let max_seen = self
                .max_event_time
                .map_or(occurrence.event_time, |t| t.max(occurrence.event_time));
            self.max_event_time = Some(max_seen);
            self.advance_watermark(max_seen.saturating_sub(max_out_of_orderness_ms));
        }

        outcome
    }

    fn handle_late(
        &mut self,
        window: TimeWindow,
        offset: Offset,
        topic: &str,
        outcome: &mut IngestOutcome,
    ) {
        if let LatePolicy::Correct { retention_ms } = self.late_policy {
            // past its bound but not yet emitted: the close itself carries the correction
            if let Some(open) = self.open.get_mut(&window) {
                open.min_offset = open.min_offset.min(offset);
                *open.counts.entry(topic.to_string()).or_insert(0) += 1;
                self.corrections += 1;
                return;
            }
            // a window finalized before the restart has no known total to correct
            if self.within_retention(&window, retention_ms)
                && (self.retained.contains_key(&window) || !self.closed_before_resume(&window))
            {
                let total = self
                    .retained
                    .entry(window)
                    .or_default()
                    .entry(topic.to_string())
                    .or_insert(0);
                *total += 1;
                self.corrections += 1;
                outcome
                    .corrections
                    .push(WindowCount::new(window, topic, *total));
                log::debug!("Late occurrence for {} in {}, corrected to {}", topic, window, total);
                return;
            }
        }

        self.late_dropped += 1;
        outcome.late_dropped += 1;
        log::debug!(
            "Late occurrence for {} in {} dropped (watermark: {:?})",
            topic,
            window,
            self.watermark
        );
    }

    /// Move the watermark forward; regressions are ignored.
    /// Returns true if the watermark moved.
    pub fn advance_watermark(&mut self, ts: Timestamp) -> bool {
        match self.watermark {
            Some(current) if ts <= current => false,
            _ => {
                self.watermark = Some(ts);
                true
            }
        }
    }

    /// Watermark at which `window` closes: `window.end + allowed_lateness`
    pub fn close_bound(&self, window: &TimeWindow) -> Timestamp {
        window.end.saturating_add(self.allowed_lateness_ms)
    }

    fn closed_before_resume(&self, window: &TimeWindow) -> bool {
        self.resumed_at
            .map_or(false, |wm| wm >= self.close_bound(window))
    }

    /// The watermark has passed `window.end + allowed_lateness`
    pub fn is_closed(&self, window: &TimeWindow) -> bool {
        self.watermark
            .map_or(false, |wm| wm >= self.close_bound(window))
    }

    fn within_retention(&self, window: &TimeWindow, retention_ms: i64) -> bool {
        self.watermark.map_or(true, |wm| {
            wm < self.close_bound(window).saturating_add(retention_ms)
        })
    }

    /// Close every window whose lateness bound the watermark has passed
    pub fn close_ready(&mut self) -> Vec<ClosedWindow> {
        let ready: Vec<TimeWindow> = self
            .open
            .keys()
            .filter(|w| self.is_closed(w))
            .copied()
            .collect();

        let closed = ready
            .into_iter()
            .filter_map(|w| self.close_window(w))
            .collect();
        self.prune_retained();
        closed
    }

    /// Close all open windows immediately, ignoring the lateness bound
    ///
    /// The watermark jumps to the highest bound drained, so anything that
    /// arrives for those windows afterwards is late.
    pub fn drain_all(&mut self) -> Vec<ClosedWindow> {
        let all: Vec<TimeWindow> = self.open.keys().copied().collect();
        if let Some(bound) = all.iter().map(|w| self.close_bound(w)).max() {
            self.advance_watermark(bound);
        }
        all.into_iter()
            .filter_map(|w| self.close_window(w))
            .collect()
    }

    fn close_window(&mut self, window: TimeWindow) -> Option<ClosedWindow> {
        let open = self.open.remove(&window)?;
        self.windows_closed += 1;

        let mut counts: Vec<WindowCount> = open
            .counts
            .iter()
            .map(|(topic, count)| WindowCount::new(window, topic.clone(), *count))
            .collect();
        counts.sort_by(|a, b| a.topic.cmp(&b.topic));

        if matches!(self.late_policy, LatePolicy::Correct { .. }) {
            self.retained.insert(window, open.counts);
        }

        log::debug!("Closed window {} with {} topics", window, counts.len());

        Some(ClosedWindow {
            window,
            counts,
            min_offset: open.min_offset,
        })
    }

    fn prune_retained(&mut self) {
        let LatePolicy::Correct { retention_ms } = self.late_policy else {
            return;
        };
        let Some(wm) = self.watermark else {
            return;
        };
        let lateness = self.allowed_lateness_ms;
        self.retained.retain(|w, _| {
            wm < w
                .end
                .saturating_add(lateness)
                .saturating_add(retention_ms)
        });
    }

    /// Lowest source offset still held by an open window
    pub fn oldest_open_offset(&self) -> Option<Offset> {
        self.open.values().map(|w| w.min_offset).min()
    }

    /// Current in-progress count for an open (window, topic)
    pub fn open_count(&self, window: &TimeWindow, topic: &str) -> Option<u64> {
        self.open.get(window)?.counts.get(topic).copied()
    }

    /// Total retained for a closed (window, topic) under `LatePolicy::Correct`
    pub fn retained_count(&self, window: &TimeWindow, topic: &str) -> Option<u64> {
        self.retained.get(window)?.get(topic).copied()
    }

    pub fn has_open_windows(&self) -> bool {
        !self.open.is_empty()
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            open_windows: self.open.len(),
            open_keys: self.open.values().map(|w| w.counts.len()).sum(),
            windows_closed: self.windows_closed,
            late_dropped: self.late_dropped,
            corrections: self.corrections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: i64 = 60_000;

    fn occ(topic: &str, secs: i64) -> HashtagOccurrence {
        HashtagOccurrence::new(topic, secs * 1_000)
    }

    fn processing_time_aggregator() -> WindowAggregator {
        WindowAggregator::new(WindowAssigner::tumbling(MINUTE).unwrap())
            .with_watermark_mode(WatermarkMode::ProcessingTime)
    }

    #[test]
    fn test_counts_per_window_and_topic() {
        let mut agg = processing_time_aggregator();
        for (i, t) in [5, 10, 55].iter().enumerate() {
            agg.ingest(i as u64, &occ("foo", *t));
        }
        agg.ingest(3, &occ("bar", 30));

        let w = TimeWindow::new(0, MINUTE);
        assert_eq!(agg.open_count(&w, "foo"), Some(3));
        assert_eq!(agg.open_count(&w, "bar"), Some(1));

        assert!(agg.close_ready().is_empty(), "no watermark yet");

        agg.advance_watermark(MINUTE);
        let closed = agg.close_ready();
        assert_eq!(closed.len(), 1);
        assert_eq!(
            closed[0].counts,
            vec![WindowCount::new(w, "bar", 1), WindowCount::new(w, "foo", 3)]
        );
        assert_eq!(closed[0].min_offset, 0);
        assert!(!agg.has_open_windows());
    }

    #[test]
    fn test_order_independence() {
        let events = [
            occ("foo", 1),
            occ("bar", 2),
            occ("foo", 59),
            occ("foo", 30),
            occ("baz", 61),
            occ("bar", 0),
        ];

        let run = |order: &[usize]| {
            let mut agg = processing_time_aggregator();
            for (offset, idx) in order.iter().enumerate() {
                agg.ingest(offset as u64, &events[*idx]);
            }
            agg.advance_watermark(10 * MINUTE);
            let mut counts: Vec<WindowCount> =
                agg.close_ready().into_iter().flat_map(|c| c.counts).collect();
            counts.sort_by(|a, b| (a.window, &a.topic).cmp(&(b.window, &b.topic)));
            counts
        };

        let forward = run(&[0, 1, 2, 3, 4, 5]);
        let reversed = run(&[5, 4, 3, 2, 1, 0]);
        let shuffled = run(&[3, 0, 5, 1, 4, 2]);
        assert_eq!(forward, reversed);
        assert_eq!(forward, shuffled);
        assert_eq!(forward.len(), 3);
    }

    #[test]
    fn test_late_occurrence_dropped() {
        let mut agg = processing_time_aggregator();
        agg.ingest(0, &occ("foo", 5));
        agg.ingest(1, &occ("foo", 65));
        agg.advance_watermark(61_000);
        let closed = agg.close_ready();
        assert_eq!(closed.len(), 1);

        let outcome = agg.ingest(2, &occ("bar", 59));
        assert_eq!(outcome.accepted, 0);
        assert_eq!(outcome.late_dropped, 1);
        assert!(outcome.corrections.is_empty());
        assert_eq!(agg.stats().late_dropped, 1);

        let next = TimeWindow::new(MINUTE, 2 * MINUTE);
        assert_eq!(agg.open_count(&next, "foo"), Some(1));
        assert_eq!(agg.open_count(&next, "bar"), None);
    }

    #[test]
    fn test_allowed_lateness_keeps_window_open() {
        let mut agg = processing_time_aggregator().with_allowed_lateness(10_000);
        agg.ingest(0, &occ("foo", 5));
        agg.advance_watermark(65_000);
        assert!(agg.close_ready().is_empty());

        let outcome = agg.ingest(1, &occ("foo", 50));
        assert_eq!(outcome.accepted, 1);

        agg.advance_watermark(70_000);
        let closed = agg.close_ready();
        assert_eq!(closed[0].counts[0].count, 2);
    }

    #[test]
    fn test_correct_policy_reemits_total() {
        let mut agg = processing_time_aggregator().with_late_policy(LatePolicy::Correct {
            retention_ms: 5 * MINUTE,
        });
        agg.ingest(0, &occ("foo", 5));
        agg.ingest(1, &occ("foo", 10));
        agg.advance_watermark(MINUTE);
        agg.close_ready();

        let outcome = agg.ingest(2, &occ("foo", 20));
        assert_eq!(
            outcome.corrections,
            vec![WindowCount::new(TimeWindow::new(0, MINUTE), "foo", 3)]
        );

        let outcome = agg.ingest(3, &occ("bar", 20));
        assert_eq!(outcome.corrections[0].count, 1);
        assert_eq!(agg.retained_count(&TimeWindow::new(0, MINUTE), "foo"), Some(3));
        assert_eq!(agg.stats().corrections, 2);
        assert_eq!(agg.stats().late_dropped, 0);
    }

    #[test]
    fn test_correct_policy_retention_expires() {
        let mut agg = processing_time_aggregator().with_late_policy(LatePolicy::Correct {
            retention_ms: MINUTE,
        });
        agg.ingest(0, &occ("foo", 5));
        agg.advance_watermark(MINUTE);
        agg.close_ready();

        agg.advance_watermark(3 * MINUTE);
        agg.close_ready();

        let outcome = agg.ingest(1, &occ("foo", 20));
        assert!(outcome.corrections.is_empty());
        assert_eq!(outcome.late_dropped, 1);
    }

    #[test]
    fn test_lateness_is_judged_before_close_ready_runs() {
        let event_time = || {
            WindowAggregator::new(WindowAssigner::tumbling(MINUTE).unwrap())
                .with_watermark_mode(WatermarkMode::EventTime {
                    max_out_of_orderness_ms: 0,
                })
        };
        let w = TimeWindow::new(0, MINUTE);

        let mut agg = event_time();
        agg.ingest(0, &occ("foo", 5));
        agg.ingest(1, &occ("foo", 61));
        let outcome = agg.ingest(2, &occ("bar", 30));
        assert_eq!(outcome.late_dropped, 1);
        assert_eq!(agg.open_count(&w, "bar"), None);

        let mut agg = event_time().with_late_policy(LatePolicy::Correct {
            retention_ms: MINUTE,
        });
        agg.ingest(0, &occ("foo", 5));
        agg.ingest(1, &occ("foo", 61));
        let outcome = agg.ingest(2, &occ("foo", 30));
        assert!(outcome.corrections.is_empty());
        assert_eq!(agg.stats().corrections, 1);

        let closed = agg.close_ready();
        assert_eq!(closed[0].counts, vec![WindowCount::new(w, "foo", 2)]);
        assert_eq!(agg.retained_count(&w, "foo"), Some(2));
    }

    #[test]
    fn test_event_time_watermark_closes_windows() {
        let mut agg = WindowAggregator::new(WindowAssigner::tumbling(MINUTE).unwrap())
            .with_watermark_mode(WatermarkMode::EventTime {
                max_out_of_orderness_ms: 5_000,
            });
        agg.ingest(0, &occ("foo", 30));
        agg.ingest(1, &occ("foo", 62));
        assert!(agg.close_ready().is_empty(), "watermark is 57s");

        // still on time: within the out-of-orderness bound
        let outcome = agg.ingest(2, &occ("foo", 58));
        assert_eq!(outcome.accepted, 1);

        agg.ingest(3, &occ("foo", 66));
        let closed = agg.close_ready();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].counts[0].count, 2);
        assert_eq!(agg.watermark(), Some(61_000));
    }

    #[test]
    fn test_watermark_never_regresses() {
        let mut agg = processing_time_aggregator();
        assert!(agg.advance_watermark(100));
        assert!(!agg.advance_watermark(50));
        assert_eq!(agg.watermark(), Some(100));
    }

    #[test]
    fn test_drain_ignores_lateness() {
        let mut agg = processing_time_aggregator().with_allowed_lateness(MINUTE);
        agg.ingest(0, &occ("baz", 5));
        agg.ingest(1, &occ("baz", 6));
        agg.ingest(2, &occ("foo", 70));

        let drained = agg.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].counts, vec![WindowCount::new(TimeWindow::new(0, MINUTE), "baz", 2)]);
        assert_eq!(agg.stats().open_windows, 0);
        assert_eq!(agg.stats().windows_closed, 2);
        assert_eq!(agg.watermark(), Some(3 * MINUTE));

        let outcome = agg.ingest(3, &occ("baz", 7));
        assert_eq!(outcome.late_dropped, 1);
        assert!(!agg.has_open_windows());
    }

    #[test]
    fn test_initial_watermark_keeps_finished_windows_closed() {
        let mut agg = WindowAggregator::new(WindowAssigner::tumbling(MINUTE).unwrap())
            .with_watermark_mode(WatermarkMode::EventTime {
                max_out_of_orderness_ms: 30_000,
            })
            .with_initial_watermark(65_000);

        let outcome = agg.ingest(1, &occ("bar", 70));
        assert_eq!(outcome.accepted, 1);
        let outcome = agg.ingest(2, &occ("foo", 20));
        assert_eq!(outcome.late_dropped, 1);
        assert_eq!(agg.open_count(&TimeWindow::new(0, MINUTE), "foo"), None);

        // the seeded watermark still only moves forward
        agg.ingest(3, &occ("bar", 80));
        assert_eq!(agg.watermark(), Some(65_000));
    }

    #[test]
    fn test_correct_policy_drops_late_data_for_windows_closed_before_resume() {
        let w = TimeWindow::new(0, MINUTE);
        let mut agg = processing_time_aggregator()
            .with_late_policy(LatePolicy::Correct {
                retention_ms: 10 * MINUTE,
            })
            .with_initial_watermark(61_000);

        let outcome = agg.ingest(4, &occ("foo", 30));
        assert!(outcome.corrections.is_empty());
        assert_eq!(outcome.late_dropped, 1);
        assert_eq!(agg.retained_count(&w, "foo"), None);

        // windows first closed in this run are still corrected
        agg.ingest(5, &occ("foo", 70));
        agg.advance_watermark(2 * MINUTE);
        agg.close_ready();
        let outcome = agg.ingest(6, &occ("foo", 90));
        assert_eq!(
            outcome.corrections,
            vec![WindowCount::new(TimeWindow::new(MINUTE, 2 * MINUTE), "foo", 2)]
        );
    }

    #[test]
    fn test_sliding_windows_count_each_overlap() {
        let mut agg = WindowAggregator::new(WindowAssigner::sliding(MINUTE, 30_000).unwrap())
            .with_watermark_mode(WatermarkMode::ProcessingTime);
        let outcome = agg.ingest(0, &occ("foo", 45));
        assert_eq!(outcome.accepted, 2);
        assert_eq!(agg.open_count(&TimeWindow::new(0, MINUTE), "foo"), Some(1));
        assert_eq!(agg.open_count(&TimeWindow::new(30_000, 90_000), "foo"), Some(1));
    }

    #[test]
    fn test_oldest_open_offset_tracks_min() {
        let mut agg = processing_time_aggregator();
        agg.ingest(7, &occ("foo", 5));
        agg.ingest(3, &occ("foo", 6));
        agg.ingest(9, &occ("foo", 65));
        assert_eq!(agg.oldest_open_offset(), Some(3));

        agg.advance_watermark(MINUTE);
        agg.close_ready();
        assert_eq!(agg.oldest_open_offset(), Some(9));
    }
}
