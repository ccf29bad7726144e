//! Pipeline driver - pulls occurrences, aggregates them, persists closed windows
//!
//! Main loop:
//! 1. Collects write reports from the writer pool (acks, replays, failures)
//! 2. Pauses ingestion while `max_pending_writes` batches are unacknowledged
//! 3. On each flush tick, advances a processing-time watermark and closes ready windows
//! 4. Pulls a batch from the source and feeds every record to the aggregator
//! 5. Commits the source offset once nothing at or below it is still pending,
//!    together with the highest watermark whose closed windows are all stored
//!
//! A restart seeds the aggregator with that watermark, so records replayed
//! after the committed offset cannot reopen a window that was already stored.
//!
//! On shutdown (or when the source is exhausted) the driver drains: every
//! open window is closed regardless of lateness, all writes are awaited, the
//! final offset is committed and the state moves to `Stopped`. A fatal sink
//! or source error moves it to `Failed` without committing past the last
//! acknowledged write.

use super::state::{PipelineState, ShutdownHandle};
use super::tracker::OffsetTracker;
use crate::aggregator::{ClosedWindow, WatermarkMode, WindowAggregator};
use crate::model::{Offset, TimeWindow, Timestamp, WindowCount};
use crate::sink::{ExponentialBackoff, SinkError, SinkWriter, WriteJob, WriteReport, WriterPool};
use crate::source::{OccurrenceSource, SourceError, SourceRecord};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub pull_batch_size: usize,
    pub flush_interval: Duration,
    /// Sleep between pulls when the source has nothing ready
    pub poll_interval: Duration,
    pub writer_workers: usize,
    /// Unacknowledged write batches allowed before ingestion pauses
    pub max_pending_writes: usize,
    /// Times a batch that exhausted its sink retries is re-queued
    pub max_batch_replays: u32,
    pub source_retry_initial_ms: u64,
    pub source_retry_max_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            pull_batch_size: 500,
            flush_interval: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(100),
            writer_workers: 4,
            max_pending_writes: 64,
            max_batch_replays: 3,
            source_retry_initial_ms: 100,
            source_retry_max_ms: 10_000,
        }
    }
}

/// Final tallies of one `run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub state: PipelineState,
    pub records_ingested: u64,
    pub windows_closed: u64,
    pub rows_written: u64,
    pub late_dropped: u64,
    pub corrections: u64,
    pub committed_offset: Option<Offset>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("writer pool stopped with writes still pending")]
    WriterPoolClosed,
}

type Clock = Box<dyn Fn() -> Timestamp + Send + Sync>;

pub struct PipelineDriver<S> {
    config: DriverConfig,
    source: S,
    aggregator: WindowAggregator,
    writer: Arc<SinkWriter>,
    committed: Option<Offset>,
    now_fn: Clock,
    state_tx: watch::Sender<PipelineState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl<S: OccurrenceSource> PipelineDriver<S> {
    pub fn new(
        config: DriverConfig,
        source: S,
        aggregator: WindowAggregator,
        writer: Arc<SinkWriter>,
    ) -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Starting);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            source,
            aggregator,
            writer,
            committed: None,
            now_fn: Box::new(|| chrono::Utc::now().timestamp_millis()),
            state_tx,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Replace the wall clock used for processing-time watermarks
    pub fn with_clock<F>(mut self, now_fn: F) -> Self
    where
        F: Fn() -> Timestamp + Send + Sync + 'static,
    {
        self.now_fn = Box::new(now_fn);
        self
    }

    /// Offset the source already has committed; commits never go below it
    pub fn with_committed_offset(mut self, committed: Option<Offset>) -> Self {
        self.committed = committed;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.shutdown_tx.clone())
    }

    pub fn state_watch(&self) -> watch::Receiver<PipelineState> {
        self.state_tx.subscribe()
    }

    pub async fn run(self) -> Result<PipelineReport, PipelineError> {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let pool = WriterPool::spawn(
            self.writer.clone(),
            self.config.writer_workers,
            self.config.max_pending_writes,
            report_tx,
        );

        let resume_watermark = self.source.resume_watermark();
        let aggregator = match resume_watermark {
            Some(wm) => self.aggregator.with_initial_watermark(wm),
            None => self.aggregator,
        };

        let mut core = DriverCore {
            shutdown_rx: self.shutdown_tx.subscribe(),
            _shutdown_tx: self.shutdown_tx,
            config: self.config,
            source: self.source,
            aggregator,
            pool,
            reports: report_rx,
            tracker: OffsetTracker::new(self.committed, resume_watermark),
            inflight: HashMap::new(),
            next_batch_id: 0,
            now_fn: self.now_fn,
            state_tx: self.state_tx,
            records_ingested: 0,
            rows_written: 0,
        };

        core.set_state(PipelineState::Running);
        log::info!("🚀 Pipeline running");
        log::info!("   ├─ Windows: {}", core.aggregator.assigner().describe());
        log::info!("   ├─ Watermark: {:?}", core.aggregator.watermark_mode());
        if let Some(wm) = resume_watermark {
            log::info!("   ├─ Resumed watermark: {}", wm);
        }
        log::info!("   ├─ Writer workers: {}", core.pool.workers());
        log::info!("   └─ Max pending writes: {}", core.config.max_pending_writes);

        let result = match core.run_loop().await {
            Ok(()) => core.drain().await,
            Err(e) => Err(e),
        };

        let final_state = match result {
            Ok(()) => PipelineState::Stopped,
            Err(_) => PipelineState::Failed,
        };
        core.set_state(final_state);
        let report = core.report(final_state);

        let DriverCore { pool, reports, .. } = core;
        pool.shutdown().await;
        drop(reports);

        match result {
            Ok(()) => {
                log::info!("✅ Pipeline stopped");
                log::info!("   ├─ Records ingested: {}", report.records_ingested);
                log::info!("   ├─ Windows closed: {}", report.windows_closed);
                log::info!("   ├─ Rows written: {}", report.rows_written);
                log::info!("   ├─ Late dropped: {}", report.late_dropped);
                log::info!("   ├─ Corrections: {}", report.corrections);
                log::info!("   └─ Committed offset: {:?}", report.committed_offset);
                Ok(report)
            }
            Err(e) => {
                log::error!("❌ Pipeline failed: {}", e);
                log::error!("   └─ Committed offset: {:?}", report.committed_offset);
                Err(e)
            }
        }
    }
}

struct Inflight {
    job: WriteJob,
    replays: u32,
}

struct DriverCore<S> {
    config: DriverConfig,
    source: S,
    aggregator: WindowAggregator,
    pool: WriterPool,
    reports: mpsc::UnboundedReceiver<WriteReport>,
    tracker: OffsetTracker,
    inflight: HashMap<u64, Inflight>,
    next_batch_id: u64,
    now_fn: Clock,
    state_tx: watch::Sender<PipelineState>,
    shutdown_rx: watch::Receiver<bool>,
    _shutdown_tx: Arc<watch::Sender<bool>>,
    records_ingested: u64,
    rows_written: u64,
}

impl<S: OccurrenceSource> DriverCore<S> {
    fn set_state(&self, next: PipelineState) {
        let current = *self.state_tx.borrow();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            log::warn!("⚠️  Ignoring state change {} → {}", current, next);
            return;
        }
        self.state_tx.send_replace(next);
        log::info!("Pipeline state: {} → {}", current, next);
    }

    fn shutdown_requested(&mut self) -> bool {
        *self.shutdown_rx.borrow_and_update()
    }

    async fn run_loop(&mut self) -> Result<(), PipelineError> {
        let mut last_flush = Instant::now();
        let mut last_log = Instant::now();
        let mut ingested_at_last_log = 0u64;
        let mut source_backoff = ExponentialBackoff::unbounded(
            self.config.source_retry_initial_ms,
            self.config.source_retry_max_ms,
        );

        loop {
            self.process_ready_reports().await?;

            if self.shutdown_requested() {
                log::info!("⚠️  Shutdown requested, draining");
                return Ok(());
            }

            if self.inflight.len() >= self.config.max_pending_writes {
                log::debug!(
                    "Backpressure: {} write batches pending, ingestion paused",
                    self.inflight.len()
                );
                self.wait_for_report(true).await?;
                continue;
            }

            if last_flush.elapsed() >= self.config.flush_interval {
                self.on_flush_tick().await?;
                last_flush = Instant::now();
            }

            if last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
                let ingested = self.records_ingested - ingested_at_last_log;
                let rate = ingested as f64 / last_log.elapsed().as_secs_f64();
                let stats = self.aggregator.stats();
                log::info!(
                    "📊 Ingestion rate: {:.1} occurrences/sec (total: {}, open windows: {}, pending writes: {})",
                    rate,
                    self.records_ingested,
                    stats.open_windows,
                    self.inflight.len()
                );
                ingested_at_last_log = self.records_ingested;
                last_log = Instant::now();
            }

            match self.source.pull(self.config.pull_batch_size).await {
                Ok(records) if records.is_empty() => {
                    source_backoff.reset();
                    if self.source.is_finished() {
                        log::info!("📭 Source exhausted, draining");
                        return Ok(());
                    }
                    self.idle().await;
                }
                Ok(records) => {
                    source_backoff.reset();
                    self.ingest_batch(records).await?;
                }
                Err(SourceError::Unavailable(msg)) => {
                    log::warn!("⚠️  Source unavailable, ingestion paused: {}", msg);
                    tokio::select! {
                        _ = source_backoff.sleep() => {}
                        _ = self.shutdown_rx.changed() => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Sleep for the poll interval, waking early on shutdown
    async fn idle(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = self.shutdown_rx.changed() => {}
        }
    }

    async fn on_flush_tick(&mut self) -> Result<(), PipelineError> {
        if self.aggregator.watermark_mode() == WatermarkMode::ProcessingTime {
            let now = (self.now_fn)();
            self.aggregator.advance_watermark(now);
        }

        let closed = self.aggregator.close_ready();
        if !closed.is_empty() {
            log::debug!(
                "Flush tick closed {} windows (watermark: {:?})",
                closed.len(),
                self.aggregator.watermark()
            );
        }
        self.dispatch_closed(closed).await?;
        self.try_commit().await
    }

    async fn ingest_batch(&mut self, records: Vec<SourceRecord>) -> Result<(), PipelineError> {
        // window → (topic → latest corrected total, lowest contributing offset)
        let mut corrections: BTreeMap<TimeWindow, (BTreeMap<String, u64>, Offset)> =
            BTreeMap::new();

        for record in records {
            self.tracker.observe_pulled(record.offset);
            let outcome = self.aggregator.ingest(record.offset, &record.occurrence);
            self.records_ingested += 1;

            for correction in outcome.corrections {
                let entry = corrections
                    .entry(correction.window)
                    .or_insert_with(|| (BTreeMap::new(), record.offset));
                entry.1 = entry.1.min(record.offset);
                entry.0.insert(correction.topic, correction.count);
            }
        }

        for (window, (topics, min_offset)) in corrections {
            let counts = topics
                .into_iter()
                .map(|(topic, count)| WindowCount::new(window, topic, count))
                .collect();
            log::debug!("🔄 Emitting correction for {}", window);
            self.dispatch(window, counts, min_offset).await?;
        }

        if matches!(
            self.aggregator.watermark_mode(),
            WatermarkMode::EventTime { .. }
        ) {
            let closed = self.aggregator.close_ready();
            self.dispatch_closed(closed).await?;
        }

        self.try_commit().await
    }

    async fn dispatch_closed(&mut self, closed: Vec<ClosedWindow>) -> Result<(), PipelineError> {
        for window in closed {
            self.dispatch(window.window, window.counts, window.min_offset)
                .await?;
        }
        Ok(())
    }

    async fn dispatch(
        &mut self,
        window: TimeWindow,
        counts: Vec<WindowCount>,
        min_offset: Offset,
    ) -> Result<(), PipelineError> {
        if counts.is_empty() {
            return Ok(());
        }

        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        let job = WriteJob {
            batch_id,
            window,
            counts,
        };

        let close_bound = self.aggregator.close_bound(&window);
        self.tracker.begin_batch(batch_id, min_offset, close_bound);
        self.inflight.insert(
            batch_id,
            Inflight {
                job: job.clone(),
                replays: 0,
            },
        );
        self.pool
            .dispatch(job)
            .await
            .map_err(|_| PipelineError::WriterPoolClosed)
    }

    async fn process_ready_reports(&mut self) -> Result<(), PipelineError> {
        let mut handled = false;
        while let Ok(report) = self.reports.try_recv() {
            self.handle_report(report).await?;
            handled = true;
        }
        if handled {
            self.try_commit().await?;
        }
        Ok(())
    }

    /// Wait for the next write report; with `interruptible`, a shutdown
    /// request ends the wait early
    async fn wait_for_report(&mut self, interruptible: bool) -> Result<(), PipelineError> {
        let report = if interruptible {
            tokio::select! {
                report = self.reports.recv() => report,
                _ = self.shutdown_rx.changed() => return Ok(()),
            }
        } else {
            self.reports.recv().await
        };

        match report {
            Some(report) => {
                self.handle_report(report).await?;
                self.try_commit().await
            }
            None => Err(PipelineError::WriterPoolClosed),
        }
    }

    async fn handle_report(&mut self, report: WriteReport) -> Result<(), PipelineError> {
        let Some(mut inflight) = self.inflight.remove(&report.batch_id) else {
            log::warn!("⚠️  Report for unknown write batch {}", report.batch_id);
            return Ok(());
        };

        match report.result {
            Ok(()) => {
                self.tracker.complete_batch(report.batch_id);
                self.rows_written += report.rows as u64;
                Ok(())
            }
            Err(SinkError::Fatal(e)) => {
                log::error!(
                    "❌ Fatal sink error on batch {} (window {}): {}",
                    report.batch_id,
                    inflight.job.window,
                    e
                );
                Err(SinkError::Fatal(e).into())
            }
            Err(err) => {
                if inflight.replays >= self.config.max_batch_replays {
                    log::error!(
                        "❌ Batch {} (window {}) still failing after {} replays: {}",
                        report.batch_id,
                        inflight.job.window,
                        inflight.replays,
                        err
                    );
                    return Err(err.into());
                }

                inflight.replays += 1;
                self.refresh_corrected_totals(&mut inflight.job);
                log::warn!(
                    "🔄 Replaying batch {} (window {}, replay {} of {}): {}",
                    report.batch_id,
                    inflight.job.window,
                    inflight.replays,
                    self.config.max_batch_replays,
                    err
                );

                let job = inflight.job.clone();
                self.inflight.insert(report.batch_id, inflight);
                self.pool
                    .dispatch(job)
                    .await
                    .map_err(|_| PipelineError::WriterPoolClosed)
            }
        }
    }

    /// A replayed batch must not regress a total that a later correction raised
    fn refresh_corrected_totals(&self, job: &mut WriteJob) {
        for count in job.counts.iter_mut() {
            if let Some(total) = self.aggregator.retained_count(&count.window, &count.topic) {
                count.count = count.count.max(total);
            }
        }
    }

    async fn try_commit(&mut self) -> Result<(), PipelineError> {
        self.tracker.advance_frontier(self.aggregator.watermark());
        let Some(offset) = self
            .tracker
            .safe_commit(self.aggregator.oldest_open_offset())
        else {
            return Ok(());
        };

        match self.source.commit(offset, self.tracker.frontier()).await {
            Ok(()) => {
                self.tracker.mark_committed(offset);
                log::debug!("Committed source offset {}", offset);
                Ok(())
            }
            Err(SourceError::Unavailable(msg)) => {
                log::warn!("⚠️  Offset commit failed, will retry: {}", msg);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn drain(&mut self) -> Result<(), PipelineError> {
        self.set_state(PipelineState::Draining);

        let closed = self.aggregator.drain_all();
        log::info!(
            "🔄 Draining: {} open windows, {} pending writes",
            closed.len(),
            self.inflight.len()
        );
        self.dispatch_closed(closed).await?;

        while !self.inflight.is_empty() {
            self.wait_for_report(false).await?;
        }
        self.try_commit().await
    }

    fn report(&self, state: PipelineState) -> PipelineReport {
        let stats = self.aggregator.stats();
        PipelineReport {
            state,
            records_ingested: self.records_ingested,
            windows_closed: stats.windows_closed,
            rows_written: self.rows_written,
            late_dropped: stats.late_dropped,
            corrections: stats.corrections,
            committed_offset: self.tracker.committed(),
        }
    }
}
