//! Writer worker pool
//!
//! Each worker owns one bounded queue. Jobs are routed by window, so every
//! write for a given window (its first close and any later correction) is
//! applied in dispatch order by the same worker. Different windows proceed
//! concurrently.

use super::{SinkError, SinkWriter};
use crate::model::{TimeWindow, WindowCount};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One batch of counts for a single window
#[derive(Debug, Clone)]
pub struct WriteJob {
    pub batch_id: u64,
    pub window: TimeWindow,
    pub counts: Vec<WindowCount>,
}

/// Outcome of one job, sent back to the driver
#[derive(Debug)]
pub struct WriteReport {
    pub batch_id: u64,
    pub rows: usize,
    pub result: Result<(), SinkError>,
}

pub struct WriterPool {
    senders: Vec<mpsc::Sender<WriteJob>>,
    handles: Vec<JoinHandle<()>>,
}

impl WriterPool {
    /// Spawn `workers` tasks, each with a queue of `queue_capacity` jobs
    pub fn spawn(
        writer: Arc<SinkWriter>,
        workers: usize,
        queue_capacity: usize,
        reports: mpsc::UnboundedSender<WriteReport>,
    ) -> Self {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let (tx, rx) = mpsc::channel::<WriteJob>(queue_capacity.max(1));
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(
                worker_id,
                rx,
                writer.clone(),
                reports.clone(),
            )));
        }

        log::info!(
            "🚀 Writer pool started: {} workers → {}",
            workers,
            writer.backend_type()
        );

        Self { senders, handles }
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    fn route(&self, window: &TimeWindow) -> usize {
        let mut hasher = DefaultHasher::new();
        window.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Queue a job; waits while the target worker's queue is full.
    /// Returns the job back if the worker is gone.
    pub async fn dispatch(&self, job: WriteJob) -> Result<(), WriteJob> {
        let idx = self.route(&job.window);
        self.senders[idx].send(job).await.map_err(|e| e.0)
    }

    /// Close every queue and wait for the workers to finish what they hold
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(e) = handle.await {
                log::error!("❌ Writer worker panicked: {}", e);
            }
        }
        log::info!("✅ Writer pool stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    mut rx: mpsc::Receiver<WriteJob>,
    writer: Arc<SinkWriter>,
    reports: mpsc::UnboundedSender<WriteReport>,
) {
    while let Some(job) = rx.recv().await {
        let rows = job.counts.len();
        let result = writer.upsert_batch(&job.counts).await;

        match &result {
            Ok(()) => log::debug!(
                "✅ Worker {} wrote batch {} ({} rows, window {})",
                worker_id,
                job.batch_id,
                rows,
                job.window
            ),
            Err(e) => log::error!(
                "❌ Worker {} failed batch {} (window {}): {}",
                worker_id,
                job.batch_id,
                job.window,
                e
            ),
        }

        let report = WriteReport {
            batch_id: job.batch_id,
            rows,
            result,
        };
        if reports.send(report).is_err() {
            log::warn!("⚠️  Report channel closed, worker {} stopping", worker_id);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemoryStore, RetryPolicy};

    #[tokio::test]
    async fn test_pool_writes_and_reports() {
        let store = Arc::new(MemoryStore::new());
        let writer = Arc::new(SinkWriter::new(store.clone(), RetryPolicy::default()));
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let pool = WriterPool::spawn(writer, 3, 4, report_tx);

        for i in 0..6i64 {
            let window = TimeWindow::new(i * 60_000, (i + 1) * 60_000);
            let job = WriteJob {
                batch_id: i as u64,
                window,
                counts: vec![WindowCount::new(window, "foo", i as u64 + 1)],
            };
            pool.dispatch(job).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..6 {
            let report = report_rx.recv().await.unwrap();
            assert!(report.result.is_ok());
            assert_eq!(report.rows, 1);
            seen.push(report.batch_id);
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);

        pool.shutdown().await;
        assert_eq!(store.len(), 6);
    }

    #[tokio::test]
    async fn test_same_window_applies_in_order() {
        let store = Arc::new(MemoryStore::new());
        let writer = Arc::new(SinkWriter::new(store.clone(), RetryPolicy::default()));
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let pool = WriterPool::spawn(writer, 4, 16, report_tx);

        let window = TimeWindow::new(0, 60_000);
        for total in 1..=10u64 {
            let job = WriteJob {
                batch_id: total,
                window,
                counts: vec![WindowCount::new(window, "foo", total)],
            };
            pool.dispatch(job).await.unwrap();
        }
        for _ in 0..10 {
            report_rx.recv().await.unwrap();
        }
        pool.shutdown().await;

        assert_eq!(store.rows(), vec![(0, "foo".to_string(), 10)]);
    }
}
