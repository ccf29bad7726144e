//! Upstream sources of hashtag occurrences
//!
//! A source hands out records tagged with increasing offsets and accepts a
//! commit once everything up to an offset is durably persisted. After a
//! restart, delivery resumes at `committed + 1`, and the watermark stored
//! with the commit tells the aggregator which windows are already final.

pub mod checkpoint;
pub mod jsonl;

pub use checkpoint::{load_checkpoint, save_checkpoint, Checkpoint};
pub use jsonl::JsonlFileSource;

use crate::model::{HashtagOccurrence, Offset, Timestamp};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Pull or commit failed, the source may recover
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("fatal source error: {0}")]
    Fatal(String),
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        SourceError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::Fatal(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub offset: Offset,
    pub occurrence: HashtagOccurrence,
}

#[async_trait]
pub trait OccurrenceSource: Send {
    /// Up to `max_batch` records in offset order; empty when nothing is ready
    async fn pull(&mut self, max_batch: usize) -> Result<Vec<SourceRecord>, SourceError>;

    /// Everything up to and including `offset` is persisted, and so is every
    /// window closed at or below `watermark`
    async fn commit(
        &mut self,
        offset: Offset,
        watermark: Option<Timestamp>,
    ) -> Result<(), SourceError>;

    /// Watermark stored with the last commit of a previous run
    fn resume_watermark(&self) -> Option<Timestamp> {
        None
    }

    /// No more records will ever arrive
    fn is_finished(&self) -> bool {
        false
    }
}

/// Source fed by an in-process channel
///
/// Offsets are assigned on receipt, starting at `first_offset`.
pub struct ChannelSource {
    rx: mpsc::Receiver<HashtagOccurrence>,
    next_offset: Offset,
    committed: Option<Offset>,
    closed: bool,
    wait: Duration,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<HashtagOccurrence>) -> Self {
        Self::starting_at(rx, 0)
    }

    pub fn starting_at(rx: mpsc::Receiver<HashtagOccurrence>, first_offset: Offset) -> Self {
        Self {
            rx,
            next_offset: first_offset,
            committed: None,
            closed: false,
            wait: Duration::from_millis(50),
        }
    }

    pub fn committed_offset(&self) -> Option<Offset> {
        self.committed
    }

    fn record(&mut self, occurrence: HashtagOccurrence) -> SourceRecord {
        let offset = self.next_offset;
        self.next_offset += 1;
        SourceRecord { offset, occurrence }
    }
}

#[async_trait]
impl OccurrenceSource for ChannelSource {
    async fn pull(&mut self, max_batch: usize) -> Result<Vec<SourceRecord>, SourceError> {
        let mut batch = Vec::new();
        if self.closed || max_batch == 0 {
            return Ok(batch);
        }

        match tokio::time::timeout(self.wait, self.rx.recv()).await {
            Ok(Some(occurrence)) => batch.push(self.record(occurrence)),
            Ok(None) => {
                self.closed = true;
                return Ok(batch);
            }
            Err(_) => return Ok(batch),
        }

        while batch.len() < max_batch {
            match self.rx.try_recv() {
                Ok(occurrence) => batch.push(self.record(occurrence)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }

        Ok(batch)
    }

    async fn commit(
        &mut self,
        offset: Offset,
        _watermark: Option<Timestamp>,
    ) -> Result<(), SourceError> {
        if self.committed.map_or(true, |c| offset > c) {
            self.committed = Some(offset);
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_source_assigns_offsets() {
        let (tx, rx) = mpsc::channel(16);
        let mut source = ChannelSource::new(rx);

        for i in 0..5 {
            tx.send(HashtagOccurrence::new("foo", i)).await.unwrap();
        }

        let batch = source.pull(3).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0, 1, 2]);

        let batch = source.pull(10).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![3, 4]);
        assert!(!source.is_finished());

        drop(tx);
        assert!(source.pull(10).await.unwrap().is_empty());
        assert!(source.is_finished());
    }

    #[tokio::test]
    async fn test_channel_source_empty_pull_times_out() {
        let (_tx, rx) = mpsc::channel::<HashtagOccurrence>(1);
        let mut source = ChannelSource::new(rx);
        assert!(source.pull(10).await.unwrap().is_empty());
        assert!(!source.is_finished());
    }

    #[tokio::test]
    async fn test_commit_is_monotonic() {
        let (_tx, rx) = mpsc::channel::<HashtagOccurrence>(1);
        let mut source = ChannelSource::new(rx);
        source.commit(5, None).await.unwrap();
        source.commit(3, None).await.unwrap();
        assert_eq!(source.committed_offset(), Some(5));
    }
}
