//! JSONL file source with a persisted checkpoint
//!
//! Each line is one `HashtagOccurrence`; the zero-based line number is its
//! offset. Lines at or below the committed offset are skipped on open.

use super::checkpoint::{load_checkpoint, save_checkpoint};
use super::{OccurrenceSource, SourceError, SourceRecord};
use crate::model::{HashtagOccurrence, Offset, Timestamp};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

pub struct JsonlFileSource {
    path: PathBuf,
    checkpoint_path: PathBuf,
    reader: BufReader<File>,
    /// Offset of the next complete line
    next_offset: Offset,
    committed: Option<Offset>,
    watermark: Option<Timestamp>,
    /// Bytes of the line being read; kept across calls so an interrupted
    /// read or a line still being written (follow mode) resumes in place
    partial: Vec<u8>,
    follow: bool,
    eof: bool,
    malformed: u64,
}

impl JsonlFileSource {
    pub async fn open(
        path: impl Into<PathBuf>,
        checkpoint_path: impl Into<PathBuf>,
        follow: bool,
    ) -> Result<Self, SourceError> {
        let path = path.into();
        let checkpoint_path = checkpoint_path.into();
        let checkpoint = load_checkpoint(&checkpoint_path).await?;

        let file = File::open(&path).await.map_err(|e| {
            SourceError::Unavailable(format!("cannot open {}: {}", path.display(), e))
        })?;

        let mut source = Self {
            path,
            checkpoint_path,
            reader: BufReader::new(file),
            next_offset: 0,
            committed: checkpoint.as_ref().map(|c| c.committed_offset),
            watermark: checkpoint.as_ref().and_then(|c| c.watermark),
            partial: Vec::new(),
            follow,
            eof: false,
            malformed: 0,
        };

        if let Some(committed) = source.committed {
            source.skip_through(committed).await?;
        }

        log::info!(
            "📖 Reading occurrences from {} (resuming at offset {})",
            source.path.display(),
            source.next_offset
        );
        Ok(source)
    }

    async fn skip_through(&mut self, committed: Offset) -> Result<(), SourceError> {
        while self.next_offset <= committed {
            match self.next_line().await? {
                Some(_) => {}
                None => break,
            }
        }
        Ok(())
    }

    /// Next complete line with its offset, `None` at EOF
    async fn next_line(&mut self) -> Result<Option<(Offset, Vec<u8>)>, SourceError> {
        let n = self.reader.read_until(b'\n', &mut self.partial).await?;
        if n == 0 {
            self.eof = true;
            if self.follow || self.partial.is_empty() {
                return Ok(None);
            }
        } else if self.follow && !self.partial.ends_with(b"\n") {
            self.eof = true;
            return Ok(None);
        }

        self.eof = false;
        let line = std::mem::take(&mut self.partial);
        let offset = self.next_offset;
        self.next_offset += 1;
        Ok(Some((offset, line)))
    }

    pub fn committed_offset(&self) -> Option<Offset> {
        self.committed
    }

    pub fn malformed_lines(&self) -> u64 {
        self.malformed
    }

    fn skip_malformed(&mut self, offset: Offset, reason: &dyn std::fmt::Display) {
        self.malformed += 1;
        log::warn!(
            "⚠️  Skipping malformed line {} in {}: {}",
            offset,
            self.path.display(),
            reason
        );
    }
}

#[async_trait]
impl OccurrenceSource for JsonlFileSource {
    async fn pull(&mut self, max_batch: usize) -> Result<Vec<SourceRecord>, SourceError> {
        let mut batch = Vec::new();

        while batch.len() < max_batch {
            let (offset, bytes) = match self.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                // Hand out what was already read; the error shows up again
                // on the next pull if it persists.
                Err(e) if !batch.is_empty() => {
                    log::warn!("⚠️  Read from {} interrupted: {}", self.path.display(), e);
                    break;
                }
                Err(e) => return Err(e),
            };

            let line = match std::str::from_utf8(&bytes) {
                Ok(line) => line.trim(),
                Err(e) => {
                    self.skip_malformed(offset, &e);
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<HashtagOccurrence>(line) {
                Ok(occurrence) => batch.push(SourceRecord { offset, occurrence }),
                Err(e) => self.skip_malformed(offset, &e),
            }
        }

        Ok(batch)
    }

    async fn commit(
        &mut self,
        offset: Offset,
        watermark: Option<Timestamp>,
    ) -> Result<(), SourceError> {
        if self.committed.map_or(false, |c| offset <= c) {
            return Ok(());
        }
        let watermark = watermark.max(self.watermark);
        save_checkpoint(&self.checkpoint_path, offset, watermark).await?;
        self.committed = Some(offset);
        self.watermark = watermark;
        Ok(())
    }

    fn resume_watermark(&self) -> Option<Timestamp> {
        self.watermark
    }

    fn is_finished(&self) -> bool {
        !self.follow && self.eof
    }
}
