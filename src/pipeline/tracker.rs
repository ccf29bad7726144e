//! Source offset bookkeeping for at-least-once commits
//!
//! An offset may be committed only when no open window and no write batch
//! beyond the committed watermark still depends on a record at or below it.
//! The committed watermark is the highest watermark at which every closed
//! window has been acknowledged by the store. A restart seeds the aggregator
//! with it, so replayed records for those windows are late instead of
//! recounting them from a partial replay.

use crate::model::{Offset, Timestamp};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct PendingBatch {
    /// Lowest offset the batch depends on
    min_offset: Offset,
    /// Watermark at which the batch's window closed
    close_bound: Timestamp,
    acked: bool,
}

#[derive(Debug, Default)]
pub struct OffsetTracker {
    last_pulled: Option<Offset>,
    /// batch id → batch not yet covered by the committed watermark
    pending: HashMap<u64, PendingBatch>,
    committed: Option<Offset>,
    frontier: Option<Timestamp>,
}

impl OffsetTracker {
    pub fn new(committed: Option<Offset>, frontier: Option<Timestamp>) -> Self {
        Self {
            committed,
            frontier,
            ..Self::default()
        }
    }

    pub fn observe_pulled(&mut self, offset: Offset) {
        self.last_pulled = Some(self.last_pulled.map_or(offset, |o| o.max(offset)));
    }

    pub fn begin_batch(&mut self, batch_id: u64, min_offset: Offset, close_bound: Timestamp) {
        self.pending.insert(
            batch_id,
            PendingBatch {
                min_offset,
                close_bound,
                acked: false,
            },
        );
    }

    /// Returns false for an unknown or already acknowledged batch
    pub fn complete_batch(&mut self, batch_id: u64) -> bool {
        match self.pending.get_mut(&batch_id) {
            Some(batch) if !batch.acked => {
                batch.acked = true;
                true
            }
            _ => false,
        }
    }

    /// Move the committed watermark up to `watermark`, stopping below the
    /// lowest window still waiting for its write. Never moves backwards.
    pub fn advance_frontier(&mut self, watermark: Option<Timestamp>) {
        let Some(wm) = watermark else {
            return;
        };
        let lowest_unacked = self
            .pending
            .values()
            .filter(|b| !b.acked)
            .map(|b| b.close_bound)
            .min();
        let candidate = match lowest_unacked {
            Some(bound) => wm.min(bound.saturating_sub(1)),
            None => wm,
        };
        if self.frontier.map_or(true, |f| candidate > f) {
            self.frontier = Some(candidate);
        }

        let frontier = self.frontier;
        self.pending
            .retain(|_, b| !(b.acked && frontier.map_or(false, |f| b.close_bound <= f)));
    }

    pub fn frontier(&self) -> Option<Timestamp> {
        self.frontier
    }

    pub fn committed(&self) -> Option<Offset> {
        self.committed
    }

    /// Highest offset that is safe to commit now, if it moves the checkpoint
    pub fn safe_commit(&self, oldest_open: Option<Offset>) -> Option<Offset> {
        let last = self.last_pulled?;
        let lowest_pending = oldest_open
            .into_iter()
            .chain(self.pending.values().map(|b| b.min_offset))
            .min();

        let candidate = match lowest_pending {
            Some(low) => low.checked_sub(1)?.min(last),
            None => last,
        };

        match self.committed {
            Some(c) if candidate <= c => None,
            _ => Some(candidate),
        }
    }

    pub fn mark_committed(&mut self, offset: Offset) {
        if self.committed.map_or(true, |c| offset > c) {
            self.committed = Some(offset);
        }
    }
}
