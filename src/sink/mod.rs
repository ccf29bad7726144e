//! Sink Writer - durable, idempotent persistence of closed windows
//!
//! ```text
//! ClosedWindow → WriterPool (per-window worker queue)
//!     ↓
//! SinkWriter (retry transient errors with backoff)
//!     ↓
//! WindowCountStore (SQLite upsert on (ts, topic))
//! ```

pub mod backoff;
pub mod pool;
pub mod sqlite_store;
pub mod store;

pub use backoff::{ExponentialBackoff, RetryPolicy};
pub use pool::{WriteJob, WriteReport, WriterPool};
pub use sqlite_store::SqliteHashtagStore;
pub use store::{MemoryStore, StoreError, WindowCountStore};

use crate::model::WindowCount;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("sink write failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: StoreError },
    #[error("fatal sink error: {0}")]
    Fatal(StoreError),
}

impl SinkError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SinkError::Fatal(_))
    }
}

/// Upserts window counts, retrying transient store failures
pub struct SinkWriter {
    store: Arc<dyn WindowCountStore>,
    policy: RetryPolicy,
}

impl SinkWriter {
    pub fn new(store: Arc<dyn WindowCountStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn backend_type(&self) -> &'static str {
        self.store.backend_type()
    }

    pub async fn upsert(&self, count: &WindowCount) -> Result<(), SinkError> {
        let mut backoff = ExponentialBackoff::new(self.policy);
        loop {
            match self.store.upsert(count).await {
                Ok(()) => return Ok(()),
                Err(e) => self.on_error(e, &mut backoff).await?,
            }
        }
    }

    /// Upsert a batch as a unit; a retry re-applies the whole batch
    pub async fn upsert_batch(&self, counts: &[WindowCount]) -> Result<(), SinkError> {
        let mut backoff = ExponentialBackoff::new(self.policy);
        loop {
            match self.store.upsert_batch(counts).await {
                Ok(()) => return Ok(()),
                Err(e) => self.on_error(e, &mut backoff).await?,
            }
        }
    }

    async fn on_error(
        &self,
        err: StoreError,
        backoff: &mut ExponentialBackoff,
    ) -> Result<(), SinkError> {
        match err {
            StoreError::Fatal(_) => {
                log::error!("❌ {} store rejected write: {}", self.store.backend_type(), err);
                Err(SinkError::Fatal(err))
            }
            StoreError::Transient(_) => {
                log::warn!("⚠️  {} store write failed: {}", self.store.backend_type(), err);
                backoff.sleep().await.map_err(|_| SinkError::RetriesExhausted {
                    // the first attempt is not a retry
                    attempts: backoff.attempts() + 1,
                    last_error: err,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TimeWindow, Timestamp};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with the given error for the first `failures` calls
    struct FlakyStore {
        inner: MemoryStore,
        failures: usize,
        error: StoreError,
        calls: AtomicUsize,
    }

    impl FlakyStore {
        fn new(failures: usize, error: StoreError) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures,
                error,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl WindowCountStore for FlakyStore {
        async fn upsert(&self, count: &WindowCount) -> Result<(), StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(self.error.clone());
            }
            self.inner.upsert(count).await
        }

        async fn fetch(&self, ts: Timestamp, topic: &str) -> Result<Option<u64>, StoreError> {
            self.inner.fetch(ts, topic).await
        }

        fn backend_type(&self) -> &'static str {
            "Flaky"
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay_ms: 1,
            max_delay_ms: 2,
            max_retries,
        }
    }

    fn sample() -> WindowCount {
        WindowCount::new(TimeWindow::new(0, 60_000), "foo", 3)
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let store = Arc::new(FlakyStore::new(2, StoreError::Transient("busy".into())));
        let writer = SinkWriter::new(store.clone(), fast_policy(3));

        writer.upsert(&sample()).await.unwrap();

        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.fetch(0, "foo").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let store = Arc::new(FlakyStore::new(100, StoreError::Transient("timeout".into())));
        let writer = SinkWriter::new(store.clone(), fast_policy(2));

        let err = writer.upsert(&sample()).await.unwrap_err();

        assert_eq!(
            err,
            SinkError::RetriesExhausted {
                attempts: 3,
                last_error: StoreError::Transient("timeout".into()),
            }
        );
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_surface_immediately() {
        let store = Arc::new(FlakyStore::new(1, StoreError::Fatal("malformed".into())));
        let writer = SinkWriter::new(store.clone(), fast_policy(5));

        let err = writer.upsert_batch(&[sample()]).await.unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_repeated_upserts_keep_one_row() {
        let store = Arc::new(MemoryStore::new());
        let writer = SinkWriter::new(store.clone(), RetryPolicy::default());

        for _ in 0..3 {
            writer.upsert(&sample()).await.unwrap();
        }

        assert_eq!(store.rows(), vec![(0, "foo".to_string(), 3)]);
    }
}
