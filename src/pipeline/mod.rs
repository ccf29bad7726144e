//! Streaming pipeline: source → window aggregator → writer pool → store
//!
//! A single driver task owns the aggregator and the source. Closed windows
//! and corrections leave it as write jobs for the pool; acknowledgements come
//! back on a report channel and move the committed source offset forward.

pub mod driver;
pub mod state;
pub mod tracker;

pub use driver::{DriverConfig, PipelineDriver, PipelineError, PipelineReport};
pub use state::{PipelineState, ShutdownHandle};
pub use tracker::OffsetTracker;
