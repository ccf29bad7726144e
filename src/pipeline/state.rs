//! Pipeline lifecycle: `Starting → Running → Draining → Stopped`, with
//! `Failed` reachable from `Running` and `Draining`.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Starting => "STARTING",
            PipelineState::Running => "RUNNING",
            PipelineState::Draining => "DRAINING",
            PipelineState::Stopped => "STOPPED",
            PipelineState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Failed)
                | (Running, Draining)
                | (Running, Failed)
                | (Draining, Stopped)
                | (Draining, Failed)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Asks a running pipeline to drain and stop
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub(crate) fn new(tx: Arc<watch::Sender<bool>>) -> Self {
        Self { tx }
    }

    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use PipelineState::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Running));
        assert!(Stopped.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn test_shutdown_handle_sets_flag() {
        let (tx, rx) = watch::channel(false);
        let handle = ShutdownHandle::new(Arc::new(tx));
        let clone = handle.clone();
        clone.shutdown();
        assert!(handle.is_requested());
        assert!(*rx.borrow());
    }
}
