//! Progress reporting and cooperative cancellation for long-running operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::engine::ItemOutcome;

/// Cooperative cancellation handle shared across long-running operations.
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self { Self(Arc::new(AtomicBool::new(false))) }
    pub fn cancel(&self) { self.0.store(true, Ordering::Relaxed); }
    pub fn is_canceled(&self) -> bool { self.0.load(Ordering::Relaxed) }
}

/// Progress events emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    RebuildStarted { backend: &'static str, indexes: usize },
    ItemIndexed(ItemOutcome),
    ItemFailed { item_id: i64, error: String },
    StaleItemRemoved { item_id: i64 },
    DistinctPruned { index: String, removed: usize },
    Canceled { processed: usize },
    RebuildFinished { processed: usize, failed: usize },
    Cleared,
}

/// Destination for [`ProgressEvent`]s, fixed when the engine is built.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// Forwards events to `tracing`. Per-item events go to `info` when verbose, `debug` otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink {
    pub verbose: bool,
}

impl TracingSink {
    pub fn verbose() -> Self {
        Self { verbose: true }
    }
}

impl ProgressSink for TracingSink {
    fn emit(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::ItemIndexed(o) => {
                if self.verbose {
                    info!(item_id = o.item_id, written = o.written, removed = o.removed, "indexed item");
                } else {
                    debug!(item_id = o.item_id, written = o.written, removed = o.removed, "indexed item");
                }
            }
            ProgressEvent::ItemFailed { item_id, error } => warn!(item_id, %error, "item failed"),
            ProgressEvent::StaleItemRemoved { item_id } => debug!(item_id, "removed item no longer in catalog"),
            ProgressEvent::DistinctPruned { index, removed } => debug!(%index, removed, "pruned distinct values"),
            ProgressEvent::RebuildStarted { backend, indexes } => info!(backend, indexes, "rebuild started"),
            ProgressEvent::Canceled { processed } => warn!(processed, "rebuild canceled"),
            ProgressEvent::RebuildFinished { processed, failed } => info!(processed, failed, "rebuild finished"),
            ProgressEvent::Cleared => info!("browse indexes cleared"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn closures_are_sinks() {
        let seen = Mutex::new(Vec::new());
        let sink = |e: &ProgressEvent| seen.lock().unwrap().push(e.clone());
        sink.emit(&ProgressEvent::Cleared);
        sink.emit(&ProgressEvent::Canceled { processed: 3 });
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_canceled());
        token.cancel();
        assert!(other.is_canceled());
    }
}
