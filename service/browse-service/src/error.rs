use browse_store::reconcile::ReconcileError;
use browse_store::StoreError;

use crate::catalog::CatalogError;
use crate::engine::EngineState;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("browse store error: {0}")]
    Store(#[from] StoreError),
    #[error("engine busy (state: {current}, item reindexes in flight: {in_flight})")]
    Busy { current: EngineState, in_flight: usize },
    #[error(transparent)]
    Reconciliation(#[from] ReconcileError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    /// Only items own browse rows; collections and communities are counted, not indexed.
    #[error("{key} is not an item and cannot be browse indexed")]
    UnsupportedEntity { key: String },
    #[error("item {item_id} failed: {source}")]
    ItemFailed {
        item_id: i64,
        #[source]
        source: Box<EngineError>,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether re-running the operation may succeed without a configuration change.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_retryable(),
            EngineError::ItemFailed { source, .. } => source.is_retryable(),
            EngineError::Io(_) => true,
            _ => false,
        }
    }
}
