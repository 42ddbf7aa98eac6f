//! Browse index maintenance over a configurable [`browse_store::BrowseStore`].

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod progress;

pub use catalog::{Catalog, CatalogError, EntityFilter, EntityIter, MemoryCatalog};
pub use config::BrowseConfig;
pub use engine::{EngineState, IndexEngine, ItemOutcome, RebuildReport};
pub use error::EngineError;
pub use progress::{CancelToken, NullSink, ProgressEvent, ProgressSink, TracingSink};
