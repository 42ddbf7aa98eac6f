pub mod column_policy;
pub mod reconcile;
pub mod sqlite_store;
pub mod tantivy_store;
pub mod factory;
pub mod item_count;

use std::collections::{BTreeMap, BTreeSet};

use browse_model::{ContainerRef, DistinctValue, EntryKey, IndexEntry};
use serde::{Deserialize, Serialize};

pub use column_policy::{ColumnLimits, StoreCeilings};
pub use factory::{StoreConfig, StoreRegistry, DEFAULT_BACKEND};

/// Storage-technology specific persistence of browse indexes.
///
/// Rows are keyed by `(index, id, item_id)`. For distinct indexes `id` is the
/// distinct-value id and the row maps the item to that value; for item indexes
/// `id == item_id`. Every method fails with [`StoreError::NotOpen`] once
/// [`BrowseStore::close`] has been called.
pub trait BrowseStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Limits applied to every value and sort key before a physical write.
    fn limits(&self) -> &ColumnLimits;

    /// Release the underlying connection/index. Idempotent.
    fn close(&self) -> Result<(), StoreError>;

    fn is_open(&self) -> bool;

    /// Apply one item's writes, removals and container mapping atomically.
    fn apply(&self, batch: &WriteBatch) -> Result<(), StoreError>;

    /// Id of the distinct row holding `value` in `index`, allocating one if absent.
    fn resolve_distinct_id(&self, index: &str, value: &str, sort_value: &str) -> Result<i64, StoreError>;

    /// Distinct-value ids currently mapped to `item_id` in `index`.
    fn read_distinct_mapping(&self, item_id: i64, index: &str) -> Result<BTreeSet<i64>, StoreError>;

    /// The item row of `item_id` in a full-item index.
    fn read_item_entry(&self, index: &str, item_id: i64) -> Result<Option<IndexEntry>, StoreError>;

    fn clear_index(&self, index: &str) -> Result<(), StoreError>;

    fn clear_all(&self) -> Result<(), StoreError>;

    /// Items with at least one row in `index`.
    fn indexed_item_ids(&self, index: &str) -> Result<BTreeSet<i64>, StoreError>;

    /// Items owning any entry, container or sort key row, across all indexes.
    fn known_item_ids(&self) -> Result<BTreeSet<i64>, StoreError>;

    /// Drop distinct values no item maps to. Returns the number removed.
    fn prune_distinct(&self, index: &str) -> Result<usize, StoreError>;

    /// Drop every row, container mapping and sort key owned by `item_id`.
    fn remove_item(&self, item_id: i64) -> Result<(), StoreError>;

    /// Number of items mapped to a collection or community.
    fn count_items(&self, container: &ContainerRef) -> Result<u64, StoreError>;

    /// Distinct values with at least one mapped item, ordered by sort key.
    fn browse_values(&self, index: &str, query: &BrowseQuery) -> Result<Vec<DistinctValue>, StoreError>;

    /// Rows of `index`, ordered by sort key then item id.
    ///
    /// With [`BrowseQuery::sort_by`] set, rows are ordered by the items' keys for
    /// that sort option instead, and the prefix filter applies to those keys.
    fn browse_items(&self, index: &str, query: &BrowseQuery) -> Result<Vec<IndexEntry>, StoreError>;

    /// Items mapped to a distinct value, by item id or by the query's sort option.
    /// The prefix filter only applies when a sort option is chosen.
    fn items_for_value(&self, index: &str, distinct_id: i64, query: &BrowseQuery) -> Result<Vec<i64>, StoreError>;

    fn entry_count(&self, index: &str) -> Result<u64, StoreError>;

    /// Every stored row in a deterministic order.
    fn snapshot(&self) -> Result<Vec<StoredRow>, StoreError>;

    /// Upsert entries of one index as a single batch.
    fn write_entries(&self, index: &str, entries: &[IndexEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let item_id = entries[0].item_id;
        self.apply(&WriteBatch {
            item_id,
            ops: vec![BatchOp::Write { index: index.to_string(), entries: entries.to_vec() }],
            containers: None,
            sort_keys: None,
        })
    }

    /// Delete entries of one index. Missing rows are ignored.
    fn remove_entries(&self, index: &str, keys: &[EntryKey]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        self.apply(&WriteBatch {
            item_id: keys[0].item_id,
            ops: vec![BatchOp::Remove { index: index.to_string(), keys: keys.to_vec() }],
            containers: None,
            sort_keys: None,
        })
    }
}

/// All index updates for one item, persisted in one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub item_id: i64,
    pub ops: Vec<BatchOp>,
    /// `Some` replaces the item's container mappings; `None` leaves them.
    pub containers: Option<Vec<ContainerRef>>,
    /// Sort option name to sort key. `Some` replaces the item's keys; `None` leaves them.
    pub sort_keys: Option<BTreeMap<String, String>>,
}

impl WriteBatch {
    pub fn new(item_id: i64) -> Self {
        Self { item_id, ops: Vec::new(), containers: None, sort_keys: None }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.containers.is_none() && self.sort_keys.is_none()
    }

    pub fn write(&mut self, index: &str, entries: Vec<IndexEntry>) {
        if !entries.is_empty() {
            self.ops.push(BatchOp::Write { index: index.to_string(), entries });
        }
    }

    pub fn remove(&mut self, index: &str, keys: Vec<EntryKey>) {
        if !keys.is_empty() {
            self.ops.push(BatchOp::Remove { index: index.to_string(), keys });
        }
    }

    /// (written, removed) row counts.
    pub fn counts(&self) -> (usize, usize) {
        self.ops.iter().fold((0, 0), |(w, r), op| match op {
            BatchOp::Write { entries, .. } => (w + entries.len(), r),
            BatchOp::Remove { keys, .. } => (w, r + keys.len()),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Write { index: String, entries: Vec<IndexEntry> },
    Remove { index: String, keys: Vec<EntryKey> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Paginated read over one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseQuery {
    pub order: SortOrder,
    pub limit: usize,
    pub offset: usize,
    /// Only rows whose sort key starts with this prefix.
    pub starts_with: Option<String>,
    /// Order item rows by this sort option. Items without a key for it sort as the empty string.
    pub sort_by: Option<String>,
}

impl Default for BrowseQuery {
    fn default() -> Self {
        BrowseQuery { order: SortOrder::Ascending, limit: 20, offset: 0, starts_with: None, sort_by: None }
    }
}

impl BrowseQuery {
    pub fn all() -> Self {
        BrowseQuery { limit: usize::MAX, ..Default::default() }
    }

    pub fn sorted_by(mut self, option: impl Into<String>) -> Self {
        self.sort_by = Some(option.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RowKind {
    Distinct,
    Entry,
    Container,
    SortKey,
}

/// Backend-neutral dump of one stored row.
///
/// Container rows carry the container type in `index` and the container id in `id`.
/// Sort key rows carry the sort option in `index` and the item id in `id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoredRow {
    pub kind: RowKind,
    pub index: String,
    pub id: i64,
    pub item_id: Option<i64>,
    pub sort_key: String,
    pub value: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("store is not open")]
    NotOpen,
    #[error("backend error: {0}")]
    Backend(String),
    #[error("backend timeout: {0}")]
    Timeout(String),
    #[error("invalid entry: {0}")]
    InvalidEntry(String),
}

impl StoreError {
    /// Whether re-running the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Backend(_))
    }
}

/// Reject rows the physical layer cannot key.
pub(crate) fn validate_entry(entry: &IndexEntry) -> Result<(), StoreError> {
    if entry.id < 0 || entry.item_id < 0 {
        return Err(StoreError::InvalidEntry(format!(
            "negative id in {}: id={}, item_id={}",
            entry.index, entry.id, entry.item_id
        )));
    }
    Ok(())
}

/// Shared pagination over rows already in ascending order.
pub(crate) fn paginate<T>(mut rows: Vec<T>, query: &BrowseQuery) -> Vec<T> {
    if query.order == SortOrder::Descending {
        rows.reverse();
    }
    rows.into_iter().skip(query.offset).take(query.limit).collect()
}
