#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use browse_model::{BrowseIndexDefinition, CatalogItem, ContainerRef, DistinctValue, IndexEntry, SortDataType, SortOption};
use browse_service::{Catalog, CatalogError, EntityFilter, EntityIter, MemoryCatalog};
use browse_store::{
    BrowseQuery, BrowseStore, ColumnLimits, RowKind, StoreConfig, StoreError, StoreRegistry, StoredRow, WriteBatch,
};

pub const BACKENDS: [&str; 2] = ["sqlite", "tantivy"];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn store(backend: &str) -> Arc<dyn BrowseStore> {
    StoreRegistry::with_builtins()
        .build(&StoreConfig { backend: backend.to_string(), ..Default::default() })
        .unwrap()
}

pub fn definitions() -> Vec<BrowseIndexDefinition> {
    vec![
        BrowseIndexDefinition::distinct("author", &["dc.contributor.*", "dc.creator"], SortDataType::Text).unwrap(),
        BrowseIndexDefinition::distinct("subject", &["dc.subject.*"], SortDataType::Text).unwrap(),
        BrowseIndexDefinition::item("title", &["dc.title"], SortDataType::Title).unwrap(),
        BrowseIndexDefinition::item("dateissued", &["dc.date.issued"], SortDataType::Date).unwrap(),
    ]
}

pub fn sort_options() -> Vec<SortOption> {
    vec![
        SortOption::new("title", "dc.title", SortDataType::Title).unwrap(),
        SortOption::new("dateissued", "dc.date.issued", SortDataType::Date).unwrap(),
    ]
}

pub fn sample_items() -> Vec<CatalogItem> {
    vec![
        CatalogItem::item(1)
            .with_value("dc.title", "The Art of Indexing")
            .with_value("dc.contributor.author", "Doe, Jane")
            .with_value("dc.contributor.author", "Roe, Rick")
            .with_value("dc.subject", "Libraries")
            .with_value("dc.date.issued", "2004-05")
            .with_container(ContainerRef::collection(10))
            .with_container(ContainerRef::community(100)),
        CatalogItem::item(2)
            .with_value("dc.title", "Proceedings of the Conference")
            .with_value("dc.creator", "Doe, Jane")
            .with_value("dc.subject", "Libraries")
            .with_value("dc.subject", "Metadata")
            .with_value("dc.date.issued", "1999")
            .with_container(ContainerRef::collection(10)),
        CatalogItem { withdrawn: true, ..CatalogItem::item(3).with_value("dc.title", "Withdrawn Thesis") }
            .with_value("dc.contributor.author", "Gone, Ann")
            .with_container(ContainerRef::collection(11)),
        CatalogItem { archived: false, ..CatalogItem::item(4).with_value("dc.title", "Work in Progress") }
            .with_value("dc.contributor.author", "Doe, Jane"),
        CatalogItem::item(5)
            .with_value("dc.title", "A Short Note")
            .with_value("dc.contributor.editor", "Zed, Zoe")
            .with_container(ContainerRef::collection(11)),
    ]
}

pub fn sample_catalog() -> MemoryCatalog {
    MemoryCatalog::from_items(sample_items())
}

/// Stored rows with backend-allocated distinct ids replaced by their values.
pub fn normalized(store: &dyn BrowseStore) -> BTreeSet<(RowKind, String, Option<i64>, String, String)> {
    let rows = store.snapshot().unwrap();
    let value_of = |index: &str, id: i64| -> String {
        rows.iter()
            .find(|r| r.kind == RowKind::Distinct && r.index == index && r.id == id)
            .map(|r| r.value.clone())
            .unwrap_or_default()
    };
    rows.iter()
        .map(|r: &StoredRow| match r.kind {
            RowKind::Container => (r.kind, r.index.clone(), r.item_id, r.id.to_string(), String::new()),
            RowKind::Entry if r.item_id != Some(r.id) => {
                (r.kind, r.index.clone(), r.item_id, r.sort_key.clone(), value_of(&r.index, r.id))
            }
            _ => (r.kind, r.index.clone(), r.item_id, r.sort_key.clone(), r.value.clone()),
        })
        .collect()
}

/// Catalog whose listed entities fail to load for the given ids.
pub struct FlakyCatalog {
    pub inner: MemoryCatalog,
    pub failing: BTreeSet<i64>,
}

impl Catalog for FlakyCatalog {
    fn list_entities(&self, filter: &EntityFilter) -> Result<EntityIter<'_>, CatalogError> {
        let failing = self.failing.clone();
        let listed = self.inner.list_entities(filter)?;
        Ok(Box::new(listed.map(move |next| match next {
            Ok(e) if failing.contains(&e.id()) => {
                Err(CatalogError::Entity { id: e.id(), reason: "metadata record unreadable".into() })
            }
            other => other,
        })))
    }
}

/// Store wrapper that records every applied batch.
pub struct RecordingStore {
    pub inner: Arc<dyn BrowseStore>,
    pub batches: Mutex<Vec<WriteBatch>>,
}

impl RecordingStore {
    pub fn new(inner: Arc<dyn BrowseStore>) -> Self {
        Self { inner, batches: Mutex::new(Vec::new()) }
    }

    pub fn take(&self) -> Vec<WriteBatch> {
        std::mem::take(&mut *self.batches.lock().unwrap())
    }
}

impl BrowseStore for RecordingStore {
    fn name(&self) -> &'static str { self.inner.name() }
    fn limits(&self) -> &ColumnLimits { self.inner.limits() }
    fn close(&self) -> Result<(), StoreError> { self.inner.close() }
    fn is_open(&self) -> bool { self.inner.is_open() }

    fn apply(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.batches.lock().unwrap().push(batch.clone());
        self.inner.apply(batch)
    }

    fn resolve_distinct_id(&self, index: &str, value: &str, sort_value: &str) -> Result<i64, StoreError> {
        self.inner.resolve_distinct_id(index, value, sort_value)
    }
    fn read_distinct_mapping(&self, item_id: i64, index: &str) -> Result<BTreeSet<i64>, StoreError> {
        self.inner.read_distinct_mapping(item_id, index)
    }
    fn read_item_entry(&self, index: &str, item_id: i64) -> Result<Option<IndexEntry>, StoreError> {
        self.inner.read_item_entry(index, item_id)
    }
    fn clear_index(&self, index: &str) -> Result<(), StoreError> { self.inner.clear_index(index) }
    fn clear_all(&self) -> Result<(), StoreError> { self.inner.clear_all() }
    fn indexed_item_ids(&self, index: &str) -> Result<BTreeSet<i64>, StoreError> { self.inner.indexed_item_ids(index) }
    fn known_item_ids(&self) -> Result<BTreeSet<i64>, StoreError> { self.inner.known_item_ids() }
    fn prune_distinct(&self, index: &str) -> Result<usize, StoreError> { self.inner.prune_distinct(index) }
    fn remove_item(&self, item_id: i64) -> Result<(), StoreError> { self.inner.remove_item(item_id) }
    fn count_items(&self, container: &ContainerRef) -> Result<u64, StoreError> { self.inner.count_items(container) }
    fn browse_values(&self, index: &str, query: &BrowseQuery) -> Result<Vec<DistinctValue>, StoreError> {
        self.inner.browse_values(index, query)
    }
    fn browse_items(&self, index: &str, query: &BrowseQuery) -> Result<Vec<IndexEntry>, StoreError> {
        self.inner.browse_items(index, query)
    }
    fn items_for_value(&self, index: &str, distinct_id: i64, query: &BrowseQuery) -> Result<Vec<i64>, StoreError> {
        self.inner.items_for_value(index, distinct_id, query)
    }
    fn entry_count(&self, index: &str) -> Result<u64, StoreError> { self.inner.entry_count(index) }
    fn snapshot(&self) -> Result<Vec<StoredRow>, StoreError> { self.inner.snapshot() }
}
