use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use browse_model::{ContainerRef, DistinctValue, IndexEntry};
use tantivy::collector::{Count, TopDocs};
use tantivy::directory::MmapDirectory;
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema, Value as _, FAST, INDEXED, STORED, STRING};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::{debug, info, warn};

use crate::column_policy::{ColumnLimits, StoreCeilings};
use crate::{paginate, validate_entry, BatchOp, BrowseQuery, BrowseStore, RowKind, StoreError, StoredRow, WriteBatch};

/// Raw terms are capped at 65 530 bytes; 16 000 chars stays below that for any UTF-8 input.
pub const TANTIVY_CEILINGS: StoreCeilings = StoreCeilings { value_chars: Some(16_000), sort_chars: Some(16_000) };

const WRITER_HEAP_BYTES: usize = 50_000_000;

const KIND_DISTINCT: &str = "distinct";
const KIND_ENTRY: &str = "entry";
const KIND_CONTAINER: &str = "container";
const KIND_SORT: &str = "sort";

impl From<tantivy::TantivyError> for StoreError {
    fn from(e: tantivy::TantivyError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[derive(Clone, Copy)]
struct Fields {
    kind: Field,
    key: Field,
    index: Field,
    container_type: Field,
    owner: Field,
    sort_option: Field,
    id: Field,
    item_id: Field,
    value: Field,
    sort_value: Field,
}

fn build_schema() -> (Schema, Fields) {
    let mut b = Schema::builder();
    let fields = Fields {
        kind: b.add_text_field("kind", STRING | STORED),
        key: b.add_text_field("key", STRING),
        index: b.add_text_field("index", STRING | STORED),
        container_type: b.add_text_field("container_type", STRING | STORED),
        owner: b.add_text_field("owner", STRING),
        sort_option: b.add_text_field("sort_option", STRING | STORED),
        id: b.add_i64_field("id", INDEXED | STORED | FAST),
        item_id: b.add_i64_field("item_id", INDEXED | STORED | FAST),
        value: b.add_text_field("value", STRING | STORED),
        sort_value: b.add_text_field("sort_value", STRING | STORED),
    };
    (b.build(), fields)
}

/// Every operation commits before releasing the lock, so a rollback only
/// discards the documents of the batch that failed.
struct Inner {
    reader: IndexReader,
    writer: IndexWriter,
    next_id: i64,
}

/// Browse indexes held in a Tantivy index, one document per stored row.
pub struct TantivyBrowseStore {
    fields: Fields,
    inner: Mutex<Option<Inner>>,
    limits: ColumnLimits,
}

impl TantivyBrowseStore {
    pub fn open_in_ram(limits: ColumnLimits) -> Result<Self, StoreError> {
        let (schema, fields) = build_schema();
        let index = Index::create_in_ram(schema);
        Self::init(index, fields, limits)
    }

    pub fn open_in_dir<P: AsRef<Path>>(dir: P, limits: ColumnLimits) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Backend(format!("create {}: {e}", dir.display())))?;
        let (schema, fields) = build_schema();
        let mmap = MmapDirectory::open(dir).map_err(|e| StoreError::Backend(e.to_string()))?;
        let index = Index::open_or_create(mmap, schema)?;
        info!(path = ?dir, "opened tantivy browse store");
        Self::init(index, fields, limits)
    }

    fn init(index: Index, fields: Fields, limits: ColumnLimits) -> Result<Self, StoreError> {
        let reader = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into()?;
        let writer: IndexWriter = index.writer(WRITER_HEAP_BYTES)?;
        let inner = Inner { reader, writer, next_id: 1 };
        let store = Self { fields, inner: Mutex::new(Some(inner)), limits };
        store.with_inner(|inner| {
            let max_id = store
                .distinct_docs(inner)?
                .iter()
                .map(|d| get_i64(d, fields.id))
                .max()
                .unwrap_or(0);
            inner.next_id = max_id + 1;
            Ok(())
        })?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Inner>>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("tantivy store lock poisoned".into()))
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let mut guard = self.lock()?;
        let inner = guard.as_mut().ok_or(StoreError::NotOpen)?;
        f(inner)
    }

    fn text(&self, field: Field, v: &str) -> Box<dyn Query> {
        Box::new(TermQuery::new(Term::from_field_text(field, v), IndexRecordOption::Basic))
    }

    fn int(&self, field: Field, v: i64) -> Box<dyn Query> {
        Box::new(TermQuery::new(Term::from_field_i64(field, v), IndexRecordOption::Basic))
    }

    fn all_of(&self, clauses: Vec<Box<dyn Query>>) -> BooleanQuery {
        BooleanQuery::new(clauses.into_iter().map(|q| (Occur::Must, q)).collect())
    }

    fn collect(&self, inner: &Inner, query: &dyn Query) -> Result<Vec<TantivyDocument>, StoreError> {
        let searcher = inner.reader.searcher();
        let n = searcher.num_docs() as usize;
        if n == 0 {
            return Ok(Vec::new());
        }
        let hits = searcher.search(query, &TopDocs::with_limit(n))?;
        hits.into_iter()
            .map(|(_, addr)| searcher.doc::<TantivyDocument>(addr).map_err(StoreError::from))
            .collect()
    }

    fn count(&self, inner: &Inner, query: &dyn Query) -> Result<u64, StoreError> {
        Ok(inner.reader.searcher().search(query, &Count)? as u64)
    }

    fn entries_of(&self, inner: &Inner, index: &str) -> Result<Vec<TantivyDocument>, StoreError> {
        let f = self.fields;
        self.collect(inner, &self.all_of(vec![self.text(f.kind, KIND_ENTRY), self.text(f.index, index)]))
    }

    fn distinct_docs(&self, inner: &Inner) -> Result<Vec<TantivyDocument>, StoreError> {
        self.collect(inner, &self.all_of(vec![self.text(self.fields.kind, KIND_DISTINCT)]))
    }

    fn distinct_of(&self, inner: &Inner, index: &str) -> Result<Vec<TantivyDocument>, StoreError> {
        let f = self.fields;
        self.collect(inner, &self.all_of(vec![self.text(f.kind, KIND_DISTINCT), self.text(f.index, index)]))
    }

    fn commit(inner: &mut Inner) -> Result<(), StoreError> {
        inner.writer.commit()?;
        inner.reader.reload()?;
        Ok(())
    }

    /// Item id to sort key for one sort option.
    fn sort_keys_of(&self, inner: &Inner, option: &str) -> Result<HashMap<i64, String>, StoreError> {
        let f = self.fields;
        let q = self.all_of(vec![self.text(f.kind, KIND_SORT), self.text(f.sort_option, option)]);
        Ok(self.collect(inner, &q)?.iter().map(|d| (get_i64(d, f.item_id), get_str(d, f.sort_value))).collect())
    }

    fn to_entry(&self, index: &str, doc: &TantivyDocument) -> IndexEntry {
        let f = self.fields;
        IndexEntry {
            index: index.to_string(),
            id: get_i64(doc, f.id),
            sort_key: get_str(doc, f.sort_value),
            value: get_str(doc, f.value),
            item_id: get_i64(doc, f.item_id),
        }
    }

    fn stage_batch(&self, inner: &mut Inner, batch: &WriteBatch) -> Result<(), StoreError> {
        let f = self.fields;
        for op in &batch.ops {
            match op {
                BatchOp::Write { index, entries } => {
                    for e in entries {
                        let key = entry_key(index, e.id, e.item_id);
                        inner.writer.delete_term(Term::from_field_text(f.key, &key));
                        let mut doc = TantivyDocument::default();
                        doc.add_text(f.kind, KIND_ENTRY);
                        doc.add_text(f.key, &key);
                        doc.add_text(f.index, index);
                        doc.add_i64(f.id, e.id);
                        doc.add_i64(f.item_id, e.item_id);
                        doc.add_text(f.value, self.limits.truncate_value(&e.value));
                        doc.add_text(f.sort_value, self.limits.truncate_sort_value(&e.sort_key));
                        inner.writer.add_document(doc)?;
                    }
                }
                BatchOp::Remove { index, keys } => {
                    for k in keys {
                        inner.writer.delete_term(Term::from_field_text(f.key, &entry_key(index, k.id, k.item_id)));
                    }
                }
            }
        }
        if let Some(containers) = &batch.containers {
            let owner = owner_key(KIND_CONTAINER, batch.item_id);
            inner.writer.delete_term(Term::from_field_text(f.owner, &owner));
            for c in containers {
                let mut doc = TantivyDocument::default();
                doc.add_text(f.kind, KIND_CONTAINER);
                doc.add_text(f.key, container_key(c, batch.item_id));
                doc.add_text(f.container_type, c.entity_type.as_str());
                doc.add_text(f.owner, &owner);
                doc.add_i64(f.id, c.id);
                doc.add_i64(f.item_id, batch.item_id);
                inner.writer.add_document(doc)?;
            }
        }
        if let Some(keys) = &batch.sort_keys {
            let owner = owner_key(KIND_SORT, batch.item_id);
            inner.writer.delete_term(Term::from_field_text(f.owner, &owner));
            for (option, key) in keys {
                let mut doc = TantivyDocument::default();
                doc.add_text(f.kind, KIND_SORT);
                doc.add_text(f.sort_option, option);
                doc.add_text(f.owner, &owner);
                doc.add_i64(f.id, batch.item_id);
                doc.add_i64(f.item_id, batch.item_id);
                doc.add_text(f.sort_value, self.limits.truncate_sort_value(key));
                inner.writer.add_document(doc)?;
            }
        }
        Ok(())
    }
}

fn entry_key(index: &str, id: i64, item_id: i64) -> String {
    format!("e\u{1f}{index}\u{1f}{id}\u{1f}{item_id}")
}

fn distinct_key(index: &str, id: i64) -> String {
    format!("d\u{1f}{index}\u{1f}{id}")
}

fn container_key(c: &ContainerRef, item_id: i64) -> String {
    format!("c\u{1f}{}\u{1f}{}\u{1f}{item_id}", c.entity_type.as_str(), c.id)
}

/// Owner term shared by the container or sort documents of one item.
fn owner_key(kind: &str, item_id: i64) -> String {
    format!("{kind}\u{1f}{item_id}")
}

fn get_i64(doc: &TantivyDocument, field: Field) -> i64 {
    doc.get_first(field).and_then(|v| v.as_i64()).unwrap_or_default()
}

fn get_str(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field).and_then(|v| v.as_str()).unwrap_or_default().to_string()
}

fn has_prefix(sort_key: &str, query: &BrowseQuery) -> bool {
    query.starts_with.as_deref().map_or(true, |p| sort_key.starts_with(p))
}

impl BrowseStore for TantivyBrowseStore {
    fn name(&self) -> &'static str { "tantivy" }

    fn limits(&self) -> &ColumnLimits { &self.limits }

    fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        if let Some(inner) = guard.take() {
            inner.writer.wait_merging_threads()?;
            debug!("closed tantivy browse store");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    fn apply(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        for op in &batch.ops {
            if let BatchOp::Write { entries, .. } = op {
                entries.iter().try_for_each(validate_entry)?;
            }
        }
        self.with_inner(|inner| {
            if let Err(e) = self.stage_batch(inner, batch).and_then(|_| Self::commit(inner)) {
                warn!(item_id = batch.item_id, error = %e, "rolling back browse batch");
                inner.writer.rollback()?;
                return Err(e);
            }
            Ok(())
        })
    }

    fn resolve_distinct_id(&self, index: &str, value: &str, sort_value: &str) -> Result<i64, StoreError> {
        let value = self.limits.truncate_value(value);
        let sort_value = self.limits.truncate_sort_value(sort_value);
        let f = self.fields;
        self.with_inner(|inner| {
            let q = self.all_of(vec![
                self.text(f.kind, KIND_DISTINCT),
                self.text(f.index, index),
                self.text(f.value, &value),
            ]);
            if let Some(doc) = self.collect(inner, &q)?.first() {
                return Ok(get_i64(doc, f.id));
            }
            let id = inner.next_id;
            inner.next_id += 1;
            let mut doc = TantivyDocument::default();
            doc.add_text(f.kind, KIND_DISTINCT);
            doc.add_text(f.key, distinct_key(index, id));
            doc.add_text(f.index, index);
            doc.add_i64(f.id, id);
            doc.add_text(f.value, &value);
            doc.add_text(f.sort_value, &sort_value);
            // Committed at once so that no later rollback can orphan entries pointing at it.
            if let Err(e) = inner.writer.add_document(doc).map_err(StoreError::from).and_then(|_| Self::commit(inner)) {
                inner.writer.rollback()?;
                return Err(e);
            }
            debug!(index, id, "allocated distinct value");
            Ok(id)
        })
    }

    fn read_distinct_mapping(&self, item_id: i64, index: &str) -> Result<BTreeSet<i64>, StoreError> {
        let f = self.fields;
        self.with_inner(|inner| {
            let q = self.all_of(vec![
                self.text(f.kind, KIND_ENTRY),
                self.text(f.index, index),
                self.int(f.item_id, item_id),
            ]);
            Ok(self.collect(inner, &q)?.iter().map(|d| get_i64(d, f.id)).collect())
        })
    }

    fn read_item_entry(&self, index: &str, item_id: i64) -> Result<Option<IndexEntry>, StoreError> {
        let f = self.fields;
        self.with_inner(|inner| {
            let q = self.all_of(vec![
                self.text(f.kind, KIND_ENTRY),
                self.text(f.index, index),
                self.int(f.id, item_id),
                self.int(f.item_id, item_id),
            ]);
            Ok(self.collect(inner, &q)?.first().map(|d| self.to_entry(index, d)))
        })
    }

    fn clear_index(&self, index: &str) -> Result<(), StoreError> {
        let f = self.fields;
        self.with_inner(|inner| {
            inner.writer.delete_term(Term::from_field_text(f.index, index));
            Self::commit(inner)?;
            info!(index, "cleared browse index");
            Ok(())
        })
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        self.with_inner(|inner| {
            inner.writer.delete_all_documents()?;
            Self::commit(inner)?;
            inner.next_id = 1;
            info!("cleared all browse indexes");
            Ok(())
        })
    }

    fn indexed_item_ids(&self, index: &str) -> Result<BTreeSet<i64>, StoreError> {
        let f = self.fields;
        self.with_inner(|inner| Ok(self.entries_of(inner, index)?.iter().map(|d| get_i64(d, f.item_id)).collect()))
    }

    fn known_item_ids(&self) -> Result<BTreeSet<i64>, StoreError> {
        let f = self.fields;
        self.with_inner(|inner| {
            let q = BooleanQuery::new(vec![
                (Occur::Should, self.text(f.kind, KIND_ENTRY)),
                (Occur::Should, self.text(f.kind, KIND_CONTAINER)),
                (Occur::Should, self.text(f.kind, KIND_SORT)),
            ]);
            Ok(self.collect(inner, &q)?.iter().map(|d| get_i64(d, f.item_id)).collect())
        })
    }

    fn prune_distinct(&self, index: &str) -> Result<usize, StoreError> {
        let f = self.fields;
        self.with_inner(|inner| {
            let mapped: BTreeSet<i64> = self.entries_of(inner, index)?.iter().map(|d| get_i64(d, f.id)).collect();
            let mut pruned = 0;
            for doc in self.distinct_of(inner, index)? {
                let id = get_i64(&doc, f.id);
                if !mapped.contains(&id) {
                    inner.writer.delete_term(Term::from_field_text(f.key, &distinct_key(index, id)));
                    pruned += 1;
                }
            }
            if pruned > 0 {
                Self::commit(inner)?;
                debug!(index, pruned, "pruned distinct values");
            }
            Ok(pruned)
        })
    }

    fn remove_item(&self, item_id: i64) -> Result<(), StoreError> {
        let f = self.fields;
        self.with_inner(|inner| {
            inner.writer.delete_term(Term::from_field_i64(f.item_id, item_id));
            Self::commit(inner)
        })
    }

    fn count_items(&self, container: &ContainerRef) -> Result<u64, StoreError> {
        let f = self.fields;
        self.with_inner(|inner| {
            let q = self.all_of(vec![
                self.text(f.kind, KIND_CONTAINER),
                self.text(f.container_type, container.entity_type.as_str()),
                self.int(f.id, container.id),
            ]);
            self.count(inner, &q)
        })
    }

    fn browse_values(&self, index: &str, query: &BrowseQuery) -> Result<Vec<DistinctValue>, StoreError> {
        let f = self.fields;
        self.with_inner(|inner| {
            let mapped: BTreeSet<i64> = self.entries_of(inner, index)?.iter().map(|d| get_i64(d, f.id)).collect();
            let mut rows: Vec<DistinctValue> = self
                .distinct_of(inner, index)?
                .iter()
                .map(|d| DistinctValue { id: get_i64(d, f.id), value: get_str(d, f.value), sort_key: get_str(d, f.sort_value) })
                .filter(|v| mapped.contains(&v.id) && has_prefix(&v.sort_key, query))
                .collect();
            rows.sort_by(|a, b| a.sort_key.cmp(&b.sort_key).then(a.id.cmp(&b.id)));
            Ok(paginate(rows, query))
        })
    }

    fn browse_items(&self, index: &str, query: &BrowseQuery) -> Result<Vec<IndexEntry>, StoreError> {
        self.with_inner(|inner| {
            let option_keys = match &query.sort_by {
                Some(option) => Some(self.sort_keys_of(inner, option)?),
                None => None,
            };
            let mut rows: Vec<(String, IndexEntry)> = self
                .entries_of(inner, index)?
                .iter()
                .map(|d| {
                    let e = self.to_entry(index, d);
                    let key = match &option_keys {
                        Some(keys) => keys.get(&e.item_id).cloned().unwrap_or_default(),
                        None => e.sort_key.clone(),
                    };
                    (key, e)
                })
                .filter(|(key, _)| has_prefix(key, query))
                .collect();
            rows.sort_by(|(ka, a), (kb, b)| ka.cmp(kb).then(a.item_id.cmp(&b.item_id)).then(a.id.cmp(&b.id)));
            Ok(paginate(rows.into_iter().map(|(_, e)| e).collect(), query))
        })
    }

    fn items_for_value(&self, index: &str, distinct_id: i64, query: &BrowseQuery) -> Result<Vec<i64>, StoreError> {
        let f = self.fields;
        self.with_inner(|inner| {
            let q = self.all_of(vec![
                self.text(f.kind, KIND_ENTRY),
                self.text(f.index, index),
                self.int(f.id, distinct_id),
            ]);
            let mut items: Vec<i64> = self.collect(inner, &q)?.iter().map(|d| get_i64(d, f.item_id)).collect();
            items.sort_unstable();
            if let Some(option) = &query.sort_by {
                let keys = self.sort_keys_of(inner, option)?;
                let mut keyed: Vec<(String, i64)> = items
                    .into_iter()
                    .map(|item| (keys.get(&item).cloned().unwrap_or_default(), item))
                    .filter(|(key, _)| has_prefix(key, query))
                    .collect();
                keyed.sort();
                items = keyed.into_iter().map(|(_, item)| item).collect();
            }
            Ok(paginate(items, query))
        })
    }

    fn entry_count(&self, index: &str) -> Result<u64, StoreError> {
        let f = self.fields;
        self.with_inner(|inner| {
            self.count(inner, &self.all_of(vec![self.text(f.kind, KIND_ENTRY), self.text(f.index, index)]))
        })
    }

    fn snapshot(&self) -> Result<Vec<StoredRow>, StoreError> {
        let f = self.fields;
        self.with_inner(|inner| {
            let mut out = Vec::new();
            for doc in self.collect(inner, &AllQuery)? {
                let row = match get_str(&doc, f.kind).as_str() {
                    KIND_DISTINCT => StoredRow {
                        kind: RowKind::Distinct,
                        index: get_str(&doc, f.index),
                        id: get_i64(&doc, f.id),
                        item_id: None,
                        sort_key: get_str(&doc, f.sort_value),
                        value: get_str(&doc, f.value),
                    },
                    KIND_ENTRY => StoredRow {
                        kind: RowKind::Entry,
                        index: get_str(&doc, f.index),
                        id: get_i64(&doc, f.id),
                        item_id: Some(get_i64(&doc, f.item_id)),
                        sort_key: get_str(&doc, f.sort_value),
                        value: get_str(&doc, f.value),
                    },
                    KIND_SORT => StoredRow {
                        kind: RowKind::SortKey,
                        index: get_str(&doc, f.sort_option),
                        id: get_i64(&doc, f.id),
                        item_id: Some(get_i64(&doc, f.item_id)),
                        sort_key: get_str(&doc, f.sort_value),
                        value: String::new(),
                    },
                    _ => StoredRow {
                        kind: RowKind::Container,
                        index: get_str(&doc, f.container_type),
                        id: get_i64(&doc, f.id),
                        item_id: Some(get_i64(&doc, f.item_id)),
                        sort_key: String::new(),
                        value: String::new(),
                    },
                };
                out.push(row);
            }
            out.sort();
            Ok(out)
        })
    }
}
