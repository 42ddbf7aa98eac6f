//! Orchestration of browse index maintenance: full rebuild, full clear and
//! single-item reindex over one [`BrowseStore`].
//!
//! One rebuild or clear runs at a time. Single-item reindexes may overlap each
//! other but never a rebuild or clear; a conflicting call fails with
//! [`EngineError::Busy`] instead of waiting. Reindexes of the same item id are
//! serialised so that each one reads the mapping the previous one wrote.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use browse_model::{BrowsableEntity, BrowseIndexDefinition, EntityType, EntryKey, IndexEntry, MetadataValue, SortOption};
use browse_store::reconcile::reconcile;
use browse_store::{BrowseStore, StoreError, StoreRegistry, WriteBatch};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::{Catalog, CatalogError, EntityFilter};
use crate::config::{validate_definitions, validate_sort_options, BrowseConfig};
use crate::error::EngineError;
use crate::progress::{CancelToken, ProgressEvent, ProgressSink, TracingSink};

/// Item reindexes hash onto this many locks.
const ITEM_LOCK_STRIPES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    Rebuilding,
    Clearing,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineState::Idle => "idle",
            EngineState::Rebuilding => "rebuilding",
            EngineState::Clearing => "clearing",
        })
    }
}

/// Rows written and removed for one item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub item_id: i64,
    pub written: usize,
    pub removed: usize,
}

impl ItemOutcome {
    pub fn is_unchanged(&self) -> bool {
        self.written == 0 && self.removed == 0
    }
}

/// Summary of one [`IndexEngine::rebuild_all`] run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub backend: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Items indexed without error.
    pub processed: usize,
    pub unchanged: usize,
    pub entries_written: usize,
    pub entries_removed: usize,
    pub stale_items_removed: usize,
    pub distinct_pruned: usize,
    /// Item id to error message, for tolerant runs.
    pub failures: BTreeMap<i64, String>,
    pub canceled: bool,
    pub report_path: Option<PathBuf>,
}

impl RebuildReport {
    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.canceled
    }

    /// Process exit code for command-line callers: 0 on full success, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    pub fn write_json(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut w = BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer_pretty(&mut w, self).map_err(std::io::Error::from)?;
        w.flush()?;
        Ok(())
    }

    fn record(&mut self, outcome: &ItemOutcome) {
        self.processed += 1;
        self.entries_written += outcome.written;
        self.entries_removed += outcome.removed;
        if outcome.is_unchanged() {
            self.unchanged += 1;
        }
    }
}

#[derive(Debug)]
struct Activity {
    state: EngineState,
    reindexing: usize,
}

fn lock(activity: &Mutex<Activity>) -> MutexGuard<'_, Activity> {
    activity.lock().unwrap_or_else(|p| p.into_inner())
}

/// Returns the engine to `Idle` when a rebuild or clear ends, however it ends.
struct ExclusiveGuard<'a>(&'a Mutex<Activity>);

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        lock(self.0).state = EngineState::Idle;
    }
}

struct ReindexGuard<'a>(&'a Mutex<Activity>);

impl Drop for ReindexGuard<'_> {
    fn drop(&mut self) {
        let mut a = lock(self.0);
        a.reindexing = a.reindexing.saturating_sub(1);
    }
}

pub struct IndexEngine {
    store: Arc<dyn BrowseStore>,
    definitions: Vec<BrowseIndexDefinition>,
    sort_options: Vec<SortOption>,
    strict: bool,
    report_path: Option<PathBuf>,
    sink: Arc<dyn ProgressSink>,
    activity: Mutex<Activity>,
    item_locks: Vec<Mutex<()>>,
}

impl IndexEngine {
    /// Tolerant engine reporting through [`TracingSink`].
    pub fn new(store: Arc<dyn BrowseStore>, definitions: Vec<BrowseIndexDefinition>) -> Result<Self, EngineError> {
        validate_definitions(&definitions)?;
        Ok(Self {
            store,
            definitions,
            sort_options: Vec::new(),
            strict: false,
            report_path: None,
            sink: Arc::new(TracingSink::default()),
            activity: Mutex::new(Activity { state: EngineState::Idle, reindexing: 0 }),
            item_locks: (0..ITEM_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    /// Build the configured store and engine. Any failure is a configuration error.
    pub fn from_config(cfg: &BrowseConfig, registry: &StoreRegistry) -> Result<Self, EngineError> {
        let store = registry.build(&cfg.store).map_err(|e| match e {
            StoreError::Configuration(msg) => EngineError::Configuration(msg),
            other => EngineError::Configuration(other.to_string()),
        })?;
        Self::new(store, cfg.indexes.clone())?
            .with_sort_options(cfg.sort_options.clone())
            .map(|e| e.with_strict(cfg.strict).with_report_path(cfg.report_path.clone()))
    }

    /// Orderings stored with every archived or withdrawn item.
    pub fn with_sort_options(mut self, options: Vec<SortOption>) -> Result<Self, EngineError> {
        validate_sort_options(&options)?;
        self.sort_options = options;
        Ok(self)
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_report_path(mut self, path: Option<PathBuf>) -> Self {
        self.report_path = path;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn store(&self) -> &Arc<dyn BrowseStore> {
        &self.store
    }

    pub fn definitions(&self) -> &[BrowseIndexDefinition] {
        &self.definitions
    }

    pub fn sort_options(&self) -> &[SortOption] {
        &self.sort_options
    }

    pub fn state(&self) -> EngineState {
        lock(&self.activity).state
    }

    pub fn in_flight_reindexes(&self) -> usize {
        lock(&self.activity).reindexing
    }

    fn begin_exclusive(&self, next: EngineState) -> Result<ExclusiveGuard<'_>, EngineError> {
        let mut a = lock(&self.activity);
        if a.state != EngineState::Idle || a.reindexing > 0 {
            return Err(EngineError::Busy { current: a.state, in_flight: a.reindexing });
        }
        a.state = next;
        Ok(ExclusiveGuard(&self.activity))
    }

    fn begin_reindex(&self) -> Result<ReindexGuard<'_>, EngineError> {
        let mut a = lock(&self.activity);
        if a.state != EngineState::Idle {
            return Err(EngineError::Busy { current: a.state, in_flight: a.reindexing });
        }
        a.reindexing += 1;
        Ok(ReindexGuard(&self.activity))
    }

    fn lock_item(&self, item_id: i64) -> MutexGuard<'_, ()> {
        let stripe = item_id.rem_euclid(ITEM_LOCK_STRIPES as i64) as usize;
        self.item_locks[stripe].lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Reindex every item the catalog lists, drop items it no longer lists and
    /// prune distinct values nothing maps to.
    ///
    /// In tolerant mode failing items are collected in the report; in strict
    /// mode the first failure is returned as [`EngineError::ItemFailed`].
    /// Cancellation is checked between items and skips the cleanup phase.
    pub fn rebuild_all(&self, catalog: &dyn Catalog, cancel: Option<&CancelToken>) -> Result<RebuildReport, EngineError> {
        let _guard = self.begin_exclusive(EngineState::Rebuilding)?;
        let mut report = RebuildReport {
            backend: self.store.name().to_string(),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        self.sink.emit(&ProgressEvent::RebuildStarted { backend: self.store.name(), indexes: self.definitions.len() });

        let mut listed = BTreeSet::new();
        for next in catalog.list_entities(&EntityFilter::items())? {
            if cancel.is_some_and(|c| c.is_canceled()) {
                report.canceled = true;
                break;
            }
            let result = match next {
                // Catalogs are asked for items only; anything else is not ours to index.
                Ok(entity) if entity.entity_type() != EntityType::Item => {
                    debug!(key = %entity.index_key(), "skipping non-item entity");
                    continue;
                }
                Ok(entity) => {
                    let item_id = entity.id();
                    listed.insert(item_id);
                    self.index_entity(entity.as_ref()).map_err(|e| (item_id, e))
                }
                // The entity still exists, so its stored rows must survive this run.
                Err(CatalogError::Entity { id, reason }) => {
                    listed.insert(id);
                    Err((id, EngineError::Catalog(CatalogError::Entity { id, reason })))
                }
                Err(e) => return Err(e.into()),
            };
            match result {
                Ok(outcome) => {
                    report.record(&outcome);
                    self.sink.emit(&ProgressEvent::ItemIndexed(outcome));
                }
                Err((item_id, e)) => {
                    self.sink.emit(&ProgressEvent::ItemFailed { item_id, error: e.to_string() });
                    if self.strict {
                        return Err(EngineError::ItemFailed { item_id, source: Box::new(e) });
                    }
                    report.failures.insert(item_id, e.to_string());
                }
            }
        }

        if report.canceled {
            self.sink.emit(&ProgressEvent::Canceled { processed: report.processed });
        } else {
            self.remove_unlisted(&listed, &mut report)?;
        }

        report.finished_at = Some(Utc::now());
        if let Some(path) = &self.report_path {
            report.report_path = Some(path.clone());
            report.write_json(path)?;
            info!(path = ?path, failed = report.failed_count(), "wrote rebuild report");
        }
        self.sink.emit(&ProgressEvent::RebuildFinished { processed: report.processed, failed: report.failed_count() });
        Ok(report)
    }

    fn remove_unlisted(&self, listed: &BTreeSet<i64>, report: &mut RebuildReport) -> Result<(), EngineError> {
        let stale: Vec<i64> = self.store.known_item_ids()?.difference(listed).copied().collect();
        for item_id in stale {
            self.store.remove_item(item_id)?;
            report.stale_items_removed += 1;
            self.sink.emit(&ProgressEvent::StaleItemRemoved { item_id });
        }
        for def in self.definitions.iter().filter(|d| d.is_distinct()) {
            let removed = self.store.prune_distinct(&def.name)?;
            if removed > 0 {
                report.distinct_pruned += removed;
                self.sink.emit(&ProgressEvent::DistinctPruned { index: def.name.clone(), removed });
            }
        }
        Ok(())
    }

    /// Drop every browse row of every index.
    pub fn clear_all(&self) -> Result<(), EngineError> {
        let _guard = self.begin_exclusive(EngineState::Clearing)?;
        self.store.clear_all()?;
        self.sink.emit(&ProgressEvent::Cleared);
        Ok(())
    }

    /// Bring one item's rows in line with its current metadata.
    ///
    /// Collections and communities are rejected with [`EngineError::UnsupportedEntity`].
    pub fn reindex_one(&self, entity: &dyn BrowsableEntity) -> Result<ItemOutcome, EngineError> {
        let _guard = self.begin_reindex()?;
        let outcome = self.index_entity(entity)?;
        self.sink.emit(&ProgressEvent::ItemIndexed(outcome));
        Ok(outcome)
    }

    /// Drop an item deleted from the catalog.
    pub fn remove_item(&self, item_id: i64) -> Result<(), EngineError> {
        let _guard = self.begin_reindex()?;
        let _item = self.lock_item(item_id);
        self.store.remove_item(item_id)?;
        Ok(())
    }

    /// Fetch, project, reconcile and persist one entity as a single batch.
    fn index_entity(&self, entity: &dyn BrowsableEntity) -> Result<ItemOutcome, EngineError> {
        if entity.entity_type() != EntityType::Item {
            return Err(EngineError::UnsupportedEntity { key: entity.index_key() });
        }
        let item_id = entity.id();
        let _item = self.lock_item(item_id);
        let mut batch = WriteBatch::new(item_id);

        for def in &self.definitions {
            let values = if def.admits(entity) { def.values_of(entity) } else { Vec::new() };
            if def.is_distinct() {
                self.project_distinct(def, item_id, &values, &mut batch)?;
            } else {
                self.project_item(def, item_id, values.first(), &mut batch)?;
            }
        }

        let in_archive = entity.is_archived() && !entity.is_withdrawn();
        batch.containers = Some(if in_archive { entity.containers() } else { Vec::new() });
        let listed = entity.is_archived() || entity.is_withdrawn();
        batch.sort_keys = Some(if listed { self.sort_keys_of(entity) } else { BTreeMap::new() });

        let (written, removed) = batch.counts();
        self.store.apply(&batch)?;
        Ok(ItemOutcome { item_id, written, removed })
    }

    fn project_distinct(
        &self,
        def: &BrowseIndexDefinition,
        item_id: i64,
        values: &[MetadataValue],
        batch: &mut WriteBatch,
    ) -> Result<(), EngineError> {
        let previous = self.store.read_distinct_mapping(item_id, &def.name)?;
        let mut projected: BTreeMap<i64, IndexEntry> = BTreeMap::new();
        for v in values {
            let sort_key = def.data_type.make_sort_string(&v.value, v.language.as_deref());
            let id = self.store.resolve_distinct_id(&def.name, &v.value, &sort_key)?;
            projected.entry(id).or_insert_with(|| IndexEntry {
                index: def.name.clone(),
                id,
                sort_key,
                value: v.value.clone(),
                item_id,
            });
        }
        let current: BTreeSet<i64> = projected.keys().copied().collect();
        let delta = reconcile(item_id, &def.name, &previous, &current)?;

        batch.write(&def.name, delta.added.iter().filter_map(|id| projected.remove(id)).collect());
        batch.remove(&def.name, delta.removed.iter().map(|&id| EntryKey { id, item_id }).collect());
        Ok(())
    }

    fn project_item(
        &self,
        def: &BrowseIndexDefinition,
        item_id: i64,
        value: Option<&MetadataValue>,
        batch: &mut WriteBatch,
    ) -> Result<(), EngineError> {
        let stored = self.store.read_item_entry(&def.name, item_id)?;
        match (value, stored) {
            (Some(v), stored) => {
                let fresh = IndexEntry {
                    index: def.name.clone(),
                    id: item_id,
                    sort_key: def.data_type.make_sort_string(&v.value, v.language.as_deref()),
                    value: v.value.clone(),
                    item_id,
                };
                if stored.map_or(true, |s| !self.is_stored_as(&s, &fresh)) {
                    batch.write(&def.name, vec![fresh]);
                }
            }
            (None, Some(s)) => batch.remove(&def.name, vec![s.key()]),
            (None, None) => {}
        }
        Ok(())
    }

    fn sort_keys_of(&self, entity: &dyn BrowsableEntity) -> BTreeMap<String, String> {
        self.sort_options
            .iter()
            .filter_map(|o| o.sort_key_of(entity).map(|key| (o.name.clone(), key)))
            .collect()
    }

    /// Whether `stored` already holds `fresh` after column truncation.
    fn is_stored_as(&self, stored: &IndexEntry, fresh: &IndexEntry) -> bool {
        let limits = self.store.limits();
        stored.value == *limits.truncate_value(&fresh.value) && stored.sort_key == *limits.truncate_sort_value(&fresh.sort_key)
    }
}
