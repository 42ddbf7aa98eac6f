//! Startup-time selection of a [`BrowseStore`] backend by name.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::column_policy::{ColumnLimits, StoreCeilings, DEFAULT_OMISSION_MARK};
use crate::sqlite_store::{SqliteBrowseStore, SQLITE_CEILINGS};
use crate::tantivy_store::{TantivyBrowseStore, TANTIVY_CEILINGS};
use crate::{BrowseStore, StoreError};

/// Backend used when none is configured.
pub const DEFAULT_BACKEND: &str = "sqlite";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: String,
    /// Database file (sqlite) or index directory (tantivy). `None` keeps the store in memory.
    pub path: Option<PathBuf>,
    /// `-1` or `0` means unlimited.
    pub value_max_chars: i64,
    pub sort_max_chars: i64,
    pub omission_mark: String,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            path: None,
            value_max_chars: 0,
            sort_max_chars: 0,
            omission_mark: DEFAULT_OMISSION_MARK.to_string(),
            busy_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn limits(&self, ceilings: StoreCeilings) -> Result<ColumnLimits, StoreError> {
        ColumnLimits::resolve(self.value_max_chars, self.sort_max_chars, &self.omission_mark, ceilings)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

pub type StoreConstructor = fn(&StoreConfig) -> Result<Arc<dyn BrowseStore>, StoreError>;

/// Named store constructors.
#[derive(Clone)]
pub struct StoreRegistry {
    constructors: BTreeMap<String, StoreConstructor>,
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl StoreRegistry {
    pub fn empty() -> Self {
        Self { constructors: BTreeMap::new() }
    }

    /// Registry holding the `sqlite` and `tantivy` backends.
    pub fn with_builtins() -> Self {
        let mut r = Self::empty();
        r.register("sqlite", open_sqlite);
        r.register("tantivy", open_tantivy);
        r
    }

    /// Add or replace a backend.
    pub fn register(&mut self, name: &str, ctor: StoreConstructor) {
        self.constructors.insert(name.to_string(), ctor);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Construct the configured backend. Every failure is a configuration error.
    pub fn build(&self, cfg: &StoreConfig) -> Result<Arc<dyn BrowseStore>, StoreError> {
        let name = if cfg.backend.trim().is_empty() { DEFAULT_BACKEND } else { cfg.backend.trim() };
        let ctor = self.constructors.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.names().collect();
            StoreError::Configuration(format!("unknown browse store '{name}' (known: {})", known.join(", ")))
        })?;
        let store = ctor(cfg).map_err(|e| match e {
            StoreError::Configuration(_) => e,
            other => StoreError::Configuration(format!("cannot open browse store '{name}': {other}")),
        })?;
        info!(
            backend = store.name(),
            value_max_chars = store.limits().max_value_chars(),
            sort_max_chars = store.limits().max_sort_chars(),
            "browse store ready"
        );
        Ok(store)
    }
}

fn open_sqlite(cfg: &StoreConfig) -> Result<Arc<dyn BrowseStore>, StoreError> {
    let limits = cfg.limits(SQLITE_CEILINGS)?;
    let store = match &cfg.path {
        Some(p) => SqliteBrowseStore::open(p, limits, cfg.busy_timeout())?,
        None => SqliteBrowseStore::open_in_memory(limits)?,
    };
    Ok(Arc::new(store))
}

fn open_tantivy(cfg: &StoreConfig) -> Result<Arc<dyn BrowseStore>, StoreError> {
    let limits = cfg.limits(TANTIVY_CEILINGS)?;
    let store = match &cfg.path {
        Some(p) => TantivyBrowseStore::open_in_dir(p, limits)?,
        None => TantivyBrowseStore::open_in_ram(limits)?,
    };
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backend_is_sqlite() {
        let store = StoreRegistry::with_builtins().build(&StoreConfig::default()).unwrap();
        assert_eq!(store.name(), DEFAULT_BACKEND);
        assert_eq!(store.limits().max_value_chars(), 0);
    }

    #[test]
    fn tantivy_ceiling_applies() {
        let cfg = StoreConfig { backend: "tantivy".into(), sort_max_chars: 50_000, ..Default::default() };
        let store = StoreRegistry::with_builtins().build(&cfg).unwrap();
        assert_eq!(store.name(), "tantivy");
        assert_eq!(store.limits().max_sort_chars(), 16_000);
        assert_eq!(store.limits().max_value_chars(), 16_000);
    }

    #[test]
    fn unknown_backend_fails_fast() {
        let cfg = StoreConfig { backend: "oracle".into(), ..Default::default() };
        let err = StoreRegistry::with_builtins().build(&cfg).err().unwrap();
        assert!(matches!(err, StoreError::Configuration(ref m) if m.contains("oracle")));
    }

    #[test]
    fn invalid_limit_is_configuration_error() {
        let cfg = StoreConfig { value_max_chars: -5, ..Default::default() };
        assert!(matches!(StoreRegistry::with_builtins().build(&cfg), Err(StoreError::Configuration(_))));
    }

    #[test]
    fn unreadable_path_becomes_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig { path: Some(dir.path().join("missing").join("browse.db")), ..Default::default() };
        assert!(matches!(StoreRegistry::with_builtins().build(&cfg), Err(StoreError::Configuration(_))));
    }

    #[test]
    fn custom_backend_can_be_registered() {
        fn small(cfg: &StoreConfig) -> Result<Arc<dyn BrowseStore>, StoreError> {
            let limits = cfg.limits(StoreCeilings { value_chars: Some(10), sort_chars: Some(10) })?;
            Ok(Arc::new(SqliteBrowseStore::open_in_memory(limits)?))
        }
        let mut registry = StoreRegistry::empty();
        registry.register("small", small);
        let store = registry
            .build(&StoreConfig { backend: "small".into(), ..Default::default() })
            .unwrap();
        assert_eq!(store.limits().max_value_chars(), 10);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["small"]);
    }

    #[test]
    fn config_from_json_uses_defaults() {
        let cfg: StoreConfig = serde_json::from_str(r#"{"backend":"tantivy","sort_max_chars":200}"#).unwrap();
        assert_eq!(cfg.sort_max_chars, 200);
        assert_eq!(cfg.omission_mark, "...");
        assert_eq!(cfg.busy_timeout_ms, 5_000);
    }
}
