use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use browse_model::{BrowseIndexDefinition, SortOption};
use browse_store::StoreConfig;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

const INDEX_PREFIX: &str = "browse.index.";
const SORT_OPTION_PREFIX: &str = "browse.sort-option.";

/// Everything the engine reads at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowseConfig {
    pub store: StoreConfig,
    /// Abort a rebuild on the first failing item.
    pub strict: bool,
    /// Where a rebuild report is written as JSON.
    pub report_path: Option<PathBuf>,
    pub indexes: Vec<BrowseIndexDefinition>,
    pub sort_options: Vec<SortOption>,
}

impl BrowseConfig {
    /// Build from flat named properties such as `browse.store` and `browse.index.1`.
    ///
    /// Unknown keys are ignored. Index definitions and sort options are ordered by their number.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, EngineError> {
        let mut cfg = BrowseConfig::default();
        let get = |k: &str| props.get(k).map(|v| v.trim()).filter(|v| !v.is_empty());

        if let Some(v) = get("browse.store") {
            cfg.store.backend = v.to_string();
        }
        if let Some(v) = get("browse.store.path") {
            cfg.store.path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("browse.value_columns.max") {
            cfg.store.value_max_chars = parse_int("browse.value_columns.max", v)?;
        }
        if let Some(v) = get("browse.sort_columns.max") {
            cfg.store.sort_max_chars = parse_int("browse.sort_columns.max", v)?;
        }
        // The mark is taken verbatim so that a blank value can disable it.
        if let Some(v) = props.get("browse.value_columns.omission_mark") {
            cfg.store.omission_mark = v.clone();
        }
        if let Some(v) = get("browse.store.busy_timeout_ms") {
            cfg.store.busy_timeout_ms = parse_int("browse.store.busy_timeout_ms", v)?;
        }
        if let Some(v) = get("browse.rebuild.strict") {
            cfg.strict = match v.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => true,
                "false" | "no" | "0" => false,
                other => {
                    return Err(EngineError::Configuration(format!("browse.rebuild.strict: not a boolean: {other}")))
                }
            };
        }
        if let Some(v) = get("browse.rebuild.report_path") {
            cfg.report_path = Some(PathBuf::from(v));
        }

        cfg.indexes = numbered(props, INDEX_PREFIX, BrowseIndexDefinition::parse)?;
        cfg.sort_options = numbered(props, SORT_OPTION_PREFIX, SortOption::parse)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let cfg: BrowseConfig =
            serde_json::from_str(json).map_err(|e| EngineError::Configuration(format!("invalid browse config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Index and sort option names must be non-empty and unique.
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_definitions(&self.indexes)?;
        validate_sort_options(&self.sort_options)
    }
}

/// Values of every `<prefix><n>` key, parsed and ordered by `n`.
fn numbered<T, E: std::fmt::Display>(
    props: &HashMap<String, String>,
    prefix: &str,
    parse: impl Fn(&str) -> Result<T, E>,
) -> Result<Vec<T>, EngineError> {
    let mut out = BTreeMap::new();
    for (key, line) in props {
        let Some(n) = key.strip_prefix(prefix) else { continue };
        let n: u32 = parse_int(key, n)?;
        let parsed = parse(line).map_err(|e| EngineError::Configuration(format!("{key}: {e}")))?;
        out.insert(n, parsed);
    }
    Ok(out.into_values().collect())
}

pub(crate) fn validate_definitions(defs: &[BrowseIndexDefinition]) -> Result<(), EngineError> {
    let mut names = BTreeSet::new();
    for def in defs {
        if def.name.trim().is_empty() || def.fields.is_empty() {
            return Err(EngineError::Configuration(format!("incomplete browse index definition '{}'", def.name)));
        }
        if !names.insert(def.name.as_str()) {
            return Err(EngineError::Configuration(format!("duplicate browse index '{}'", def.name)));
        }
    }
    Ok(())
}

pub(crate) fn validate_sort_options(options: &[SortOption]) -> Result<(), EngineError> {
    let mut names = BTreeSet::new();
    for option in options {
        if option.name.trim().is_empty() {
            return Err(EngineError::Configuration("sort option without a name".into()));
        }
        if !names.insert(option.name.as_str()) {
            return Err(EngineError::Configuration(format!("duplicate sort option '{}'", option.name)));
        }
    }
    Ok(())
}

fn parse_int<T: std::str::FromStr>(key: &str, v: &str) -> Result<T, EngineError>
where
    T::Err: std::fmt::Display,
{
    v.trim()
        .parse()
        .map_err(|e| EngineError::Configuration(format!("{key}: '{v}' is not a valid number: {e}")))
}
