//! Shared models used across crates

pub mod definition;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use definition::{BrowseIndexDefinition, DefinitionError, IndexKind, SortDataType, SortOption};

/// Wildcard accepted for qualifier and language in [`FieldKey`].
pub const ANY: &str = "*";

/// Kind of catalog object. Together with the id it forms the global index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Item,
    Collection,
    Community,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Item => "item",
            EntityType::Collection => "collection",
            EntityType::Community => "community",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "item" => Some(EntityType::Item),
            "collection" => Some(EntityType::Collection),
            "community" => Some(EntityType::Community),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metadata field selector: `schema.element[.qualifier]` plus an optional language.
///
/// `None` qualifier only matches unqualified values; [`ANY`] matches every qualifier.
/// `None` language matches every language.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldKey {
    pub schema: String,
    pub element: String,
    #[serde(default)]
    pub qualifier: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl FieldKey {
    pub fn new(schema: impl Into<String>, element: impl Into<String>, qualifier: Option<&str>) -> Self {
        Self {
            schema: schema.into(),
            element: element.into(),
            qualifier: qualifier.map(str::to_string),
            language: None,
        }
    }

    /// Parse the dotted form `dc.contributor.author` or `dc.contributor.*`.
    pub fn parse(field: &str) -> Option<Self> {
        let mut parts = field.trim().split('.');
        let schema = parts.next().filter(|s| !s.is_empty())?;
        let element = parts.next().filter(|s| !s.is_empty())?;
        let qualifier = parts.next().filter(|s| !s.is_empty());
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(schema, element, qualifier))
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Whether a stored metadata entry is selected by this key.
    pub fn matches(&self, entry: &MetadataEntry) -> bool {
        if self.schema != entry.schema || self.element != entry.element {
            return false;
        }
        let qualifier_ok = match self.qualifier.as_deref() {
            Some(ANY) => true,
            Some(q) => entry.qualifier.as_deref() == Some(q),
            None => entry.qualifier.is_none(),
        };
        let language_ok = match self.language.as_deref() {
            None | Some(ANY) => true,
            Some(lang) => entry.value.language.as_deref() == Some(lang),
        };
        qualifier_ok && language_ok
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.element)?;
        if let Some(q) = &self.qualifier {
            write!(f, ".{q}")?;
        }
        Ok(())
    }
}

/// One metadata value with its (optional) language tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataValue {
    pub value: String,
    #[serde(default)]
    pub language: Option<String>,
}

impl MetadataValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into(), language: None }
    }
}

/// A fully qualified metadata value as held by a catalog record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub schema: String,
    pub element: String,
    #[serde(default)]
    pub qualifier: Option<String>,
    #[serde(flatten)]
    pub value: MetadataValue,
}

/// A collection or community an item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerRef {
    pub entity_type: EntityType,
    pub id: i64,
}

impl ContainerRef {
    pub fn collection(id: i64) -> Self { Self { entity_type: EntityType::Collection, id } }
    pub fn community(id: i64) -> Self { Self { entity_type: EntityType::Community, id } }
}

/// Capability contract for anything that can be projected into browse indexes.
pub trait BrowsableEntity: Send + Sync {
    fn id(&self) -> i64;
    fn entity_type(&self) -> EntityType;
    fn is_archived(&self) -> bool;
    fn is_withdrawn(&self) -> bool;
    fn is_discoverable(&self) -> bool;
    /// Values for `field`, in catalog order.
    fn metadata(&self, field: &FieldKey) -> Vec<MetadataValue>;

    /// Collections and communities owning this entity.
    fn containers(&self) -> Vec<ContainerRef> {
        Vec::new()
    }

    /// Globally unique key, e.g. `item-42`.
    fn index_key(&self) -> String {
        format!("{}-{}", self.entity_type(), self.id())
    }
}

/// Catalog record projected for browsing. Holds the record, exposes only the
/// browse-relevant accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: i64,
    pub entity_type: EntityType,
    pub archived: bool,
    pub withdrawn: bool,
    pub discoverable: bool,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
    #[serde(default)]
    pub containers: Vec<ContainerRef>,
}

impl CatalogItem {
    /// An archived, discoverable, not withdrawn item without metadata.
    pub fn item(id: i64) -> Self {
        Self {
            id,
            entity_type: EntityType::Item,
            archived: true,
            withdrawn: false,
            discoverable: true,
            metadata: Vec::new(),
            containers: Vec::new(),
        }
    }

    /// Append a value for a dotted field name (`dc.title`, `dc.contributor.author`).
    pub fn with_value(mut self, field: &str, value: impl Into<String>) -> Self {
        self.push_value(field, MetadataValue::new(value));
        self
    }

    pub fn with_container(mut self, container: ContainerRef) -> Self {
        self.containers.push(container);
        self
    }

    pub fn push_value(&mut self, field: &str, value: MetadataValue) {
        let mut parts = field.splitn(3, '.');
        let schema = parts.next().unwrap_or_default().to_string();
        let element = parts.next().unwrap_or_default().to_string();
        let qualifier = parts.next().map(str::to_string);
        self.metadata.push(MetadataEntry { schema, element, qualifier, value });
    }

    /// Drop every value of `field` (exact qualifier match).
    pub fn clear_field(&mut self, field: &str) {
        if let Some(key) = FieldKey::parse(field) {
            self.metadata.retain(|e| !key.matches(e));
        }
    }
}

impl BrowsableEntity for CatalogItem {
    fn id(&self) -> i64 { self.id }
    fn entity_type(&self) -> EntityType { self.entity_type }
    fn is_archived(&self) -> bool { self.archived }
    fn is_withdrawn(&self) -> bool { self.withdrawn }
    fn is_discoverable(&self) -> bool { self.discoverable }

    fn metadata(&self, field: &FieldKey) -> Vec<MetadataValue> {
        self.metadata
            .iter()
            .filter(|e| field.matches(e))
            .map(|e| e.value.clone())
            .collect()
    }

    fn containers(&self) -> Vec<ContainerRef> {
        self.containers.clone()
    }
}

/// One stored browse row: a distinct value mapped to an item, or an item row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub index: String,
    /// Distinct-value id for distinct indexes, item id for item indexes.
    pub id: i64,
    pub sort_key: String,
    pub value: String,
    pub item_id: i64,
}

impl IndexEntry {
    pub fn key(&self) -> EntryKey {
        EntryKey { id: self.id, item_id: self.item_id }
    }
}

/// Identity of one stored entry within an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    pub id: i64,
    pub item_id: i64,
}

/// One row of a distinct-value table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistinctValue {
    pub id: i64,
    pub value: String,
    pub sort_key: String,
}

/// Set difference between an item's previous and current distinct mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingDelta {
    pub added: Vec<i64>,
    pub retained: Vec<i64>,
    pub removed: Vec<i64>,
}

impl MappingDelta {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_key_parse_and_match() {
        let any = FieldKey::parse("dc.contributor.*").expect("valid key");
        let author = FieldKey::parse("dc.contributor.author").expect("valid key");
        let bare = FieldKey::parse("dc.contributor").expect("valid key");
        assert!(FieldKey::parse("dc").is_none());
        assert!(FieldKey::parse("dc.a.b.c").is_none());

        let item = CatalogItem::item(1)
            .with_value("dc.contributor.author", "Doe, Jane")
            .with_value("dc.contributor.editor", "Roe, Rick")
            .with_value("dc.contributor", "Anonymous");

        assert_eq!(item.metadata(&any).len(), 3);
        assert_eq!(item.metadata(&author), vec![MetadataValue::new("Doe, Jane")]);
        assert_eq!(item.metadata(&bare), vec![MetadataValue::new("Anonymous")]);
    }

    #[test]
    fn language_filter_applies_only_when_set() {
        let mut item = CatalogItem::item(7);
        item.push_value("dc.title", MetadataValue { value: "Titel".into(), language: Some("de".into()) });
        item.push_value("dc.title", MetadataValue { value: "Title".into(), language: Some("en".into()) });

        let all = FieldKey::parse("dc.title").unwrap();
        let en = FieldKey::parse("dc.title").unwrap().with_language("en");
        assert_eq!(item.metadata(&all).len(), 2);
        assert_eq!(item.metadata(&en)[0].value, "Title");
    }

    #[test]
    fn index_key_combines_type_and_id() {
        let mut c = CatalogItem::item(12);
        assert_eq!(c.index_key(), "item-12");
        c.entity_type = EntityType::Collection;
        assert_eq!(c.index_key(), "collection-12");
    }
}
