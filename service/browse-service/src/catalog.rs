//! Read-only access to the catalog the browse indexes are derived from.

use std::collections::BTreeMap;
use std::sync::RwLock;

use browse_model::{BrowsableEntity, CatalogItem, EntityType};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// The listing itself cannot be produced.
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
    /// One entity could not be loaded; the listing continues.
    #[error("entity {id} unreadable: {reason}")]
    Entity { id: i64, reason: String },
}

/// Which entities a listing returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFilter {
    pub entity_type: Option<EntityType>,
    pub include_withdrawn: bool,
    pub include_unarchived: bool,
}

impl Default for EntityFilter {
    fn default() -> Self {
        Self { entity_type: None, include_withdrawn: true, include_unarchived: true }
    }
}

impl EntityFilter {
    /// Every item regardless of archival state.
    pub fn items() -> Self {
        Self { entity_type: Some(EntityType::Item), ..Default::default() }
    }

    pub fn accepts(&self, entity: &dyn BrowsableEntity) -> bool {
        self.entity_type.map_or(true, |t| t == entity.entity_type())
            && (self.include_withdrawn || !entity.is_withdrawn())
            && (self.include_unarchived || entity.is_archived())
    }
}

pub type EntityResult = Result<Box<dyn BrowsableEntity>, CatalogError>;
pub type EntityIter<'a> = Box<dyn Iterator<Item = EntityResult> + Send + 'a>;

pub trait Catalog: Send + Sync {
    /// Lazily list entities matching `filter`, ordered by id.
    fn list_entities(&self, filter: &EntityFilter) -> Result<EntityIter<'_>, CatalogError>;
}

/// In-memory catalog keyed by entity id.
#[derive(Default)]
pub struct MemoryCatalog {
    entities: RwLock<BTreeMap<i64, CatalogItem>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: impl IntoIterator<Item = CatalogItem>) -> Self {
        let c = Self::new();
        for item in items {
            c.upsert(item);
        }
        c
    }

    pub fn upsert(&self, item: CatalogItem) {
        let mut map = self.entities.write().unwrap_or_else(|p| p.into_inner());
        map.insert(item.id, item);
    }

    pub fn remove(&self, id: i64) -> Option<CatalogItem> {
        let mut map = self.entities.write().unwrap_or_else(|p| p.into_inner());
        map.remove(&id)
    }

    pub fn get(&self, id: i64) -> Option<CatalogItem> {
        let map = self.entities.read().unwrap_or_else(|p| p.into_inner());
        map.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entities.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Catalog for MemoryCatalog {
    fn list_entities(&self, filter: &EntityFilter) -> Result<EntityIter<'_>, CatalogError> {
        let map = self
            .entities
            .read()
            .map_err(|_| CatalogError::Unavailable("catalog lock poisoned".into()))?;
        let listed: Vec<CatalogItem> = map.values().filter(|e| filter.accepts(*e)).cloned().collect();
        Ok(Box::new(listed.into_iter().map(|e| -> EntityResult { Ok(Box::new(e)) })))
    }
}
