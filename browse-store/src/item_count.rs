//! Per-container item counts read from a store's container mappings.

use std::sync::Arc;

use browse_model::{BrowsableEntity, ContainerRef, EntityType};

use crate::{BrowseStore, StoreError};

/// Number of indexed items in a collection or community.
#[derive(Clone)]
pub struct ItemCounter {
    store: Arc<dyn BrowseStore>,
}

impl ItemCounter {
    pub fn new(store: Arc<dyn BrowseStore>) -> Self {
        Self { store }
    }

    /// Fails with [`StoreError::InvalidEntry`] for anything but a collection or community.
    pub fn get_count(&self, container: &dyn BrowsableEntity) -> Result<u64, StoreError> {
        match container.entity_type() {
            EntityType::Collection | EntityType::Community => self
                .store
                .count_items(&ContainerRef { entity_type: container.entity_type(), id: container.id() }),
            EntityType::Item => Err(StoreError::InvalidEntry(format!(
                "cannot count items in {}",
                container.index_key()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_store::SqliteBrowseStore;
    use crate::{ColumnLimits, WriteBatch};
    use browse_model::CatalogItem;

    fn container(entity_type: EntityType, id: i64) -> CatalogItem {
        CatalogItem { entity_type, ..CatalogItem::item(id) }
    }

    #[test]
    fn counts_items_per_container() {
        let store: Arc<dyn BrowseStore> = Arc::new(SqliteBrowseStore::open_in_memory(ColumnLimits::unlimited()).unwrap());
        for item in 1..=3 {
            let mut batch = WriteBatch::new(item);
            let mut containers = vec![ContainerRef::collection(10)];
            if item != 2 {
                containers.push(ContainerRef::community(20));
            }
            batch.containers = Some(containers);
            store.apply(&batch).unwrap();
        }
        let counter = ItemCounter::new(store);
        assert_eq!(counter.get_count(&container(EntityType::Collection, 10)).unwrap(), 3);
        assert_eq!(counter.get_count(&container(EntityType::Community, 20)).unwrap(), 2);
        assert_eq!(counter.get_count(&container(EntityType::Collection, 11)).unwrap(), 0);
    }

    #[test]
    fn items_are_not_containers() {
        let store = Arc::new(SqliteBrowseStore::open_in_memory(ColumnLimits::unlimited()).unwrap());
        let err = ItemCounter::new(store).get_count(&CatalogItem::item(4)).unwrap_err();
        assert!(err.to_string().contains("item-4"));
    }
}
