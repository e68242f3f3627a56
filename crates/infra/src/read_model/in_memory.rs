use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use catalog_events::ApplyOutcome;
use catalog_products::{ProductId, ProductSnapshot};

use super::{clamp_limit, Page, ReadChange, ReadRecord, ReadStore, ReadStoreError};

#[derive(Debug, Clone)]
struct Row {
    snapshot: ProductSnapshot,
    version: u64,
    deleted: bool,
}

impl Row {
    fn visible(&self) -> Option<ReadRecord> {
        (!self.deleted).then(|| ReadRecord {
            product: self.snapshot.clone(),
            last_applied_version: self.version,
        })
    }
}

/// In-memory read store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryReadStore {
    rows: RwLock<HashMap<ProductId, Row>>,
}

impl InMemoryReadStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted_visible(&self) -> Result<Vec<ReadRecord>, ReadStoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        let mut records: Vec<ReadRecord> = rows.values().filter_map(Row::visible).collect();
        records.sort_by(|a, b| {
            a.product
                .name
                .cmp(&b.product.name)
                .then_with(|| a.product.id.cmp(&b.product.id))
        });
        Ok(records)
    }
}

fn poisoned() -> ReadStoreError {
    ReadStoreError::Unavailable("lock poisoned".to_string())
}

#[async_trait]
impl ReadStore for InMemoryReadStore {
    async fn get(&self, id: ProductId) -> Result<Option<ReadRecord>, ReadStoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.get(&id).and_then(Row::visible))
    }

    async fn applied_version(&self, id: ProductId) -> Result<Option<u64>, ReadStoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.get(&id).map(|r| r.version))
    }

    async fn apply(&self, change: ReadChange) -> Result<ApplyOutcome, ReadStoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let id = change.snapshot.id;

        if let Some(existing) = rows.get(&id) {
            if change.version <= existing.version {
                return Ok(ApplyOutcome::Stale {
                    current: existing.version,
                });
            }
        }

        rows.insert(
            id,
            Row {
                snapshot: change.snapshot,
                version: change.version,
                deleted: change.deleted,
            },
        );
        Ok(ApplyOutcome::Applied)
    }

    async fn list_all(&self) -> Result<Vec<ReadRecord>, ReadStoreError> {
        self.sorted_visible()
    }

    async fn list_page(&self, limit: u32, offset: u64) -> Result<Page, ReadStoreError> {
        let all = self.sorted_visible()?;
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(clamp_limit(limit) as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn clear(&self) -> Result<(), ReadStoreError> {
        self.rows.write().map_err(|_| poisoned())?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::EntityId;
    use proptest::prelude::*;

    fn snapshot(id: ProductId, name: &str, stock: i64) -> ProductSnapshot {
        ProductSnapshot {
            id,
            name: name.to_string(),
            description: None,
            price: 1.5,
            stock,
        }
    }

    fn change(id: ProductId, name: &str, version: u64) -> ReadChange {
        ReadChange {
            snapshot: snapshot(id, name, version as i64),
            version,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn first_change_for_an_id_is_applied() {
        let store = InMemoryReadStore::new();
        let id = ProductId::generate();

        assert_eq!(store.apply(change(id, "Widget", 0)).await.unwrap(), ApplyOutcome::Applied);

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.last_applied_version, 0);
        assert_eq!(record.product.name, "Widget");
    }

    #[tokio::test]
    async fn older_or_equal_versions_are_stale() {
        let store = InMemoryReadStore::new();
        let id = ProductId::generate();
        store.apply(change(id, "v1", 1)).await.unwrap();

        assert_eq!(
            store.apply(change(id, "v1-again", 1)).await.unwrap(),
            ApplyOutcome::Stale { current: 1 }
        );
        assert_eq!(
            store.apply(change(id, "v0", 0)).await.unwrap(),
            ApplyOutcome::Stale { current: 1 }
        );
        assert_eq!(store.get(id).await.unwrap().unwrap().product.name, "v1");
    }

    #[tokio::test]
    async fn tombstones_are_hidden_but_keep_rejecting_old_versions() {
        let store = InMemoryReadStore::new();
        let id = ProductId::generate();
        store.apply(change(id, "Widget", 0)).await.unwrap();
        store
            .apply(ReadChange { deleted: true, ..change(id, "Widget", 1) })
            .await
            .unwrap();

        assert_eq!(store.get(id).await.unwrap(), None);
        assert_eq!(store.applied_version(id).await.unwrap(), Some(1));
        assert!(store.list_all().await.unwrap().is_empty());
        assert_eq!(store.list_page(10, 0).await.unwrap().total, 0);

        assert_eq!(
            store.apply(change(id, "Widget", 0)).await.unwrap(),
            ApplyOutcome::Stale { current: 1 }
        );
        assert_eq!(store.get(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn pages_are_ordered_by_name_then_id() {
        let store = InMemoryReadStore::new();
        let a = ProductId::new(EntityId::from_uuid(uuid::Uuid::from_u128(1)));
        let b = ProductId::new(EntityId::from_uuid(uuid::Uuid::from_u128(2)));
        store.apply(change(b, "Same", 0)).await.unwrap();
        store.apply(change(a, "Same", 0)).await.unwrap();
        store.apply(change(ProductId::generate(), "Alpha", 0)).await.unwrap();

        let names: Vec<_> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.product.name, r.product.id))
            .collect();

        assert_eq!(names[0].0, "Alpha");
        assert_eq!(names[1].1, a);
        assert_eq!(names[2].1, b);
    }

    #[tokio::test]
    async fn names_sort_by_bytes_not_locale() {
        let store = InMemoryReadStore::new();
        for name in ["banana", "Äpfel", "apple", "Banana"] {
            store.apply(change(ProductId::generate(), name, 0)).await.unwrap();
        }

        let names: Vec<_> = store.list_all().await.unwrap().into_iter().map(|r| r.product.name).collect();

        assert_eq!(names, ["Banana", "apple", "banana", "Äpfel"]);
    }

    #[tokio::test]
    async fn page_limit_is_clamped_and_offset_past_end_is_empty() {
        let store = InMemoryReadStore::new();
        for i in 0..3 {
            store.apply(change(ProductId::generate(), &format!("p{i}"), 0)).await.unwrap();
        }

        assert_eq!(store.list_page(0, 0).await.unwrap().items.len(), 1);
        assert_eq!(store.list_page(1000, 0).await.unwrap().items.len(), 3);

        let past_end = store.list_page(10, 50).await.unwrap();
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.total, 3);
    }

    #[tokio::test]
    async fn clear_drops_records_and_tombstones() {
        let store = InMemoryReadStore::new();
        let id = ProductId::generate();
        store.apply(ReadChange { deleted: true, ..change(id, "x", 3) }).await.unwrap();

        store.clear().await.unwrap();

        assert_eq!(store.applied_version(id).await.unwrap(), None);
        assert_eq!(store.apply(change(id, "x", 0)).await.unwrap(), ApplyOutcome::Applied);
    }

    proptest! {
        // Any delivery order (with duplicates) converges to the highest version.
        #[test]
        fn any_delivery_order_converges_to_the_latest_version(
            order in Just((0u64..6).chain(0u64..6).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = InMemoryReadStore::new();
                let id = ProductId::generate();
                for v in &order {
                    store.apply(change(id, &format!("v{v}"), *v)).await.unwrap();
                }

                let record = store.get(id).await.unwrap().unwrap();
                prop_assert_eq!(record.last_applied_version, 5);
                prop_assert_eq!(record.product.name, "v5".to_string());
                Ok(())
            })?;
        }
    }
}
