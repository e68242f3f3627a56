//! Read-side queries. Served only from the read store; never waits for the
//! projector to catch up, so results may lag accepted commands.

use std::time::Duration;

use thiserror::Error;
use tracing::instrument;

use catalog_products::ProductId;

use crate::read_model::{clamp_limit, Page, ReadRecord, ReadStore, ReadStoreError};
use crate::retry::{retry_transient, RetryPolicy};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("product {0} not found")]
    NotFound(ProductId),

    #[error("read store failure: {0}")]
    TransientStore(String),
}

impl From<ReadStoreError> for QueryError {
    fn from(value: ReadStoreError) -> Self {
        QueryError::TransientStore(value.to_string())
    }
}

/// A page plus the effective paging parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub items: Vec<ReadRecord>,
    pub total: u64,
    pub limit: u32,
    pub offset: u64,
}

pub struct ProductQueryHandler<R> {
    store: R,
    retry: RetryPolicy,
    store_timeout: Duration,
}

impl<R> ProductQueryHandler<R>
where
    R: ReadStore,
{
    pub fn new(store: R) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            store_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy, store_timeout: Duration) -> Self {
        self.retry = retry;
        self.store_timeout = store_timeout;
        self
    }

    #[instrument(skip(self), fields(entity_id = %id), err)]
    pub async fn get(&self, id: ProductId) -> Result<ReadRecord, QueryError> {
        retry_transient(&self.retry, self.store_timeout, "read_store.get", || self.store.get(id))
            .await?
            .ok_or(QueryError::NotFound(id))
    }

    pub async fn list_all(&self) -> Result<Vec<ReadRecord>, QueryError> {
        Ok(retry_transient(&self.retry, self.store_timeout, "read_store.list_all", || {
            self.store.list_all()
        })
        .await?)
    }

    /// Records ordered by name, plus the total count. `limit` is clamped to `1..=100`.
    pub async fn list_page(&self, limit: u32, offset: u64) -> Result<PageResult, QueryError> {
        let limit = clamp_limit(limit);
        let Page { items, total } = retry_transient(&self.retry, self.store_timeout, "read_store.list_page", || {
            self.store.list_page(limit, offset)
        })
        .await?;

        Ok(PageResult {
            items,
            total,
            limit,
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use catalog_products::ProductSnapshot;

    use crate::read_model::{InMemoryReadStore, ReadChange};

    async fn seeded(names: &[&str]) -> ProductQueryHandler<InMemoryReadStore> {
        let store = InMemoryReadStore::new();
        for name in names {
            store
                .apply(ReadChange {
                    snapshot: ProductSnapshot {
                        id: ProductId::generate(),
                        name: name.to_string(),
                        description: None,
                        price: 2.5,
                        stock: 4,
                    },
                    version: 0,
                    deleted: false,
                })
                .await
                .unwrap();
        }
        ProductQueryHandler::new(store)
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let q = seeded(&[]).await;
        let id = ProductId::generate();
        assert_eq!(q.get(id).await.unwrap_err(), QueryError::NotFound(id));
    }

    #[tokio::test]
    async fn pages_of_two_over_five_items_cover_everything_once() {
        let q = seeded(&["e", "c", "a", "d", "b"]).await;

        let mut seen = HashSet::new();
        let mut sizes = Vec::new();
        let mut names = Vec::new();
        for offset in [0, 2, 4] {
            let page = q.list_page(2, offset).await.unwrap();
            assert_eq!(page.total, 5);
            sizes.push(page.items.len());
            for item in page.items {
                assert!(seen.insert(item.product.id));
                names.push(item.product.name);
            }
        }

        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn page_reports_the_clamped_limit() {
        let q = seeded(&["a"]).await;
        assert_eq!(q.list_page(0, 0).await.unwrap().limit, 1);
        assert_eq!(q.list_page(500, 0).await.unwrap().limit, 100);
    }

    #[tokio::test]
    async fn list_all_returns_every_visible_record() {
        let q = seeded(&["x", "y"]).await;
        assert_eq!(q.list_all().await.unwrap().len(), 2);
    }
}
