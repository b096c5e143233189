//! Store wrappers shared by the coordinator and backend tests.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Barrier;

use super::{
    ContentItem, ContentItemStore, CreateOutcome, Delta, EngagementKey, ItemId, MembershipStore,
    Persistence, RemoveOutcome, StoreError, Unit,
};

/// Parks every caller at `exists` until all racers have read, so they all observe
/// the same pre-race state.
pub struct Gated {
    inner: Arc<dyn Persistence>,
    barrier: Arc<Barrier>,
}

impl Gated {
    pub fn new(inner: Arc<dyn Persistence>, racers: usize) -> Self {
        Self {
            inner,
            barrier: Arc::new(Barrier::new(racers)),
        }
    }
}

struct GatedUnit {
    inner: Box<dyn Unit>,
    barrier: Arc<Barrier>,
}

#[async_trait]
impl Persistence for Gated {
    async fn begin(&self) -> Result<Box<dyn Unit>, StoreError> {
        Ok(Box::new(GatedUnit {
            inner: self.inner.begin().await?,
            barrier: self.barrier.clone(),
        }))
    }
}

#[async_trait]
impl MembershipStore for GatedUnit {
    async fn exists(&mut self, key: &EngagementKey) -> Result<bool, StoreError> {
        let exists = self.inner.exists(key).await?;
        self.barrier.wait().await;
        Ok(exists)
    }

    async fn create(&mut self, key: &EngagementKey) -> Result<CreateOutcome, StoreError> {
        self.inner.create(key).await
    }

    async fn remove(&mut self, key: &EngagementKey) -> Result<RemoveOutcome, StoreError> {
        self.inner.remove(key).await
    }

    async fn cardinality(&mut self, item: &ItemId) -> Result<u64, StoreError> {
        self.inner.cardinality(item).await
    }
}

#[async_trait]
impl ContentItemStore for GatedUnit {
    async fn get(&mut self, item: &ItemId) -> Result<ContentItem, StoreError> {
        self.inner.get(item).await
    }

    async fn adjust_count(&mut self, item: &ItemId, delta: Delta) -> Result<u64, StoreError> {
        self.inner.adjust_count(item, delta).await
    }
}

#[async_trait]
impl Unit for GatedUnit {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.commit().await
    }
}
