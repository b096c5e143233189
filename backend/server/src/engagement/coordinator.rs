use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, warn};

#[cfg(feature = "verbose")]
use tracing::info;

use super::{
    CreateOutcome, EngagementKey, EngagementState, EngagementStatus, ItemId, Persistence,
    RemoveOutcome, StoreError, Transition,
};

pub const INVARIANT_TARGET: &str = "engagement::invariant";

#[derive(Error, Debug)]
pub enum EngagementError {
    #[error("Item not found: {0}")]
    NotFound(ItemId),

    #[error("Transient store failure: {0}")]
    Transient(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for EngagementError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ItemNotFound(item) => EngagementError::NotFound(item),
            StoreError::Conflict(reason) | StoreError::Unavailable(reason) => {
                EngagementError::Transient(reason)
            }
            StoreError::Invariant(reason) => EngagementError::InvariantViolation(reason),
            StoreError::Internal(reason) => EngagementError::Internal(reason),
        }
    }
}

enum Applied {
    /// Membership and counter both changed.
    Committed(u64),
    /// A racing toggle already reached the target state; nothing was written.
    Absorbed(u64),
}

/// The only writer of membership records and engagement counters.
#[derive(Clone)]
pub struct ToggleCoordinator {
    store: Arc<dyn Persistence>,
    audit_reads: bool,
}

impl ToggleCoordinator {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self {
            store,
            audit_reads: false,
        }
    }

    /// Cross-check `engagement_count` against membership cardinality on every status read.
    pub fn with_read_audit(mut self, enabled: bool) -> Self {
        self.audit_reads = enabled;
        self
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    pub async fn toggle(&self, key: &EngagementKey) -> Result<EngagementState, EngagementError> {
        let observed = self.observe(key).await.map_err(|e| self.escalate(key, e))?;
        let transition = observed.transition();

        let applied = match self.apply(key, transition).await {
            Err(StoreError::Conflict(reason)) => {
                warn!("Transaction conflict on {key}, retrying once: {reason}");
                self.apply(key, transition).await
            }
            other => other,
        }
        .map_err(|e| self.escalate(key, e))?;

        let count = match applied {
            Applied::Committed(count) => {
                #[cfg(feature = "verbose")]
                info!("Applied {transition:?} on {key}, count now {count}");

                count
            }
            Applied::Absorbed(count) => {
                debug!("Concurrent {transition:?} on {key} already landed, absorbed");
                count
            }
        };

        Ok(EngagementState {
            count,
            is_engaged: transition.target().is_engaged(),
        })
    }

    pub async fn status(&self, key: &EngagementKey) -> Result<EngagementState, EngagementError> {
        self.read_status(key).await.map_err(|e| self.escalate(key, e))
    }

    async fn read_status(&self, key: &EngagementKey) -> Result<EngagementState, StoreError> {
        let mut unit = self.store.begin().await?;
        let item = unit.get(&key.item).await?;
        let engaged = unit.exists(key).await?;

        if self.audit_reads {
            let cardinality = unit.cardinality(&key.item).await?;

            if cardinality != item.engagement_count {
                return Err(StoreError::Invariant(format!(
                    "item {} count {} but {} membership records",
                    key.item, item.engagement_count, cardinality
                )));
            }
        }

        Ok(EngagementState {
            count: item.engagement_count,
            is_engaged: engaged,
        })
    }

    async fn observe(&self, key: &EngagementKey) -> Result<EngagementStatus, StoreError> {
        let mut unit = self.store.begin().await?;
        unit.get(&key.item).await?;

        Ok(EngagementStatus::from_exists(unit.exists(key).await?))
    }

    async fn apply(
        &self,
        key: &EngagementKey,
        transition: Transition,
    ) -> Result<Applied, StoreError> {
        let mut unit = self.store.begin().await?;

        let won = match transition {
            Transition::Engage => unit.create(key).await? == CreateOutcome::Created,
            Transition::Disengage => unit.remove(key).await? == RemoveOutcome::Removed,
        };

        if !won {
            let item = unit.get(&key.item).await?;
            return Ok(Applied::Absorbed(item.engagement_count));
        }

        let count = unit.adjust_count(&key.item, transition.delta()).await?;
        unit.commit().await?;

        Ok(Applied::Committed(count))
    }

    fn escalate(&self, key: &EngagementKey, err: StoreError) -> EngagementError {
        let err = EngagementError::from(err);

        if let EngagementError::InvariantViolation(reason) = &err {
            error!(target: INVARIANT_TARGET, key = %key, "Engagement invariant broken: {reason}");
        }

        err
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::time::timeout;

    use super::*;
    use crate::engagement::{
        ContentItem, ContentItemStore, Delta, MemoryStore, MembershipStore, Unit, UserId,
        testing::Gated,
    };

    fn key(item: &str, user: &str) -> EngagementKey {
        EngagementKey::new(
            ItemId::parse(item).expect("item id"),
            UserId::parse(user).expect("user id"),
        )
    }

    fn coordinator_with_item(item: &str) -> (MemoryStore, ToggleCoordinator) {
        let store = MemoryStore::new();
        store.insert_item(ItemId::parse(item).expect("item id"));
        let coordinator = ToggleCoordinator::new(Arc::new(store.clone()));

        (store, coordinator)
    }

    /// Fails the first `failures` commits with a conflict.
    struct Conflicting {
        inner: MemoryStore,
        failures: Arc<AtomicUsize>,
    }

    struct ConflictingUnit {
        inner: Box<dyn Unit>,
        failures: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Persistence for Conflicting {
        async fn begin(&self) -> Result<Box<dyn Unit>, StoreError> {
            Ok(Box::new(ConflictingUnit {
                inner: self.inner.begin().await?,
                failures: self.failures.clone(),
            }))
        }
    }

    #[async_trait]
    impl MembershipStore for ConflictingUnit {
        async fn exists(&mut self, key: &EngagementKey) -> Result<bool, StoreError> {
            self.inner.exists(key).await
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
    impl ContentItemStore for ConflictingUnit {
        async fn get(&mut self, item: &ItemId) -> Result<ContentItem, StoreError> {
            self.inner.get(item).await
        }

        async fn adjust_count(&mut self, item: &ItemId, delta: Delta) -> Result<u64, StoreError> {
            self.inner.adjust_count(item, delta).await
        }
    }

    #[async_trait]
    impl Unit for ConflictingUnit {
        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);

            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Conflict("database is locked".to_string()));
            }

            self.inner.commit().await
        }
    }

    async fn assert_consistent(store: &MemoryStore, item: &str) -> u64 {
        let item = ItemId::parse(item).expect("item id");
        let mut unit = store.begin().await.expect("begin");
        let count = unit.get(&item).await.expect("item").engagement_count;
        let cardinality = unit.cardinality(&item).await.expect("cardinality");
        assert_eq!(count, cardinality, "counter drifted from membership");
        count
    }

    #[tokio::test]
    async fn toggle_engages_then_disengages() {
        let (store, coordinator) = coordinator_with_item("post-1");
        let alice = key("post-1", "alice");

        let first = coordinator.toggle(&alice).await.expect("toggle on");
        assert_eq!(
            first,
            EngagementState {
                count: 1,
                is_engaged: true,
            }
        );

        let second = coordinator.toggle(&alice).await.expect("toggle off");
        assert_eq!(
            second,
            EngagementState {
                count: 0,
                is_engaged: false,
            }
        );

        assert_eq!(assert_consistent(&store, "post-1").await, 0);
    }

    #[tokio::test]
    async fn toggle_unknown_item_is_not_found() {
        let (_store, coordinator) = coordinator_with_item("post-1");

        let err = coordinator
            .toggle(&key("missing", "alice"))
            .await
            .expect_err("missing item");

        assert!(matches!(err, EngagementError::NotFound(item) if item.as_str() == "missing"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_users_accumulate() {
        let (store, coordinator) = coordinator_with_item("post-1");

        let handles: Vec<_> = ["alice", "bob"]
            .into_iter()
            .map(|user| {
                let coordinator = coordinator.clone();
                let key = key("post-1", user);
                tokio::spawn(async move { coordinator.toggle(&key).await })
            })
            .collect();

        for handle in handles {
            let state = handle.await.expect("join").expect("toggle");
            assert!(state.is_engaged);
        }

        assert_eq!(assert_consistent(&store, "post-1").await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_toggle_on_counts_once() {
        const RACERS: usize = 8;

        let store = MemoryStore::new();
        store.insert_item(ItemId::parse("post-1").expect("item id"));
        let gated = Gated::new(Arc::new(store.clone()), RACERS);
        let coordinator = ToggleCoordinator::new(Arc::new(gated));

        let handles: Vec<_> = (0..RACERS)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.toggle(&key("post-1", "alice")).await })
            })
            .collect();

        for handle in handles {
            let state = handle.await.expect("join").expect("toggle");
            assert_eq!(
                state,
                EngagementState {
                    count: 1,
                    is_engaged: true,
                }
            );
        }

        assert_eq!(assert_consistent(&store, "post-1").await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_toggle_off_decrements_once() {
        let store = MemoryStore::new();
        store.insert_item(ItemId::parse("post-1").expect("item id"));

        let plain = ToggleCoordinator::new(Arc::new(store.clone()));
        plain.toggle(&key("post-1", "bob")).await.expect("bob on");
        plain.toggle(&key("post-1", "alice")).await.expect("alice on");

        let gated = Gated::new(Arc::new(store.clone()), 2);
        let coordinator = ToggleCoordinator::new(Arc::new(gated));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.toggle(&key("post-1", "alice")).await })
            })
            .collect();

        for handle in handles {
            let state = handle.await.expect("join").expect("toggle");
            assert_eq!(
                state,
                EngagementState {
                    count: 1,
                    is_engaged: false,
                }
            );
        }

        assert_eq!(assert_consistent(&store, "post-1").await, 1);
    }

    #[tokio::test]
    async fn held_key_does_not_block_other_keys() {
        let (store, coordinator) = coordinator_with_item("post-1");
        store.insert_item(ItemId::parse("post-2").expect("item id"));

        let mut held = store.begin().await.expect("begin");
        held.create(&key("post-1", "alice")).await.expect("create");

        timeout(Duration::from_secs(1), coordinator.toggle(&key("post-1", "bob")))
            .await
            .expect("same item, other user must not wait")
            .expect("toggle");
        timeout(Duration::from_secs(1), coordinator.toggle(&key("post-2", "alice")))
            .await
            .expect("other item must not wait")
            .expect("toggle");

        assert!(
            timeout(Duration::from_millis(100), coordinator.toggle(&key("post-1", "alice")))
                .await
                .is_err(),
            "same key must wait for the open unit"
        );

        drop(held);
        assert_eq!(assert_consistent(&store, "post-1").await, 1);
    }

    #[tokio::test]
    async fn negative_count_is_invariant_violation_and_rolls_back() {
        let (store, coordinator) = coordinator_with_item("post-1");
        let alice = key("post-1", "alice");
        store.insert_membership_unchecked(alice.clone());

        let err = coordinator.toggle(&alice).await.expect_err("would go negative");
        assert!(matches!(err, EngagementError::InvariantViolation(_)));

        let mut unit = store.begin().await.expect("begin");
        assert!(unit.exists(&alice).await.expect("exists"), "delete must roll back");
        assert_eq!(unit.get(&alice.item).await.expect("item").engagement_count, 0);
    }

    #[tokio::test]
    async fn single_conflict_is_retried() {
        let store = MemoryStore::new();
        store.insert_item(ItemId::parse("post-1").expect("item id"));
        let conflicting = Conflicting {
            inner: store.clone(),
            failures: Arc::new(AtomicUsize::new(1)),
        };
        let coordinator = ToggleCoordinator::new(Arc::new(conflicting));

        let state = coordinator.toggle(&key("post-1", "alice")).await.expect("retried");
        assert_eq!(
            state,
            EngagementState {
                count: 1,
                is_engaged: true,
            }
        );
        assert_eq!(assert_consistent(&store, "post-1").await, 1);
    }

    #[tokio::test]
    async fn repeated_conflict_is_transient_without_partial_state() {
        let store = MemoryStore::new();
        store.insert_item(ItemId::parse("post-1").expect("item id"));
        let conflicting = Conflicting {
            inner: store.clone(),
            failures: Arc::new(AtomicUsize::new(2)),
        };
        let coordinator = ToggleCoordinator::new(Arc::new(conflicting));

        let err = coordinator
            .toggle(&key("post-1", "alice"))
            .await
            .expect_err("both attempts conflict");
        assert!(matches!(err, EngagementError::Transient(_)));
        assert_eq!(assert_consistent(&store, "post-1").await, 0);
    }

    #[tokio::test]
    async fn status_reports_without_writing() {
        let (store, coordinator) = coordinator_with_item("post-1");
        let alice = key("post-1", "alice");

        let before = coordinator.status(&alice).await.expect("status");
        assert_eq!(
            before,
            EngagementState {
                count: 0,
                is_engaged: false,
            }
        );

        coordinator.toggle(&alice).await.expect("toggle");
        let other = coordinator.status(&key("post-1", "bob")).await.expect("status");
        assert_eq!(
            other,
            EngagementState {
                count: 1,
                is_engaged: false,
            }
        );

        assert_eq!(assert_consistent(&store, "post-1").await, 1);
    }

    #[tokio::test]
    async fn audited_status_detects_drift() {
        let (store, coordinator) = coordinator_with_item("post-1");
        let coordinator = coordinator.with_read_audit(true);
        store.insert_membership_unchecked(key("post-1", "alice"));

        let err = coordinator
            .status(&key("post-1", "bob"))
            .await
            .expect_err("count 0 with one record");
        assert!(matches!(err, EngagementError::InvariantViolation(_)));
    }
}
