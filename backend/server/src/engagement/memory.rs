//! # In-process store
//!
//! Same contract as the SQLite store, without a database. Used for local runs
//! (`DATABASE_URL=memory`) and tests.
//!
//! Behaves like read-committed with row locks:
//! - Reads see committed state plus the unit's own staged writes
//! - `create`/`remove` lock the (item, user) key until the unit ends
//! - `adjust_count` locks the item row until the unit ends
//! - `commit` applies every staged write in one critical section
//!
//! Locks are always taken key first, item second.
use std::{
    collections::{HashMap, HashSet},
    hash::Hash,
    sync::{Arc, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    ContentItem, ContentItemStore, CreateOutcome, Delta, EngagementKey, ItemId, MembershipRecord,
    MembershipStore, Persistence, RemoveOutcome, StoreError, Unit,
};

#[derive(Default)]
struct Tables {
    items: HashMap<ItemId, u64>,
    memberships: HashMap<EngagementKey, MembershipRecord>,
}

/// Row locks. Held across awaits, so these are async mutexes.
struct LockTable<K> {
    slots: std::sync::Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> LockTable<K> {
    fn new() -> Self {
        Self {
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<K, Arc<Mutex<()>>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire(self: &Arc<Self>, key: &K) -> RowLock<K> {
        let slot = self.slots().entry(key.clone()).or_default().clone();

        RowLock {
            table: self.clone(),
            key: key.clone(),
            guard: Some(slot.lock_owned().await),
        }
    }
}

/// Held row lock. The slot is evicted on release once nobody else holds or awaits it.
struct RowLock<K: Eq + Hash> {
    table: Arc<LockTable<K>>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for RowLock<K> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut slots = self
            .table
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if slots
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.key);
        }
    }
}

struct Shared {
    tables: std::sync::Mutex<Tables>,
    key_locks: Arc<LockTable<EngagementKey>>,
    item_locks: Arc<LockTable<ItemId>>,
}

impl Shared {
    /// Never held across an await; no critical section can panic midway.
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: std::sync::Mutex::new(Tables::default()),
                key_locks: Arc::new(LockTable::new()),
                item_locks: Arc::new(LockTable::new()),
            }),
        }
    }

    /// Registers an item with a zero count. Existing items are left untouched.
    pub fn insert_item(&self, id: ItemId) {
        self.shared.tables().items.entry(id).or_insert(0);
    }

    /// Writes a membership record without touching the counter.
    #[cfg(test)]
    pub(crate) fn insert_membership_unchecked(&self, key: EngagementKey) {
        self.shared
            .tables()
            .memberships
            .insert(key.clone(), MembershipRecord::now(key));
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Unit>, StoreError> {
        Ok(Box::new(MemoryUnit {
            shared: self.shared.clone(),
            held_keys: HashMap::new(),
            held_items: HashMap::new(),
            staged: Staged::default(),
        }))
    }
}

#[derive(Default)]
struct Staged {
    inserts: HashMap<EngagementKey, MembershipRecord>,
    deletes: HashSet<EngagementKey>,
    deltas: HashMap<ItemId, i64>,
}

pub struct MemoryUnit {
    shared: Arc<Shared>,
    held_keys: HashMap<EngagementKey, RowLock<EngagementKey>>,
    held_items: HashMap<ItemId, RowLock<ItemId>>,
    staged: Staged,
}

impl MemoryUnit {
    async fn lock_key(&mut self, key: &EngagementKey) {
        if !self.held_keys.contains_key(key) {
            let guard = self.shared.key_locks.acquire(key).await;
            self.held_keys.insert(key.clone(), guard);
        }
    }

    async fn lock_item(&mut self, item: &ItemId) {
        if !self.held_items.contains_key(item) {
            let guard = self.shared.item_locks.acquire(item).await;
            self.held_items.insert(item.clone(), guard);
        }
    }

    fn visible_exists(&self, tables: &Tables, key: &EngagementKey) -> bool {
        if self.staged.inserts.contains_key(key) {
            return true;
        }

        !self.staged.deletes.contains(key) && tables.memberships.contains_key(key)
    }

    fn visible_count(&self, tables: &Tables, item: &ItemId) -> Result<u64, StoreError> {
        let committed = *tables
            .items
            .get(item)
            .ok_or_else(|| StoreError::ItemNotFound(item.clone()))?;
        let pending = self.staged.deltas.get(item).copied().unwrap_or(0);

        committed.checked_add_signed(pending).ok_or_else(|| {
            StoreError::Invariant(format!("item {item} count {committed} with pending {pending}"))
        })
    }
}

#[async_trait]
impl MembershipStore for MemoryUnit {
    async fn exists(&mut self, key: &EngagementKey) -> Result<bool, StoreError> {
        let tables = self.shared.tables();

        Ok(self.visible_exists(&tables, key))
    }

    async fn create(&mut self, key: &EngagementKey) -> Result<CreateOutcome, StoreError> {
        self.lock_key(key).await;
        let tables = self.shared.tables();

        if !tables.items.contains_key(&key.item) {
            return Err(StoreError::ItemNotFound(key.item.clone()));
        }

        if self.visible_exists(&tables, key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        drop(tables);

        if !self.staged.deletes.remove(key) {
            self.staged
                .inserts
                .insert(key.clone(), MembershipRecord::now(key.clone()));
        }

        Ok(CreateOutcome::Created)
    }

    async fn remove(&mut self, key: &EngagementKey) -> Result<RemoveOutcome, StoreError> {
        self.lock_key(key).await;
        let tables = self.shared.tables();

        if !self.visible_exists(&tables, key) {
            return Ok(RemoveOutcome::NotPresent);
        }
        drop(tables);

        if self.staged.inserts.remove(key).is_none() {
            self.staged.deletes.insert(key.clone());
        }

        Ok(RemoveOutcome::Removed)
    }

    async fn cardinality(&mut self, item: &ItemId) -> Result<u64, StoreError> {
        let tables = self.shared.tables();

        let committed = tables
            .memberships
            .keys()
            .filter(|key| &key.item == item && !self.staged.deletes.contains(*key))
            .count();
        let staged = self
            .staged
            .inserts
            .keys()
            .filter(|key| &key.item == item)
            .count();

        Ok((committed + staged) as u64)
    }
}

#[async_trait]
impl ContentItemStore for MemoryUnit {
    async fn get(&mut self, item: &ItemId) -> Result<ContentItem, StoreError> {
        let tables = self.shared.tables();

        Ok(ContentItem {
            id: item.clone(),
            engagement_count: self.visible_count(&tables, item)?,
        })
    }

    async fn adjust_count(&mut self, item: &ItemId, delta: Delta) -> Result<u64, StoreError> {
        self.lock_item(item).await;
        let tables = self.shared.tables();

        let current = self.visible_count(&tables, item)?;
        let next = delta.apply(current).ok_or_else(|| {
            StoreError::Invariant(format!("item {item} count {current} would go negative"))
        })?;
        drop(tables);

        *self.staged.deltas.entry(item.clone()).or_insert(0) += delta.as_i64();

        Ok(next)
    }
}

#[async_trait]
impl Unit for MemoryUnit {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tables = self.shared.tables();

        for (item, delta) in &self.staged.deltas {
            let count = tables
                .items
                .get(item)
                .copied()
                .ok_or_else(|| StoreError::ItemNotFound(item.clone()))?;

            if count.checked_add_signed(*delta).is_none() {
                return Err(StoreError::Invariant(format!(
                    "item {item} count {count} cannot take {delta}"
                )));
            }
        }

        for key in &self.staged.deletes {
            tables.memberships.remove(key);
        }
        for (key, record) in &self.staged.inserts {
            tables.memberships.insert(key.clone(), record.clone());
        }
        for (item, delta) in &self.staged.deltas {
            if let Some(count) = tables.items.get_mut(item) {
                *count = count.saturating_add_signed(*delta);
            }
        }

        Ok(())
    }
}
