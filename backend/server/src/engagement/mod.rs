//! # Engagement
//!
//! Users mark/unmark interest in a content item (community posts). Each item carries a
//! denormalized `engagement_count` that must always equal the number of membership
//! records pointing at it.
//!
//! ## Storage
//!
//! - Membership records: one row per (item, user), uniqueness enforced by the store
//! - Content items: one row per item, integer counter, never negative
//! - Both are only ever written together inside one [`Unit`] opened by [`Persistence::begin`]
//!
//! ## Toggle
//!
//! - Observe the caller's [`EngagementStatus`], pick the [`Transition`] once
//! - Conditional create/remove on the membership key, counter adjustment, commit
//! - Lost race on create/remove (already there / already gone) is absorbed, no counter change
//! - Transaction conflict gets exactly one retry with the same transition
//!
//! Relative increments are only sound while every counter write goes through
//! [`ToggleCoordinator`]. Anything else writing `engagement_count` needs a reconciliation job.
use std::fmt::{self, Display};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub mod coordinator;
pub mod memory;
pub mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{EngagementError, ToggleCoordinator};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const MAX_ID_LEN: usize = 128;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            /// Trims the raw value, rejects empty or oversized identifiers.
            pub fn parse(raw: &str) -> Option<Self> {
                let trimmed = raw.trim();

                if trimmed.is_empty() || trimmed.len() > MAX_ID_LEN {
                    return None;
                }

                Some(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(ItemId);
string_id!(UserId);

/// Natural key of a membership record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EngagementKey {
    pub item: ItemId,
    pub user: UserId,
}

impl EngagementKey {
    pub fn new(item: ItemId, user: UserId) -> Self {
        Self { item, user }
    }
}

impl Display for EngagementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.item, self.user)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentItem {
    pub id: ItemId,
    pub engagement_count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembershipRecord {
    pub key: EngagementKey,
    pub created_at: DateTime<Utc>,
}

impl MembershipRecord {
    pub fn now(key: EngagementKey) -> Self {
        Self {
            key,
            created_at: Utc::now(),
        }
    }
}

/// Per-key state. `NotEngaged` is the initial state of every key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngagementStatus {
    NotEngaged,
    Engaged,
}

impl EngagementStatus {
    pub fn from_exists(exists: bool) -> Self {
        if exists {
            Self::Engaged
        } else {
            Self::NotEngaged
        }
    }

    pub fn is_engaged(self) -> bool {
        matches!(self, Self::Engaged)
    }

    /// The only transition leaving this state.
    pub fn transition(self) -> Transition {
        match self {
            Self::NotEngaged => Transition::Engage,
            Self::Engaged => Transition::Disengage,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Engage,
    Disengage,
}

impl Transition {
    pub fn target(self) -> EngagementStatus {
        match self {
            Self::Engage => EngagementStatus::Engaged,
            Self::Disengage => EngagementStatus::NotEngaged,
        }
    }

    pub fn delta(self) -> Delta {
        match self {
            Self::Engage => Delta::Increment,
            Self::Disengage => Delta::Decrement,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delta {
    Increment,
    Decrement,
}

impl Delta {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Increment => 1,
            Self::Decrement => -1,
        }
    }

    /// `None` when the result would leave the non-negative range.
    pub fn apply(self, count: u64) -> Option<u64> {
        count.checked_add_signed(self.as_i64())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotPresent,
}

/// What a caller sees after a toggle or a status read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementState {
    pub count: u64,
    pub is_engaged: bool,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Store error: {0}")]
    Internal(String),
}

#[async_trait]
pub trait MembershipStore: Send {
    async fn exists(&mut self, key: &EngagementKey) -> Result<bool, StoreError>;

    /// Exactly one of any set of racing callers for the same key observes `Created`.
    async fn create(&mut self, key: &EngagementKey) -> Result<CreateOutcome, StoreError>;

    async fn remove(&mut self, key: &EngagementKey) -> Result<RemoveOutcome, StoreError>;

    /// Number of membership records referencing `item`.
    async fn cardinality(&mut self, item: &ItemId) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait ContentItemStore: Send {
    async fn get(&mut self, item: &ItemId) -> Result<ContentItem, StoreError>;

    /// Relative adjustment. Fails with [`StoreError::Invariant`] instead of going below zero.
    async fn adjust_count(&mut self, item: &ItemId, delta: Delta) -> Result<u64, StoreError>;
}

/// One atomic unit of work. Dropping it without [`Unit::commit`] rolls everything back.
#[async_trait]
pub trait Unit: MembershipStore + ContentItemStore {
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    async fn begin(&self) -> Result<Box<dyn Unit>, StoreError>;
}
