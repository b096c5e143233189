//! # SQLite
//!
//! Durable store. Content items are written by the trip/community CRUD surface;
//! this module only reads them and moves their counter.
//!
//! ## Schema
//! - `content_items`: id (**text**), engagement_count (**int**, `CHECK >= 0`)
//! - `engagements`: item_id (**text**), user_id (**text**), created_at (**int**, unix millis),
//!   primary key on (item_id, user_id)
//!
//! ## Toggle statements
//! - Create: `INSERT .. ON CONFLICT DO NOTHING`, one affected row means we won the key
//! - Remove: `DELETE`, zero affected rows means someone else already removed it
//! - Adjust: `UPDATE .. RETURNING`, relative to the stored value
//!
//! Every unit's first statement in the toggle path is a write, so SQLite takes the
//! write lock up front and the busy timeout covers contention instead of failing a
//! read-then-upgrade.
use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    Pool, Sqlite, Transaction,
    error::ErrorKind,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};
use tracing::info;

use super::{
    ContentItem, ContentItemStore, CreateOutcome, Delta, EngagementKey, ItemId, MembershipStore,
    Persistence, RemoveOutcome, StoreError, Unit,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS content_items (
    id TEXT PRIMARY KEY NOT NULL,
    engagement_count INTEGER NOT NULL DEFAULT 0 CHECK (engagement_count >= 0)
);

CREATE TABLE IF NOT EXISTS engagements (
    item_id TEXT NOT NULL REFERENCES content_items(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (item_id, user_id)
);
"#;

// SQLITE_BUSY, SQLITE_LOCKED and their extended forms.
const CONFLICT_CODES: [&str; 6] = ["5", "6", "261", "262", "517", "773"];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if matches!(db.kind(), ErrorKind::CheckViolation) => {
                StoreError::Invariant(db.message().to_string())
            }
            sqlx::Error::Database(db)
                if db
                    .code()
                    .is_some_and(|code| CONFLICT_CODES.contains(&code.as_ref())) =>
            {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Internal(err.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn connect(
        url: &str,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);

        if let Some(parent) = options.get_filename().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("creating {}: {e}", parent.display()))
            })?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        info!("SQLite store ready at {url}");

        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;

        Ok(())
    }

    /// Registers an item with a zero count. Existing items are left untouched.
    pub async fn insert_item(&self, id: &ItemId) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO content_items (id) VALUES (?) ON CONFLICT(id) DO NOTHING")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn Unit>, StoreError> {
        Ok(Box::new(SqliteUnit {
            tx: self.pool.begin().await?,
        }))
    }
}

pub struct SqliteUnit {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl MembershipStore for SqliteUnit {
    async fn exists(&mut self, key: &EngagementKey) -> Result<bool, StoreError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM engagements WHERE item_id = ? AND user_id = ?")
                .bind(key.item.as_str())
                .bind(key.user.as_str())
                .fetch_optional(&mut *self.tx)
                .await?;

        Ok(found.is_some())
    }

    async fn create(&mut self, key: &EngagementKey) -> Result<CreateOutcome, StoreError> {
        let result = sqlx::query(
            "INSERT INTO engagements (item_id, user_id, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(item_id, user_id) DO NOTHING",
        )
        .bind(key.item.as_str())
        .bind(key.user.as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                StoreError::ItemNotFound(key.item.clone())
            } else {
                StoreError::from(e)
            }
        })?;

        Ok(match result.rows_affected() {
            0 => CreateOutcome::AlreadyExists,
            _ => CreateOutcome::Created,
        })
    }

    async fn remove(&mut self, key: &EngagementKey) -> Result<RemoveOutcome, StoreError> {
        let result = sqlx::query("DELETE FROM engagements WHERE item_id = ? AND user_id = ?")
            .bind(key.item.as_str())
            .bind(key.user.as_str())
            .execute(&mut *self.tx)
            .await?;

        Ok(match result.rows_affected() {
            0 => RemoveOutcome::NotPresent,
            _ => RemoveOutcome::Removed,
        })
    }

    async fn cardinality(&mut self, item: &ItemId) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM engagements WHERE item_id = ?")
            .bind(item.as_str())
            .fetch_one(&mut *self.tx)
            .await?;

        to_count(item, count)
    }
}

#[async_trait]
impl ContentItemStore for SqliteUnit {
    async fn get(&mut self, item: &ItemId) -> Result<ContentItem, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT engagement_count FROM content_items WHERE id = ?")
                .bind(item.as_str())
                .fetch_optional(&mut *self.tx)
                .await?
                .ok_or_else(|| StoreError::ItemNotFound(item.clone()))?;

        Ok(ContentItem {
            id: item.clone(),
            engagement_count: to_count(item, count)?,
        })
    }

    async fn adjust_count(&mut self, item: &ItemId, delta: Delta) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "UPDATE content_items SET engagement_count = engagement_count + ? \
             WHERE id = ? RETURNING engagement_count",
        )
        .bind(delta.as_i64())
        .bind(item.as_str())
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StoreError::ItemNotFound(item.clone()))?;

        to_count(item, count)
    }
}

#[async_trait]
impl Unit for SqliteUnit {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;

        Ok(())
    }
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if matches!(db.kind(), ErrorKind::ForeignKeyViolation))
}

fn to_count(item: &ItemId, raw: i64) -> Result<u64, StoreError> {
    u64::try_from(raw)
        .map_err(|_| StoreError::Invariant(format!("item {item} stored count {raw}")))
}
