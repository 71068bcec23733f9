//! Subscription repository for database operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::SubscriptionDbModel;

/// Read-side and housekeeping access to subscriptions.
///
/// Creation and renewal happen inside immediate transactions through
/// [`super::SubscriptionTxOps`].
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// The user's active subscription row, if any (it may already be past its end).
    async fn find_active(&self, user_id: i64) -> Result<Option<SubscriptionDbModel>>;

    /// Every subscription of the user, newest first.
    async fn list_for_user(&self, user_id: i64) -> Result<Vec<SubscriptionDbModel>>;

    /// Deactivate one subscription if it is still active and ended at or
    /// before `now`. Returns false if it was renewed or already inactive.
    async fn deactivate_if_lapsed(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Deactivate every active subscription whose end is at or before `now`.
    async fn deactivate_lapsed(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// SQLx implementation of SubscriptionRepository.
pub struct SqlxSubscriptionRepository {
    pool: SqlitePool,
    write_pool: SqlitePool,
}

impl SqlxSubscriptionRepository {
    pub fn new(pool: SqlitePool, write_pool: SqlitePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl SubscriptionRepository for SqlxSubscriptionRepository {
    async fn find_active(&self, user_id: i64) -> Result<Option<SubscriptionDbModel>> {
        let sub = sqlx::query_as::<_, SubscriptionDbModel>(
            "SELECT * FROM subscriptions WHERE user_id = ? AND is_active = TRUE",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn list_for_user(&self, user_id: i64) -> Result<Vec<SubscriptionDbModel>> {
        let subs = sqlx::query_as::<_, SubscriptionDbModel>(
            "SELECT * FROM subscriptions WHERE user_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    async fn deactivate_if_lapsed(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let now_ms = now.timestamp_millis();
        let result = sqlx::query(
            "UPDATE subscriptions SET is_active = FALSE, updated_at = ? WHERE id = ? AND is_active = TRUE AND end_at <= ?",
        )
        .bind(now_ms)
        .bind(id)
        .bind(now_ms)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn deactivate_lapsed(&self, now: DateTime<Utc>) -> Result<u64> {
        let now_ms = now.timestamp_millis();
        let result = sqlx::query(
            "UPDATE subscriptions SET is_active = FALSE, updated_at = ? WHERE is_active = TRUE AND end_at <= ?",
        )
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected())
    }
}
