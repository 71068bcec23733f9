//! User repository for database operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::UserDbModel;

/// User repository trait for user data access operations.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Create the user unless it already exists. Returns true if created.
    async fn create_if_missing(&self, user: &UserDbModel) -> Result<bool>;

    /// Find a user by id.
    async fn find_by_id(&self, id: i64) -> Result<Option<UserDbModel>>;

    /// Set `last_activity_at`, creating the user on first contact.
    async fn record_activity(&self, id: i64, time: DateTime<Utc>) -> Result<()>;

    /// Start the one-time trial. Returns false if it was already consumed.
    async fn start_trial(&self, id: i64, time: DateTime<Utc>) -> Result<bool>;

    /// Clear the credential assignment. Returns false if there was none.
    async fn clear_assignment(&self, id: i64) -> Result<bool>;

    /// Users holding a credential whose last activity is before `cutoff`.
    async fn find_idle_assigned(&self, cutoff: DateTime<Utc>) -> Result<Vec<UserDbModel>>;
}

/// SQLx implementation of UserRepository.
pub struct SqlxUserRepository {
    pool: SqlitePool,
    write_pool: SqlitePool,
}

impl SqlxUserRepository {
    /// Create a new SqlxUserRepository with the given connection pool.
    pub fn new(pool: SqlitePool, write_pool: SqlitePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl UserRepository for SqlxUserRepository {
    async fn create_if_missing(&self, user: &UserDbModel) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (
                id, assigned_credential_id, last_activity_at, trial_started_at,
                trial_consumed, trial_folded, referrer_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(user.id)
        .bind(&user.assigned_credential_id)
        .bind(user.last_activity_at)
        .bind(user.trial_started_at)
        .bind(user.trial_consumed)
        .bind(user.trial_folded)
        .bind(user.referrer_id)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<UserDbModel>> {
        let user = sqlx::query_as::<_, UserDbModel>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn record_activity(&self, id: i64, time: DateTime<Utc>) -> Result<()> {
        let now = time.timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO users (id, last_activity_at, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET last_activity_at = excluded.last_activity_at
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    async fn start_trial(&self, id: i64, time: DateTime<Utc>) -> Result<bool> {
        // Activation and consumption are one conditional write.
        let now = time.timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE users
            SET trial_started_at = ?, trial_consumed = TRUE, updated_at = ?
            WHERE id = ? AND trial_consumed = FALSE
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_assignment(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET assigned_credential_id = NULL WHERE id = ? AND assigned_credential_id IS NOT NULL",
        )
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_idle_assigned(&self, cutoff: DateTime<Utc>) -> Result<Vec<UserDbModel>> {
        let users = sqlx::query_as::<_, UserDbModel>(
            r#"
            SELECT * FROM users
            WHERE assigned_credential_id IS NOT NULL AND last_activity_at < ?
            ORDER BY last_activity_at
            "#,
        )
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }
}
