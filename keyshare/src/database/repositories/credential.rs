//! Credential repository for database operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{CredentialDbModel, CredentialUsageRow};

/// Credential repository trait.
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    /// Insert every secret not already present. Returns the number inserted.
    async fn seed(&self, secrets: &[String], now: DateTime<Utc>) -> Result<u64>;

    /// Find a credential by id.
    async fn find_by_id(&self, id: &str) -> Result<Option<CredentialDbModel>>;

    /// (De)activate a credential. Returns false if no such credential exists.
    async fn set_active(&self, id: &str, active: bool, now: DateTime<Utc>) -> Result<bool>;

    /// Assigned-user counts for every credential, in scan order.
    async fn usage(&self) -> Result<Vec<CredentialUsageRow>>;
}

/// SQLx implementation of CredentialRepository.
pub struct SqlxCredentialRepository {
    pool: SqlitePool,
    write_pool: SqlitePool,
}

impl SqlxCredentialRepository {
    pub fn new(pool: SqlitePool, write_pool: SqlitePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl CredentialRepository for SqlxCredentialRepository {
    async fn seed(&self, secrets: &[String], now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.write_pool.begin().await?;
        let mut inserted = 0u64;

        for secret in secrets {
            let secret = secret.trim();
            if secret.is_empty() {
                continue;
            }
            let credential = CredentialDbModel::new(secret, now);
            let result = sqlx::query(
                r#"
                INSERT INTO credentials (id, secret, is_active, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(secret) DO NOTHING
                "#,
            )
            .bind(&credential.id)
            .bind(&credential.secret)
            .bind(credential.is_active)
            .bind(credential.created_at)
            .bind(credential.updated_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<CredentialDbModel>> {
        let credential =
            sqlx::query_as::<_, CredentialDbModel>("SELECT * FROM credentials WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(credential)
    }

    async fn set_active(&self, id: &str, active: bool, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE credentials SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(now.timestamp_millis())
            .bind(id)
            .execute(&self.write_pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn usage(&self) -> Result<Vec<CredentialUsageRow>> {
        let rows = sqlx::query_as::<_, CredentialUsageRow>(
            r#"
            SELECT c.id AS id,
                   c.is_active AS is_active,
                   (SELECT COUNT(*) FROM users u WHERE u.assigned_credential_id = c.id) AS assigned_count
            FROM credentials c
            ORDER BY c.created_at, c.rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
