//! Transactional operations for credentials.
//!
//! These methods operate within an existing transaction and do NOT commit.

use sqlx::SqliteConnection;

use crate::Result;
use crate::database::models::CredentialDbModel;

/// Transactional operations for credentials.
pub struct CredentialTxOps;

impl CredentialTxOps {
    pub async fn get_credential(
        tx: &mut SqliteConnection,
        id: &str,
    ) -> Result<Option<CredentialDbModel>> {
        let credential =
            sqlx::query_as::<_, CredentialDbModel>("SELECT * FROM credentials WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        Ok(credential)
    }

    /// First active credential, in scan order, held by fewer than `capacity` users.
    ///
    /// Only meaningful inside a `BEGIN IMMEDIATE` transaction: the count must
    /// not change between this read and the assignment write.
    pub async fn find_with_capacity(
        tx: &mut SqliteConnection,
        capacity: u32,
    ) -> Result<Option<CredentialDbModel>> {
        let credential = sqlx::query_as::<_, CredentialDbModel>(
            r#"
            SELECT c.* FROM credentials c
            WHERE c.is_active = TRUE
              AND (SELECT COUNT(*) FROM users u WHERE u.assigned_credential_id = c.id) < ?
            ORDER BY c.created_at, c.rowid
            LIMIT 1
            "#,
        )
        .bind(i64::from(capacity))
        .fetch_optional(&mut *tx)
        .await?;
        Ok(credential)
    }
}
