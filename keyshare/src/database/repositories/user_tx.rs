//! Transactional operations for users.
//!
//! These methods operate within an existing transaction and do NOT commit.
//! The caller is responsible for committing or rolling back the transaction.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::Result;
use crate::database::models::UserDbModel;

/// Transactional operations for users.
pub struct UserTxOps;

impl UserTxOps {
    pub async fn get_user(tx: &mut SqliteConnection, id: i64) -> Result<Option<UserDbModel>> {
        let user = sqlx::query_as::<_, UserDbModel>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        Ok(user)
    }

    /// Load the user, inserting a fresh row first if this is the first contact.
    pub async fn get_or_create_user(
        tx: &mut SqliteConnection,
        id: i64,
        referrer_hint: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<UserDbModel> {
        if let Some(user) = Self::get_user(tx, id).await? {
            return Ok(user);
        }

        let user = UserDbModel::new(id, referrer_hint, now);
        sqlx::query(
            r#"
            INSERT INTO users (
                id, assigned_credential_id, last_activity_at, trial_started_at,
                trial_consumed, trial_folded, referrer_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
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
        .execute(&mut *tx)
        .await?;

        Ok(user)
    }

    /// Point the user at a credential. Touches no other column.
    pub async fn set_assignment(
        tx: &mut SqliteConnection,
        id: i64,
        credential_id: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET assigned_credential_id = ? WHERE id = ?")
            .bind(credential_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }

    /// Mark the trial as carried into a subscription. Returns false if it already was.
    pub async fn mark_trial_folded(
        tx: &mut SqliteConnection,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET trial_folded = TRUE, updated_at = ? WHERE id = ? AND trial_folded = FALSE",
        )
        .bind(now.timestamp_millis())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the referrer unless one is already set.
    pub async fn set_referrer_if_unset(
        tx: &mut SqliteConnection,
        id: i64,
        referrer_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET referrer_id = ?, updated_at = ? WHERE id = ? AND referrer_id IS NULL",
        )
        .bind(referrer_id)
        .bind(now.timestamp_millis())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
