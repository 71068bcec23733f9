//! Transactional operations for subscriptions.
//!
//! These methods operate within an existing transaction and do NOT commit.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::Result;
use crate::database::models::{PlanType, SubscriptionDbModel};

/// Transactional operations for subscriptions.
pub struct SubscriptionTxOps;

impl SubscriptionTxOps {
    pub async fn get_active(
        tx: &mut SqliteConnection,
        user_id: i64,
    ) -> Result<Option<SubscriptionDbModel>> {
        let sub = sqlx::query_as::<_, SubscriptionDbModel>(
            "SELECT * FROM subscriptions WHERE user_id = ? AND is_active = TRUE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        Ok(sub)
    }

    pub async fn get_by_id(
        tx: &mut SqliteConnection,
        id: &str,
    ) -> Result<Option<SubscriptionDbModel>> {
        let sub = sqlx::query_as::<_, SubscriptionDbModel>("SELECT * FROM subscriptions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        Ok(sub)
    }

    pub async fn insert(tx: &mut SqliteConnection, sub: &SubscriptionDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, plan_type, start_at, end_at, is_active,
                payment_ref, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sub.id)
        .bind(sub.user_id)
        .bind(&sub.plan_type)
        .bind(sub.start_at)
        .bind(sub.end_at)
        .bind(sub.is_active)
        .bind(&sub.payment_ref)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&mut *tx)
        .await?;
        Ok(())
    }

    /// Extend an active row in place. A `None` payment reference keeps the old one.
    pub async fn renew(
        tx: &mut SqliteConnection,
        id: &str,
        plan_type: PlanType,
        end_at: DateTime<Utc>,
        payment_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET plan_type = ?,
                end_at = ?,
                payment_ref = COALESCE(?, payment_ref),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(plan_type.as_str())
        .bind(end_at.timestamp_millis())
        .bind(payment_ref)
        .bind(now.timestamp_millis())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        Ok(())
    }

    pub async fn deactivate(
        tx: &mut SqliteConnection,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE subscriptions SET is_active = FALSE, updated_at = ? WHERE id = ? AND is_active = TRUE",
        )
        .bind(now.timestamp_millis())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Whether the user ever received a referral grant, active or not.
    pub async fn has_referral_grant(tx: &mut SqliteConnection, user_id: i64) -> Result<bool> {
        let found: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM subscriptions WHERE user_id = ? AND plan_type = ? LIMIT 1",
        )
        .bind(user_id)
        .bind(PlanType::ReferralBonus.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        Ok(found.is_some())
    }
}
