//! Subscription database model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::ms_to_datetime;

/// Prefix of `payment_ref` on rows created by the referral issuer.
pub const REFERRAL_PAYMENT_REF_PREFIX: &str = "referral:";

/// Plan a subscription row was created or last renewed with.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum PlanType {
    #[strum(serialize = "1_period")]
    #[serde(rename = "1_period")]
    OnePeriod,
    #[strum(serialize = "3_period")]
    #[serde(rename = "3_period")]
    ThreePeriod,
    #[strum(serialize = "6_period")]
    #[serde(rename = "6_period")]
    SixPeriod,
    /// Short grant given to referred users; not purchasable.
    #[strum(serialize = "referral_bonus")]
    #[serde(rename = "referral_bonus")]
    ReferralBonus,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnePeriod => "1_period",
            Self::ThreePeriod => "3_period",
            Self::SixPeriod => "6_period",
            Self::ReferralBonus => "referral_bonus",
        }
    }

    /// Number of billing periods bought by a paid plan.
    pub fn periods(&self) -> Option<i32> {
        match self {
            Self::OnePeriod => Some(1),
            Self::ThreePeriod => Some(3),
            Self::SixPeriod => Some(6),
            Self::ReferralBonus => None,
        }
    }

    pub fn is_paid(&self) -> bool {
        self.periods().is_some()
    }

    /// Length of time this plan adds to an expiry.
    pub fn duration(&self, period: Duration, referral_bonus: Duration) -> Duration {
        match self.periods() {
            Some(n) => period * n,
            None => referral_bonus,
        }
    }
}

/// Subscription database model.
///
/// Rows are never deleted. At most one row per user has `is_active = true`.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct SubscriptionDbModel {
    /// Unique identifier (UUID)
    pub id: String,
    pub user_id: i64,
    /// `PlanType` in its string form
    pub plan_type: String,
    /// Unix epoch milliseconds (UTC)
    pub start_at: i64,
    /// Unix epoch milliseconds (UTC)
    pub end_at: i64,
    pub is_active: bool,
    /// Opaque payment reference, or `referral:<referrer id>` for grants
    pub payment_ref: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SubscriptionDbModel {
    /// Create a new active subscription.
    pub fn new(
        user_id: i64,
        plan_type: PlanType,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        payment_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let now_ms = now.timestamp_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            plan_type: plan_type.as_str().to_string(),
            start_at: start_at.timestamp_millis(),
            end_at: end_at.timestamp_millis(),
            is_active: true,
            payment_ref,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Parse the stored plan type. Unknown values yield `None`.
    pub fn get_plan_type(&self) -> Option<PlanType> {
        self.plan_type.parse().ok()
    }

    pub fn get_start_at(&self) -> DateTime<Utc> {
        ms_to_datetime(self.start_at)
    }

    pub fn get_end_at(&self) -> DateTime<Utc> {
        ms_to_datetime(self.end_at)
    }

    /// Active and not yet past its end.
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.end_at > now.timestamp_millis()
    }

    /// Rows written by the referral issuer. `payment_ref` is caller-supplied
    /// and is not used for classification.
    pub fn is_referral_grant(&self) -> bool {
        self.get_plan_type() == Some(PlanType::ReferralBonus)
    }
}
