//! User database model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::ms_to_datetime;

/// An end user of the shared service.
///
/// Rows are created on first contact and never deleted; reclaiming a
/// credential only clears `assigned_credential_id`.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct UserDbModel {
    /// Messaging platform user id
    pub id: i64,
    /// Credential currently held by the user (owned by the credential pool)
    pub assigned_credential_id: Option<String>,
    /// Unix epoch milliseconds (UTC) of the last credential-consuming interaction.
    pub last_activity_at: i64,
    /// Unix epoch milliseconds (UTC) when the one-time trial was started.
    pub trial_started_at: Option<i64>,
    /// Set together with `trial_started_at`; never reset.
    pub trial_consumed: bool,
    /// Set once the trial remainder has been carried into a subscription.
    pub trial_folded: bool,
    /// User who referred this one (set once)
    pub referrer_id: Option<i64>,
    /// Unix epoch milliseconds (UTC) when the user was created.
    pub created_at: i64,
    /// Unix epoch milliseconds (UTC) when the user was last updated.
    pub updated_at: i64,
}

impl UserDbModel {
    /// Create a new user seen for the first time at `now`.
    pub fn new(id: i64, referrer_id: Option<i64>, now: DateTime<Utc>) -> Self {
        let now_ms = now.timestamp_millis();
        Self {
            id,
            assigned_credential_id: None,
            last_activity_at: now_ms,
            trial_started_at: None,
            trial_consumed: false,
            trial_folded: false,
            // A user cannot refer themselves.
            referrer_id: referrer_id.filter(|r| *r != id),
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    pub fn get_last_activity_at(&self) -> DateTime<Utc> {
        ms_to_datetime(self.last_activity_at)
    }

    pub fn get_trial_started_at(&self) -> Option<DateTime<Utc>> {
        self.trial_started_at.map(ms_to_datetime)
    }

    pub fn has_assignment(&self) -> bool {
        self.assigned_credential_id.is_some()
    }
}
