use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One-time trial state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialStatus {
    /// The trial has never been activated.
    pub can_activate: bool,
    /// The trial was activated and its window has not elapsed.
    pub is_active: bool,
    /// Hours left in the window; zero when inactive.
    pub hours_remaining: f64,
}

impl TrialStatus {
    pub(crate) fn unknown_user() -> Self {
        Self {
            can_activate: true,
            is_active: false,
            hours_remaining: 0.0,
        }
    }
}

/// What currently entitles a user to the service.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntitlementSource {
    /// A paid subscription or a referral grant.
    Subscription,
    Trial,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntitlementStatus {
    pub active: bool,
    pub source: EntitlementSource,
    pub expires_at: Option<DateTime<Utc>>,
    pub hours_left: f64,
}

impl EntitlementStatus {
    pub fn none() -> Self {
        Self {
            active: false,
            source: EntitlementSource::None,
            expires_at: None,
            hours_left: 0.0,
        }
    }
}
