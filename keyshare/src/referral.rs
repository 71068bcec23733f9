//! Referral grants for newly invited users.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::Result;
use crate::entitlement::EntitlementLedger;
use crate::events::{EngineEvent, EngineEventBroadcaster};

/// Gives a referred user a short subscription instead of the trial.
///
/// The referrer receives nothing from the engine. A
/// [`EngineEvent::ReferralGranted`] event is published so the messaging layer
/// can tell them.
pub struct ReferralRewardIssuer {
    ledger: Arc<EntitlementLedger>,
    events: EngineEventBroadcaster,
}

impl ReferralRewardIssuer {
    pub fn new(ledger: Arc<EntitlementLedger>, events: EngineEventBroadcaster) -> Self {
        Self { ledger, events }
    }

    /// Grant the referral subscription to `new_user_id`.
    ///
    /// Returns false, changing nothing, for a self-referral, an unknown user
    /// or referrer, a user already referred by someone else, or a user who
    /// already had a grant or holds a current subscription. Callers fall back
    /// to the trial in that case.
    pub async fn grant(&self, new_user_id: i64, referrer_id: i64) -> Result<bool> {
        self.grant_at(new_user_id, referrer_id, Utc::now()).await
    }

    #[instrument(skip(self, now))]
    pub async fn grant_at(
        &self,
        new_user_id: i64,
        referrer_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let granted = self
            .ledger
            .grant_referral_bonus_at(new_user_id, referrer_id, now)
            .await?;

        if granted {
            info!(
                days = self.ledger.durations().referral_bonus.num_days(),
                "Referral grant issued"
            );
            self.events.publish(EngineEvent::ReferralGranted {
                new_user_id,
                referrer_id,
            });
        }
        Ok(granted)
    }
}
