//! Engine facade.
//!
//! The Engine builds every component against one pair of database pools and
//! exposes the operations the messaging layer calls. Construct it once and
//! share it behind an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::activity::ActivityTracker;
use crate::config::EngineConfig;
use crate::credentials::{AssignmentResult, CredentialPool, CredentialUsage};
use crate::database::DatabasePools;
use crate::database::models::{PlanType, SubscriptionDbModel};
use crate::database::repositories::{
    SqlxCredentialRepository, SqlxSubscriptionRepository, SqlxUserRepository,
};
use crate::entitlement::{EntitlementLedger, EntitlementStatus, LedgerDurations, TrialStatus};
use crate::events::{EngineEvent, EngineEventBroadcaster};
use crate::reclaim::Reclaimer;
use crate::referral::ReferralRewardIssuer;
use crate::{Error, Result};

/// What the messaging layer knows about a user when they first show up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileHints {
    /// Inviting user from a referral link; recorded only when the user is created.
    pub referrer_id: Option<i64>,
}

impl ProfileHints {
    pub fn referred_by(referrer_id: i64) -> Self {
        Self {
            referrer_id: Some(referrer_id),
        }
    }
}

/// Credential pool and entitlement engine.
pub struct Engine {
    pub pools: DatabasePools,
    pub credential_pool: Arc<CredentialPool>,
    pub ledger: Arc<EntitlementLedger>,
    pub activity: Arc<ActivityTracker>,
    pub referrals: Arc<ReferralRewardIssuer>,
    pub reclaimer: Arc<Reclaimer>,
    /// Event broadcaster (shared between components).
    pub event_broadcaster: EngineEventBroadcaster,
    config: EngineConfig,
    cancellation_token: CancellationToken,
}

impl Engine {
    /// Open the database, apply migrations and seed the configured upstream keys.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pools = DatabasePools::open(&config.database_url).await?;
        let engine = Self::new(pools, config);

        if !engine.config.upstream_keys.is_empty() {
            engine
                .credential_pool
                .seed(&engine.config.upstream_keys)
                .await?;
        }

        Ok(engine)
    }

    /// Wire every component against already-migrated pools.
    pub fn new(pools: DatabasePools, config: EngineConfig) -> Self {
        info!("Initializing engine");

        // Create repositories
        let credential_repo = Arc::new(SqlxCredentialRepository::new(
            pools.read.clone(),
            pools.write.clone(),
        ));
        let user_repo = Arc::new(SqlxUserRepository::new(
            pools.read.clone(),
            pools.write.clone(),
        ));
        let subscription_repo = Arc::new(SqlxSubscriptionRepository::new(
            pools.read.clone(),
            pools.write.clone(),
        ));

        let event_broadcaster = EngineEventBroadcaster::new();

        let credential_pool = Arc::new(CredentialPool::new(
            pools.write.clone(),
            credential_repo,
            user_repo.clone(),
            config.max_users_per_credential,
            event_broadcaster.clone(),
        ));

        let ledger = Arc::new(EntitlementLedger::new(
            pools.write.clone(),
            user_repo.clone(),
            subscription_repo,
            LedgerDurations {
                trial_window: config.trial_window(),
                period: config.period(),
                referral_bonus: config.referral_bonus(),
            },
            event_broadcaster.clone(),
        ));

        let activity = Arc::new(ActivityTracker::new(user_repo));
        let referrals = Arc::new(ReferralRewardIssuer::new(
            ledger.clone(),
            event_broadcaster.clone(),
        ));
        let reclaimer = Arc::new(Reclaimer::new(activity.clone(), credential_pool.clone()));

        info!(
            capacity = config.max_users_per_credential,
            "Engine initialized"
        );

        Self {
            pools,
            credential_pool,
            ledger,
            activity,
            referrals,
            reclaimer,
            event_broadcaster,
            config,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========== Credentials ==========

    /// Return the user's credential, assigning one if needed.
    ///
    /// A full pool is reported as `limit_exceeded`, not as an error.
    #[instrument(skip(self, hints))]
    pub async fn assign_or_get_credential(
        &self,
        user_id: i64,
        hints: &ProfileHints,
    ) -> Result<AssignmentResult> {
        match self
            .credential_pool
            .assign_at(user_id, hints.referrer_id, chrono::Utc::now())
            .await
        {
            Ok(assignment) => Ok(assignment.into()),
            Err(Error::PoolExhausted) => Ok(AssignmentResult::limit_exceeded()),
            Err(e) => Err(e),
        }
    }

    pub async fn get_credential(&self, user_id: i64) -> Result<Option<String>> {
        self.credential_pool.credential_for(user_id).await
    }

    pub async fn seed_credentials(&self, secrets: &[String]) -> Result<u64> {
        self.credential_pool.seed(secrets).await
    }

    pub async fn usage_stats(&self) -> Result<Vec<CredentialUsage>> {
        self.credential_pool.usage_stats().await
    }

    pub async fn activate_credential(&self, credential_id: &str) -> Result<bool> {
        self.credential_pool.set_active(credential_id, true).await
    }

    /// Holders keep working until their next assignment moves them elsewhere.
    pub async fn deactivate_credential(&self, credential_id: &str) -> Result<bool> {
        self.credential_pool.set_active(credential_id, false).await
    }

    // ========== Activity ==========

    pub async fn record_activity(&self, user_id: i64) -> Result<()> {
        self.activity.touch(user_id).await
    }

    /// Release credentials idle for longer than `idle_threshold`.
    pub async fn reclaim_idle(&self, idle_threshold: Duration) -> Result<u64> {
        self.reclaimer.sweep(idle_threshold).await
    }

    // ========== Entitlements ==========

    pub async fn activate_trial(&self, user_id: i64) -> Result<bool> {
        self.ledger.activate_trial(user_id).await
    }

    pub async fn get_trial_status(&self, user_id: i64) -> Result<TrialStatus> {
        self.ledger.trial_status(user_id).await
    }

    pub async fn create_or_renew_subscription(
        &self,
        user_id: i64,
        plan_type: PlanType,
        payment_ref: Option<&str>,
    ) -> Result<SubscriptionDbModel> {
        self.ledger
            .create_or_renew(user_id, plan_type, payment_ref)
            .await
    }

    pub async fn get_entitlement_status(&self, user_id: i64) -> Result<EntitlementStatus> {
        self.ledger.entitlement_status(user_id).await
    }

    pub async fn subscription_history(&self, user_id: i64) -> Result<Vec<SubscriptionDbModel>> {
        self.ledger.subscription_history(user_id).await
    }

    pub async fn expire_lapsed_subscriptions(&self) -> Result<u64> {
        self.ledger.expire_lapsed().await
    }

    pub async fn grant_referral_reward(&self, new_user_id: i64, referrer_id: i64) -> Result<bool> {
        self.referrals.grant(new_user_id, referrer_id).await
    }

    // ========== Lifecycle ==========

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_broadcaster.subscribe()
    }

    /// Spawn the reclaim and subscription-expiry loops. They stop on [`Self::shutdown`].
    pub fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let reclaim = self.reclaimer.clone().start_background_task(
            self.config.reclaim_interval(),
            self.config.idle_threshold(),
            self.cancellation_token.child_token(),
        );
        let expiry = self.ledger.clone().start_expiry_task(
            self.config.expiry_check_interval(),
            self.cancellation_token.child_token(),
        );
        vec![reclaim, expiry]
    }

    /// Get the cancellation token for background tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Stop background tasks and close the pools.
    pub async fn shutdown(&self) {
        info!("Shutting down engine");
        self.cancellation_token.cancel();
        self.pools.write.close().await;
        self.pools.read.close().await;
        info!("Engine shut down");
    }
}
