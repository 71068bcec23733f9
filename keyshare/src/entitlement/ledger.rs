//! Trial, subscription and referral-grant bookkeeping.
//!
//! Renewals are read-then-write on the user's active subscription. They are
//! serialized per user with an in-process mutex and run inside one
//! `BEGIN IMMEDIATE` transaction.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::database::models::{
    PlanType, REFERRAL_PAYMENT_REF_PREFIX, SubscriptionDbModel, UserDbModel,
};
use crate::database::repositories::{
    SubscriptionRepository, SubscriptionTxOps, UserRepository, UserTxOps,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{duration_to_hours, elapsed_since};
use crate::database::{ImmediateTransaction, WritePool, begin_immediate};
use crate::events::{EngineEvent, EngineEventBroadcaster};
use crate::{Error, Result};

use super::types::{EntitlementSource, EntitlementStatus, TrialStatus};

/// Durations the ledger computes expiries with.
#[derive(Debug, Clone, Copy)]
pub struct LedgerDurations {
    pub trial_window: Duration,
    pub period: Duration,
    pub referral_bonus: Duration,
}

impl Default for LedgerDurations {
    fn default() -> Self {
        Self {
            trial_window: Duration::hours(24),
            period: Duration::days(30),
            referral_bonus: Duration::days(3),
        }
    }
}

/// Time left in a trial window started at `started_at`; zero once elapsed.
pub(crate) fn trial_remaining(
    started_at: Option<DateTime<Utc>>,
    window: Duration,
    now: DateTime<Utc>,
) -> Duration {
    match started_at {
        Some(start) => (window - elapsed_since(start, now)).max(Duration::zero()),
        None => Duration::zero(),
    }
}

/// Point a renewal extends from: the current end if still in the future,
/// otherwise `now`.
pub(crate) fn renewal_base(current_end: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match current_end {
        Some(end) if end > now => end,
        _ => now,
    }
}

pub struct EntitlementLedger {
    write_pool: WritePool,
    users: Arc<dyn UserRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    durations: LedgerDurations,
    events: EngineEventBroadcaster,
    /// Per-user locks for renewals and grants.
    user_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl EntitlementLedger {
    pub fn new(
        write_pool: WritePool,
        users: Arc<dyn UserRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        durations: LedgerDurations,
        events: EngineEventBroadcaster,
    ) -> Self {
        Self {
            write_pool,
            users,
            subscriptions,
            durations,
            events,
            user_locks: DashMap::new(),
        }
    }

    pub fn durations(&self) -> LedgerDurations {
        self.durations
    }

    /// Run `fut` holding the user's lock. The map entry is dropped once no
    /// other caller holds or waits on it.
    async fn with_user_lock<T, Fut>(&self, user_id: i64, fut: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let lock = self
            .user_locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            fut.await
        };
        drop(lock);
        self.user_locks
            .remove_if(&user_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    // ========== Trial ==========

    pub async fn trial_status(&self, user_id: i64) -> Result<TrialStatus> {
        self.trial_status_at(user_id, Utc::now()).await
    }

    pub async fn trial_status_at(&self, user_id: i64, now: DateTime<Utc>) -> Result<TrialStatus> {
        let Some(user) = self.users.find_by_id(user_id).await? else {
            return Ok(TrialStatus::unknown_user());
        };

        let remaining = trial_remaining(
            user.get_trial_started_at(),
            self.durations.trial_window,
            now,
        );
        Ok(TrialStatus {
            can_activate: !user.trial_consumed,
            is_active: remaining > Duration::zero(),
            hours_remaining: duration_to_hours(remaining),
        })
    }

    /// Start the one-time trial. Returns false, changing nothing, if it was
    /// already used.
    pub async fn activate_trial(&self, user_id: i64) -> Result<bool> {
        self.activate_trial_at(user_id, Utc::now()).await
    }

    #[instrument(skip(self, now))]
    pub async fn activate_trial_at(&self, user_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let started = retry_on_sqlite_busy("activate_trial", || async {
            self.users
                .create_if_missing(&UserDbModel::new(user_id, None, now))
                .await?;
            self.users.start_trial(user_id, now).await
        })
        .await?;

        if started {
            info!("Trial activated");
            self.events.publish(EngineEvent::TrialActivated { user_id });
        } else {
            debug!("Trial already consumed");
        }
        Ok(started)
    }

    // ========== Subscriptions ==========

    /// Create a subscription or extend the active one by the plan's duration.
    ///
    /// An unexpired trial remainder is added once, the first time a
    /// subscription is bought inside the trial window.
    pub async fn create_or_renew(
        &self,
        user_id: i64,
        plan_type: PlanType,
        payment_ref: Option<&str>,
    ) -> Result<SubscriptionDbModel> {
        self.create_or_renew_at(user_id, plan_type, payment_ref, Utc::now())
            .await
    }

    #[instrument(skip(self, payment_ref, now), fields(plan = %plan_type))]
    pub async fn create_or_renew_at(
        &self,
        user_id: i64,
        plan_type: PlanType,
        payment_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionDbModel> {
        if !plan_type.is_paid() {
            return Err(Error::validation(format!(
                "plan {} cannot be purchased",
                plan_type
            )));
        }

        let subscription = self
            .with_user_lock(
                user_id,
                retry_on_sqlite_busy("create_or_renew_subscription", || {
                    self.try_create_or_renew(user_id, plan_type, payment_ref, now)
                }),
            )
            .await?;

        let end_at = subscription.get_end_at();
        info!(
            subscription_id = %subscription.id,
            end_at = %end_at,
            "Subscription renewed"
        );
        self.events.publish(EngineEvent::SubscriptionRenewed {
            user_id,
            subscription_id: subscription.id.clone(),
            end_at,
        });

        Ok(subscription)
    }

    async fn try_create_or_renew(
        &self,
        user_id: i64,
        plan_type: PlanType,
        payment_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionDbModel> {
        let mut tx = begin_immediate(&self.write_pool).await?;

        let user = UserTxOps::get_or_create_user(&mut tx, user_id, None, now).await?;

        let mut extra = Duration::zero();
        if !user.trial_folded {
            let remaining = trial_remaining(
                user.get_trial_started_at(),
                self.durations.trial_window,
                now,
            );
            if remaining > Duration::zero() && UserTxOps::mark_trial_folded(&mut tx, user_id, now).await? {
                debug!(minutes = remaining.num_minutes(), "Folding trial remainder");
                extra = remaining;
            }
        }

        let active = SubscriptionTxOps::get_active(&mut tx, user_id).await?;
        let base = renewal_base(active.as_ref().map(|s| s.get_end_at()), now);
        let new_end = base
            + plan_type.duration(self.durations.period, self.durations.referral_bonus)
            + extra;

        let id = match active {
            // The grant row is kept as-is for the audit trail; the paid plan
            // continues from its end.
            Some(current) if current.is_referral_grant() => {
                SubscriptionTxOps::deactivate(&mut tx, &current.id, now).await?;
                Self::insert_subscription(&mut tx, user_id, plan_type, base, new_end, payment_ref, now)
                    .await?
            }
            Some(current) => {
                SubscriptionTxOps::renew(&mut tx, &current.id, plan_type, new_end, payment_ref, now)
                    .await?;
                current.id
            }
            None => {
                Self::insert_subscription(&mut tx, user_id, plan_type, base, new_end, payment_ref, now)
                    .await?
            }
        };

        let subscription = SubscriptionTxOps::get_by_id(&mut tx, &id)
            .await?
            .ok_or_else(|| Error::not_found("Subscription", &id))?;
        tx.commit().await?;
        Ok(subscription)
    }

    async fn insert_subscription(
        tx: &mut ImmediateTransaction,
        user_id: i64,
        plan_type: PlanType,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        payment_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let sub = SubscriptionDbModel::new(
            user_id,
            plan_type,
            start_at,
            end_at,
            payment_ref.map(str::to_string),
            now,
        );
        SubscriptionTxOps::insert(tx, &sub).await?;
        Ok(sub.id)
    }

    fn subscription_status(sub: &SubscriptionDbModel, now: DateTime<Utc>) -> EntitlementStatus {
        let end = sub.get_end_at();
        EntitlementStatus {
            active: true,
            source: EntitlementSource::Subscription,
            expires_at: Some(end),
            hours_left: duration_to_hours(end - now),
        }
    }

    /// Whether the user may use the service right now, and until when.
    pub async fn entitlement_status(&self, user_id: i64) -> Result<EntitlementStatus> {
        self.entitlement_status_at(user_id, Utc::now()).await
    }

    pub async fn entitlement_status_at(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<EntitlementStatus> {
        if let Some(sub) = self.subscriptions.find_active(user_id).await? {
            if sub.is_current(now) {
                return Ok(Self::subscription_status(&sub, now));
            }

            // Lapsed but not yet swept. A concurrent renewal may have
            // extended the row since it was read.
            let deactivated = retry_on_sqlite_busy("deactivate_subscription", || {
                self.subscriptions.deactivate_if_lapsed(&sub.id, now)
            })
            .await?;
            if deactivated {
                debug!(subscription_id = %sub.id, "Deactivated lapsed subscription");
            } else if let Some(renewed) = self.subscriptions.find_active(user_id).await? {
                if renewed.is_current(now) {
                    return Ok(Self::subscription_status(&renewed, now));
                }
            }
        }

        let Some(user) = self.users.find_by_id(user_id).await? else {
            return Ok(EntitlementStatus::none());
        };
        let Some(started_at) = user.get_trial_started_at() else {
            return Ok(EntitlementStatus::none());
        };

        let remaining = trial_remaining(Some(started_at), self.durations.trial_window, now);
        if remaining > Duration::zero() {
            return Ok(EntitlementStatus {
                active: true,
                source: EntitlementSource::Trial,
                expires_at: Some(started_at + self.durations.trial_window),
                hours_left: duration_to_hours(remaining),
            });
        }

        Ok(EntitlementStatus::none())
    }

    /// Deactivate every active subscription whose end has passed.
    pub async fn expire_lapsed(&self) -> Result<u64> {
        self.expire_lapsed_at(Utc::now()).await
    }

    pub async fn expire_lapsed_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let expired = retry_on_sqlite_busy("expire_lapsed_subscriptions", || {
            self.subscriptions.deactivate_lapsed(now)
        })
        .await?;
        if expired > 0 {
            info!(expired, "Deactivated lapsed subscriptions");
        }
        Ok(expired)
    }

    /// Every subscription row of the user, newest first.
    pub async fn subscription_history(&self, user_id: i64) -> Result<Vec<SubscriptionDbModel>> {
        self.subscriptions.list_for_user(user_id).await
    }

    // ========== Referral grant ==========

    /// Insert the referral grant for `new_user_id` if they are eligible.
    ///
    /// Returns false, changing nothing, when they are not.
    pub(crate) async fn grant_referral_bonus_at(
        &self,
        new_user_id: i64,
        referrer_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if new_user_id == referrer_id {
            return Ok(false);
        }

        self.with_user_lock(
            new_user_id,
            retry_on_sqlite_busy("grant_referral_bonus", || {
                self.try_grant_referral_bonus(new_user_id, referrer_id, now)
            }),
        )
        .await
    }

    async fn try_grant_referral_bonus(
        &self,
        new_user_id: i64,
        referrer_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = begin_immediate(&self.write_pool).await?;

        if let Some(reason) = Self::referral_rejection(&mut tx, new_user_id, referrer_id, now).await? {
            tx.rollback().await?;
            debug!(new_user_id, referrer_id, reason, "Referral grant rejected");
            return Ok(false);
        }

        // A lapsed row still flagged active would block the insert.
        if let Some(stale) = SubscriptionTxOps::get_active(&mut tx, new_user_id).await? {
            SubscriptionTxOps::deactivate(&mut tx, &stale.id, now).await?;
        }

        UserTxOps::set_referrer_if_unset(&mut tx, new_user_id, referrer_id, now).await?;

        let grant = SubscriptionDbModel::new(
            new_user_id,
            PlanType::ReferralBonus,
            now,
            now + self.durations.referral_bonus,
            Some(format!("{}{}", REFERRAL_PAYMENT_REF_PREFIX, referrer_id)),
            now,
        );
        SubscriptionTxOps::insert(&mut tx, &grant).await?;
        tx.commit().await?;

        Ok(true)
    }

    async fn referral_rejection(
        tx: &mut ImmediateTransaction,
        new_user_id: i64,
        referrer_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<&'static str>> {
        if UserTxOps::get_user(tx, referrer_id).await?.is_none() {
            return Ok(Some("unknown referrer"));
        }
        let Some(new_user) = UserTxOps::get_user(tx, new_user_id).await? else {
            return Ok(Some("unknown user"));
        };
        if new_user.referrer_id.is_some_and(|r| r != referrer_id) {
            return Ok(Some("referred by someone else"));
        }
        if SubscriptionTxOps::has_referral_grant(tx, new_user_id).await? {
            return Ok(Some("grant already received"));
        }
        if let Some(active) = SubscriptionTxOps::get_active(tx, new_user_id).await? {
            if active.is_current(now) {
                return Ok(Some("active subscription"));
            }
        }
        Ok(None)
    }

    // ========== Background expiry ==========

    /// Run [`Self::expire_lapsed`] every `check_interval` until cancelled.
    pub fn start_expiry_task(
        self: Arc<Self>,
        check_interval: std::time::Duration,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);

            info!(
                interval_secs = check_interval.as_secs(),
                "Subscription expiry task started"
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Subscription expiry task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.expire_lapsed().await {
                            error!(error = %e, "Expiry check failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabasePools;
    use crate::database::repositories::{SqlxSubscriptionRepository, SqlxUserRepository};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_trial_remaining_inside_window() {
        let window = Duration::hours(24);
        let remaining = trial_remaining(Some(t0()), window, t0() + Duration::hours(10));
        assert_eq!(remaining, Duration::hours(14));
    }

    #[test]
    fn test_trial_remaining_after_window() {
        let window = Duration::hours(24);
        assert_eq!(
            trial_remaining(Some(t0()), window, t0() + Duration::hours(24)),
            Duration::zero()
        );
        assert_eq!(
            trial_remaining(Some(t0()), window, t0() + Duration::days(3)),
            Duration::zero()
        );
        assert_eq!(trial_remaining(None, window, t0()), Duration::zero());
    }

    #[test]
    fn test_trial_remaining_never_exceeds_window() {
        // Start recorded slightly in the future by a skewed writer.
        let window = Duration::hours(24);
        let remaining = trial_remaining(Some(t0() + Duration::minutes(5)), window, t0());
        assert_eq!(remaining, window);
    }

    #[test]
    fn test_renewal_base() {
        let now = t0();
        let future = now + Duration::days(10);
        let past = now - Duration::days(1);

        assert_eq!(renewal_base(Some(future), now), future);
        assert_eq!(renewal_base(Some(past), now), now);
        assert_eq!(renewal_base(Some(now), now), now);
        assert_eq!(renewal_base(None, now), now);
    }

    #[test]
    fn test_default_durations() {
        let d = LedgerDurations::default();
        assert_eq!(d.trial_window, Duration::hours(24));
        assert_eq!(PlanType::ThreePeriod.duration(d.period, d.referral_bonus), Duration::days(90));
        assert_eq!(
            PlanType::ReferralBonus.duration(d.period, d.referral_bonus),
            Duration::days(3)
        );
    }

    /// Holds the first `find_active` caller between its read and its return.
    struct PausingSubscriptions {
        inner: SqlxSubscriptionRepository,
        armed: AtomicBool,
        paused: Notify,
        resume: Notify,
    }

    #[async_trait]
    impl SubscriptionRepository for PausingSubscriptions {
        async fn find_active(&self, user_id: i64) -> Result<Option<SubscriptionDbModel>> {
            let found = self.inner.find_active(user_id).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.paused.notify_one();
                self.resume.notified().await;
            }
            Ok(found)
        }

        async fn list_for_user(&self, user_id: i64) -> Result<Vec<SubscriptionDbModel>> {
            self.inner.list_for_user(user_id).await
        }

        async fn deactivate_if_lapsed(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
            self.inner.deactivate_if_lapsed(id, now).await
        }

        async fn deactivate_lapsed(&self, now: DateTime<Utc>) -> Result<u64> {
            self.inner.deactivate_lapsed(now).await
        }
    }

    #[tokio::test]
    async fn test_status_check_keeps_concurrent_renewal() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("ledger.db").display());
        let pools = DatabasePools::open(&url).await.unwrap();

        let subscriptions = Arc::new(PausingSubscriptions {
            inner: SqlxSubscriptionRepository::new(pools.read.clone(), pools.write.clone()),
            armed: AtomicBool::new(false),
            paused: Notify::new(),
            resume: Notify::new(),
        });
        let ledger = Arc::new(EntitlementLedger::new(
            pools.write.clone(),
            Arc::new(SqlxUserRepository::new(pools.read.clone(), pools.write.clone())),
            subscriptions.clone(),
            LedgerDurations::default(),
            EngineEventBroadcaster::new(),
        ));

        // A one-period row that lapsed ten days ago and was never swept.
        ledger
            .create_or_renew_at(1, PlanType::OnePeriod, Some("pay-1"), t0())
            .await
            .unwrap();
        let now = t0() + Duration::days(40);

        subscriptions.armed.store(true, Ordering::SeqCst);
        let status_check = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.entitlement_status_at(1, now).await })
        };
        subscriptions.paused.notified().await;

        // The status check has read the lapsed row; renew it before it acts.
        let renewed = ledger
            .create_or_renew_at(1, PlanType::SixPeriod, Some("pay-2"), now)
            .await
            .unwrap();
        assert_eq!(renewed.get_end_at(), now + Duration::days(180));
        subscriptions.resume.notify_one();

        let status = status_check.await.unwrap().unwrap();
        assert!(status.active);
        assert_eq!(status.source, EntitlementSource::Subscription);
        assert_eq!(status.expires_at, Some(now + Duration::days(180)));

        let active = subscriptions.find_active(1).await.unwrap().unwrap();
        assert_eq!(active.id, renewed.id);
        assert!(active.is_active);
        assert!(ledger.user_locks.is_empty());
    }
}
