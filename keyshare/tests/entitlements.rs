use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::task::JoinSet;

use keyshare::config::EngineConfig;
use keyshare::database::models::PlanType;
use keyshare::entitlement::EntitlementSource;
use keyshare::events::EngineEvent;
use keyshare::{Engine, Error, ProfileHints};

async fn open_engine(dir: &TempDir) -> Engine {
    let url = format!(
        "sqlite:{}?mode=rwc",
        dir.path().join("keyshare.db").to_string_lossy().replace('\\', "/")
    );
    let config = EngineConfig::default()
        .with_database_url(url)
        .with_upstream_keys(vec!["key-a".to_string()]);
    Engine::open(config).await.unwrap()
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
}

fn assert_hours(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {expected} hours, got {actual}"
    );
}

#[tokio::test]
async fn trial_is_single_use() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;
    let ledger = &engine.ledger;

    let unknown = ledger.trial_status_at(1, t0()).await.unwrap();
    assert!(unknown.can_activate);
    assert!(!unknown.is_active);
    assert_hours(unknown.hours_remaining, 0.0);

    assert!(ledger.activate_trial_at(1, t0()).await.unwrap());
    assert!(!ledger.activate_trial_at(1, t0() + Duration::hours(1)).await.unwrap());

    let status = ledger
        .trial_status_at(1, t0() + Duration::hours(1))
        .await
        .unwrap();
    assert!(!status.can_activate);
    assert!(status.is_active);
    assert_hours(status.hours_remaining, 23.0);

    // The failed second activation did not restart the window.
    let expired = ledger
        .trial_status_at(1, t0() + Duration::hours(24))
        .await
        .unwrap();
    assert!(!expired.can_activate);
    assert!(!expired.is_active);
    assert_hours(expired.hours_remaining, 0.0);

    assert!(!ledger.activate_trial_at(1, t0() + Duration::days(5)).await.unwrap());
}

#[tokio::test]
async fn trial_entitlement_window() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;
    let ledger = &engine.ledger;

    let none = ledger.entitlement_status_at(5, t0()).await.unwrap();
    assert!(!none.active);
    assert_eq!(none.source, EntitlementSource::None);
    assert_eq!(none.expires_at, None);

    ledger.activate_trial_at(5, t0()).await.unwrap();

    let status = ledger
        .entitlement_status_at(5, t0() + Duration::hours(6))
        .await
        .unwrap();
    assert!(status.active);
    assert_eq!(status.source, EntitlementSource::Trial);
    assert_eq!(status.expires_at, Some(t0() + Duration::hours(24)));
    assert_hours(status.hours_left, 18.0);

    let after = ledger
        .entitlement_status_at(5, t0() + Duration::hours(25))
        .await
        .unwrap();
    assert!(!after.active);
    assert_eq!(after.source, EntitlementSource::None);
}

#[tokio::test]
async fn purchase_during_trial_folds_remainder_once() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;
    let ledger = &engine.ledger;
    let period = Duration::days(30);

    ledger.activate_trial_at(9, t0()).await.unwrap();

    let bought_at = t0() + Duration::hours(10);
    let sub = ledger
        .create_or_renew_at(9, PlanType::OnePeriod, Some("pay-1"), bought_at)
        .await
        .unwrap();
    assert_eq!(sub.get_start_at(), bought_at);
    assert_eq!(sub.get_end_at(), bought_at + period + Duration::hours(14));
    assert_eq!(sub.payment_ref.as_deref(), Some("pay-1"));

    // Still inside the trial window, but the remainder was already used.
    let renewed = ledger
        .create_or_renew_at(9, PlanType::OnePeriod, None, t0() + Duration::hours(11))
        .await
        .unwrap();
    assert_eq!(renewed.id, sub.id);
    assert_eq!(renewed.get_end_at(), sub.get_end_at() + period);
    assert_eq!(renewed.payment_ref.as_deref(), Some("pay-1"));
    assert_eq!(renewed.get_start_at(), bought_at);

    let status = ledger
        .entitlement_status_at(9, t0() + Duration::hours(12))
        .await
        .unwrap();
    assert_eq!(status.source, EntitlementSource::Subscription);
    assert_eq!(status.expires_at, Some(renewed.get_end_at()));
}

#[tokio::test]
async fn purchase_after_trial_adds_nothing() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;
    let ledger = &engine.ledger;

    ledger.activate_trial_at(10, t0()).await.unwrap();

    let bought_at = t0() + Duration::hours(30);
    let sub = ledger
        .create_or_renew_at(10, PlanType::ThreePeriod, None, bought_at)
        .await
        .unwrap();
    assert_eq!(sub.get_end_at(), bought_at + Duration::days(90));
    assert_eq!(sub.get_plan_type(), Some(PlanType::ThreePeriod));
}

#[tokio::test]
async fn expiry_never_moves_backwards() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;
    let ledger = &engine.ledger;

    let first = ledger
        .create_or_renew_at(11, PlanType::SixPeriod, Some("pay-1"), t0())
        .await
        .unwrap();
    assert_eq!(first.get_end_at(), t0() + Duration::days(180));

    // Early renewal extends from the current end, not from now.
    let second = ledger
        .create_or_renew_at(11, PlanType::OnePeriod, Some("pay-2"), t0() + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(second.get_end_at(), first.get_end_at() + Duration::days(30));
    assert_eq!(second.get_plan_type(), Some(PlanType::OnePeriod));

    // After lapse the new period starts at the purchase time.
    let late = t0() + Duration::days(400);
    let third = ledger
        .create_or_renew_at(11, PlanType::OnePeriod, None, late)
        .await
        .unwrap();
    assert!(third.get_end_at() >= second.get_end_at());
    assert_eq!(third.get_end_at(), late + Duration::days(30));

    let active_rows = ledger
        .subscription_history(11)
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.is_active)
        .count();
    assert_eq!(active_rows, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_renewals_all_count() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(open_engine(&dir).await);
    let renewals = 12;

    let mut tasks = JoinSet::new();
    for i in 0..renewals {
        let engine = engine.clone();
        tasks.spawn(async move {
            let payment_ref = format!("pay-{i}");
            engine
                .ledger
                .create_or_renew_at(20, PlanType::OnePeriod, Some(payment_ref.as_str()), t0())
                .await
                .unwrap();
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }

    let history = engine.ledger.subscription_history(20).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(
        history[0].get_end_at(),
        t0() + Duration::days(30) * renewals
    );
}

#[tokio::test]
async fn referral_bonus_is_not_purchasable() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;

    let err = engine
        .create_or_renew_subscription(1, PlanType::ReferralBonus, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(engine.subscription_history(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn lapsed_subscriptions_are_expired() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;
    let ledger = &engine.ledger;

    ledger
        .create_or_renew_at(30, PlanType::OnePeriod, None, t0())
        .await
        .unwrap();
    ledger
        .create_or_renew_at(31, PlanType::SixPeriod, None, t0())
        .await
        .unwrap();

    let expired = ledger
        .expire_lapsed_at(t0() + Duration::days(31))
        .await
        .unwrap();
    assert_eq!(expired, 1);

    let history = ledger.subscription_history(30).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].is_active);

    let status = ledger
        .entitlement_status_at(31, t0() + Duration::days(31))
        .await
        .unwrap();
    assert!(status.active);

    // A second pass finds nothing.
    assert_eq!(
        ledger.expire_lapsed_at(t0() + Duration::days(31)).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn status_check_deactivates_lapsed_row() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;
    let ledger = &engine.ledger;

    ledger
        .create_or_renew_at(32, PlanType::OnePeriod, None, t0())
        .await
        .unwrap();

    let status = ledger
        .entitlement_status_at(32, t0() + Duration::days(30))
        .await
        .unwrap();
    assert!(!status.active);

    let history = ledger.subscription_history(32).await.unwrap();
    assert!(!history[0].is_active);
}

#[tokio::test]
async fn self_referral_is_rejected_without_mutation() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;

    engine.record_activity(40).await.unwrap();
    assert!(!engine.grant_referral_reward(40, 40).await.unwrap());
    assert!(engine.subscription_history(40).await.unwrap().is_empty());

    let referrer: (Option<i64>,) = sqlx::query_as("SELECT referrer_id FROM users WHERE id = 40")
        .fetch_one(&engine.pools.read)
        .await
        .unwrap();
    assert_eq!(referrer.0, None);
}

#[tokio::test]
async fn referral_requires_known_users() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;

    engine.record_activity(50).await.unwrap();
    // Unknown referrer
    assert!(!engine.grant_referral_reward(50, 51).await.unwrap());
    // Unknown new user
    assert!(!engine.grant_referral_reward(52, 50).await.unwrap());
    assert!(engine.subscription_history(50).await.unwrap().is_empty());
}

#[tokio::test]
async fn referral_grant_lasts_three_days() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;
    let mut events = engine.subscribe();

    engine.record_activity(60).await.unwrap();
    engine
        .assign_or_get_credential(61, &ProfileHints::referred_by(60))
        .await
        .unwrap();
    while events.try_recv().is_ok() {}

    assert!(engine.referrals.grant_at(61, 60, t0()).await.unwrap());

    let history = engine.subscription_history(61).await.unwrap();
    assert_eq!(history.len(), 1);
    let grant = &history[0];
    assert_eq!(grant.get_plan_type(), Some(PlanType::ReferralBonus));
    assert_eq!(grant.get_end_at() - grant.get_start_at(), Duration::days(3));
    assert_eq!(grant.payment_ref.as_deref(), Some("referral:60"));
    assert!(grant.is_referral_grant());

    assert_eq!(
        events.recv().await.unwrap(),
        EngineEvent::ReferralGranted {
            new_user_id: 61,
            referrer_id: 60
        }
    );

    let status = engine
        .ledger
        .entitlement_status_at(61, t0() + Duration::days(1))
        .await
        .unwrap();
    assert!(status.active);
    assert_eq!(status.source, EntitlementSource::Subscription);
    assert_hours(status.hours_left, 48.0);

    // Only once, even after the grant lapsed.
    assert!(!engine.referrals.grant_at(61, 60, t0() + Duration::days(10)).await.unwrap());

    // The referrer gets nothing.
    assert!(engine.subscription_history(60).await.unwrap().is_empty());
}

#[tokio::test]
async fn referral_rejected_for_other_referrer_or_subscriber() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;

    for user_id in [70, 71, 72, 73] {
        engine.record_activity(user_id).await.unwrap();
    }

    engine
        .assign_or_get_credential(74, &ProfileHints::referred_by(70))
        .await
        .unwrap();
    assert!(!engine.grant_referral_reward(74, 71).await.unwrap());

    engine
        .ledger
        .create_or_renew_at(72, PlanType::OnePeriod, None, Utc::now())
        .await
        .unwrap();
    assert!(!engine.grant_referral_reward(72, 73).await.unwrap());
    assert_eq!(engine.subscription_history(72).await.unwrap().len(), 1);
}

#[tokio::test]
async fn paid_plan_continues_after_referral_grant() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;

    engine.record_activity(80).await.unwrap();
    engine.record_activity(81).await.unwrap();
    assert!(engine.referrals.grant_at(81, 80, t0()).await.unwrap());

    let paid = engine
        .ledger
        .create_or_renew_at(81, PlanType::OnePeriod, Some("pay-9"), t0() + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(paid.get_start_at(), t0() + Duration::days(3));
    assert_eq!(paid.get_end_at(), t0() + Duration::days(33));

    let history = engine.subscription_history(81).await.unwrap();
    assert_eq!(history.len(), 2);
    let grant = history.iter().find(|s| s.is_referral_grant()).unwrap();
    assert!(!grant.is_active);
}

#[tokio::test]
async fn referral_after_lapsed_subscription() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;

    engine.record_activity(90).await.unwrap();
    engine
        .ledger
        .create_or_renew_at(91, PlanType::OnePeriod, None, t0())
        .await
        .unwrap();

    // Lapsed but not yet swept: the stale row is closed first.
    assert!(
        engine
            .referrals
            .grant_at(91, 90, t0() + Duration::days(40))
            .await
            .unwrap()
    );
    let active: Vec<_> = engine
        .subscription_history(91)
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.is_active)
        .collect();
    assert_eq!(active.len(), 1);
    assert!(active[0].is_referral_grant());
}

#[tokio::test]
async fn billing_ref_does_not_mark_paid_rows_as_grants() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;
    let ledger = &engine.ledger;

    let first = ledger
        .create_or_renew_at(95, PlanType::OnePeriod, Some("referral:promo-42"), t0())
        .await
        .unwrap();
    assert!(!first.is_referral_grant());

    // Renewed in place like any other paid row.
    let second = ledger
        .create_or_renew_at(95, PlanType::OnePeriod, Some("inv-2"), t0() + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.get_end_at(), t0() + Duration::days(60));

    let history = engine.subscription_history(95).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].is_active);

    // A lapsed paid row with such a ref does not count as a used grant.
    engine.record_activity(94).await.unwrap();
    engine
        .ledger
        .create_or_renew_at(96, PlanType::OnePeriod, Some("referral:promo-7"), t0())
        .await
        .unwrap();
    assert!(engine.referrals.grant_at(96, 94, t0() + Duration::days(40)).await.unwrap());
}
