// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Integration tests for the credit ledger and subscription store invariants.
//!
//! These exercise the properties the reconciliation engine exists to protect:
//! balances never go negative under concurrency, the transaction log always
//! sums to the balance, webhook events apply at most once, and stale events
//! are dropped.
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://..."   # migrated test database
//! cargo test --test ledger_invariants -- --ignored
//! ```

use partlens_billing::{
    Balance, BillingError, CreditLedger, SubscriptionService, SubscriptionSync, UpsertOutcome,
};
use partlens_shared::{SubscriptionStatus, SubscriptionTier, TransactionReason, UserId};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

// ============================================================================
// Test Utilities
// ============================================================================

async fn test_pool() -> PgPool {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database")
}

async fn create_test_user(pool: &PgPool, role: &str) -> UserId {
    let user_id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, email, role) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(format!("test-{}@example.com", user_id))
        .bind(role)
        .execute(pool)
        .await
        .expect("Failed to create test user");
    UserId(user_id)
}

async fn raw_balance(pool: &PgPool, user_id: UserId) -> i64 {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT balance FROM credit_balances WHERE user_id = $1")
            .bind(user_id.0)
            .fetch_optional(pool)
            .await
            .unwrap();
    row.map(|(b,)| b).unwrap_or(0)
}

async fn delta_sum(pool: &PgPool, user_id: UserId) -> i64 {
    let row: (Option<i64>,) = sqlx::query_as(
        "SELECT SUM(delta)::BIGINT FROM credit_transactions WHERE user_id = $1",
    )
    .bind(user_id.0)
    .fetch_one(pool)
    .await
    .unwrap();
    row.0.unwrap_or(0)
}

fn sync_with_period_end(end: OffsetDateTime) -> SubscriptionSync {
    SubscriptionSync {
        tier: SubscriptionTier::Pro,
        status: SubscriptionStatus::Active,
        stripe_customer_id: format!("cus_{}", Uuid::new_v4().simple()),
        stripe_subscription_id: format!("sub_{}", Uuid::new_v4().simple()),
        current_period_start: end - Duration::days(30),
        current_period_end: end,
        cancel_at_period_end: false,
    }
}

// ============================================================================
// Ledger invariants
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn concurrent_debits_never_overdraw() {
    let pool = test_pool().await;
    let ledger = CreditLedger::new(pool.clone());
    let user = create_test_user(&pool, "user").await;

    ledger
        .credit(user, 1, TransactionReason::AdminGrant)
        .await
        .unwrap();

    // Balance 1, two simultaneous debits of 1: exactly one may win.
    let l1 = ledger.clone();
    let l2 = ledger.clone();
    let (a, b) = tokio::join!(l1.try_debit(user, 1), l2.try_debit(user, 1));

    let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one debit must succeed");

    let failure = if a.is_err() { a } else { b };
    assert!(matches!(
        failure.unwrap_err(),
        BillingError::InsufficientCredits { .. }
    ));

    assert_eq!(raw_balance(&pool, user).await, 0);
    assert_eq!(delta_sum(&pool, user).await, 0);
}

#[tokio::test]
#[ignore] // Requires database
async fn balance_equals_sum_of_deltas_under_mixed_ops() {
    let pool = test_pool().await;
    let ledger = CreditLedger::new(pool.clone());
    let user = create_test_user(&pool, "user").await;

    ledger.credit(user, 10, TransactionReason::Purchase).await.unwrap();
    ledger.try_debit(user, 3).await.unwrap();
    ledger.credit(user, 5, TransactionReason::Grant).await.unwrap();
    ledger.try_debit(user, 1).await.unwrap();
    ledger
        .refund(user, 1, TransactionReason::AnalysisRefund)
        .await
        .unwrap();

    let balance = raw_balance(&pool, user).await;
    assert_eq!(balance, 12);
    assert_eq!(delta_sum(&pool, user).await, balance);
}

#[tokio::test]
#[ignore] // Requires database
async fn insufficient_debit_writes_nothing() {
    let pool = test_pool().await;
    let ledger = CreditLedger::new(pool.clone());
    let user = create_test_user(&pool, "user").await;

    ledger.credit(user, 2, TransactionReason::Purchase).await.unwrap();

    let err = ledger.try_debit(user, 5).await.unwrap_err();
    match err {
        BillingError::InsufficientCredits { available, required } => {
            assert_eq!(available, 2);
            assert_eq!(required, 5);
        }
        other => panic!("unexpected error: {other}"),
    }

    // No transaction row recorded for the failed attempt
    let tx_count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*)::BIGINT FROM credit_transactions WHERE user_id = $1 AND delta < 0",
    )
    .bind(user.0)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(tx_count.0, 0);
    assert_eq!(raw_balance(&pool, user).await, 2);
}

#[tokio::test]
#[ignore] // Requires database
async fn debit_then_refund_is_net_zero() {
    let pool = test_pool().await;
    let ledger = CreditLedger::new(pool.clone());
    let user = create_test_user(&pool, "user").await;

    ledger.credit(user, 4, TransactionReason::Purchase).await.unwrap();
    let before = raw_balance(&pool, user).await;

    ledger.try_debit(user, 1).await.unwrap();
    ledger
        .refund(user, 1, TransactionReason::AnalysisRefund)
        .await
        .unwrap();

    assert_eq!(raw_balance(&pool, user).await, before);
}

#[tokio::test]
#[ignore] // Requires database
async fn admin_accounts_are_unlimited_and_never_debited() {
    let pool = test_pool().await;
    let ledger = CreditLedger::new(pool.clone());
    let admin = create_test_user(&pool, "admin").await;

    assert_eq!(ledger.get_balance(admin).await.unwrap(), Balance::Unlimited);

    let receipt = ledger.try_debit(admin, 1).await.unwrap();
    assert!(receipt.exempt);

    // No ledger rows for the exempt account
    let tx_count: (i64,) =
        sqlx::query_as("SELECT COUNT(*)::BIGINT FROM credit_transactions WHERE user_id = $1")
            .bind(admin.0)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(tx_count.0, 0);
}

#[tokio::test]
#[ignore] // Requires database
async fn transactions_list_newest_first() {
    let pool = test_pool().await;
    let ledger = CreditLedger::new(pool.clone());
    let user = create_test_user(&pool, "user").await;

    ledger.credit(user, 1, TransactionReason::Purchase).await.unwrap();
    ledger.credit(user, 2, TransactionReason::Grant).await.unwrap();
    ledger.credit(user, 3, TransactionReason::AdminGrant).await.unwrap();

    let txs = ledger.list_transactions(user, 10, 0).await.unwrap();
    assert_eq!(txs.len(), 3);
    assert_eq!(txs[0].delta, 3);
    assert_eq!(txs[2].delta, 1);
    assert!(txs[0].created_at >= txs[2].created_at);
}

// ============================================================================
// Subscription store invariants
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn stale_subscription_event_is_a_noop() {
    let pool = test_pool().await;
    let subs = SubscriptionService::new(pool.clone());
    let user = create_test_user(&pool, "user").await;

    let now = OffsetDateTime::now_utc();
    let current = sync_with_period_end(now + Duration::days(30));
    assert_eq!(
        subs.upsert_from_provider(user, &current).await.unwrap(),
        UpsertOutcome::Applied
    );

    // An event from a previous period arrives late
    let mut stale = sync_with_period_end(now - Duration::days(5));
    stale.status = SubscriptionStatus::PastDue;
    assert_eq!(
        subs.upsert_from_provider(user, &stale).await.unwrap(),
        UpsertOutcome::Stale
    );

    let record = subs.get_subscription(user).await.unwrap();
    assert_eq!(record.status, SubscriptionStatus::Active);
    assert_eq!(record.current_period_end, Some(current.current_period_end));
}

#[tokio::test]
#[ignore] // Requires database
async fn period_advance_resets_usage_counter() {
    let pool = test_pool().await;
    let subs = SubscriptionService::new(pool.clone());
    let user = create_test_user(&pool, "user").await;

    let now = OffsetDateTime::now_utc();
    subs.upsert_from_provider(user, &sync_with_period_end(now + Duration::days(30)))
        .await
        .unwrap();
    subs.record_analysis_usage(user).await.unwrap();
    subs.record_analysis_usage(user).await.unwrap();
    assert_eq!(subs.get_subscription(user).await.unwrap().analyses_this_period, 2);

    // Renewal advances the period and the counter starts over
    subs.upsert_from_provider(user, &sync_with_period_end(now + Duration::days(60)))
        .await
        .unwrap();
    assert_eq!(subs.get_subscription(user).await.unwrap().analyses_this_period, 0);
}

#[tokio::test]
#[ignore] // Requires database
async fn trial_grant_claim_succeeds_exactly_once() {
    let pool = test_pool().await;
    let subs = SubscriptionService::new(pool.clone());
    let user = create_test_user(&pool, "user").await;

    let now = OffsetDateTime::now_utc();
    let mut sync = sync_with_period_end(now + Duration::days(14));
    sync.status = SubscriptionStatus::Trialing;
    subs.upsert_from_provider(user, &sync).await.unwrap();

    assert!(subs.claim_trial_grant(user).await.unwrap());
    // Redelivered or renewal events find the flag already set
    assert!(!subs.claim_trial_grant(user).await.unwrap());
    assert!(!subs.claim_trial_grant(user).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires database
async fn access_gate_requires_live_period() {
    let pool = test_pool().await;
    let subs = SubscriptionService::new(pool.clone());
    let user = create_test_user(&pool, "user").await;

    // No subscription row: fail closed
    assert!(!subs.has_active_access(user).await);

    let now = OffsetDateTime::now_utc();
    subs.upsert_from_provider(user, &sync_with_period_end(now + Duration::days(30)))
        .await
        .unwrap();
    assert!(subs.has_active_access(user).await);

    // Cancellation scheduling alone does not revoke access
    subs.cancel(user).await.unwrap();
    assert!(subs.has_active_access(user).await);

    // A past-due status does
    subs.mark_past_due(user).await.unwrap();
    assert!(!subs.has_active_access(user).await);
}

// ============================================================================
// Webhook event claim idempotency
// ============================================================================

/// Exercises the atomic claim used by the webhook handler: the same provider
/// event id can be claimed once, and redelivery finds it already processed.
#[tokio::test]
#[ignore] // Requires database
async fn webhook_event_claim_is_exclusive() {
    let pool = test_pool().await;
    let event_id = format!("evt_{}", Uuid::new_v4().simple());
    let now = OffsetDateTime::now_utc();

    let claim = |pool: PgPool, event_id: String| async move {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, 'invoice.payment_succeeded', $2, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            WHERE stripe_webhook_events.processing_result = 'processing'
              AND stripe_webhook_events.processing_started_at < NOW() - INTERVAL '30 minutes'
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(now)
        .fetch_optional(&pool)
        .await
        .unwrap();
        row.is_some()
    };

    let (first, second) = tokio::join!(
        claim(pool.clone(), event_id.clone()),
        claim(pool.clone(), event_id.clone())
    );

    // Exactly one concurrent delivery wins the claim
    assert!(first ^ second, "exactly one claim must succeed");

    // A later redelivery (still within the processing window) is also refused
    assert!(!claim(pool.clone(), event_id.clone()).await);
}
