//! Subscription State Store
//!
//! Local mirror of the payment provider's subscription object, one row per
//! user. Webhook-driven upserts are last-writer-wins but refuse to move the
//! billing period backwards, which is what protects against out-of-order
//! event application.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use partlens_shared::{SubscriptionStatus, SubscriptionTier, UserId};

use crate::error::BillingResult;

/// The mirrored subscription row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub trial_credits_granted: bool,
    pub analyses_this_period: i64,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Default record for users with no subscription row
    pub fn inactive(user_id: UserId) -> Self {
        Self {
            user_id: user_id.0,
            tier: SubscriptionTier::Free,
            status: SubscriptionStatus::Inactive,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            trial_credits_granted: false,
            analyses_this_period: 0,
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Fields applied by a provider-driven upsert
#[derive(Debug, Clone)]
pub struct SubscriptionSync {
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
}

/// Result of an upsert attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Row written
    Applied,
    /// Event's period end is older than what is stored; nothing written
    Stale,
}

/// Whether an incoming period end must be discarded as out-of-order.
///
/// Equal timestamps are applied: Stripe re-delivers events and sends several
/// distinct events for the same period (status changes within one cycle).
pub fn is_stale_period(
    stored: Option<OffsetDateTime>,
    incoming: OffsetDateTime,
) -> bool {
    matches!(stored, Some(stored) if incoming < stored)
}

/// Service owning the subscription mirror
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch the subscription, defaulting to inactive-free for absent rows
    pub async fn get_subscription(&self, user_id: UserId) -> BillingResult<SubscriptionRecord> {
        let row: Option<SubscriptionRecord> = sqlx::query_as(
            r#"
            SELECT user_id, tier, status, stripe_customer_id, stripe_subscription_id,
                   current_period_start, current_period_end, cancel_at_period_end,
                   trial_credits_granted, analyses_this_period, updated_at
            FROM subscriptions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.unwrap_or_else(|| SubscriptionRecord::inactive(user_id)))
    }

    /// Apply a provider-driven sync, guarding against out-of-order events.
    ///
    /// Advancing the period resets the monthly usage counter. The stale check
    /// and the write happen in one statement so a concurrent newer event
    /// cannot be clobbered between check and write.
    pub async fn upsert_from_provider(
        &self,
        user_id: UserId,
        sync: &SubscriptionSync,
    ) -> BillingResult<UpsertOutcome> {
        let written: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (
                user_id, tier, status, stripe_customer_id, stripe_subscription_id,
                current_period_start, current_period_end, cancel_at_period_end, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                tier = EXCLUDED.tier,
                status = EXCLUDED.status,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                analyses_this_period = CASE
                    WHEN EXCLUDED.current_period_end > COALESCE(subscriptions.current_period_end, EXCLUDED.current_period_end)
                    THEN 0
                    ELSE subscriptions.analyses_this_period
                END,
                updated_at = NOW()
            WHERE subscriptions.current_period_end IS NULL
               OR EXCLUDED.current_period_end >= subscriptions.current_period_end
            RETURNING user_id
            "#,
        )
        .bind(user_id.0)
        .bind(sync.tier)
        .bind(sync.status)
        .bind(&sync.stripe_customer_id)
        .bind(&sync.stripe_subscription_id)
        .bind(sync.current_period_start)
        .bind(sync.current_period_end)
        .bind(sync.cancel_at_period_end)
        .fetch_optional(&self.pool)
        .await?;

        if written.is_none() {
            tracing::info!(
                user_id = %user_id,
                stripe_subscription_id = %sync.stripe_subscription_id,
                incoming_period_end = %sync.current_period_end,
                "Dropped stale subscription event"
            );
            return Ok(UpsertOutcome::Stale);
        }

        tracing::info!(
            user_id = %user_id,
            tier = %sync.tier,
            status = %sync.status,
            period_end = %sync.current_period_end,
            "Subscription synced"
        );

        Ok(UpsertOutcome::Applied)
    }

    /// Schedule cancellation at period end without altering status
    pub async fn cancel(&self, user_id: UserId) -> BillingResult<()> {
        sqlx::query(
            "UPDATE subscriptions SET cancel_at_period_end = TRUE, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Undo a scheduled cancellation
    pub async fn reactivate(&self, user_id: UserId) -> BillingResult<()> {
        sqlx::query(
            "UPDATE subscriptions SET cancel_at_period_end = FALSE, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark the subscription past due (payment failure), leaving period bounds alone
    pub async fn mark_past_due(&self, user_id: UserId) -> BillingResult<()> {
        sqlx::query(
            "UPDATE subscriptions SET status = 'past_due', updated_at = NOW() WHERE user_id = $1",
        )
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Retire the subscription on provider-side deletion; rows are never hard-deleted
    pub async fn mark_cancelled(&self, user_id: UserId) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'cancelled', cancel_at_period_end = TRUE, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Single access gate for every credit-consuming operation.
    ///
    /// Fail-closed: any lookup error reads as no access.
    pub async fn has_active_access(&self, user_id: UserId) -> bool {
        match self.get_subscription(user_id).await {
            Ok(sub) => {
                sub.status.grants_access()
                    && sub
                        .current_period_end
                        .map(|end| end > OffsetDateTime::now_utc())
                        .unwrap_or(false)
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Access check failed, denying");
                false
            }
        }
    }

    /// Claim the one-time trial grant. Returns true only for the first caller.
    pub async fn claim_trial_grant(&self, user_id: UserId) -> BillingResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET trial_credits_granted = TRUE, updated_at = NOW()
            WHERE user_id = $1 AND trial_credits_granted = FALSE
            RETURNING user_id
            "#,
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    /// Increment the monthly usage counter after a completed analysis
    pub async fn record_analysis_usage(&self, user_id: UserId) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET analyses_this_period = analyses_this_period + 1, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resolve the local user for a Stripe customer id
    pub async fn find_user_by_customer(
        &self,
        stripe_customer_id: &str,
    ) -> BillingResult<Option<UserId>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM subscriptions WHERE stripe_customer_id = $1")
                .bind(stripe_customer_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id,)| UserId(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_stale_period_comparison() {
        let now = OffsetDateTime::now_utc();
        let older = now - Duration::days(30);

        // No stored period: nothing to be stale against
        assert!(!is_stale_period(None, now));
        // Incoming older than stored: stale
        assert!(is_stale_period(Some(now), older));
        // Incoming newer than stored: applied
        assert!(!is_stale_period(Some(older), now));
        // Equal timestamps re-apply (idempotent redelivery)
        assert!(!is_stale_period(Some(now), now));
    }

    #[test]
    fn test_inactive_default_denies_access() {
        let record = SubscriptionRecord::inactive(UserId::new());
        assert_eq!(record.status, SubscriptionStatus::Inactive);
        assert_eq!(record.tier, SubscriptionTier::Free);
        assert!(!record.status.grants_access());
        assert!(record.current_period_end.is_none());
    }
}
