//! Stripe Checkout sessions
//!
//! Creates outbound checkout sessions for subscription plans and one-off
//! credit purchases. The correlating `checkout_sessions` row is persisted
//! before the URL is returned to the caller, so the webhook processor can
//! always resolve a completed session even when the webhook beats the HTTP
//! response.

use std::collections::HashMap;

use serde::Serialize;
use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionLineItemsPriceData, CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCheckoutSessionLineItemsPriceDataRecurring,
    CreateCheckoutSessionLineItemsPriceDataRecurringInterval, CreateCheckoutSessionSubscriptionData,
};

use partlens_shared::{SubscriptionTier, UserId};

use crate::client::{resolve_plan, StripeClient, CREDIT_UNIT_PRICE_CENTS};
use crate::error::{BillingError, BillingResult};

/// Upper bound on a single one-off purchase
const MAX_CREDITS_PER_PURCHASE: i64 = 10_000;

/// Checkout session kind persisted for webhook correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutKind {
    Subscription,
    Credits,
}

impl CheckoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Credits => "credits",
        }
    }
}

/// Response for creating a checkout session
#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

impl From<CheckoutSession> for CheckoutResponse {
    fn from(session: CheckoutSession) -> Self {
        Self {
            session_id: session.id.to_string(),
            url: session.url,
        }
    }
}

/// Checkout service for creating Stripe checkout sessions
pub struct CheckoutService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Create a checkout session for a new subscription
    pub async fn create_subscription_checkout(
        &self,
        user_id: UserId,
        plan: &str,
        trial_days: Option<u32>,
    ) -> BillingResult<CheckoutResponse> {
        let tier = resolve_plan(plan);
        if tier == SubscriptionTier::Free {
            return Err(BillingError::InvalidTier(format!(
                "Plan '{}' resolves to the free tier; nothing to check out",
                plan
            )));
        }

        let price_cents = tier.monthly_price_cents();

        let base_url = &self.stripe.config().app_base_url;
        let success_url = format!(
            "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
            base_url
        );
        let cancel_url = format!("{}/billing/cancel", base_url);

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("kind".to_string(), CheckoutKind::Subscription.as_str().to_string());
        metadata.insert("plan".to_string(), plan.to_string());
        metadata.insert("tier".to_string(), tier.to_string());

        let line_items = vec![CreateCheckoutSessionLineItems {
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency: stripe::Currency::USD,
                unit_amount: Some(price_cents),
                recurring: Some(CreateCheckoutSessionLineItemsPriceDataRecurring {
                    interval: CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Month,
                    ..Default::default()
                }),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: format!("PartLens {} Plan", tier),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            quantity: Some(1),
            ..Default::default()
        }];

        // Stamp the subscription itself so later webhook events (renewals,
        // deletions) can resolve the user without the session row.
        let mut subscription_metadata = HashMap::new();
        subscription_metadata.insert("user_id".to_string(), user_id.to_string());
        subscription_metadata.insert("plan".to_string(), plan.to_string());

        let subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            trial_period_days: trial_days,
            metadata: Some(subscription_metadata),
            ..Default::default()
        });

        let params = CreateCheckoutSession {
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(line_items),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata),
            subscription_data,
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), params)
            .await
            .map_err(map_provider_error)?;

        self.persist_session(
            &session.id.to_string(),
            user_id,
            CheckoutKind::Subscription,
            price_cents,
            Some(plan),
            None,
        )
        .await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            plan = %plan,
            tier = %tier,
            trial_days = ?trial_days,
            "Created subscription checkout session"
        );

        Ok(session.into())
    }

    /// Create a one-off checkout session for purchasing credits
    pub async fn create_credits_checkout(
        &self,
        user_id: UserId,
        credit_count: i64,
    ) -> BillingResult<CheckoutResponse> {
        if credit_count <= 0 || credit_count > MAX_CREDITS_PER_PURCHASE {
            return Err(BillingError::InvalidRequest(format!(
                "credit_count must be between 1 and {}, got {}",
                MAX_CREDITS_PER_PURCHASE, credit_count
            )));
        }

        let amount_cents = credit_count * CREDIT_UNIT_PRICE_CENTS;

        let base_url = &self.stripe.config().app_base_url;
        let success_url = format!(
            "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
            base_url
        );
        let cancel_url = format!("{}/billing/cancel", base_url);

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("kind".to_string(), CheckoutKind::Credits.as_str().to_string());
        metadata.insert("credit_count".to_string(), credit_count.to_string());

        let line_items = vec![CreateCheckoutSessionLineItems {
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency: stripe::Currency::USD,
                unit_amount: Some(CREDIT_UNIT_PRICE_CENTS),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: "PartLens analysis credits".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            quantity: Some(credit_count as u64),
            ..Default::default()
        }];

        let params = CreateCheckoutSession {
            mode: Some(CheckoutSessionMode::Payment),
            line_items: Some(line_items),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), params)
            .await
            .map_err(map_provider_error)?;

        self.persist_session(
            &session.id.to_string(),
            user_id,
            CheckoutKind::Credits,
            amount_cents,
            None,
            Some(credit_count),
        )
        .await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            credit_count = credit_count,
            amount_cents = amount_cents,
            "Created credits checkout session"
        );

        Ok(session.into())
    }

    async fn persist_session(
        &self,
        session_id: &str,
        user_id: UserId,
        kind: CheckoutKind,
        amount_cents: i64,
        plan: Option<&str>,
        credit_count: Option<i64>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO checkout_sessions (id, user_id, kind, amount_cents, currency, status, plan, credit_count)
            VALUES ($1, $2, $3, $4, 'usd', 'created', $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(session_id)
        .bind(user_id.0)
        .bind(kind.as_str())
        .bind(amount_cents)
        .bind(plan)
        .bind(credit_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Stripe connectivity failures surface as an operator-facing error, distinct
/// from caller mistakes.
fn map_provider_error(err: stripe::StripeError) -> BillingError {
    match &err {
        stripe::StripeError::ClientError(_) | stripe::StripeError::Timeout => {
            BillingError::PaymentSystemUnavailable(err.to_string())
        }
        _ => BillingError::StripeApi(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_kind_strings() {
        assert_eq!(CheckoutKind::Subscription.as_str(), "subscription");
        assert_eq!(CheckoutKind::Credits.as_str(), "credits");
    }

    #[test]
    fn test_credit_purchase_bounds() {
        assert!(MAX_CREDITS_PER_PURCHASE > 0);
        // Pricing is linear in the credit count
        assert_eq!(5 * CREDIT_UNIT_PRICE_CENTS, 495);
    }
}
