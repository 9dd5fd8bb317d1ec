//! Billing routes: balance, transactions, subscription state, checkout, and
//! the Stripe webhook endpoint

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use partlens_billing::{Balance, CheckoutResponse, CreditTransaction, SubscriptionService};
use partlens_shared::{SubscriptionStatus, SubscriptionTier};

use crate::{
    error::{ApiError, ApiResult},
    routes::require_user,
    state::AppState,
};

/// Request to create a subscription checkout session
#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionCheckoutRequest {
    pub plan: String,
    pub trial_days: Option<u32>,
}

/// Request to create a one-off credits checkout session
#[derive(Debug, Deserialize)]
pub struct CreateCreditsCheckoutRequest {
    pub credit_count: i64,
}

/// Paging for the transaction log
#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// Subscription info response
#[derive(Debug, Serialize)]
pub struct SubscriptionInfo {
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub has_access: bool,
    pub analyses_this_period: i64,
}

/// Current credit balance; administrative accounts report the unlimited
/// sentinel, never a number
pub async fn balance(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Balance>> {
    let user_id = require_user(&headers)?;
    let balance = state.orchestrator.ledger().get_balance(user_id).await?;
    Ok(Json(balance))
}

/// Credit transaction log, newest first
pub async fn transactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TransactionsQuery>,
) -> ApiResult<Json<Vec<CreditTransaction>>> {
    let user_id = require_user(&headers)?;
    let txs = state
        .orchestrator
        .ledger()
        .list_transactions(user_id, query.limit, query.offset)
        .await?;
    Ok(Json(txs))
}

/// Subscription status as consumed by external collaborators
pub async fn subscription_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<SubscriptionInfo>> {
    let user_id = require_user(&headers)?;

    let subscriptions = SubscriptionService::new(state.pool.clone());
    let record = subscriptions.get_subscription(user_id).await?;
    let has_access = subscriptions.has_active_access(user_id).await;

    Ok(Json(SubscriptionInfo {
        tier: record.tier,
        status: record.status,
        period_end: record.current_period_end,
        cancel_at_period_end: record.cancel_at_period_end,
        has_access,
        analyses_this_period: record.analyses_this_period,
    }))
}

/// Schedule cancellation at period end
pub async fn cancel_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let user_id = require_user(&headers)?;
    SubscriptionService::new(state.pool.clone())
        .cancel(user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Undo a scheduled cancellation
pub async fn reactivate_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let user_id = require_user(&headers)?;
    SubscriptionService::new(state.pool.clone())
        .reactivate(user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Create a checkout session for a subscription plan
pub async fn create_subscription_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSubscriptionCheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let user_id = require_user(&headers)?;
    let billing = state
        .billing_service()
        .ok_or(ApiError::PaymentSystemUnavailable)?;

    let response = billing
        .checkout
        .create_subscription_checkout(user_id, &req.plan, req.trial_days)
        .await?;

    Ok(Json(response))
}

/// Create a one-off checkout session for purchasing credits
pub async fn create_credits_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateCreditsCheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let user_id = require_user(&headers)?;
    let billing = state
        .billing_service()
        .ok_or(ApiError::PaymentSystemUnavailable)?;

    let response = billing
        .checkout
        .create_credits_checkout(user_id, req.credit_count)
        .await?;

    Ok(Json(response))
}

/// Handle Stripe webhook events.
///
/// The body stays raw for signature verification. Signature failure is the
/// only processing outcome surfaced as an error; the provider's redelivery on
/// non-2xx is the retry mechanism for it. Branch failures after the event is
/// claimed are logged and acknowledged so Stripe does not redeliver state
/// transitions that already committed.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let billing = state
        .billing_service()
        .ok_or(ApiError::ServiceUnavailable)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = ?e, "Stripe webhook signature verification failed");
            ApiError::BadRequest("Invalid webhook signature".to_string())
        })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    if let Err(e) = billing.webhooks.handle_event(event).await {
        // Acknowledge anyway: the failure is recorded on the event row and
        // redelivery would be rejected by the idempotency claim.
        tracing::error!(error = %e, "Webhook processing error");
    }

    Ok(StatusCode::OK)
}
