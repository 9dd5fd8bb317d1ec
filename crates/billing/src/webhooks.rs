//! Stripe webhook handling
//!
//! Consumes asynchronous payment-provider events, verifies authenticity, and
//! performs idempotent state transitions against the subscription store and
//! the credit ledger.
//!
//! Consistency note: a dispatch branch's side effects (subscription upsert
//! plus credit grant) are a best-effort compensating sequence, not a single
//! transaction. If the grant fails after the upsert committed we log and
//! continue; Stripe will not re-deliver a success event for state that
//! already changed, so the two sub-stores converge eventually rather than
//! transactionally.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use std::str::FromStr;
use stripe::{Event, EventObject, EventType, Invoice, Subscription, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use partlens_shared::{SubscriptionStatus, SubscriptionTier, TransactionReason, UserId};

use crate::client::{resolve_plan, StripeClient};
use crate::error::{BillingError, BillingResult};
use crate::ledger::CreditLedger;
use crate::subscriptions::{SubscriptionService, SubscriptionSync, UpsertOutcome};

type HmacSha256 = Hmac<Sha256>;

/// Events stuck in 'processing' longer than this are eligible for re-claim.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    ledger: CreditLedger,
    subscriptions: SubscriptionService,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let ledger = CreditLedger::new(pool.clone());
        let subscriptions = SubscriptionService::new(pool.clone());
        Self {
            stripe,
            pool,
            ledger,
            subscriptions,
        }
    }

    /// Verify and parse a Stripe webhook event
    ///
    /// Uses manual signature verification as a fallback to work around
    /// async-stripe version incompatibility with newer Stripe API versions.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        verify_signature_manually(payload, signature, webhook_secret)?;

        // Signature checked; parse the event body ourselves
        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// Idempotency is atomic: INSERT..ON CONFLICT..RETURNING claims exclusive
    /// processing rights, so two concurrent deliveries of the same event id
    /// cannot both pass an EXISTS-style check. Events stuck in 'processing'
    /// past the timeout can be re-claimed.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type_str = event.type_.to_string();

        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            WHERE stripe_webhook_events.processing_result = 'processing'
              AND stripe_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type_str)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type_str,
                "Duplicate webhook event, skipping"
            );
            return Ok(());
        }

        tracing::info!(
            event_type = %event_type_str,
            event_id = %event_id,
            "Processing Stripe webhook event"
        );

        let result = self.process_event_internal(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to update webhook audit record; event may appear stuck in 'processing'"
            );
        }

        result
    }

    /// Dispatch by event kind. Unknown kinds are acknowledged and ignored so
    /// one unrecognized event type never fails the whole webhook call.
    async fn process_event_internal(&self, event: &Event) -> BillingResult<()> {
        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                self.handle_checkout_completed(event.clone()).await?;
            }
            EventType::InvoicePaymentSucceeded | EventType::InvoicePaid => {
                self.handle_invoice_paid(event.clone()).await?;
            }
            EventType::InvoicePaymentFailed => {
                self.handle_invoice_payment_failed(event.clone()).await?;
            }
            EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_deleted(event.clone()).await?;
            }
            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
            }
        }

        Ok(())
    }

    async fn handle_checkout_completed(&self, event: Event) -> BillingResult<()> {
        let session = match event.data.object {
            EventObject::CheckoutSession(session) => session,
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected CheckoutSession".to_string(),
                ))
            }
        };

        let session_id = session.id.to_string();

        // Prefer the row persisted at session creation; fall back to session
        // metadata for sessions created out-of-band.
        let persisted: Option<(Uuid, String, Option<String>, Option<i64>)> = sqlx::query_as(
            "SELECT user_id, kind, plan, credit_count FROM checkout_sessions WHERE id = $1",
        )
        .bind(&session_id)
        .fetch_optional(&self.pool)
        .await?;

        let metadata = session.metadata.clone().unwrap_or_default();

        let (user_id, kind) = match &persisted {
            Some((user_id, kind, _, _)) => (UserId(*user_id), kind.clone()),
            None => {
                let user_id = metadata
                    .get("user_id")
                    .and_then(|id| Uuid::parse_str(id).ok())
                    .map(UserId)
                    .ok_or_else(|| {
                        BillingError::Internal(format!(
                            "Checkout session {} has no persisted row and no user_id metadata",
                            session_id
                        ))
                    })?;
                let kind = metadata
                    .get("kind")
                    .cloned()
                    .unwrap_or_else(|| "subscription".to_string());
                (user_id, kind)
            }
        };

        match kind.as_str() {
            "credits" => {
                let credit_count = persisted
                    .as_ref()
                    .and_then(|(_, _, _, count)| *count)
                    .or_else(|| metadata.get("credit_count").and_then(|c| c.parse().ok()))
                    .unwrap_or(0);

                if credit_count <= 0 {
                    tracing::error!(
                        session_id = %session_id,
                        user_id = %user_id,
                        "Credits checkout completed with no resolvable credit count"
                    );
                    self.mark_session(&session_id, "failed").await?;
                    return Ok(());
                }

                self.ledger
                    .credit(user_id, credit_count, TransactionReason::Purchase)
                    .await?;
                self.mark_session(&session_id, "completed").await?;

                tracing::info!(
                    user_id = %user_id,
                    session_id = %session_id,
                    credit_count = credit_count,
                    "One-off credit purchase completed"
                );
            }
            _ => {
                self.complete_subscription_checkout(user_id, &session, &metadata)
                    .await?;
                self.mark_session(&session_id, "completed").await?;
            }
        }

        Ok(())
    }

    /// Subscription checkout: sync state from the authoritative provider
    /// object, then grant the activation or one-time trial allotment.
    async fn complete_subscription_checkout(
        &self,
        user_id: UserId,
        session: &stripe::CheckoutSession,
        metadata: &std::collections::HashMap<String, String>,
    ) -> BillingResult<()> {
        let subscription_id = session
            .subscription
            .as_ref()
            .map(|s| s.id().to_string())
            .ok_or_else(|| {
                BillingError::Internal("Subscription checkout has no subscription id".to_string())
            })?;

        // The webhook payload is not trusted for status/period bounds; fetch
        // the subscription object from Stripe instead.
        let subscription = self.retrieve_subscription(&subscription_id).await?;

        let plan = metadata.get("plan").map(String::as_str).unwrap_or("pro");
        let tier = resolve_plan(plan);

        let sync = build_sync(tier, &subscription)?;
        let status = sync.status;
        let outcome = self.subscriptions.upsert_from_provider(user_id, &sync).await?;

        if outcome == UpsertOutcome::Stale {
            return Ok(());
        }

        // Grants after the upsert are best-effort; see module docs.
        match status {
            SubscriptionStatus::Trialing => {
                // Renewal and redelivered events must not re-grant the trial
                // allotment, so the guard flag is claimed first.
                match self.subscriptions.claim_trial_grant(user_id).await {
                    Ok(true) => {
                        if let Err(e) = self
                            .ledger
                            .credit(user_id, tier.trial_credits(), TransactionReason::Trial)
                            .await
                        {
                            tracing::error!(
                                user_id = %user_id,
                                error = %e,
                                "Trial credit grant failed after subscription upsert"
                            );
                        }
                    }
                    Ok(false) => {
                        tracing::info!(
                            user_id = %user_id,
                            "Trial credits already granted for this subscription"
                        );
                    }
                    Err(e) => {
                        tracing::error!(user_id = %user_id, error = %e, "Trial grant claim failed");
                    }
                }
            }
            SubscriptionStatus::Active => {
                if let Err(e) = self
                    .ledger
                    .credit(user_id, tier.monthly_credits(), TransactionReason::Grant)
                    .await
                {
                    tracing::error!(
                        user_id = %user_id,
                        error = %e,
                        "Activation credit grant failed after subscription upsert"
                    );
                }
            }
            _ => {
                tracing::warn!(
                    user_id = %user_id,
                    status = %status,
                    "Checkout completed with non-grantable subscription status"
                );
            }
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            tier = %tier,
            status = %status,
            "Subscription checkout completed"
        );

        Ok(())
    }

    /// Renewal: re-sync period bounds and grant the monthly allotment.
    ///
    /// The grant is skipped for `subscription_create` invoices because the
    /// checkout-completed branch already granted the activation allotment.
    async fn handle_invoice_paid(&self, event: Event) -> BillingResult<()> {
        let invoice = extract_invoice(event)?;

        let subscription_id = match invoice.subscription.as_ref().map(|s| s.id().to_string()) {
            Some(id) => id,
            None => {
                // One-off invoices (credit purchases) are handled via
                // checkout.session.completed, nothing to renew here.
                tracing::debug!(invoice_id = %invoice.id, "Invoice without subscription, ignoring");
                return Ok(());
            }
        };

        let subscription = self.retrieve_subscription(&subscription_id).await?;

        let user_id = self.resolve_user(&subscription, invoice.customer.as_ref()).await?;

        let tier = self.tier_for(user_id, &subscription).await;
        let sync = build_sync(tier, &subscription)?;
        let outcome = self.subscriptions.upsert_from_provider(user_id, &sync).await?;

        if outcome == UpsertOutcome::Stale {
            return Ok(());
        }

        let is_creation_invoice = matches!(
            invoice.billing_reason,
            Some(stripe::InvoiceBillingReason::SubscriptionCreate)
        );

        if is_creation_invoice {
            tracing::debug!(
                user_id = %user_id,
                invoice_id = %invoice.id,
                "Skipping renewal grant for subscription-create invoice"
            );
            return Ok(());
        }

        if let Err(e) = self
            .ledger
            .credit(user_id, tier.monthly_credits(), TransactionReason::Grant)
            .await
        {
            tracing::error!(
                user_id = %user_id,
                error = %e,
                "Renewal credit grant failed after subscription re-sync"
            );
        }

        tracing::info!(
            user_id = %user_id,
            invoice_id = %invoice.id,
            tier = %tier,
            amount = ?invoice.amount_paid,
            "Invoice paid, renewal grant applied"
        );

        Ok(())
    }

    async fn handle_invoice_payment_failed(&self, event: Event) -> BillingResult<()> {
        let invoice = extract_invoice(event)?;

        let customer_id = expandable_customer_id(invoice.customer.as_ref())
            .ok_or_else(|| BillingError::Internal("No customer on invoice".to_string()))?;

        let user_id = self
            .subscriptions
            .find_user_by_customer(&customer_id)
            .await?
            .ok_or(BillingError::CustomerNotFound(customer_id))?;

        self.subscriptions.mark_past_due(user_id).await?;

        tracing::warn!(
            user_id = %user_id,
            invoice_id = %invoice.id,
            amount = ?invoice.amount_due,
            "Invoice payment failed, subscription marked past due"
        );

        Ok(())
    }

    async fn handle_subscription_deleted(&self, event: Event) -> BillingResult<()> {
        let subscription = extract_subscription(event)?;

        let user_id = self.resolve_user(&subscription, None).await?;

        self.subscriptions.mark_cancelled(user_id).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            "Subscription cancelled by provider"
        );

        Ok(())
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<Subscription> {
        let parsed = stripe::SubscriptionId::from_str(subscription_id)
            .map_err(|_| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

        let subscription = Subscription::retrieve(self.stripe.inner(), &parsed, &[]).await?;
        Ok(subscription)
    }

    /// Resolve the local user for a provider subscription, via the stored
    /// customer mapping first, then subscription metadata.
    async fn resolve_user(
        &self,
        subscription: &Subscription,
        invoice_customer: Option<&stripe::Expandable<stripe::Customer>>,
    ) -> BillingResult<UserId> {
        let customer_id = expandable_customer_id(Some(&subscription.customer))
            .or_else(|| expandable_customer_id(invoice_customer));

        if let Some(customer_id) = &customer_id {
            if let Some(user_id) = self.subscriptions.find_user_by_customer(customer_id).await? {
                return Ok(user_id);
            }
        }

        subscription
            .metadata
            .get("user_id")
            .and_then(|id| Uuid::parse_str(id).ok())
            .map(UserId)
            .ok_or_else(|| {
                BillingError::CustomerNotFound(
                    customer_id.unwrap_or_else(|| "unknown".to_string()),
                )
            })
    }

    /// Tier for renewal events: subscription metadata when present, otherwise
    /// whatever the mirror already holds.
    async fn tier_for(&self, user_id: UserId, subscription: &Subscription) -> SubscriptionTier {
        if let Some(plan) = subscription.metadata.get("plan") {
            return resolve_plan(plan);
        }
        match self.subscriptions.get_subscription(user_id).await {
            Ok(record) => record.tier,
            Err(_) => SubscriptionTier::Free,
        }
    }

    async fn mark_session(&self, session_id: &str, status: &str) -> BillingResult<()> {
        // Forward-only transition: a completed/failed session never reverts
        sqlx::query(
            "UPDATE checkout_sessions SET status = $1 WHERE id = $2 AND status = 'created'",
        )
        .bind(status)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Manual Stripe signature check: `t=<ts>,v1=<hex hmac of "<ts>.<payload>">`
/// with a 5-minute timestamp tolerance.
fn verify_signature_manually(
    payload: &str,
    signature: &str,
    webhook_secret: &str,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

    let now = OffsetDateTime::now_utc().unix_timestamp();
    if (now - timestamp).abs() > 300 {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Map a Stripe subscription object into local sync fields
fn build_sync(tier: SubscriptionTier, subscription: &Subscription) -> BillingResult<SubscriptionSync> {
    let period_start = OffsetDateTime::from_unix_timestamp(subscription.current_period_start)
        .map_err(|e| BillingError::Internal(format!("Invalid period start: {}", e)))?;
    let period_end = OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
        .map_err(|e| BillingError::Internal(format!("Invalid period end: {}", e)))?;

    let customer_id = expandable_customer_id(Some(&subscription.customer))
        .ok_or_else(|| BillingError::Internal("Subscription has no customer".to_string()))?;

    Ok(SubscriptionSync {
        tier,
        status: map_status(subscription.status),
        stripe_customer_id: customer_id,
        stripe_subscription_id: subscription.id.to_string(),
        current_period_start: period_start,
        current_period_end: period_end,
        cancel_at_period_end: subscription.cancel_at_period_end,
    })
}

fn map_status(status: stripe::SubscriptionStatus) -> SubscriptionStatus {
    match status {
        stripe::SubscriptionStatus::Trialing => SubscriptionStatus::Trialing,
        stripe::SubscriptionStatus::Active => SubscriptionStatus::Active,
        stripe::SubscriptionStatus::PastDue | stripe::SubscriptionStatus::Unpaid => {
            SubscriptionStatus::PastDue
        }
        stripe::SubscriptionStatus::Canceled => SubscriptionStatus::Cancelled,
        stripe::SubscriptionStatus::Incomplete
        | stripe::SubscriptionStatus::IncompleteExpired
        | stripe::SubscriptionStatus::Paused => SubscriptionStatus::Inactive,
    }
}

fn expandable_customer_id(
    customer: Option<&stripe::Expandable<stripe::Customer>>,
) -> Option<String> {
    match customer {
        Some(stripe::Expandable::Id(id)) => Some(id.to_string()),
        Some(stripe::Expandable::Object(c)) => Some(c.id.to_string()),
        None => None,
    }
}

fn extract_subscription(event: Event) -> BillingResult<Subscription> {
    match event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Subscription".to_string(),
        )),
    }
}

fn extract_invoice(event: Event) -> BillingResult<Invoice> {
    match event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Invoice".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).unwrap();
        mac.update(signed_payload.as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_manual_signature_accepts_valid() {
        let payload = r#"{"id":"evt_1","type":"invoice.payment_succeeded"}"#;
        let secret = "whsec_test_secret";
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign(payload, secret, now);

        assert!(verify_signature_manually(payload, &header, secret).is_ok());
    }

    #[test]
    fn test_manual_signature_rejects_tampered_payload() {
        let secret = "whsec_test_secret";
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign(r#"{"amount":1}"#, secret, now);

        let err = verify_signature_manually(r#"{"amount":1000}"#, &header, secret).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_manual_signature_rejects_old_timestamp() {
        let payload = r#"{"id":"evt_1"}"#;
        let secret = "whsec_test_secret";
        let stale = OffsetDateTime::now_utc().unix_timestamp() - 600;
        let header = sign(payload, secret, stale);

        let err = verify_signature_manually(payload, &header, secret).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_manual_signature_rejects_missing_parts() {
        let payload = r#"{"id":"evt_1"}"#;
        assert!(verify_signature_manually(payload, "v1=abcdef", "whsec_x").is_err());
        assert!(verify_signature_manually(payload, "t=12345", "whsec_x").is_err());
        assert!(verify_signature_manually(payload, "", "whsec_x").is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status(stripe::SubscriptionStatus::Trialing), SubscriptionStatus::Trialing);
        assert_eq!(map_status(stripe::SubscriptionStatus::Active), SubscriptionStatus::Active);
        assert_eq!(map_status(stripe::SubscriptionStatus::PastDue), SubscriptionStatus::PastDue);
        assert_eq!(map_status(stripe::SubscriptionStatus::Unpaid), SubscriptionStatus::PastDue);
        assert_eq!(map_status(stripe::SubscriptionStatus::Canceled), SubscriptionStatus::Cancelled);
        assert_eq!(map_status(stripe::SubscriptionStatus::Incomplete), SubscriptionStatus::Inactive);
    }
}
