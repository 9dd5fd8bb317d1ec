// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PartLens Billing Module
//!
//! Handles Stripe integration for credits and subscriptions.
//!
//! ## Features
//!
//! - **Credit Ledger**: Atomic balance mutations with an append-only log
//! - **Subscription Mirror**: Local copy of provider subscription state
//! - **Checkout**: Subscription and one-off credit purchase sessions
//! - **Webhooks**: Idempotent, order-guarded Stripe event processing

pub mod checkout;
pub mod client;
pub mod error;
pub mod ledger;
pub mod subscriptions;
pub mod webhooks;

// Checkout
pub use checkout::{CheckoutKind, CheckoutResponse, CheckoutService};

// Client
pub use client::{resolve_plan, StripeClient, StripeConfig, CREDIT_UNIT_PRICE_CENTS};

// Error
pub use error::{BillingError, BillingResult};

// Ledger
pub use ledger::{Balance, CreditLedger, CreditTransaction, DebitReceipt};

// Subscriptions
pub use subscriptions::{
    is_stale_period, SubscriptionRecord, SubscriptionService, SubscriptionSync, UpsertOutcome,
};

// Webhooks
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub checkout: CheckoutService,
    pub ledger: CreditLedger,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_client(stripe, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_client(StripeClient::new(config), pool)
    }

    fn with_client(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            checkout: CheckoutService::new(stripe.clone(), pool.clone()),
            ledger: CreditLedger::new(pool.clone()),
            subscriptions: SubscriptionService::new(pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool),
        }
    }
}
