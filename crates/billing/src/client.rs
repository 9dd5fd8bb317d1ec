//! Stripe client configuration and the static plan catalog

use sqlx::PgPool;
use stripe::Client;

use partlens_shared::SubscriptionTier;

use crate::error::{BillingError, BillingResult};

/// Price of a single purchased credit in cents
pub const CREDIT_UNIT_PRICE_CENTS: i64 = 99;

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Base URL for success/cancel redirects
    pub app_base_url: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }

    /// Create config from environment variables, falling back to the
    /// persisted `app_config` table for values the environment omits.
    pub async fn from_env_or_db(pool: &PgPool) -> BillingResult<Self> {
        let secret_key = match std::env::var("STRIPE_SECRET_KEY") {
            Ok(v) => v,
            Err(_) => fetch_config_value(pool, "stripe_secret_key")
                .await?
                .ok_or_else(|| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
        };
        let webhook_secret = match std::env::var("STRIPE_WEBHOOK_SECRET") {
            Ok(v) => v,
            Err(_) => fetch_config_value(pool, "stripe_webhook_secret")
                .await?
                .ok_or_else(|| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
        };
        let app_base_url = match std::env::var("APP_BASE_URL") {
            Ok(v) => v,
            Err(_) => fetch_config_value(pool, "app_base_url")
                .await?
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
        };

        Ok(Self {
            secret_key,
            webhook_secret,
            app_base_url,
        })
    }
}

async fn fetch_config_value(pool: &PgPool, key: &str) -> BillingResult<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM app_config WHERE key = $1")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v))
}

/// Resolve a user-supplied plan name to a tier.
///
/// Exact match on the canonical tier names first, then substring keyword
/// fallback for the display names marketing ships ("Professional / Business"),
/// then the documented default of Pro.
pub fn resolve_plan(plan: &str) -> SubscriptionTier {
    let normalized = plan.trim().to_lowercase();

    match normalized.as_str() {
        "free" => return SubscriptionTier::Free,
        "pro" => return SubscriptionTier::Pro,
        "enterprise" => return SubscriptionTier::Enterprise,
        _ => {}
    }

    if normalized.contains("enterprise") || normalized.contains("team") {
        SubscriptionTier::Enterprise
    } else if normalized.contains("pro") || normalized.contains("business") {
        SubscriptionTier::Pro
    } else if normalized.contains("free") || normalized.contains("trial") {
        SubscriptionTier::Free
    } else {
        // Documented default: unrecognized paid-plan names bill as Pro
        SubscriptionTier::Pro
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_plan_exact() {
        assert_eq!(resolve_plan("free"), SubscriptionTier::Free);
        assert_eq!(resolve_plan("pro"), SubscriptionTier::Pro);
        assert_eq!(resolve_plan("Enterprise"), SubscriptionTier::Enterprise);
    }

    #[test]
    fn test_resolve_plan_keyword_fallback() {
        assert_eq!(resolve_plan("Professional / Business"), SubscriptionTier::Pro);
        assert_eq!(resolve_plan("Business Monthly"), SubscriptionTier::Pro);
        assert_eq!(resolve_plan("Enterprise Annual"), SubscriptionTier::Enterprise);
        assert_eq!(resolve_plan("Team Plan"), SubscriptionTier::Enterprise);
        assert_eq!(resolve_plan("Free Trial"), SubscriptionTier::Free);
    }

    #[test]
    fn test_resolve_plan_default() {
        assert_eq!(resolve_plan("Legacy Gold"), SubscriptionTier::Pro);
        assert_eq!(resolve_plan(""), SubscriptionTier::Pro);
    }
}
