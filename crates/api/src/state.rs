//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use partlens_billing::{BillingService, StripeConfig};

use crate::analysis::{AnalysisClient, AnalysisOrchestrator};
use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    /// Billing service; None when Stripe is not configured
    pub billing: Option<Arc<BillingService>>,
    pub orchestrator: Arc<AnalysisOrchestrator>,
}

impl AppState {
    pub async fn new(pool: PgPool, config: Config) -> Self {
        // Try to initialize billing. Configuration resolves environment-first
        // with the persisted app_config table as fallback.
        let billing = if config.enable_billing {
            match StripeConfig::from_env_or_db(&pool).await {
                Ok(stripe_config) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(BillingService::new(stripe_config, pool.clone())))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        let client = AnalysisClient::new(
            config.analysis_service_url.clone(),
            config.analysis_timeout_secs,
            config.deep_analysis_timeout_secs,
        );
        let orchestrator = Arc::new(AnalysisOrchestrator::new(pool.clone(), client));

        Self {
            pool,
            config,
            billing,
            orchestrator,
        }
    }

    /// Get billing service reference; None when Stripe is not configured
    pub fn billing_service(&self) -> Option<&Arc<BillingService>> {
        self.billing.as_ref()
    }
}
