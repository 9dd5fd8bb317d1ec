//! PartLens Background Worker
//!
//! Handles scheduled jobs:
//! - Retry sweep for failed analysis jobs (every 5 minutes)
//! - Webhook event retention cleanup (daily at 3:00 AM UTC)

mod retry;

use std::sync::Arc;
use std::time::Duration;

use partlens_api::analysis::{AnalysisClient, AnalysisOrchestrator};
use partlens_api::Config;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting PartLens Worker");

    let config = Config::from_env()?;
    let pool = partlens_shared::create_pool(&config.database_url).await?;
    info!("Database pool created");

    let client = AnalysisClient::new(
        config.analysis_service_url.clone(),
        config.analysis_timeout_secs,
        config.deep_analysis_timeout_secs,
    );
    let orchestrator = Arc::new(AnalysisOrchestrator::new(pool.clone(), client));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Retry failed analysis jobs (every 5 minutes)
    let retry_pool = pool.clone();
    let retry_orchestrator = orchestrator.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let pool = retry_pool.clone();
            let orchestrator = retry_orchestrator.clone();
            Box::pin(async move {
                retry::retry_failed_jobs(&pool, &orchestrator).await;
            })
        })?)
        .await?;
    info!("Scheduled: Analysis retry sweep (every 5 minutes)");

    // Job 2: Cleanup old webhook events (daily at 3:00 AM UTC)
    let cleanup_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let pool = cleanup_pool.clone();
            Box::pin(async move {
                info!("Running webhook event cleanup");
                retry::cleanup_old_webhook_events(&pool, 30).await;
            })
        })?)
        .await?;
    info!("Scheduled: Webhook event cleanup (daily at 3:00 AM)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("PartLens Worker started successfully with 2 scheduled jobs");

    // Keep the main task running; the scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
