//! Retry sweep for failed analysis jobs
//!
//! Each sweep claims a bounded batch of retryable jobs (failed, under the
//! retry cap), moves them back to pending with the count incremented, and
//! hands each to the orchestrator for a fresh attempt. The batch bound keeps
//! a backlog from re-submitting as a thundering herd. Jobs that exhaust the
//! cap stay failed permanently; no scheduler action remains for them.

use partlens_api::analysis::{AnalysisOrchestrator, RetryJob, RetryOutcome, MAX_RETRIES};
use sqlx::PgPool;
use tracing::{error, info, warn};

/// Jobs re-attempted per sweep
const SWEEP_BATCH_SIZE: i64 = 5;

/// One sweep: claim retryable jobs and re-attempt them.
pub async fn retry_failed_jobs(pool: &PgPool, orchestrator: &AnalysisOrchestrator) {
    let jobs = match claim_batch(pool).await {
        Ok(jobs) => jobs,
        Err(e) => {
            error!(error = %e, "Failed to claim retryable jobs");
            return;
        }
    };

    if jobs.is_empty() {
        return; // No work to do
    }

    info!(count = jobs.len(), "Retrying failed analysis jobs");

    let mut completed = 0;
    let mut short_of_credits = 0;
    let mut failed_again = 0;

    for job in &jobs {
        match orchestrator.retry_job(job).await {
            RetryOutcome::Completed => {
                completed += 1;
                info!(
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    "Retry succeeded"
                );
            }
            RetryOutcome::InsufficientCredits => {
                short_of_credits += 1;
                warn!(
                    job_id = %job.id,
                    user_id = %job.user_id,
                    "Retry skipped, balance now insufficient"
                );
            }
            RetryOutcome::Failed(err) => {
                failed_again += 1;
                warn!(
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    error = %err,
                    "Retry failed"
                );
            }
        }
    }

    info!(
        attempted = jobs.len(),
        completed = completed,
        short_of_credits = short_of_credits,
        failed_again = failed_again,
        "Retry sweep complete"
    );
}

/// Claim a batch of retryable jobs: increment the retry count and move them
/// back to pending in the same locked transaction, so concurrent sweeps (or
/// a second worker) cannot double-claim.
async fn claim_batch(pool: &PgPool) -> Result<Vec<RetryJob>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let jobs: Vec<RetryJob> = sqlx::query_as(
        r#"
        SELECT id, user_id, retry_count, artifact_url, keywords
        FROM analysis_jobs
        WHERE status = 'failed' AND retry_count < $1
        ORDER BY updated_at ASC
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(MAX_RETRIES)
    .bind(SWEEP_BATCH_SIZE)
    .fetch_all(&mut *tx)
    .await?;

    let mut claimed = Vec::with_capacity(jobs.len());
    for mut job in jobs {
        sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET retry_count = retry_count + 1, status = 'pending', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .execute(&mut *tx)
        .await?;
        job.retry_count += 1;
        claimed.push(job);
    }

    tx.commit().await?;
    Ok(claimed)
}

/// Delete processed webhook-event rows past the retention window.
pub async fn cleanup_old_webhook_events(pool: &PgPool, retention_days: i32) {
    let result = sqlx::query(
        r#"
        DELETE FROM stripe_webhook_events
        WHERE created_at < NOW() - ($1 || ' days')::INTERVAL
          AND processing_result IN ('success', 'error')
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await;

    match result {
        Ok(rows) => {
            if rows.rows_affected() > 0 {
                info!(
                    deleted = rows.rows_affected(),
                    retention_days = retention_days,
                    "Cleaned up old webhook events"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to clean up old webhook events");
        }
    }
}
