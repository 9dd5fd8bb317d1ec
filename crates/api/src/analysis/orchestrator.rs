//! Analysis Job Orchestrator
//!
//! Wraps a paid analysis operation with credit reservation, delegates the
//! work to the external AI service, and refunds on failure. State machine per
//! job: pending -> processing -> completed | failed; the retry sweep may move
//! failed back to pending up to MAX_RETRIES.
//!
//! Invariant: a job holds a credit reservation only while pending or
//! processing. Completion consumes the reservation; failure releases it via
//! refund, exactly once, guarded by the conditional update on
//! `credit_reserved`. A caller never observes a failed job whose credit has
//! not already been restored.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use partlens_billing::{CreditLedger, SubscriptionService};
use partlens_shared::{JobId, JobStatus, TransactionReason, UserId};

use crate::analysis::client::{
    AnalysisClient, AnalysisError, AnalysisMode, AnalysisOutcome, AnalysisRequest,
};
use crate::error::{ApiError, ApiResult};

/// Maximum re-attempts the retry sweep will make for a failed job
pub const MAX_RETRIES: i32 = 3;

/// Credits consumed per analysis operation
pub const CREDITS_PER_ANALYSIS: i64 = 1;

/// A persisted analysis job row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: JobStatus,
    pub retry_count: i32,
    pub credit_reserved: bool,
    pub artifact_url: Option<String>,
    pub keywords: Option<String>,
    pub error_message: Option<String>,
    pub confidence: Option<f64>,
    pub processing_ms: Option<i64>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Submission input for one analysis
#[derive(Debug)]
pub struct SubmitRequest {
    pub user_id: UserId,
    pub image: Vec<u8>,
    pub image_filename: String,
    pub keywords: Option<String>,
    /// External storage reference for the input, used by the retry sweep to
    /// re-fetch the artifact
    pub artifact_url: Option<String>,
    pub mode: AnalysisMode,
}

/// Outcome returned to the submitter
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub confidence: Option<f64>,
    pub processing_ms: Option<i64>,
}

/// Orchestrates credit reservation, dispatch, and refund-on-failure
#[derive(Clone)]
pub struct AnalysisOrchestrator {
    pool: PgPool,
    ledger: CreditLedger,
    subscriptions: SubscriptionService,
    client: AnalysisClient,
}

impl AnalysisOrchestrator {
    pub fn new(pool: PgPool, client: AnalysisClient) -> Self {
        let ledger = CreditLedger::new(pool.clone());
        let subscriptions = SubscriptionService::new(pool.clone());
        Self {
            pool,
            ledger,
            subscriptions,
            client,
        }
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    /// Submit a paid analysis. Reserves a credit first (admin-exempt accounts
    /// skip the check entirely), creates the job row, and runs the dispatch
    /// to completion. Failures refund before this returns.
    pub async fn submit(&self, request: SubmitRequest) -> ApiResult<SubmitResponse> {
        let user_id = request.user_id;

        // Step 1: reserve a credit. InsufficientCredits creates no job.
        let receipt = self.ledger.try_debit(user_id, CREDITS_PER_ANALYSIS).await?;

        // Step 2: persist the job with the reservation recorded
        let job_id = JobId::new();
        sqlx::query(
            r#"
            INSERT INTO analysis_jobs (id, user_id, status, retry_count, credit_reserved, artifact_url, keywords)
            VALUES ($1, $2, 'pending', 0, $3, $4, $5)
            "#,
        )
        .bind(job_id.0)
        .bind(user_id.0)
        .bind(!receipt.exempt)
        .bind(&request.artifact_url)
        .bind(&request.keywords)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            job_id = %job_id,
            user_id = %user_id,
            exempt = receipt.exempt,
            mode = ?request.mode,
            "Analysis job created"
        );

        let user_email = self.user_email(user_id).await?;

        // Step 3-5: dispatch and settle
        let dispatch = AnalysisRequest {
            analysis_id: job_id.to_string(),
            user_email,
            image: request.image,
            image_filename: request.image_filename,
            keywords: request.keywords,
            mode: request.mode,
        };

        match self.run_attempt(job_id, user_id, dispatch).await {
            Ok(outcome) => Ok(SubmitResponse {
                job_id,
                status: JobStatus::Completed,
                confidence: Some(outcome.confidence),
                processing_ms: Some(outcome.processing_ms),
            }),
            Err(err) => Err(map_analysis_error(err)),
        }
    }

    /// Run one dispatch attempt for a job whose credit is already reserved
    /// (or whose owner is exempt). Settles the job row and the reservation on
    /// both paths before returning.
    pub async fn run_attempt(
        &self,
        job_id: JobId,
        user_id: UserId,
        request: AnalysisRequest,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        self.mark_processing(job_id).await;

        // Fast-fail health probe before shipping the payload
        let result = match self.client.health_check().await {
            Ok(()) => self.client.analyze(request).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) => {
                self.complete_job(job_id, user_id, &outcome).await;
                Ok(outcome)
            }
            Err(err) => {
                self.fail_job(job_id, user_id, &err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Re-fetch a job's input artifact from external storage
    pub async fn fetch_artifact(&self, artifact_url: &str) -> Result<Vec<u8>, AnalysisError> {
        let response = reqwest::get(artifact_url)
            .await
            .map_err(|e| AnalysisError::Unavailable(format!("Artifact fetch failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AnalysisError::Unavailable(format!(
                "Artifact fetch returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AnalysisError::Unavailable(format!("Artifact read failed: {}", e)))?;

        Ok(bytes.to_vec())
    }

    /// Fetch a job row scoped to its owner
    pub async fn get_job(&self, user_id: UserId, job_id: JobId) -> ApiResult<JobRecord> {
        let job: Option<JobRecord> = sqlx::query_as(
            r#"
            SELECT id, user_id, status, retry_count, credit_reserved, artifact_url,
                   keywords, error_message, confidence, processing_ms, created_at, updated_at
            FROM analysis_jobs
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(job_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        job.ok_or(ApiError::NotFound)
    }

    pub async fn user_email(&self, user_id: UserId) -> ApiResult<String> {
        let row: Option<(String,)> = sqlx::query_as("SELECT email FROM users WHERE id = $1")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(email,)| email).ok_or(ApiError::NotFound)
    }

    async fn mark_processing(&self, job_id: JobId) {
        if let Err(e) = sqlx::query(
            "UPDATE analysis_jobs SET status = 'processing', updated_at = NOW() WHERE id = $1",
        )
        .bind(job_id.0)
        .execute(&self.pool)
        .await
        {
            tracing::error!(job_id = %job_id, error = %e, "Failed to mark job processing");
        }
    }

    /// Completion consumes the reservation: no refund, usage counter bumped.
    async fn complete_job(&self, job_id: JobId, user_id: UserId, outcome: &AnalysisOutcome) {
        if let Err(e) = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'completed', credit_reserved = FALSE,
                confidence = $2, processing_ms = $3, error_message = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id.0)
        .bind(outcome.confidence)
        .bind(outcome.processing_ms)
        .execute(&self.pool)
        .await
        {
            tracing::error!(job_id = %job_id, error = %e, "Failed to mark job completed");
            return;
        }

        if let Err(e) = self.subscriptions.record_analysis_usage(user_id).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to record analysis usage");
        }

        tracing::info!(
            job_id = %job_id,
            user_id = %user_id,
            confidence = outcome.confidence,
            processing_ms = outcome.processing_ms,
            "Analysis job completed"
        );
    }

    /// Failure releases the reservation. The conditional update claims the
    /// refund so a job can never be refunded twice, and the refund completes
    /// before the failure is reported upward.
    async fn fail_job(&self, job_id: JobId, user_id: UserId, error_message: &str) {
        let claimed_refund: Result<Option<(Uuid,)>, sqlx::Error> = sqlx::query_as(
            r#"
            UPDATE analysis_jobs
            SET status = 'failed', credit_reserved = FALSE, error_message = $2, updated_at = NOW()
            WHERE id = $1 AND credit_reserved = TRUE
            RETURNING id
            "#,
        )
        .bind(job_id.0)
        .bind(error_message)
        .fetch_optional(&self.pool)
        .await;

        match claimed_refund {
            Ok(Some(_)) => {
                if let Err(e) = self
                    .ledger
                    .refund(
                        user_id,
                        CREDITS_PER_ANALYSIS,
                        TransactionReason::AnalysisRefund,
                    )
                    .await
                {
                    // Balance drift: the reservation was released but the
                    // refund did not land. Flag for reconciliation.
                    tracing::error!(
                        job_id = %job_id,
                        user_id = %user_id,
                        error = %e,
                        "RECONCILIATION NEEDED: refund failed after reservation release"
                    );
                }
            }
            Ok(None) => {
                // Exempt job, or the reservation was already settled
                if let Err(e) = sqlx::query(
                    r#"
                    UPDATE analysis_jobs
                    SET status = 'failed', error_message = $2, updated_at = NOW()
                    WHERE id = $1 AND status <> 'failed'
                    "#,
                )
                .bind(job_id.0)
                .bind(error_message)
                .execute(&self.pool)
                .await
                {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to mark job failed");
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to settle failed job");
            }
        }

        tracing::warn!(
            job_id = %job_id,
            user_id = %user_id,
            error = %error_message,
            "Analysis job failed, credit refunded"
        );
    }
}

/// A failed job claimed by the retry sweep
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RetryJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub retry_count: i32,
    pub artifact_url: Option<String>,
    pub keywords: Option<String>,
}

/// Result of one retry attempt
#[derive(Debug)]
pub enum RetryOutcome {
    Completed,
    /// Balance was short this time; the job stays failed with its
    /// incremented retry count and is not requeued this sweep
    InsufficientCredits,
    Failed(String),
}

impl AnalysisOrchestrator {
    /// Re-attempt a failed job on behalf of the retry sweep.
    ///
    /// The prior failure refunded the original debit, so a fresh reservation
    /// is required here, mirroring submission. The caller has already
    /// incremented `retry_count` and moved the job back to pending.
    pub async fn retry_job(&self, job: &RetryJob) -> RetryOutcome {
        let job_id = JobId(job.id);
        let user_id = UserId(job.user_id);

        let receipt = match self.ledger.try_debit(user_id, CREDITS_PER_ANALYSIS).await {
            Ok(receipt) => receipt,
            Err(partlens_billing::BillingError::InsufficientCredits { .. }) => {
                self.settle_without_refund(job_id, "Insufficient credits for retry")
                    .await;
                return RetryOutcome::InsufficientCredits;
            }
            Err(e) => {
                self.settle_without_refund(job_id, &e.to_string()).await;
                return RetryOutcome::Failed(e.to_string());
            }
        };

        if !receipt.exempt {
            if let Err(e) = sqlx::query(
                "UPDATE analysis_jobs SET credit_reserved = TRUE, updated_at = NOW() WHERE id = $1",
            )
            .bind(job_id.0)
            .execute(&self.pool)
            .await
            {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record reservation");
            }
        }

        let artifact_url = match &job.artifact_url {
            Some(url) => url.clone(),
            None => {
                let msg = "No artifact reference to retry";
                self.fail_job(job_id, user_id, msg).await;
                return RetryOutcome::Failed(msg.to_string());
            }
        };

        let image = match self.fetch_artifact(&artifact_url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail_job(job_id, user_id, &e.to_string()).await;
                return RetryOutcome::Failed(e.to_string());
            }
        };

        let user_email = match self.user_email(user_id).await {
            Ok(email) => email,
            Err(e) => {
                self.fail_job(job_id, user_id, &e.to_string()).await;
                return RetryOutcome::Failed(e.to_string());
            }
        };

        let image_filename = artifact_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("artifact.jpg")
            .to_string();

        let request = AnalysisRequest {
            analysis_id: job_id.to_string(),
            user_email,
            image,
            image_filename,
            keywords: job.keywords.clone(),
            mode: AnalysisMode::Interactive,
        };

        match self.run_attempt(job_id, user_id, request).await {
            Ok(_) => RetryOutcome::Completed,
            Err(e) => RetryOutcome::Failed(e.to_string()),
        }
    }

    /// Park a job back in failed without touching the ledger (nothing was
    /// debited for this attempt).
    async fn settle_without_refund(&self, job_id: JobId, error_message: &str) {
        if let Err(e) = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'failed', error_message = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id.0)
        .bind(error_message)
        .execute(&self.pool)
        .await
        {
            tracing::error!(job_id = %job_id, error = %e, "Failed to park job as failed");
        }
    }
}

/// Map collaborator failures to the caller-facing taxonomy. The distinction
/// changes only the message and status code, never the refund behavior.
pub fn map_analysis_error(err: AnalysisError) -> ApiError {
    match err {
        AnalysisError::Unavailable(msg) => ApiError::CollaboratorUnavailable(msg),
        AnalysisError::Timeout => ApiError::CollaboratorTimeout,
        AnalysisError::Rejected(msg) => ApiError::CollaboratorRejected(msg),
        AnalysisError::Service(msg) | AnalysisError::InvalidResponse(msg) => {
            ApiError::CollaboratorError(msg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping_preserves_retry_semantics() {
        assert_eq!(
            map_analysis_error(AnalysisError::Timeout).retry_suggested(),
            Some(true)
        );
        assert_eq!(
            map_analysis_error(AnalysisError::Unavailable("dns".into())).retry_suggested(),
            Some(true)
        );
        assert_eq!(
            map_analysis_error(AnalysisError::Rejected("413".into())).retry_suggested(),
            Some(false)
        );
        assert_eq!(
            map_analysis_error(AnalysisError::Service("500".into())).retry_suggested(),
            Some(true)
        );
    }

    #[test]
    fn test_retry_bound_constant() {
        assert_eq!(MAX_RETRIES, 3);
        assert_eq!(CREDITS_PER_ANALYSIS, 1);
    }
}
