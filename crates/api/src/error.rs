//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use partlens_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,

    // Billing errors
    #[error("Insufficient credits")]
    InsufficientCredits { available: i64, required: i64 },
    #[error("Payment system unavailable")]
    PaymentSystemUnavailable,

    // Collaborator errors
    #[error("Analysis service unavailable: {0}")]
    CollaboratorUnavailable(String),
    #[error("Analysis service timed out")]
    CollaboratorTimeout,
    #[error("Analysis service rejected the request: {0}")]
    CollaboratorRejected(String),
    #[error("Analysis service error: {0}")]
    CollaboratorError(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl ApiError {
    /// Whether the caller should resubmit after a collaborator failure.
    /// Transient kinds are retry-worthy; rejections are not.
    pub fn retry_suggested(&self) -> Option<bool> {
        match self {
            ApiError::CollaboratorUnavailable(_)
            | ApiError::CollaboratorTimeout
            | ApiError::CollaboratorError(_) => Some(true),
            ApiError::CollaboratorRejected(_) => Some(false),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let retry_suggested = self.retry_suggested();

        let (status, code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),

            ApiError::InsufficientCredits { .. } => (
                StatusCode::PAYMENT_REQUIRED,
                "INSUFFICIENT_CREDITS",
                self.to_string(),
            ),
            ApiError::PaymentSystemUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "PAYMENT_SYSTEM_UNAVAILABLE",
                self.to_string(),
            ),

            ApiError::CollaboratorUnavailable(msg) => (
                StatusCode::BAD_GATEWAY,
                "ANALYSIS_UNAVAILABLE",
                msg.clone(),
            ),
            ApiError::CollaboratorTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "ANALYSIS_TIMEOUT",
                self.to_string(),
            ),
            ApiError::CollaboratorRejected(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "ANALYSIS_REJECTED",
                msg.clone(),
            ),
            ApiError::CollaboratorError(msg) => {
                (StatusCode::BAD_GATEWAY, "ANALYSIS_ERROR", msg.clone())
            }

            ApiError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "Internal server error".to_string(),
                )
            }
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                self.to_string(),
            ),
        };

        let mut body = json!({
            "error": {
                "code": code,
                "message": message,
            }
        });

        // Insufficient-credit responses carry the counts so the caller can
        // prompt an upgrade
        if let ApiError::InsufficientCredits {
            available,
            required,
        } = &self
        {
            body["error"]["available_credits"] = json!(available);
            body["error"]["required_credits"] = json!(required);
        }

        if let Some(retry) = retry_suggested {
            body["error"]["retry_suggested"] = json!(retry);
        }

        (status, Json(body)).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InsufficientCredits {
                available,
                required,
            } => ApiError::InsufficientCredits {
                available,
                required,
            },
            BillingError::InvalidRequest(msg) | BillingError::InvalidTier(msg) => {
                ApiError::BadRequest(msg)
            }
            BillingError::PaymentSystemUnavailable(_) | BillingError::Config(_) => {
                ApiError::PaymentSystemUnavailable
            }
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::Database(msg) => ApiError::Database(msg),
            other => {
                tracing::error!(error = %other, "Billing error");
                ApiError::Internal
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Database(err.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_suggested_by_kind() {
        assert_eq!(
            ApiError::CollaboratorTimeout.retry_suggested(),
            Some(true)
        );
        assert_eq!(
            ApiError::CollaboratorUnavailable("refused".into()).retry_suggested(),
            Some(true)
        );
        assert_eq!(
            ApiError::CollaboratorError("boom".into()).retry_suggested(),
            Some(true)
        );
        assert_eq!(
            ApiError::CollaboratorRejected("too large".into()).retry_suggested(),
            Some(false)
        );
        assert_eq!(
            ApiError::InsufficientCredits {
                available: 0,
                required: 1
            }
            .retry_suggested(),
            None
        );
    }

    #[test]
    fn test_billing_error_mapping() {
        let err: ApiError = BillingError::InsufficientCredits {
            available: 2,
            required: 5,
        }
        .into();
        assert!(matches!(
            err,
            ApiError::InsufficientCredits {
                available: 2,
                required: 5
            }
        ));

        let err: ApiError = BillingError::PaymentSystemUnavailable("down".into()).into();
        assert!(matches!(err, ApiError::PaymentSystemUnavailable));
    }
}
