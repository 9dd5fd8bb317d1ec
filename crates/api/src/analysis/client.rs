//! HTTP client for the external AI analysis service
//!
//! The service is consumed through a narrow contract: a lightweight health
//! probe, then a multipart dispatch carrying the image bytes. Any non-2xx,
//! connection error, or timeout is a collaborator failure; the caller decides
//! what that means for credits.

use std::time::Duration;

use reqwest::multipart;
use serde_json::Value;

/// Timeout for the pre-dispatch health probe
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Error type for analysis service calls
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// Connection refused, DNS failure, service down
    #[error("Analysis service unreachable: {0}")]
    Unavailable(String),

    /// The request exceeded its configured deadline
    #[error("Analysis request timed out")]
    Timeout,

    /// 4xx from the service: bad input, file too large, unauthorized
    #[error("Analysis request rejected: {0}")]
    Rejected(String),

    /// 5xx from the service
    #[error("Analysis service error: {0}")]
    Service(String),

    /// 2xx but a body we cannot use
    #[error("Invalid analysis response: {0}")]
    InvalidResponse(String),
}

impl AnalysisError {
    /// Transient failures are worth a retry; rejections are permanent
    pub fn is_transient(&self) -> bool {
        !matches!(self, AnalysisError::Rejected(_))
    }
}

/// Analysis depth, which determines the request deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMode {
    Interactive,
    Deep,
}

/// A dispatch request for one analysis job
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub analysis_id: String,
    pub user_email: String,
    pub image: Vec<u8>,
    pub image_filename: String,
    pub keywords: Option<String>,
    pub mode: AnalysisMode,
}

/// Normalized result of a successful analysis
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Collaborator-reported processing time in milliseconds
    pub processing_ms: i64,
    /// Raw result payload for downstream consumers
    pub raw: Value,
}

/// Client for the external analysis service
#[derive(Clone)]
pub struct AnalysisClient {
    http: reqwest::Client,
    base_url: String,
    interactive_timeout: Duration,
    deep_timeout: Duration,
}

impl AnalysisClient {
    pub fn new(base_url: String, interactive_timeout_secs: u64, deep_timeout_secs: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            interactive_timeout: Duration::from_secs(interactive_timeout_secs),
            deep_timeout: Duration::from_secs(deep_timeout_secs),
        }
    }

    fn timeout_for(&self, mode: AnalysisMode) -> Duration {
        match mode {
            AnalysisMode::Interactive => self.interactive_timeout,
            AnalysisMode::Deep => self.deep_timeout,
        }
    }

    /// Fast-fail probe run before the full dispatch. Absence or failure of
    /// the health endpoint short-circuits straight to the failure path.
    pub async fn health_check(&self) -> Result<(), AnalysisError> {
        let url = format!("{}/health", self.base_url);

        let response = self
            .http
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalysisError::Timeout
                } else {
                    AnalysisError::Unavailable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(AnalysisError::Unavailable(format!(
                "Health probe returned {}",
                response.status()
            )));
        }

        Ok(())
    }

    /// Dispatch an analysis request and normalize the response.
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisOutcome, AnalysisError> {
        let url = format!("{}/analyze", self.base_url);
        let timeout = self.timeout_for(request.mode);

        let image_part = multipart::Part::bytes(request.image)
            .file_name(request.image_filename)
            .mime_str("application/octet-stream")
            .map_err(|e| AnalysisError::InvalidResponse(e.to_string()))?;

        let mut form = multipart::Form::new()
            .part("image", image_part)
            .text("user_email", request.user_email)
            .text("analysis_id", request.analysis_id.clone());

        if let Some(keywords) = request.keywords {
            form = form.text("keywords", keywords);
        }

        let response = self
            .http
            .post(&url)
            .multipart(form)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalysisError::Timeout
                } else if e.is_connect() {
                    AnalysisError::Unavailable(e.to_string())
                } else {
                    AnalysisError::Service(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Rejected(format!("{}: {}", status, body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Service(format!("{}: {}", status, body)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AnalysisError::InvalidResponse(e.to_string()))?;

        parse_outcome(body)
    }
}

/// Extract confidence and processing time from either response shape: a flat
/// result object or a `predictions` array.
fn parse_outcome(body: Value) -> Result<AnalysisOutcome, AnalysisError> {
    let result = if let Some(predictions) = body.get("predictions").and_then(Value::as_array) {
        predictions
            .first()
            .cloned()
            .ok_or_else(|| AnalysisError::InvalidResponse("Empty predictions array".to_string()))?
    } else {
        body.clone()
    };

    let confidence = result
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| AnalysisError::InvalidResponse("Missing confidence".to_string()))?;

    let processing_ms = extract_processing_ms(&body).or_else(|| extract_processing_ms(&result));

    Ok(AnalysisOutcome {
        confidence: normalize_confidence(confidence),
        processing_ms: processing_ms.unwrap_or(0),
        raw: body,
    })
}

/// Both [0, 1] and [0, 100] confidence scales are observed in the wild;
/// normalize to [0, 1].
fn normalize_confidence(value: f64) -> f64 {
    let scaled = if value > 1.0 { value / 100.0 } else { value };
    scaled.clamp(0.0, 1.0)
}

fn extract_processing_ms(value: &Value) -> Option<i64> {
    if let Some(ms) = value.get("processing_ms").and_then(Value::as_i64) {
        return Some(ms);
    }
    // Some deployments report seconds as a float
    value
        .get("processing_time")
        .and_then(Value::as_f64)
        .map(|secs| (secs * 1000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_confidence_both_scales() {
        assert!((normalize_confidence(0.87) - 0.87).abs() < f64::EPSILON);
        assert!((normalize_confidence(87.0) - 0.87).abs() < 1e-9);
        assert_eq!(normalize_confidence(0.0), 0.0);
        assert_eq!(normalize_confidence(100.0), 1.0);
        // Out-of-range values clamp rather than propagate
        assert_eq!(normalize_confidence(250.0), 1.0);
        assert_eq!(normalize_confidence(-0.5), 0.0);
    }

    #[test]
    fn test_parse_flat_response() {
        let outcome = parse_outcome(json!({
            "part": "drain pump",
            "confidence": 0.92,
            "processing_ms": 1450
        }))
        .unwrap();
        assert!((outcome.confidence - 0.92).abs() < 1e-9);
        assert_eq!(outcome.processing_ms, 1450);
    }

    #[test]
    fn test_parse_predictions_response() {
        let outcome = parse_outcome(json!({
            "predictions": [
                {"label": "heating element", "confidence": 88.5},
                {"label": "thermostat", "confidence": 11.5}
            ],
            "processing_time": 2.3
        }))
        .unwrap();
        assert!((outcome.confidence - 0.885).abs() < 1e-9);
        assert_eq!(outcome.processing_ms, 2300);
    }

    #[test]
    fn test_parse_rejects_missing_confidence() {
        assert!(parse_outcome(json!({"part": "unknown"})).is_err());
        assert!(parse_outcome(json!({"predictions": []})).is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(AnalysisError::Timeout.is_transient());
        assert!(AnalysisError::Unavailable("refused".into()).is_transient());
        assert!(AnalysisError::Service("500".into()).is_transient());
        assert!(!AnalysisError::Rejected("413 too large".into()).is_transient());
    }
}
