//! API routes

pub mod analysis;
pub mod billing;
pub mod health;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderMap,
    routing::{get, post},
    Router,
};
use uuid::Uuid;

use partlens_shared::UserId;

use crate::{error::ApiError, state::AppState};

/// Maximum accepted upload size (image artifacts)
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Resolve the caller identity injected by the upstream auth gateway.
/// Authentication itself is out of scope here; absent or malformed identity
/// is treated as a bad request.
pub fn require_user(headers: &HeaderMap) -> Result<UserId, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .map(UserId)
        .ok_or_else(|| ApiError::BadRequest("Missing or invalid x-user-id header".to_string()))
}

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new().route("/health", get(health::health));

    // Stripe webhook (public, uses signature verification)
    let webhook_routes = Router::new().route("/webhooks/stripe", post(billing::webhook));

    let api_routes = Router::new()
        .route("/analysis", post(analysis::submit))
        .route("/analysis/:job_id", get(analysis::get_job))
        .route("/billing/balance", get(billing::balance))
        .route("/billing/transactions", get(billing::transactions))
        .route("/billing/subscription", get(billing::subscription_status))
        .route(
            "/billing/subscription/cancel",
            post(billing::cancel_subscription),
        )
        .route(
            "/billing/subscription/reactivate",
            post(billing::reactivate_subscription),
        )
        .route(
            "/billing/checkout/subscription",
            post(billing::create_subscription_checkout),
        )
        .route(
            "/billing/checkout/credits",
            post(billing::create_credits_checkout),
        );

    Router::new()
        .merge(health_routes)
        .nest("/api", api_routes.merge(webhook_routes))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}
