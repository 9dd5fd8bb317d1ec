//! Health check endpoint

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// Liveness/readiness probe. Reports database connectivity without failing
/// the whole probe on a slow pool.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let db_ok = sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .is_ok();

    Json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "database": db_ok,
        "billing": state.billing.is_some(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
