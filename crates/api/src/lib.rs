// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PartLens API Library
//!
//! This crate contains the API server components for PartLens: the HTTP
//! surface, the analysis job orchestrator, and the external AI service
//! client.

pub mod analysis;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
