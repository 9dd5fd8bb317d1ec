//! Paid analysis operations: external service client and job orchestration

pub mod client;
pub mod orchestrator;

pub use client::{AnalysisClient, AnalysisError, AnalysisMode, AnalysisOutcome, AnalysisRequest};
pub use orchestrator::{
    map_analysis_error, AnalysisOrchestrator, JobRecord, RetryJob, RetryOutcome, SubmitRequest,
    SubmitResponse, CREDITS_PER_ANALYSIS, MAX_RETRIES,
};
