//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,

    // External AI analysis service
    pub analysis_service_url: String,
    /// Timeout for interactive analysis requests, seconds
    pub analysis_timeout_secs: u64,
    /// Timeout for deep/batch analysis requests, seconds
    pub deep_analysis_timeout_secs: u64,

    // Feature flags
    pub enable_billing: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),

            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,

            analysis_service_url: env::var("ANALYSIS_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:9000".to_string()),
            analysis_timeout_secs: env_u64("ANALYSIS_TIMEOUT_SECS", 120),
            deep_analysis_timeout_secs: env_u64("DEEP_ANALYSIS_TIMEOUT_SECS", 300),

            enable_billing: env::var("ENABLE_BILLING")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(true),
        })
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_u64_default() {
        assert_eq!(env_u64("PARTLENS_TEST_UNSET_VAR", 120), 120);
    }
}
