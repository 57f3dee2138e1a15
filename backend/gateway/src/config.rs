//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::errors::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the crowdfunding REST API (e.g. https://admin.myeasydonate.com/api/v1)
    pub api_base_url: String,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the gateway's own REST API
    pub api_port: u16,
    /// Fixed delay between two status checks, in milliseconds
    pub poll_interval_ms: u64,
    /// Maximum number of status checks before a payment is considered timed out
    pub max_polls: u32,
    /// Timeout applied to every outbound HTTP request
    pub http_timeout_secs: u64,
    /// `payment_method_id` sent with guest donation records
    pub guest_payment_method_id: u32,
    /// Contact email sent with guest donation records
    pub guest_email: String,
    /// Drafts untouched for this long are dropped
    pub draft_idle_secs: u64,
    /// How often idle drafts are swept
    pub draft_sweep_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup; unset keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Config {
            api_base_url: var("API_BASE_URL", "https://crowdfundingapi.wgtesthub.com/api/v1")
                .trim_end_matches('/')
                .to_string(),
            database_url: var("DATABASE_URL", "sqlite:./easydonate.db"),
            api_port: parse(&var("API_PORT", "3002"), "API_PORT")?,
            poll_interval_ms: parse(&var("POLL_INTERVAL_MS", "3000"), "POLL_INTERVAL_MS")?,
            max_polls: parse(&var("MAX_POLLS", "20"), "MAX_POLLS")?,
            http_timeout_secs: parse(&var("HTTP_TIMEOUT_SECS", "30"), "HTTP_TIMEOUT_SECS")?,
            guest_payment_method_id: parse(
                &var("GUEST_PAYMENT_METHOD_ID", "1"),
                "GUEST_PAYMENT_METHOD_ID",
            )?,
            guest_email: var("GUEST_EMAIL", "guest@myeasydonate.com"),
            draft_idle_secs: parse(&var("DRAFT_IDLE_SECS", "1800"), "DRAFT_IDLE_SECS")?,
            draft_sweep_secs: parse(&var("DRAFT_SWEEP_SECS", "60"), "DRAFT_SWEEP_SECS")?,
        };

        if config.max_polls == 0 {
            return Err(GatewayError::Config("MAX_POLLS must be at least 1".to_string()));
        }
        if config.draft_sweep_secs == 0 {
            return Err(GatewayError::Config("DRAFT_SWEEP_SECS must be at least 1".to_string()));
        }

        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn draft_idle(&self) -> Duration {
        Duration::from_secs(self.draft_idle_secs)
    }

    pub fn draft_sweep(&self) -> Duration {
        Duration::from_secs(self.draft_sweep_secs)
    }
}

fn parse<T: FromStr>(raw: &str, key: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| GatewayError::Config(format!("Invalid {key}: {raw:?}")))
}
