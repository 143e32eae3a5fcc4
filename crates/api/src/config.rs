//! Environment-driven configuration.

use std::time::Duration;

use tracing::warn;

/// Process configuration, read once at startup. Every knob has a dev
/// default; unset values warn and fall back.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    /// Default replication batch size when the request omits one.
    pub default_batch_size: u32,
    /// Outbox claim lease.
    pub claim_lease: Duration,
    /// Pause between job batches.
    pub job_batch_pause: Duration,
    /// Base URL the generation sources build asset URLs under.
    pub asset_base_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            default_batch_size: 50,
            claim_lease: Duration::from_secs(60),
            job_batch_pause: Duration::from_millis(250),
            asset_base_url: "https://assets.giftwell.dev".to_string(),
        }
    }
}

impl ApiConfig {
    /// Read configuration from `GIFTWELL_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: env_or("GIFTWELL_BIND", defaults.bind_addr),
            default_batch_size: env_parsed("GIFTWELL_BATCH_SIZE", defaults.default_batch_size),
            claim_lease: Duration::from_secs(env_parsed(
                "GIFTWELL_CLAIM_LEASE_SECS",
                defaults.claim_lease.as_secs(),
            )),
            job_batch_pause: Duration::from_millis(env_parsed(
                "GIFTWELL_JOB_PAUSE_MS",
                defaults.job_batch_pause.as_millis() as u64,
            )),
            asset_base_url: env_or("GIFTWELL_ASSET_BASE_URL", defaults.asset_base_url),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, raw, "unparseable value, using default {default}");
            default
        }),
        Err(_) => default,
    }
}
