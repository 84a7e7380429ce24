//! Gateway configuration loaded from the environment

use crate::protocol::END_SENTINEL;
use crate::retry::RetryPolicy;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// What to do when a connection sends a new request while one is streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusyPolicy {
    /// Cancel the running session and start the new one (newest wins)
    #[default]
    Replace,
    /// Keep the running session and answer the new request with an error frame
    Reject,
}

impl FromStr for BusyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "replace" => Ok(BusyPolicy::Replace),
            "reject" => Ok(BusyPolicy::Reject),
            other => Err(format!("Unknown busy policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    /// JSON-file connection table; `None` keeps the table in memory
    pub connection_table_path: Option<PathBuf>,
    /// Hard ceiling for one streaming session
    pub session_timeout: Duration,
    pub busy_policy: BusyPolicy,
    /// Retries for transient send failures
    pub send_retry: RetryPolicy,
    /// Retries for registering a connection on connect
    pub store_retry: RetryPolicy,
    /// How long a stored row may exist without a live socket
    pub connection_grace: Duration,
    pub sweep_interval: Duration,
    /// Payload of End frames; empty for none
    pub end_sentinel: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            // 6573 is ascii for "AI"
            port: 6573,
            connection_table_path: None,
            // Serverless per-invocation ceiling
            session_timeout: Duration::from_secs(900),
            busy_policy: BusyPolicy::Replace,
            send_retry: RetryPolicy::default(),
            store_retry: RetryPolicy::default(),
            connection_grace: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(15),
            end_sentinel: END_SENTINEL.to_string(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let connection_table_path = std::env::var("CONNECTION_TABLE_PATH")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let busy_policy = match std::env::var("BUSY_POLICY") {
            Ok(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!("{}, falling back to replace", e);
                BusyPolicy::Replace
            }),
            Err(_) => BusyPolicy::Replace,
        };

        let send_retry = RetryPolicy::new(
            env_parse("SEND_RETRY_ATTEMPTS").unwrap_or(defaults.send_retry.attempts),
            env_parse("SEND_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.send_retry.base_delay),
        );

        let store_retry = RetryPolicy::new(
            env_parse("STORE_RETRY_ATTEMPTS").unwrap_or(defaults.store_retry.attempts),
            defaults.store_retry.base_delay,
        );

        let end_sentinel = std::env::var("END_SENTINEL").unwrap_or(defaults.end_sentinel);

        Self {
            port: env_parse("STREAMGATE_PORT").unwrap_or(defaults.port),
            connection_table_path,
            session_timeout: env_parse("SESSION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_timeout),
            busy_policy,
            send_retry,
            store_retry,
            connection_grace: env_parse("CONNECTION_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.connection_grace),
            sweep_interval: env_parse("SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            end_sentinel,
        }
    }
}
