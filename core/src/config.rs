//! Client configuration.
//!
//! # Design
//! Plain serde structs with defaults on every field, so a partial JSON
//! document (or `Default::default()`) yields a working configuration. All
//! durations are whole seconds, matching what the server speaks in
//! (`maxlag`, `Retry-After`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay used when a `Retry-After` header is present but not an integer.
pub const FALLBACK_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Where the delay between busy retries comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Sleep for the server's `Retry-After` value.
    #[default]
    RetryAfter,
    /// Ignore the header value and sleep `initial * 2^(attempt - 1)`.
    Exponential { initial_secs: u64 },
}

/// Replication-lag negotiation settings.
///
/// While `on` is set, every request carries `maxlag=<threshold_secs>` and a
/// response with both `X-Database-Lag` and `Retry-After` is retried up to
/// `retries` total attempts. No honored delay exceeds `max_delay_secs`,
/// whatever the server asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxlagConfig {
    pub on: bool,
    pub threshold_secs: u64,
    pub retries: u32,
    pub max_delay_secs: u64,
    pub backoff: Backoff,
}

impl Default for MaxlagConfig {
    fn default() -> Self {
        Self {
            on: false,
            threshold_secs: 5,
            retries: 3,
            max_delay_secs: 30,
            backoff: Backoff::RetryAfter,
        }
    }
}

impl MaxlagConfig {
    /// Delay before the next attempt, after `attempt` attempts were answered
    /// busy. `retry_after` is the raw header value.
    pub fn delay(&self, attempt: u32, retry_after: &str) -> Duration {
        let requested = match self.backoff {
            Backoff::RetryAfter => retry_after
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .unwrap_or(FALLBACK_RETRY_DELAY),
            Backoff::Exponential { initial_secs } => {
                let exponent = attempt.saturating_sub(1).min(32);
                Duration::from_secs(initial_secs.saturating_mul(1u64 << exponent))
            }
        };
        requested.min(Duration::from_secs(self.max_delay_secs))
    }
}

/// Everything a `Client` needs besides its base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub user_agent: String,
    /// Per-request transport timeout.
    pub timeout_secs: u64,
    /// Bound on the total time one `call` may spend, retries included.
    pub call_deadline_secs: Option<u64>,
    pub maxlag: MaxlagConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("mwclient/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 30,
            call_deadline_secs: None,
            maxlag: MaxlagConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn call_deadline(&self) -> Option<Duration> {
        self.call_deadline_secs.map(Duration::from_secs)
    }
}
