//! Backoff Policy
//!
//! Computes how long the envelope waits before the next attempt.
//!
//! | Error class | Delay |
//! |-------------|-------|
//! | Rate limited (429) | `Retry-After` if present (capped), else a fixed default |
//! | Server error (5xx, timeout) | `base * 2^(attempt-1)`, capped at `max_backoff` |
//! | Auth expired (401) | zero, retry right after the token refresh |
//!
//! `compute_delay` is a pure function of its inputs. Jitter, when enabled,
//! is applied by the envelope on top of the computed delay.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retryable error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// HTTP 429 Too Many Requests.
    RateLimited {
        /// Server-provided delay from the `Retry-After` header.
        retry_after: Option<Duration>,
    },
    /// HTTP 5xx, network timeout or connection failure.
    ServerError,
    /// HTTP 401, the bearer token was rejected.
    AuthExpired,
}

impl ErrorClass {
    /// Metric/log label for this class.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError => "server_error",
            Self::AuthExpired => "auth_expired",
        }
    }
}

/// Backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Base delay for server errors (default: 1s).
    pub base_backoff: Duration,
    /// Cap for server-error delays (default: 30s).
    pub max_backoff: Duration,
    /// Delay for a 429 without `Retry-After` (default: 60s).
    pub rate_limit_default: Duration,
    /// Cap applied to a server-provided `Retry-After` (default: 120s).
    pub max_retry_after: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
            rate_limit_default: Duration::from_secs(60),
            max_retry_after: Duration::from_secs(120),
        }
    }
}

/// Backoff policy.
#[derive(Debug, Clone, Default)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    /// Create a policy from configuration.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay before the attempt following `attempt` failed with `class`.
    ///
    /// `attempt` is 1-based; 0 is treated as 1.
    #[must_use]
    pub fn compute_delay(&self, attempt: u32, class: ErrorClass) -> Duration {
        match class {
            ErrorClass::RateLimited { retry_after } => retry_after.map_or(
                self.config.rate_limit_default,
                |server| server.min(self.config.max_retry_after),
            ),
            ErrorClass::ServerError => self.exponential(attempt),
            ErrorClass::AuthExpired => Duration::ZERO,
        }
    }

    fn exponential(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let base_ms = u64::try_from(self.config.base_backoff.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.config.max_backoff.as_millis()).unwrap_or(u64::MAX);

        let factor = 2u64.checked_pow(exponent).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(factor).min(max_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Parse a `Retry-After` header value.
///
/// Supports delay-seconds (`"120"`) and HTTP-date
/// (`"Wed, 21 Oct 2015 07:28:00 GMT"`). Dates in the past yield zero.
#[must_use]
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
