//! Port Interfaces
//!
//! Contracts between the envelope and the outside world.
//!
//! ## Driven Ports (Outbound)
//!
//! - `CredentialRefresher`: vendor-specific auth flow invoked by the token cache
//! - `Clock`: wall-clock source for token expiry and `Retry-After` dates
//!
//! ## Driver Ports (Inbound)
//!
//! - `RemoteGateway`: capability handed to integration adapters

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

use crate::domain::credential::Credential;
use crate::domain::operation::{RemoteOperationResult, RemoteReply, TransportError};

// =============================================================================
// Errors
// =============================================================================

/// Errors from a credential refresh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// Auth server rejected the request.
    #[error("auth server rejected refresh ({status}): {message}")]
    Rejected {
        /// HTTP status from the auth server.
        status: u16,
        /// Error message from the auth server.
        message: String,
    },

    /// Auth server could not be reached.
    #[error("auth transport error: {0}")]
    Transport(String),

    /// Auth server answered with something that is not a token.
    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    /// The refresher panicked before producing a result.
    #[error("refresher panicked: {0}")]
    Panicked(String),
}

/// Errors from the token cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// The refresh this caller awaited failed.
    #[error("credential refresh failed: {0}")]
    RefreshFailed(#[from] RefreshError),
}

// =============================================================================
// Credential Refresher
// =============================================================================

/// Vendor-specific credential refresh.
///
/// Implementations perform exactly one auth round-trip per call and never
/// retry; retry policy belongs to the envelope.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    /// Obtain a fresh credential.
    async fn refresh(&self) -> Result<Credential, RefreshError>;
}

// =============================================================================
// Clock
// =============================================================================

/// Wall-clock source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// System clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic expiry.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// =============================================================================
// Remote Gateway
// =============================================================================

/// Capability consumed by integration adapters.
///
/// Adapters depend on this trait instead of carrying their own retry and
/// token code.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Run `request_fn` with retry, backoff and token refresh.
    async fn execute<T, F, Fut>(&self, request_fn: F, max_attempts: u32) -> RemoteOperationResult<T>
    where
        T: Send,
        F: FnMut(Credential) -> Fut + Send,
        Fut: Future<Output = Result<RemoteReply<T>, TransportError>> + Send;

    /// Current credential, refreshing if needed.
    async fn get_valid_token(&self) -> Result<Credential, TokenError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let shared = clock.clone();

        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(shared.now(), start + chrono::Duration::seconds(90));

        shared.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn token_error_wraps_refresh_error() {
        let err: TokenError = RefreshError::Transport("dns".to_string()).into();
        assert_eq!(
            err.to_string(),
            "credential refresh failed: auth transport error: dns"
        );
    }
}
