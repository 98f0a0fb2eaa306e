//! Bearer Credential
//!
//! A token issued by a custodian's auth endpoint. Only the token cache
//! creates or replaces credentials; everything else receives clones.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Default token type when the auth server omits one.
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Bearer credential with an absolute expiry.
///
/// The `Debug` implementation redacts the token value for safe logging.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token_value: String,
    expires_at: DateTime<Utc>,
    token_type: String,
}

impl Credential {
    /// Create a new credential.
    #[must_use]
    pub fn new(
        token_value: impl Into<String>,
        expires_at: DateTime<Utc>,
        token_type: impl Into<String>,
    ) -> Self {
        Self {
            token_value: token_value.into(),
            expires_at,
            token_type: token_type.into(),
        }
    }

    /// Create a `Bearer` credential.
    #[must_use]
    pub fn bearer(token_value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self::new(token_value, expires_at, DEFAULT_TOKEN_TYPE)
    }

    /// Get the raw token value.
    #[must_use]
    pub fn token_value(&self) -> &str {
        &self.token_value
    }

    /// Get the expiry timestamp.
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Get the token type (e.g. `Bearer`).
    #[must_use]
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Value for the `Authorization` header.
    #[must_use]
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.token_value)
    }

    /// Whether the credential is still usable at `now`.
    ///
    /// Stale from `expires_at - safety_margin` onwards.
    #[must_use]
    pub fn is_fresh_at(&self, now: DateTime<Utc>, safety_margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(safety_margin).unwrap_or(chrono::Duration::MAX);
        match self.expires_at.checked_sub_signed(margin) {
            Some(refresh_at) => now < refresh_at,
            None => false,
        }
    }

    /// Time remaining until expiry at `now` (zero once expired).
    #[must_use]
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token_value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .finish()
    }
}
