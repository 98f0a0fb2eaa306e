//! Gateway Configuration Settings
//!
//! Every value is read through a lookup function so the same parsing runs
//! against the process environment in production and a map in tests.
//!
//! Envelope settings are resolved per integration: `<PREFIX>_<SUFFIX>`
//! first, then `ENVELOPE_<SUFFIX>`, then the built-in default. Unparseable
//! values fall back to the default.

use std::time::Duration;

use reqwest::Url;

use crate::application::services::envelope::EnvelopeConfig;
use crate::application::services::token_cache::DEFAULT_SAFETY_MARGIN;
use crate::domain::backoff::BackoffConfig;

/// Prefix shared by all integrations.
const SHARED_PREFIX: &str = "ENVELOPE";

// =============================================================================
// Envelope Settings
// =============================================================================

/// Retry, backoff and token settings for one integration.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeSettings {
    /// Attempts per operation when the caller does not choose.
    pub max_attempts: u32,
    /// Upper bound on attempts for any operation.
    pub attempt_ceiling: u32,
    /// Base delay for server-error backoff.
    pub base_backoff: Duration,
    /// Cap on server-error backoff.
    pub max_backoff: Duration,
    /// How long before expiry a token is treated as stale.
    pub token_safety_margin: Duration,
    /// Delay for a 429 without `Retry-After`.
    pub rate_limit_default: Duration,
    /// Cap on a server-provided `Retry-After`.
    pub max_retry_after: Duration,
    /// Per-attempt timeout (unset = none).
    pub attempt_timeout: Option<Duration>,
    /// Random reduction applied to server-error delays, in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for EnvelopeSettings {
    fn default() -> Self {
        let envelope = EnvelopeConfig::default();
        Self {
            max_attempts: envelope.max_attempts,
            attempt_ceiling: envelope.attempt_ceiling,
            base_backoff: envelope.backoff.base_backoff,
            max_backoff: envelope.backoff.max_backoff,
            token_safety_margin: DEFAULT_SAFETY_MARGIN,
            rate_limit_default: envelope.backoff.rate_limit_default,
            max_retry_after: envelope.backoff.max_retry_after,
            attempt_timeout: envelope.attempt_timeout,
            jitter_factor: envelope.jitter_factor,
        }
    }
}

impl EnvelopeSettings {
    /// Load settings for the integration identified by `prefix`.
    #[must_use]
    pub fn from_env(prefix: &str) -> Self {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// Load settings from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(prefix: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = ScopedLookup { prefix, lookup };
        let defaults = Self::default();

        Self {
            max_attempts: env.parse("MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            attempt_ceiling: env
                .parse("ATTEMPT_CEILING")
                .unwrap_or(defaults.attempt_ceiling),
            base_backoff: env.millis("BASE_BACKOFF_MS").unwrap_or(defaults.base_backoff),
            max_backoff: env.millis("MAX_BACKOFF_MS").unwrap_or(defaults.max_backoff),
            token_safety_margin: env
                .millis("TOKEN_SAFETY_MARGIN_MS")
                .unwrap_or(defaults.token_safety_margin),
            rate_limit_default: env
                .millis("RATE_LIMIT_DEFAULT_MS")
                .unwrap_or(defaults.rate_limit_default),
            max_retry_after: env
                .millis("MAX_RETRY_AFTER_MS")
                .unwrap_or(defaults.max_retry_after),
            attempt_timeout: env
                .millis("ATTEMPT_TIMEOUT_MS")
                .filter(|timeout| !timeout.is_zero())
                .or(defaults.attempt_timeout),
            jitter_factor: env
                .parse::<f64>("JITTER_FACTOR")
                .filter(|factor| factor.is_finite())
                .map_or(defaults.jitter_factor, |factor| factor.clamp(0.0, 1.0)),
        }
    }

    /// Envelope configuration built from these settings.
    #[must_use]
    pub fn envelope_config(&self) -> EnvelopeConfig {
        EnvelopeConfig {
            max_attempts: self.max_attempts,
            attempt_ceiling: self.attempt_ceiling,
            backoff: BackoffConfig {
                base_backoff: self.base_backoff,
                max_backoff: self.max_backoff,
                rate_limit_default: self.rate_limit_default,
                max_retry_after: self.max_retry_after,
            },
            attempt_timeout: self.attempt_timeout,
            jitter_factor: self.jitter_factor,
        }
    }
}

/// Resolves `<prefix>_<suffix>`, then the shared `ENVELOPE_<suffix>`.
struct ScopedLookup<'a, F> {
    prefix: &'a str,
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> ScopedLookup<'_, F> {
    fn raw(&self, suffix: &str) -> Option<String> {
        let scoped = format!("{}_{suffix}", self.prefix);
        (self.lookup)(&scoped).or_else(|| (self.lookup)(&format!("{SHARED_PREFIX}_{suffix}")))
    }

    fn parse<T: std::str::FromStr>(&self, suffix: &str) -> Option<T> {
        self.raw(suffix).and_then(|v| v.trim().parse().ok())
    }

    fn millis(&self, suffix: &str) -> Option<Duration> {
        self.parse::<u64>(suffix).map(Duration::from_millis)
    }
}

// =============================================================================
// Custodian Settings
// =============================================================================

/// Connection settings for an OAuth2-protected custodian API.
#[derive(Clone)]
pub struct CustodianSettings {
    /// Integration name used in logs, metrics and env prefixes.
    pub name: String,
    /// API base URL.
    pub base_url: Url,
    /// OAuth2 token endpoint.
    pub token_url: Url,
    client_id: String,
    client_secret: String,
    /// Optional OAuth2 scope.
    pub scope: Option<String>,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Path requested by the probe binary.
    pub probe_path: String,
}

impl CustodianSettings {
    /// Default integration name.
    pub const DEFAULT_NAME: &'static str = "custodian";
    /// Default HTTP timeout.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    /// Default probe path.
    pub const DEFAULT_PROBE_PATH: &'static str = "/";

    /// Create settings with defaults for the optional values.
    #[must_use]
    pub fn new(base_url: Url, token_url: Url, client_id: String, client_secret: String) -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_string(),
            base_url,
            token_url,
            client_id,
            client_secret,
            scope: None,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
            probe_path: Self::DEFAULT_PROBE_PATH.to_string(),
        }
    }

    /// Load settings from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing, empty or not a
    /// valid URL.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing, empty or not a
    /// valid URL.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_url = parse_url(&lookup, "CUSTODIAN_BASE_URL")?;
        let token_url = parse_url(&lookup, "CUSTODIAN_TOKEN_URL")?;
        let client_id = required(&lookup, "CUSTODIAN_CLIENT_ID")?;
        let client_secret = required(&lookup, "CUSTODIAN_CLIENT_SECRET")?;

        let name = lookup("CUSTODIAN_NAME")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| Self::DEFAULT_NAME.to_string());

        let scope = lookup("CUSTODIAN_SCOPE").filter(|v| !v.trim().is_empty());

        let request_timeout = lookup("CUSTODIAN_REQUEST_TIMEOUT_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map_or(Self::DEFAULT_REQUEST_TIMEOUT, Duration::from_millis);

        let probe_path = lookup("CUSTODIAN_PROBE_PATH")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| Self::DEFAULT_PROBE_PATH.to_string());

        Ok(Self {
            name,
            base_url,
            token_url,
            client_id,
            client_secret,
            scope,
            request_timeout,
            probe_path,
        })
    }

    /// OAuth2 client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// OAuth2 client secret.
    #[must_use]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Environment prefix for this integration's envelope overrides.
    ///
    /// `"acme-custody"` becomes `"ACME_CUSTODY"`.
    #[must_use]
    pub fn env_prefix(&self) -> String {
        self.name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect()
    }
}

impl std::fmt::Debug for CustodianSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustodianSettings")
            .field("name", &self.name)
            .field("base_url", &self.base_url.as_str())
            .field("token_url", &self.token_url.as_str())
            .field("client_id", &"[REDACTED]")
            .field("client_secret", &"[REDACTED]")
            .field("scope", &self.scope)
            .field("request_timeout", &self.request_timeout)
            .field("probe_path", &self.probe_path)
            .finish()
    }
}

// =============================================================================
// Gateway Config
// =============================================================================

/// Complete configuration for one custodian integration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Custodian connection settings.
    pub custodian: CustodianSettings,
    /// Envelope settings resolved for the custodian's prefix.
    pub envelope: EnvelopeSettings,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let custodian = CustodianSettings::from_lookup(&lookup)?;
        let envelope = EnvelopeSettings::from_lookup(&custodian.env_prefix(), &lookup);
        Ok(Self {
            custodian,
            envelope,
        })
    }
}

// =============================================================================
// Errors and Parsing
// =============================================================================

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable is not a valid URL.
    #[error("environment variable {key} is not a valid URL: {message}")]
    InvalidUrl {
        /// Variable name.
        key: String,
        /// Parser message.
        message: String,
    },
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, ConfigError> {
    let value = lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_url(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Url, ConfigError> {
    let raw = required(lookup, key)?;
    Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidUrl {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn custodian_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("CUSTODIAN_BASE_URL", "https://api.custodian.test/v1/"),
            ("CUSTODIAN_TOKEN_URL", "https://auth.custodian.test/oauth/token"),
            ("CUSTODIAN_CLIENT_ID", "client-123"),
            ("CUSTODIAN_CLIENT_SECRET", "hunter2"),
        ]
    }

    #[test]
    fn envelope_defaults() {
        let settings = EnvelopeSettings::from_lookup("ACME", |_| None);
        assert_eq!(settings, EnvelopeSettings::default());
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.attempt_ceiling, 5);
        assert_eq!(settings.base_backoff, Duration::from_millis(1000));
        assert_eq!(settings.max_backoff, Duration::from_millis(30_000));
        assert_eq!(settings.token_safety_margin, Duration::from_millis(300_000));
        assert_eq!(settings.rate_limit_default, Duration::from_secs(60));
        assert_eq!(settings.max_retry_after, Duration::from_secs(120));
        assert!(settings.attempt_timeout.is_none());
        assert!(settings.jitter_factor.abs() < f64::EPSILON);
    }

    #[test]
    fn prefix_overrides_shared_value() {
        let lookup = lookup_from(&[
            ("ACME_MAX_ATTEMPTS", "4"),
            ("ENVELOPE_MAX_ATTEMPTS", "2"),
            ("ENVELOPE_RATE_LIMIT_DEFAULT_MS", "120000"),
        ]);
        let settings = EnvelopeSettings::from_lookup("ACME", lookup);
        assert_eq!(settings.max_attempts, 4);
        assert_eq!(settings.rate_limit_default, Duration::from_secs(120));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let lookup = lookup_from(&[
            ("ACME_MAX_ATTEMPTS", "many"),
            ("ACME_BASE_BACKOFF_MS", "-1"),
            ("ACME_JITTER_FACTOR", "NaN"),
            ("ACME_ATTEMPT_TIMEOUT_MS", "0"),
        ]);
        let settings = EnvelopeSettings::from_lookup("ACME", lookup);
        assert_eq!(settings, EnvelopeSettings::default());
    }

    #[test]
    fn jitter_is_clamped() {
        let settings =
            EnvelopeSettings::from_lookup("ACME", lookup_from(&[("ACME_JITTER_FACTOR", "3.5")]));
        assert!((settings.jitter_factor - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn envelope_config_carries_settings() {
        let lookup = lookup_from(&[
            ("ACME_BASE_BACKOFF_MS", "250"),
            ("ACME_MAX_BACKOFF_MS", "4000"),
            ("ACME_ATTEMPT_TIMEOUT_MS", "1500"),
        ]);
        let config = EnvelopeSettings::from_lookup("ACME", lookup).envelope_config();
        assert_eq!(config.backoff.base_backoff, Duration::from_millis(250));
        assert_eq!(config.backoff.max_backoff, Duration::from_millis(4000));
        assert_eq!(config.attempt_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn custodian_required_values() {
        let err = CustodianSettings::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == "CUSTODIAN_BASE_URL"));

        let mut env = custodian_env();
        env[3] = ("CUSTODIAN_CLIENT_SECRET", "  ");
        let err = CustodianSettings::from_lookup(lookup_from(&env)).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(ref key) if key == "CUSTODIAN_CLIENT_SECRET"));

        let mut env = custodian_env();
        env[0] = ("CUSTODIAN_BASE_URL", "not a url");
        let err = CustodianSettings::from_lookup(lookup_from(&env)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { ref key, .. } if key == "CUSTODIAN_BASE_URL"));
    }

    #[test]
    fn custodian_defaults_and_overrides() {
        let settings = CustodianSettings::from_lookup(lookup_from(&custodian_env())).unwrap();
        assert_eq!(settings.name, "custodian");
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.probe_path, "/");
        assert!(settings.scope.is_none());
        assert_eq!(settings.client_id(), "client-123");

        let mut env = custodian_env();
        env.push(("CUSTODIAN_NAME", "acme-custody"));
        env.push(("CUSTODIAN_SCOPE", "accounts:read"));
        env.push(("CUSTODIAN_REQUEST_TIMEOUT_MS", "5000"));
        let settings = CustodianSettings::from_lookup(lookup_from(&env)).unwrap();
        assert_eq!(settings.env_prefix(), "ACME_CUSTODY");
        assert_eq!(settings.scope.as_deref(), Some("accounts:read"));
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn custodian_debug_redacts_secrets() {
        let settings = CustodianSettings::from_lookup(lookup_from(&custodian_env())).unwrap();
        let debug = format!("{settings:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("client-123"));
    }

    #[test]
    fn gateway_config_uses_custodian_prefix() {
        let mut env = custodian_env();
        env.push(("CUSTODIAN_NAME", "acme"));
        env.push(("ACME_MAX_ATTEMPTS", "5"));
        env.push(("CUSTODIAN_MAX_ATTEMPTS", "2"));
        let config = GatewayConfig::from_lookup(lookup_from(&env)).unwrap();
        assert_eq!(config.envelope.max_attempts, 5);
    }
}
