#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Custodian Gateway - Resilient Remote Operation Envelope
//!
//! Wraps calls to third-party custodian APIs with bearer-token management,
//! bounded retries and error-class-specific backoff, so integration
//! adapters stop carrying their own copy of that logic.
//!
//! # Layers (inside to outside)
//!
//! - **Domain**: Pure types
//!   - `credential`: bearer token with expiry
//!   - `backoff`: delay per error class, `Retry-After` parsing
//!   - `operation`: replies, failure classes, envelope states
//!
//! - **Application**: Services and ports
//!   - `ports`: `CredentialRefresher`, `Clock`, `RemoteGateway`
//!   - `services`: `TokenCache`, `OperationEnvelope`
//!
//! - **Infrastructure**: Adapters
//!   - `custodian`: reqwest JSON client and OAuth2 client-credentials refresher
//!   - `config`: environment-driven settings
//!   - `metrics`, `telemetry`: Prometheus and OpenTelemetry setup
//!
//! # Flow
//!
//! ```text
//! adapter ──► OperationEnvelope ──► TokenCache ──► CredentialRefresher
//!                  │    ▲
//!                  ▼    │ reply / transport error
//!             request_fn(credential)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Credentials, backoff and outcomes with no I/O.
pub mod domain;

/// Application layer - Token cache, envelope and ports.
pub mod application;

/// Infrastructure layer - HTTP adapters, configuration and observability.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::backoff::{BackoffConfig, BackoffPolicy, ErrorClass, parse_retry_after};
pub use domain::credential::Credential;
pub use domain::operation::{
    AttemptRecord, EnvelopeState, FailureClass, OperationFailure, RemoteOperationResult,
    RemoteReply, TransportError,
};

// Ports
pub use application::ports::{
    Clock, CredentialRefresher, ManualClock, RefreshError, RemoteGateway, SystemClock, TokenError,
};

// Services
pub use application::services::{EnvelopeConfig, OperationEnvelope, TokenCache};

// Infrastructure config
pub use infrastructure::config::{ConfigError, CustodianSettings, EnvelopeSettings, GatewayConfig};

// Custodian adapter
pub use infrastructure::custodian::{ClientCredentialsRefresher, CustodianError, CustodianHttpClient};

// Metrics
pub use infrastructure::metrics::{MetricsError, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{
    TelemetryConfig, TelemetryError, TelemetryGuard, init as init_telemetry,
};
