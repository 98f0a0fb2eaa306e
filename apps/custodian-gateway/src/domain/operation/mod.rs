//! Remote Operation Outcomes
//!
//! What a request function hands back to the envelope, how the envelope
//! classifies it, and what the caller finally receives.
//!
//! # State Machine
//!
//! ```text
//! AwaitToken ──► InFlight ──► Success
//!     │             │
//!     │             ├──► Backoff ──► AwaitToken
//!     │             │       │
//!     ▼             ▼       ▼
//!   Failed ◄────────┴───────┘
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::backoff::ErrorClass;

// =============================================================================
// Replies
// =============================================================================

/// Reply from a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteReply<T> {
    /// 2xx with a decoded payload.
    Success(T),
    /// Non-2xx status.
    Failure {
        /// HTTP status code.
        status: u16,
        /// Parsed `Retry-After` header, if any.
        retry_after: Option<Duration>,
        /// Response body or error message from the server.
        detail: String,
    },
}

impl<T> RemoteReply<T> {
    /// Failure reply without `Retry-After`.
    #[must_use]
    pub fn status(status: u16, detail: impl Into<String>) -> Self {
        Self::Failure {
            status,
            retry_after: None,
            detail: detail.into(),
        }
    }
}

/// Failure that produced no HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The call exceeded its timeout.
    #[error("request timed out")]
    Timeout,
    /// Connection could not be established or was reset.
    #[error("connection error: {0}")]
    Connect(String),
    /// A 2xx body could not be decoded.
    #[error("response decode error: {0}")]
    Decode(String),
}

// =============================================================================
// Classification
// =============================================================================

/// What the envelope does with an attempt's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 2xx.
    Success,
    /// Retry if attempts remain, else fail with the mapped class.
    Retry(ErrorClass),
    /// Fail now.
    Terminal(FailureClass),
}

impl Disposition {
    /// Verdict for a reply that carried no payload: the class to retry
    /// with, or the terminal class. A success status without a payload is a
    /// client error.
    ///
    /// # Errors
    ///
    /// Returns the terminal `FailureClass` when the reply must not be retried.
    pub const fn for_failed_reply(self) -> Result<ErrorClass, FailureClass> {
        match self {
            Self::Retry(class) => Ok(class),
            Self::Terminal(class) => Err(class),
            Self::Success => Err(FailureClass::ClientError),
        }
    }
}

/// Classify an HTTP status code.
#[must_use]
pub const fn classify_status(status: u16, retry_after: Option<Duration>) -> Disposition {
    match status {
        200..=299 => Disposition::Success,
        401 => Disposition::Retry(ErrorClass::AuthExpired),
        429 => Disposition::Retry(ErrorClass::RateLimited { retry_after }),
        500..=599 => Disposition::Retry(ErrorClass::ServerError),
        _ => Disposition::Terminal(FailureClass::ClientError),
    }
}

/// Classify a transport failure.
#[must_use]
pub const fn classify_transport(error: &TransportError) -> Disposition {
    match error {
        TransportError::Timeout | TransportError::Connect(_) => {
            Disposition::Retry(ErrorClass::ServerError)
        }
        TransportError::Decode(_) => Disposition::Terminal(FailureClass::ClientError),
    }
}

// =============================================================================
// Failures
// =============================================================================

/// Terminal failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Token refresh failed, or 401 persisted through every attempt.
    AuthFailure,
    /// 429 persisted through every attempt.
    RateLimitExceeded,
    /// 5xx/timeout persisted through every attempt.
    ServerError,
    /// Non-retryable client error (4xx other than 401/429).
    ClientError,
    /// The caller abandoned the operation.
    Cancelled,
}

impl FailureClass {
    /// Class reported when retries of `class` are exhausted.
    #[must_use]
    pub const fn exhausted(class: ErrorClass) -> Self {
        match class {
            ErrorClass::RateLimited { .. } => Self::RateLimitExceeded,
            ErrorClass::ServerError => Self::ServerError,
            ErrorClass::AuthExpired => Self::AuthFailure,
        }
    }

    /// Metric/log label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AuthFailure => "auth_failure",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class} after {attempts} attempt(s): {detail}")]
pub struct OperationFailure {
    /// Failure class.
    pub class: FailureClass,
    /// Last underlying error detail.
    pub detail: String,
    /// Attempts issued before failing.
    pub attempts: u32,
    /// Last HTTP status observed, if any.
    pub last_status: Option<u16>,
}

impl OperationFailure {
    /// Create a failure.
    #[must_use]
    pub fn new(class: FailureClass, detail: impl Into<String>, attempts: u32) -> Self {
        Self {
            class,
            detail: detail.into(),
            attempts,
            last_status: None,
        }
    }

    /// Attach the last HTTP status.
    #[must_use]
    pub const fn with_status(mut self, status: Option<u16>) -> Self {
        self.last_status = status;
        self
    }
}

/// Result of a remote operation.
pub type RemoteOperationResult<T> = Result<T, OperationFailure>;

/// One failed attempt. Lives only for the duration of an `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Why the attempt failed.
    pub error_class: ErrorClass,
    /// Delay applied before the next attempt.
    pub delay_applied: Duration,
}

// =============================================================================
// State Machine
// =============================================================================

/// Envelope state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvelopeState {
    /// Waiting for a valid token.
    #[default]
    AwaitToken,
    /// Request issued, awaiting the reply.
    InFlight,
    /// Waiting before the next attempt.
    Backoff,
    /// Payload returned.
    Success,
    /// Terminal failure returned.
    Failed,
}

impl EnvelopeState {
    /// Whether no further transition is allowed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::AwaitToken, Self::InFlight | Self::Failed)
                | (Self::InFlight, Self::Success | Self::Backoff | Self::Failed)
                | (Self::Backoff, Self::AwaitToken | Self::Failed)
        )
    }

    /// Label for tracing.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitToken => "await_token",
            Self::InFlight => "in_flight",
            Self::Backoff => "backoff",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(200 => Disposition::Success ; "ok")]
    #[test_case(204 => Disposition::Success ; "no content")]
    #[test_case(401 => Disposition::Retry(ErrorClass::AuthExpired) ; "unauthorized")]
    #[test_case(429 => Disposition::Retry(ErrorClass::RateLimited { retry_after: None }) ; "too many requests")]
    #[test_case(500 => Disposition::Retry(ErrorClass::ServerError) ; "internal error")]
    #[test_case(503 => Disposition::Retry(ErrorClass::ServerError) ; "unavailable")]
    #[test_case(400 => Disposition::Terminal(FailureClass::ClientError) ; "bad request")]
    #[test_case(403 => Disposition::Terminal(FailureClass::ClientError) ; "forbidden")]
    #[test_case(404 => Disposition::Terminal(FailureClass::ClientError) ; "not found")]
    #[test_case(422 => Disposition::Terminal(FailureClass::ClientError) ; "unprocessable")]
    #[test_case(302 => Disposition::Terminal(FailureClass::ClientError) ; "redirect")]
    fn status_classification(status: u16) -> Disposition {
        classify_status(status, None)
    }

    #[test]
    fn rate_limited_keeps_retry_after() {
        let retry_after = Some(Duration::from_secs(5));
        assert_eq!(
            classify_status(429, retry_after),
            Disposition::Retry(ErrorClass::RateLimited { retry_after })
        );
    }

    #[test]
    fn transport_classification() {
        assert_eq!(
            classify_transport(&TransportError::Timeout),
            Disposition::Retry(ErrorClass::ServerError)
        );
        assert_eq!(
            classify_transport(&TransportError::Connect("reset".to_string())),
            Disposition::Retry(ErrorClass::ServerError)
        );
        assert_eq!(
            classify_transport(&TransportError::Decode("eof".to_string())),
            Disposition::Terminal(FailureClass::ClientError)
        );
    }

    #[test]
    fn failed_reply_verdicts() {
        assert_eq!(
            classify_status(503, None).for_failed_reply(),
            Ok(ErrorClass::ServerError)
        );
        assert_eq!(
            classify_status(400, None).for_failed_reply(),
            Err(FailureClass::ClientError)
        );
        assert_eq!(
            classify_status(200, None).for_failed_reply(),
            Err(FailureClass::ClientError)
        );
    }

    #[test]
    fn exhausted_mapping() {
        assert_eq!(
            FailureClass::exhausted(ErrorClass::AuthExpired),
            FailureClass::AuthFailure
        );
        assert_eq!(
            FailureClass::exhausted(ErrorClass::RateLimited { retry_after: None }),
            FailureClass::RateLimitExceeded
        );
        assert_eq!(
            FailureClass::exhausted(ErrorClass::ServerError),
            FailureClass::ServerError
        );
    }

    #[test]
    fn terminal_states_have_no_exits() {
        let all = [
            EnvelopeState::AwaitToken,
            EnvelopeState::InFlight,
            EnvelopeState::Backoff,
            EnvelopeState::Success,
            EnvelopeState::Failed,
        ];
        for terminal in [EnvelopeState::Success, EnvelopeState::Failed] {
            assert!(terminal.is_terminal());
            for next in all {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn legal_transitions() {
        use EnvelopeState::{AwaitToken, Backoff, Failed, InFlight, Success};

        assert!(AwaitToken.can_transition_to(InFlight));
        assert!(AwaitToken.can_transition_to(Failed));
        assert!(InFlight.can_transition_to(Success));
        assert!(InFlight.can_transition_to(Backoff));
        assert!(InFlight.can_transition_to(Failed));
        assert!(Backoff.can_transition_to(AwaitToken));
        assert!(Backoff.can_transition_to(Failed));

        assert!(!AwaitToken.can_transition_to(Success));
        assert!(!AwaitToken.can_transition_to(Backoff));
        assert!(!Backoff.can_transition_to(InFlight));
        assert!(!Backoff.can_transition_to(Success));
    }

    #[test]
    fn failure_display() {
        let failure = OperationFailure::new(FailureClass::ClientError, "bad request", 1)
            .with_status(Some(400));
        assert_eq!(failure.to_string(), "client_error after 1 attempt(s): bad request");
        assert_eq!(failure.last_status, Some(400));
    }
}
