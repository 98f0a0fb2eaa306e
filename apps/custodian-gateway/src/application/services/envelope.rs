//! Operation Envelope
//!
//! Wraps a single remote call with token acquisition, retry and backoff.
//!
//! # Retry Rules
//!
//! | Reply | Attempts remain | Exhausted |
//! |-------|-----------------|-----------|
//! | 2xx | return payload | - |
//! | 401 | invalidate token, retry now | `AuthFailure` |
//! | 429 | wait `Retry-After` (or default), same token | `RateLimitExceeded` |
//! | 5xx, timeout, connect error | exponential backoff | `ServerError` |
//! | other status, decode error | - | `ClientError` immediately |
//!
//! The envelope runs inside the caller's task and spawns nothing. Dropping
//! the returned future, or cancelling the supplied token, stops it at the
//! next suspension point (token wait, in-flight call or backoff sleep).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{RemoteGateway, TokenError};
use crate::application::services::token_cache::TokenCache;
use crate::domain::backoff::{BackoffConfig, BackoffPolicy, ErrorClass};
use crate::domain::credential::Credential;
use crate::domain::operation::{
    AttemptRecord, EnvelopeState, FailureClass, OperationFailure,
    RemoteOperationResult, RemoteReply, TransportError, classify_status, classify_transport,
};
use crate::infrastructure::metrics;

/// Envelope configuration.
#[derive(Debug, Clone)]
pub struct EnvelopeConfig {
    /// Attempts used by `execute_default` (default: 3).
    pub max_attempts: u32,
    /// Hard upper bound on attempts for any call (default: 5).
    pub attempt_ceiling: u32,
    /// Backoff delays.
    pub backoff: BackoffConfig,
    /// Per-attempt timeout; a timeout counts as a server error.
    pub attempt_timeout: Option<Duration>,
    /// Fraction of a server-error delay that may be shaved off at random
    /// (default: 0.0, no jitter).
    pub jitter_factor: f64,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_ceiling: 5,
            backoff: BackoffConfig::default(),
            attempt_timeout: None,
            jitter_factor: 0.0,
        }
    }
}

/// Retry/backoff/token-refresh wrapper for one integration.
#[derive(Debug, Clone)]
pub struct OperationEnvelope {
    token_cache: Arc<TokenCache>,
    policy: BackoffPolicy,
    config: EnvelopeConfig,
}

impl OperationEnvelope {
    /// Create an envelope over a shared token cache.
    #[must_use]
    pub fn new(token_cache: Arc<TokenCache>, config: EnvelopeConfig) -> Self {
        Self {
            token_cache,
            policy: BackoffPolicy::new(config.backoff.clone()),
            config,
        }
    }

    /// Token cache backing this envelope.
    #[must_use]
    pub const fn token_cache(&self) -> &Arc<TokenCache> {
        &self.token_cache
    }

    /// Envelope configuration.
    #[must_use]
    pub const fn config(&self) -> &EnvelopeConfig {
        &self.config
    }

    /// Attempts actually allowed for a requested `max_attempts`.
    #[must_use]
    pub fn effective_attempts(&self, requested: u32) -> u32 {
        requested.clamp(1, self.config.attempt_ceiling.max(1))
    }

    /// Run `request_fn` with the configured default attempt count.
    pub async fn execute_default<T, F, Fut>(&self, request_fn: F) -> RemoteOperationResult<T>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<RemoteReply<T>, TransportError>>,
    {
        self.execute(request_fn, self.config.max_attempts).await
    }

    /// Run `request_fn` with retry, backoff and token refresh.
    pub async fn execute<T, F, Fut>(&self, request_fn: F, max_attempts: u32) -> RemoteOperationResult<T>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<RemoteReply<T>, TransportError>>,
    {
        self.execute_cancellable(request_fn, max_attempts, &CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), stopping with `Cancelled` once
    /// `cancel` fires.
    pub async fn execute_cancellable<T, F, Fut>(
        &self,
        mut request_fn: F,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> RemoteOperationResult<T>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<RemoteReply<T>, TransportError>>,
    {
        let integration = self.token_cache.integration();
        let max_attempts = self.effective_attempts(max_attempts);
        let mut tracker = StateTracker::new(integration);
        let mut attempt: u32 = 1;
        let mut last_status: Option<u16> = None;

        loop {
            let credential = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return self.fail(
                        &mut tracker,
                        OperationFailure::new(
                            FailureClass::Cancelled,
                            "cancelled while awaiting token",
                            attempt - 1,
                        )
                        .with_status(last_status),
                    );
                }
                token = self.token_cache.get_valid_token() => match token {
                    Ok(credential) => credential,
                    Err(e) => {
                        return self.fail(
                            &mut tracker,
                            OperationFailure::new(FailureClass::AuthFailure, e.to_string(), attempt - 1)
                                .with_status(last_status),
                        );
                    }
                },
            };

            tracker.advance(EnvelopeState::InFlight);
            tracing::debug!(integration, attempt, max_attempts, "Issuing remote call");

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return self.fail(
                        &mut tracker,
                        OperationFailure::new(
                            FailureClass::Cancelled,
                            "cancelled while request in flight",
                            attempt,
                        )
                        .with_status(last_status),
                    );
                }
                outcome = self.issue(&mut request_fn, credential.clone()) => outcome,
            };

            let (verdict, detail) = match outcome {
                Ok(RemoteReply::Success(payload)) => {
                    metrics::record_attempt(integration, "success");
                    tracker.advance(EnvelopeState::Success);
                    metrics::record_operation(integration, "success");
                    if attempt > 1 {
                        tracing::info!(integration, attempts = attempt, "Remote call succeeded after retry");
                    }
                    return Ok(payload);
                }
                Ok(RemoteReply::Failure {
                    status,
                    retry_after,
                    detail,
                }) => {
                    last_status = Some(status);
                    (classify_status(status, retry_after).for_failed_reply(), detail)
                }
                Err(e) => (classify_transport(&e).for_failed_reply(), e.to_string()),
            };

            let class = match verdict {
                Ok(class) => class,
                Err(terminal) => {
                    metrics::record_attempt(integration, terminal.as_str());
                    return self.fail(
                        &mut tracker,
                        OperationFailure::new(terminal, detail, attempt).with_status(last_status),
                    );
                }
            };
            metrics::record_attempt(integration, class.as_str());

            if attempt >= max_attempts {
                return self.fail(
                    &mut tracker,
                    OperationFailure::new(FailureClass::exhausted(class), detail, attempt)
                        .with_status(last_status),
                );
            }

            if class == ErrorClass::AuthExpired {
                self.token_cache.invalidate_token(&credential);
            }

            let record = AttemptRecord {
                attempt_number: attempt,
                error_class: class,
                delay_applied: self.delay_for(attempt, class),
            };
            tracing::warn!(
                integration,
                attempt = record.attempt_number,
                error_class = record.error_class.as_str(),
                delay_ms = record.delay_applied.as_millis(),
                status = last_status,
                detail = %detail,
                "Retryable failure, backing off"
            );
            metrics::record_retry(integration, record.error_class, record.delay_applied);

            tracker.advance(EnvelopeState::Backoff);
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return self.fail(
                        &mut tracker,
                        OperationFailure::new(FailureClass::Cancelled, "cancelled during backoff", attempt)
                            .with_status(last_status),
                    );
                }
                () = tokio::time::sleep(record.delay_applied) => {}
            }

            tracker.advance(EnvelopeState::AwaitToken);
            attempt += 1;
        }
    }

    async fn issue<T, F, Fut>(
        &self,
        request_fn: &mut F,
        credential: Credential,
    ) -> Result<RemoteReply<T>, TransportError>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<RemoteReply<T>, TransportError>>,
    {
        let call = request_fn(credential);
        match self.config.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(TransportError::Timeout)),
            None => call.await,
        }
    }

    /// Backoff delay for the attempt after `attempt`, with jitter applied to
    /// server errors only.
    fn delay_for(&self, attempt: u32, class: ErrorClass) -> Duration {
        let delay = self.policy.compute_delay(attempt, class);
        if class != ErrorClass::ServerError || self.config.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let factor = self.config.jitter_factor.min(1.0);
        let shave: f64 = rand::rng().random_range(0.0..=factor);
        delay.mul_f64(1.0 - shave)
    }

    fn fail<T>(&self, tracker: &mut StateTracker<'_>, failure: OperationFailure) -> RemoteOperationResult<T> {
        tracker.advance(EnvelopeState::Failed);
        tracing::warn!(
            integration = tracker.integration,
            class = failure.class.as_str(),
            attempts = failure.attempts,
            status = failure.last_status,
            detail = %failure.detail,
            "Remote operation failed"
        );
        metrics::record_operation(tracker.integration, failure.class.as_str());
        Err(failure)
    }
}

#[async_trait]
impl RemoteGateway for OperationEnvelope {
    async fn execute<T, F, Fut>(&self, request_fn: F, max_attempts: u32) -> RemoteOperationResult<T>
    where
        T: Send,
        F: FnMut(Credential) -> Fut + Send,
        Fut: Future<Output = Result<RemoteReply<T>, TransportError>> + Send,
    {
        let cancel = CancellationToken::new();
        self.execute_cancellable(request_fn, max_attempts, &cancel).await
    }

    async fn get_valid_token(&self) -> Result<Credential, TokenError> {
        self.token_cache.get_valid_token().await
    }
}

/// Tracks the envelope state for one `execute` call.
struct StateTracker<'a> {
    integration: &'a str,
    state: EnvelopeState,
}

impl<'a> StateTracker<'a> {
    const fn new(integration: &'a str) -> Self {
        Self {
            integration,
            state: EnvelopeState::AwaitToken,
        }
    }

    fn advance(&mut self, next: EnvelopeState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal envelope transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!(
            integration = self.integration,
            from = self.state.as_str(),
            to = next.as_str(),
            "Envelope transition"
        );
        self.state = next;
    }
}
