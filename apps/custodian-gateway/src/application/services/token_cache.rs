//! Token Cache
//!
//! Holds one credential per integration connection and refreshes it lazily.
//!
//! Concurrent callers that find the credential stale share a single refresh
//! future, so the refresher runs once no matter how many requests overlap
//! at the moment of expiry. No timers are scheduled; a refresh only happens
//! when someone asks for a token.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use crate::application::ports::{
    Clock, CredentialRefresher, RefreshError, SystemClock, TokenError,
};
use crate::domain::credential::Credential;
use crate::infrastructure::metrics;

/// Default safety margin before expiry.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(300);

type RefreshFuture = Shared<BoxFuture<'static, Result<Credential, TokenError>>>;

#[derive(Default)]
struct CacheState {
    credential: Option<Credential>,
    in_flight: Option<(u64, RefreshFuture)>,
    generation: u64,
}

/// Lazily refreshed credential cache with single-flight refresh.
pub struct TokenCache {
    integration: String,
    refresher: Arc<dyn CredentialRefresher>,
    clock: Arc<dyn Clock>,
    safety_margin: Duration,
    state: Mutex<CacheState>,
    refreshes: AtomicU64,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("integration", &self.integration)
            .field("safety_margin", &self.safety_margin)
            .field("refreshes", &self.refresh_count())
            .finish_non_exhaustive()
    }
}

impl TokenCache {
    /// Create a cache using the system clock and the default safety margin.
    #[must_use]
    pub fn new(integration: impl Into<String>, refresher: Arc<dyn CredentialRefresher>) -> Self {
        Self::with_clock(
            integration,
            refresher,
            Arc::new(SystemClock),
            DEFAULT_SAFETY_MARGIN,
        )
    }

    /// Create a cache with an explicit clock and safety margin.
    #[must_use]
    pub fn with_clock(
        integration: impl Into<String>,
        refresher: Arc<dyn CredentialRefresher>,
        clock: Arc<dyn Clock>,
        safety_margin: Duration,
    ) -> Self {
        Self {
            integration: integration.into(),
            refresher,
            clock,
            safety_margin,
            state: Mutex::new(CacheState::default()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Integration name used in logs and metrics.
    #[must_use]
    pub fn integration(&self) -> &str {
        &self.integration
    }

    /// Clock shared with the envelope.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Number of refreshes started since creation.
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Return the cached credential, refreshing it first if stale.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::RefreshFailed` if the refresh this call joined
    /// failed. Every caller that joined that refresh sees the same error.
    pub async fn get_valid_token(&self) -> Result<Credential, TokenError> {
        let (generation, refresh) = {
            let mut state = self.state.lock();

            if let Some(credential) = &state.credential
                && credential.is_fresh_at(self.clock.now(), self.safety_margin)
            {
                return Ok(credential.clone());
            }

            match &state.in_flight {
                Some((generation, refresh)) => {
                    tracing::trace!(
                        integration = %self.integration,
                        generation,
                        "Joining in-flight token refresh"
                    );
                    (*generation, refresh.clone())
                }
                None => {
                    state.generation += 1;
                    let generation = state.generation;
                    let refresh = self.start_refresh(generation);
                    state.in_flight = Some((generation, refresh.clone()));
                    (generation, refresh)
                }
            }
        };

        let result = refresh.await;
        self.complete_refresh(generation, &result);
        result
    }

    /// Force the next `get_valid_token` to refresh.
    pub fn invalidate(&self) {
        self.state.lock().credential = None;
        tracing::debug!(integration = %self.integration, "Token invalidated");
    }

    /// Invalidate only if `rejected` is still the cached credential.
    ///
    /// Overlapping requests that were all rejected with the same stale token
    /// then trigger one refresh instead of discarding each other's result.
    pub fn invalidate_token(&self, rejected: &Credential) {
        let mut state = self.state.lock();
        if state
            .credential
            .as_ref()
            .is_some_and(|current| current.token_value() == rejected.token_value())
        {
            state.credential = None;
            tracing::debug!(integration = %self.integration, "Rejected token invalidated");
        }
    }

    fn start_refresh(&self, generation: u64) -> RefreshFuture {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            integration = %self.integration,
            generation,
            "Refreshing credential"
        );

        let refresher = Arc::clone(&self.refresher);
        async move {
            match AssertUnwindSafe(refresher.refresh()).catch_unwind().await {
                Ok(result) => result.map_err(TokenError::from),
                Err(payload) => Err(RefreshError::Panicked(panic_message(&*payload)).into()),
            }
        }
        .boxed()
        .shared()
    }

    fn complete_refresh(&self, generation: u64, result: &Result<Credential, TokenError>) {
        let mut state = self.state.lock();

        // Only the first waiter to wake up for this generation publishes it.
        if !matches!(&state.in_flight, Some((current, _)) if *current == generation) {
            return;
        }
        state.in_flight = None;

        match result {
            Ok(credential) => {
                let now = self.clock.now();
                if !credential.is_fresh_at(now, self.safety_margin) {
                    tracing::warn!(
                        integration = %self.integration,
                        remaining_secs = credential.remaining_at(now).as_secs(),
                        margin_secs = self.safety_margin.as_secs(),
                        "Refreshed credential expires inside the safety margin"
                    );
                }
                tracing::info!(
                    integration = %self.integration,
                    expires_at = %credential.expires_at(),
                    "Credential refreshed"
                );
                state.credential = Some(credential.clone());
                metrics::record_token_refresh(&self.integration, true);
            }
            Err(e) => {
                tracing::warn!(
                    integration = %self.integration,
                    error = %e,
                    "Credential refresh failed"
                );
                metrics::record_token_refresh(&self.integration, false);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{ManualClock, MockCredentialRefresher};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::AtomicU32;
    use tokio_test::{assert_err, assert_ok};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap()
    }

    /// Refresher that counts calls and hands out numbered tokens.
    struct CountingRefresher {
        calls: AtomicU32,
        clock: ManualClock,
        lifetime: chrono::Duration,
        delay: Duration,
    }

    #[async_trait]
    impl CredentialRefresher for CountingRefresher {
        async fn refresh(&self) -> Result<Credential, RefreshError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            Ok(Credential::bearer(
                format!("token-{n}"),
                self.clock.now() + self.lifetime,
            ))
        }
    }

    fn counting(clock: &ManualClock, delay: Duration) -> Arc<CountingRefresher> {
        Arc::new(CountingRefresher {
            calls: AtomicU32::new(0),
            clock: clock.clone(),
            lifetime: chrono::Duration::hours(1),
            delay,
        })
    }

    fn cache(refresher: Arc<dyn CredentialRefresher>, clock: &ManualClock) -> TokenCache {
        TokenCache::with_clock(
            "test",
            refresher,
            Arc::new(clock.clone()),
            DEFAULT_SAFETY_MARGIN,
        )
    }

    #[tokio::test]
    async fn first_call_refreshes_then_caches() {
        let clock = ManualClock::new(start());
        let refresher = counting(&clock, Duration::ZERO);
        let cache = cache(refresher.clone(), &clock);

        let first = assert_ok!(cache.get_valid_token().await);
        let second = assert_ok!(cache.get_valid_token().await);

        assert_eq!(first.token_value(), "token-1");
        assert_eq!(first, second);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.refresh_count(), 1);
    }

    #[tokio::test]
    async fn refreshes_once_inside_safety_margin() {
        let clock = ManualClock::new(start());
        let refresher = counting(&clock, Duration::ZERO);
        let cache = cache(refresher.clone(), &clock);

        cache.get_valid_token().await.unwrap();

        // 54 minutes in: still 6 minutes left, outside the 5 minute margin.
        clock.advance(chrono::Duration::minutes(54));
        assert_eq!(cache.get_valid_token().await.unwrap().token_value(), "token-1");

        // 55 minutes in: inside the margin.
        clock.advance(chrono::Duration::minutes(1));
        assert_eq!(cache.get_valid_token().await.unwrap().token_value(), "token-2");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_refresh() {
        let clock = ManualClock::new(start());
        let refresher = counting(&clock, Duration::from_millis(250));
        let cache = Arc::new(cache(refresher.clone(), &clock));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get_valid_token().await })
            })
            .collect();

        for handle in handles {
            let credential = handle.await.unwrap().unwrap();
            assert_eq!(credential.token_value(), "token-1");
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_at_expiry_share_one_refresh() {
        let clock = ManualClock::new(start());
        let refresher = counting(&clock, Duration::from_millis(100));
        let cache = Arc::new(cache(refresher.clone(), &clock));

        cache.get_valid_token().await.unwrap();
        clock.advance(chrono::Duration::minutes(58));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get_valid_token().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(
                handle.await.unwrap().unwrap().token_value(),
                "token-2"
            );
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let clock = ManualClock::new(start());
        let refresher = counting(&clock, Duration::ZERO);
        let cache = cache(refresher.clone(), &clock);

        cache.get_valid_token().await.unwrap();
        cache.invalidate();
        assert_eq!(cache.get_valid_token().await.unwrap().token_value(), "token-2");
    }

    #[tokio::test]
    async fn invalidate_token_ignores_superseded_credential() {
        let clock = ManualClock::new(start());
        let refresher = counting(&clock, Duration::ZERO);
        let cache = cache(refresher.clone(), &clock);

        let stale = cache.get_valid_token().await.unwrap();
        cache.invalidate_token(&stale);
        let fresh = cache.get_valid_token().await.unwrap();
        assert_eq!(fresh.token_value(), "token-2");

        // A late 401 for the old token must not discard the new one.
        cache.invalidate_token(&stale);
        assert_eq!(cache.get_valid_token().await.unwrap(), fresh);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refresh_failure_propagates_without_internal_retry() {
        let clock = ManualClock::new(start());
        let mut mock = MockCredentialRefresher::new();
        mock.expect_refresh().times(1).returning(|| {
            Err(RefreshError::Rejected {
                status: 400,
                message: "invalid_client".to_string(),
            })
        });
        let cache = cache(Arc::new(mock), &clock);

        let err = assert_err!(cache.get_valid_token().await);
        assert!(matches!(
            err,
            TokenError::RefreshFailed(RefreshError::Rejected { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn failed_refresh_is_not_cached() {
        let clock = ManualClock::new(start());
        let mut mock = MockCredentialRefresher::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_refresh()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(RefreshError::Transport("connection refused".to_string())));
        let expires = start() + chrono::Duration::hours(1);
        mock.expect_refresh()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move || Ok(Credential::bearer("recovered", expires)));
        let cache = cache(Arc::new(mock), &clock);

        assert!(cache.get_valid_token().await.is_err());
        assert_eq!(
            cache.get_valid_token().await.unwrap().token_value(),
            "recovered"
        );
    }

    /// Refresher that always fails after a delay.
    struct FailingRefresher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CredentialRefresher for FailingRefresher {
        async fn refresh(&self) -> Result<Credential, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(RefreshError::Rejected {
                status: 401,
                message: "bad secret".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_failure() {
        let clock = ManualClock::new(start());
        let refresher = Arc::new(FailingRefresher {
            calls: AtomicU32::new(0),
        });
        let cache = Arc::new(cache(refresher.clone(), &clock));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get_valid_token().await })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_err());
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    /// Refresher that panics on its first call and succeeds afterwards.
    struct PanicOnceRefresher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CredentialRefresher for PanicOnceRefresher {
        async fn refresh(&self) -> Result<Credential, RefreshError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(n > 1, "auth client crashed");
            Ok(Credential::bearer(
                "after-panic",
                start() + chrono::Duration::hours(1),
            ))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refresher_panic_surfaces_as_error_and_cache_recovers() {
        let clock = ManualClock::new(start());
        let refresher = Arc::new(PanicOnceRefresher {
            calls: AtomicU32::new(0),
        });
        let cache = Arc::new(cache(refresher.clone(), &clock));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get_valid_token().await })
            })
            .collect();

        for handle in handles {
            let err = assert_err!(handle.await.unwrap());
            assert!(matches!(
                err,
                TokenError::RefreshFailed(RefreshError::Panicked(ref message))
                    if message.contains("auth client crashed")
            ));
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        let credential = assert_ok!(cache.get_valid_token().await);
        assert_eq!(credential.token_value(), "after-panic");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }
}
