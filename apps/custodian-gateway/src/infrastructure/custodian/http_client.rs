//! HTTP client that routes every call through a [`RemoteGateway`].
//!
//! The client only knows how to build a request and read a reply. Token
//! handling, retries and backoff belong to the gateway.

use std::sync::Arc;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Method, Response, Url};
use serde::Serialize;
use serde::de::{DeserializeOwned, IgnoredAny};

use super::error::CustodianError;
use crate::application::ports::{Clock, RemoteGateway};
use crate::application::services::envelope::OperationEnvelope;
use crate::domain::backoff::parse_retry_after;
use crate::domain::credential::Credential;
use crate::domain::operation::{
    FailureClass, OperationFailure, RemoteOperationResult, RemoteReply, TransportError,
};
use crate::infrastructure::config::CustodianSettings;

/// Header carrying the per-operation idempotency key.
pub const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

const JSON: &str = "application/json";

/// Custodian API client.
#[derive(Debug)]
pub struct CustodianHttpClient<G = OperationEnvelope> {
    integration: String,
    client: Client,
    base_url: Url,
    gateway: Arc<G>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl<G> Clone for CustodianHttpClient<G> {
    fn clone(&self) -> Self {
        Self {
            integration: self.integration.clone(),
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            gateway: Arc::clone(&self.gateway),
            clock: Arc::clone(&self.clock),
            max_attempts: self.max_attempts,
        }
    }
}

impl<G: RemoteGateway> CustodianHttpClient<G> {
    /// Default attempts per call.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// Create a client from custodian settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_settings(
        settings: &CustodianSettings,
        gateway: Arc<G>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CustodianError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()?;

        Ok(Self::new(
            settings.name.clone(),
            client,
            settings.base_url.clone(),
            gateway,
            clock,
        ))
    }

    /// Create a client over an existing `reqwest::Client`.
    #[must_use]
    pub fn new(
        integration: impl Into<String>,
        client: Client,
        base_url: Url,
        gateway: Arc<G>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            integration: integration.into(),
            client,
            base_url,
            gateway,
            clock,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Override the attempts per call.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Gateway the client runs through.
    #[must_use]
    pub const fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    /// Make a GET request.
    ///
    /// # Errors
    ///
    /// Returns the envelope's terminal failure.
    #[tracing::instrument(skip(self), fields(integration = %self.integration))]
    pub async fn get<T>(&self, path: &str) -> RemoteOperationResult<T>
    where
        T: DeserializeOwned + Send,
    {
        self.request(Method::GET, path, None, None).await
    }

    /// Make a POST request with a JSON body.
    ///
    /// One idempotency key is generated per call and sent on every attempt.
    ///
    /// # Errors
    ///
    /// Returns the envelope's terminal failure, or `ClientError` if the body
    /// cannot be serialized.
    #[tracing::instrument(skip(self, body), fields(integration = %self.integration))]
    pub async fn post<T, B>(&self, path: &str, body: &B) -> RemoteOperationResult<T>
    where
        T: DeserializeOwned + Send,
        B: Serialize + ?Sized + Sync,
    {
        let payload = serde_json::to_vec(body).map_err(|e| {
            OperationFailure::new(FailureClass::ClientError, format!("request body: {e}"), 0)
        })?;
        let idempotency_key = uuid::Uuid::new_v4().to_string();
        tracing::debug!(idempotency_key = %idempotency_key, "Posting");

        self.request(Method::POST, path, Some(payload), Some(idempotency_key))
            .await
    }

    /// Make a DELETE request, discarding any response body.
    ///
    /// # Errors
    ///
    /// Returns the envelope's terminal failure.
    #[tracing::instrument(skip(self), fields(integration = %self.integration))]
    pub async fn delete(&self, path: &str) -> RemoteOperationResult<()> {
        let _: IgnoredAny = self.request(Method::DELETE, path, None, None).await?;
        Ok(())
    }

    /// Absolute URL for `path` under the base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the joined URL does not parse.
    pub fn endpoint(&self, path: &str) -> Result<Url, CustodianError> {
        let joined = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| CustodianError::InvalidPath {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    async fn request<T>(
        &self,
        method: Method,
        path: &str,
        payload: Option<Vec<u8>>,
        idempotency_key: Option<String>,
    ) -> RemoteOperationResult<T>
    where
        T: DeserializeOwned + Send,
    {
        let url = self
            .endpoint(path)
            .map_err(|e| OperationFailure::new(FailureClass::ClientError, e.to_string(), 0))?;

        let request_fn = |credential: Credential| {
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .header(AUTHORIZATION, credential.authorization_header())
                .header(ACCEPT, JSON);
            if let Some(key) = &idempotency_key {
                request = request.header(IDEMPOTENCY_KEY, key.as_str());
            }
            if let Some(bytes) = &payload {
                request = request.header(CONTENT_TYPE, JSON).body(bytes.clone());
            }
            let clock = Arc::clone(&self.clock);

            async move {
                let response = request.send().await.map_err(|e| transport_error(&e))?;
                read_reply(response, clock.as_ref()).await
            }
        };

        self.gateway.execute(request_fn, self.max_attempts).await
    }
}

/// Turn a response into a reply the envelope can classify.
async fn read_reply<T: DeserializeOwned>(
    response: Response,
    clock: &dyn Clock,
) -> Result<RemoteReply<T>, TransportError> {
    let status = response.status();

    if status.is_success() {
        let bytes = response.bytes().await.map_err(|e| transport_error(&e))?;
        let body: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
        return serde_json::from_slice(body)
            .map(RemoteReply::Success)
            .map_err(|e| TransportError::Decode(e.to_string()));
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, clock.now()));

    let body = response.text().await.unwrap_or_default();
    let detail = if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("no response body")
            .to_string()
    } else {
        body
    };

    Ok(RemoteReply::Failure {
        status: status.as_u16(),
        retry_after,
        detail,
    })
}

fn transport_error(e: &reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_decode() {
        TransportError::Decode(e.to_string())
    } else {
        TransportError::Connect(e.to_string())
    }
}
