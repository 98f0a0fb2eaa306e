//! OAuth2 client-credentials refresher.
//!
//! One token request per call. Retry is left to the envelope: a failed
//! refresh surfaces as `AUTH_FAILURE` on the operation that needed it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use reqwest::{Client, Url};
use serde::Deserialize;

use super::error::CustodianError;
use crate::application::ports::{Clock, CredentialRefresher, RefreshError};
use crate::domain::credential::{Credential, DEFAULT_TOKEN_TYPE};
use crate::infrastructure::config::CustodianSettings;

/// Token endpoint response body.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// The bearer token.
    pub access_token: String,
    /// Token type (default: `Bearer`).
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds.
    pub expires_in: u64,
}

impl TokenResponse {
    /// Credential issued at `now`.
    ///
    /// # Errors
    ///
    /// Returns `RefreshError::InvalidResponse` if the token is empty.
    pub fn into_credential(self, now: DateTime<Utc>) -> Result<Credential, RefreshError> {
        if self.access_token.trim().is_empty() {
            return Err(RefreshError::InvalidResponse(
                "empty access_token".to_string(),
            ));
        }

        let lifetime = i64::try_from(self.expires_in)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        let expires_at = now
            .checked_add_signed(lifetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let token_type = self
            .token_type
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string());

        Ok(Credential::new(self.access_token, expires_at, token_type))
    }
}

/// Refreshes credentials with the OAuth2 client-credentials grant.
pub struct ClientCredentialsRefresher {
    client: Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    scope: Option<String>,
    clock: Arc<dyn Clock>,
}

impl ClientCredentialsRefresher {
    /// Create a refresher from custodian settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_settings(
        settings: &CustodianSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CustodianError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()?;

        Ok(Self::new(
            client,
            settings.token_url.clone(),
            settings.client_id().to_string(),
            settings.client_secret().to_string(),
            clock,
        )
        .with_scope(settings.scope.clone()))
    }

    /// Create a refresher over an existing `reqwest::Client`.
    #[must_use]
    pub fn new(
        client: Client,
        token_url: Url,
        client_id: String,
        client_secret: String,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            token_url,
            client_id,
            client_secret,
            scope: None,
            clock,
        }
    }

    /// Set the requested scope.
    #[must_use]
    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    fn form(&self) -> Vec<(&'static str, &str)> {
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        if let Some(scope) = &self.scope {
            form.push(("scope", scope.as_str()));
        }
        form
    }
}

impl std::fmt::Debug for ClientCredentialsRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentialsRefresher")
            .field("token_url", &self.token_url.as_str())
            .field("client_id", &"[REDACTED]")
            .field("client_secret", &"[REDACTED]")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialRefresher for ClientCredentialsRefresher {
    async fn refresh(&self) -> Result<Credential, RefreshError> {
        let response = self
            .client
            .post(self.token_url.clone())
            .header(ACCEPT, "application/json")
            .form(&self.form())
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

        token.into_credential(self.clock.now())
    }
}
