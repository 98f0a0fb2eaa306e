//! Custodian HTTP Adapter
//!
//! JSON-over-HTTPS access to a bearer-token custodian API, driven through the
//! operation envelope, plus the OAuth2 client-credentials refresher that
//! feeds its token cache.

mod error;
mod http_client;
mod oauth;

pub use error::CustodianError;
pub use http_client::CustodianHttpClient;
pub use oauth::{ClientCredentialsRefresher, TokenResponse};
