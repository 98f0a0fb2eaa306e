//! Custodian adapter setup errors.

use thiserror::Error;

/// Errors building a custodian adapter.
#[derive(Debug, Error)]
pub enum CustodianError {
    /// The underlying HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),

    /// A request path could not be joined onto the base URL.
    #[error("invalid request path '{path}': {message}")]
    InvalidPath {
        /// Offending path.
        path: String,
        /// Parser message.
        message: String,
    },
}

impl From<reqwest::Error> for CustodianError {
    fn from(e: reqwest::Error) -> Self {
        Self::ClientBuild(e.to_string())
    }
}
