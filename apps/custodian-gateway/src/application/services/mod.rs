//! Application Services
//!
//! - `token_cache`: one credential per integration, single-flight refresh
//! - `envelope`: retry/backoff loop around a request function

pub mod envelope;
pub mod token_cache;

pub use envelope::{EnvelopeConfig, OperationEnvelope};
pub use token_cache::{DEFAULT_SAFETY_MARGIN, TokenCache};
