//! Configuration Module
//!
//! Envelope tuning and custodian connection settings, loaded from
//! environment variables.

mod settings;

pub use settings::{ConfigError, CustodianSettings, EnvelopeSettings, GatewayConfig};
