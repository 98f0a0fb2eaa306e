//! Application Layer - Services and port definitions.
//!
//! The token cache and operation envelope, and the ports they use to reach
//! the outside world.

/// Port interfaces for credential refresh, time and the gateway capability.
pub mod ports;

/// Token cache and operation envelope.
pub mod services;
