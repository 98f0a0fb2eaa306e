//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus the ambient
//! configuration, metrics and tracing setup.

/// Configuration loaded from the environment.
pub mod config;

/// Custodian HTTP adapter and OAuth2 refresher.
pub mod custodian;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
