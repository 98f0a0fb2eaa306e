//! Prometheus Metrics Module
//!
//! Counters and histograms for remote operations.
//!
//! # Metrics Categories
//!
//! - **Attempts**: every issued request, labelled by outcome
//! - **Retries**: scheduled retries by error class, plus the backoff applied
//! - **Operations**: final outcome of each `execute` call
//! - **Token refreshes**: refresh round-trips by result
//!
//! Recording is a no-op until [`init_metrics`] installs the recorder.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;
use thiserror::Error;

use crate::domain::backoff::ErrorClass;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Errors from metrics setup.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The global recorder could not be installed.
    #[error("failed to install Prometheus recorder: {0}")]
    Install(String),
}

/// Initialize the Prometheus metrics recorder.
///
/// Later calls, including concurrent ones, return the handle installed by
/// the first.
///
/// # Errors
///
/// Returns `MetricsError::Install` if a recorder from outside this module is
/// already installed.
pub fn init_metrics() -> Result<PrometheusHandle, MetricsError> {
    let mut slot = PROMETHEUS_HANDLE.lock();
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::Install(e.to_string()))?;
    register_metrics();

    *slot = Some(handle.clone());
    Ok(handle)
}

// =============================================================================
// Metric Registration
// =============================================================================

const ATTEMPTS_TOTAL: &str = "custodian_gateway_attempts_total";
const RETRIES_TOTAL: &str = "custodian_gateway_retries_total";
const OPERATIONS_TOTAL: &str = "custodian_gateway_operations_total";
const TOKEN_REFRESHES_TOTAL: &str = "custodian_gateway_token_refreshes_total";
const BACKOFF_SECONDS: &str = "custodian_gateway_backoff_seconds";

fn register_metrics() {
    describe_counter!(ATTEMPTS_TOTAL, "Remote requests issued, by outcome");
    describe_counter!(RETRIES_TOTAL, "Retries scheduled, by error class");
    describe_counter!(OPERATIONS_TOTAL, "Completed remote operations, by outcome");
    describe_counter!(TOKEN_REFRESHES_TOTAL, "Credential refresh round-trips, by result");
    describe_histogram!(BACKOFF_SECONDS, "Backoff delay applied before a retry");
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record one issued request and how it ended.
pub fn record_attempt(integration: &str, outcome: &str) {
    counter!(
        ATTEMPTS_TOTAL,
        "integration" => integration.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a scheduled retry and its delay.
pub fn record_retry(integration: &str, class: ErrorClass, delay: Duration) {
    counter!(
        RETRIES_TOTAL,
        "integration" => integration.to_string(),
        "error_class" => class.as_str()
    )
    .increment(1);
    histogram!(
        BACKOFF_SECONDS,
        "integration" => integration.to_string(),
        "error_class" => class.as_str()
    )
    .record(delay.as_secs_f64());
}

/// Record the final outcome of an operation.
pub fn record_operation(integration: &str, outcome: &str) {
    counter!(
        OPERATIONS_TOTAL,
        "integration" => integration.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a credential refresh round-trip.
pub fn record_token_refresh(integration: &str, success: bool) {
    counter!(
        TOKEN_REFRESHES_TOTAL,
        "integration" => integration.to_string(),
        "result" => refresh_result_label(success)
    )
    .increment(1);
}

const fn refresh_result_label(success: bool) -> &'static str {
    if success { "success" } else { "failure" }
}

// =============================================================================
// Tests
// =============================================================================
