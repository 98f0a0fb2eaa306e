//! Tracing Setup
//!
//! One subscriber for the whole process: `RUST_LOG` filtering, compact
//! console output, and span export over OTLP when an endpoint is configured.
//!
//! # Environment Variables
//!
//! - `OTEL_ENABLED`: "false" turns span export off (default: on)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: collector address (default: http://localhost:4317)
//! - `OTEL_SERVICE_NAME`: reported service name (default: custodian-gateway)

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const SERVICE_NAME: &str = "custodian-gateway";
const OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Crate and HTTP-stack levels layered over `RUST_LOG`.
const BASE_DIRECTIVES: [&str; 3] = ["custodian_gateway=info", "reqwest=warn", "hyper=warn"];

/// Errors from telemetry setup.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A filter directive did not parse.
    #[error("invalid filter directive '{directive}': {message}")]
    Directive {
        /// The offending directive.
        directive: &'static str,
        /// Parser message.
        message: String,
    },

    /// The OTLP exporter could not be built.
    #[error("failed to create OTLP exporter: {0}")]
    Exporter(String),

    /// A global subscriber is already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Flushes and stops span export when dropped. Hold it for the life of `main`.
pub struct TelemetryGuard(Option<SdkTracerProvider>);

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("span exporter shutdown failed: {e}");
        }
    }
}

/// Where spans go and under which service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Collector endpoint; `None` keeps spans local.
    pub otlp_endpoint: Option<String>,
    /// Reported service name.
    pub service_name: String,
}

impl TelemetryConfig {
    /// Read `OTEL_*` variables from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read `OTEL_*` variables through `lookup`.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let exporting = lookup("OTEL_ENABLED").is_none_or(|v| !v.eq_ignore_ascii_case("false"));

        Self {
            otlp_endpoint: exporting.then(|| {
                lookup("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|| OTLP_ENDPOINT.to_string())
            }),
            service_name: lookup("OTEL_SERVICE_NAME").unwrap_or_else(|| SERVICE_NAME.to_string()),
        }
    }
}

/// Install the global subscriber using `OTEL_*` from the environment.
///
/// # Errors
///
/// See [`install`].
pub fn init() -> Result<TelemetryGuard, TelemetryError> {
    install(&TelemetryConfig::from_env())
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns `TelemetryError` if the exporter cannot be built or a global
/// subscriber is already set.
pub fn install(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let provider = config
        .otlp_endpoint
        .as_deref()
        .map(|endpoint| tracer_provider(endpoint, &config.service_name))
        .transpose()?;

    let otel_layer = provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(build_filter()?)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    Ok(TelemetryGuard(provider))
}

fn tracer_provider(endpoint: &str, service_name: &str) -> Result<SdkTracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_string())
                .build(),
        )
        .build())
}

fn build_filter() -> Result<EnvFilter, TelemetryError> {
    BASE_DIRECTIVES
        .iter()
        .try_fold(EnvFilter::from_default_env(), |filter, &directive| {
            let parsed = directive
                .parse::<Directive>()
                .map_err(|e| TelemetryError::Directive {
                    directive,
                    message: e.to_string(),
                })?;
            Ok(filter.add_directive(parsed))
        })
}
