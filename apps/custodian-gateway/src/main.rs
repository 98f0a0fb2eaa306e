//! Custodian Gateway Probe
//!
//! Fetches a token and issues one GET through the operation envelope, then
//! prints the JSON reply. Useful for checking credentials and retry settings
//! against a real custodian.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin custodian-gateway
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `CUSTODIAN_BASE_URL`: API base URL
//! - `CUSTODIAN_TOKEN_URL`: OAuth2 token endpoint
//! - `CUSTODIAN_CLIENT_ID`: OAuth2 client id
//! - `CUSTODIAN_CLIENT_SECRET`: OAuth2 client secret
//!
//! ## Optional
//! - `CUSTODIAN_NAME`: Integration name and env prefix (default: custodian)
//! - `CUSTODIAN_SCOPE`: OAuth2 scope
//! - `CUSTODIAN_REQUEST_TIMEOUT_MS`: HTTP timeout (default: 30000)
//! - `CUSTODIAN_PROBE_PATH`: Path to GET (default: /)
//! - `<PREFIX>_MAX_ATTEMPTS`, `<PREFIX>_BASE_BACKOFF_MS`, ...: envelope overrides,
//!   falling back to `ENVELOPE_*`
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: custodian-gateway)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use anyhow::Context;
use custodian_gateway::infrastructure::telemetry;
use custodian_gateway::{
    ClientCredentialsRefresher, Clock, CustodianHttpClient, GatewayConfig, OperationEnvelope,
    SystemClock, TokenCache, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let _telemetry_guard = telemetry::init().context("initializing telemetry")?;

    tracing::info!("Starting Custodian Gateway probe");

    let metrics_handle = init_metrics().context("initializing metrics")?;

    let config = GatewayConfig::from_env().context("loading configuration")?;
    log_config(&config);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let refresher = ClientCredentialsRefresher::from_settings(&config.custodian, Arc::clone(&clock))
        .context("building token refresher")?;

    let token_cache = Arc::new(TokenCache::with_clock(
        config.custodian.name.clone(),
        Arc::new(refresher),
        Arc::clone(&clock),
        config.envelope.token_safety_margin,
    ));
    let envelope = Arc::new(OperationEnvelope::new(
        token_cache,
        config.envelope.envelope_config(),
    ));
    let client = CustodianHttpClient::from_settings(&config.custodian, envelope, clock)
        .context("building custodian client")?
        .with_max_attempts(config.envelope.max_attempts);

    let shutdown_token = CancellationToken::new();
    tokio::spawn(await_shutdown(shutdown_token.clone()));

    let probe_path = config.custodian.probe_path.as_str();
    let outcome = tokio::select! {
        biased;
        () = shutdown_token.cancelled() => {
            tracing::warn!("Probe cancelled before completion");
            None
        }
        result = client.get::<serde_json::Value>(probe_path) => Some(result),
    };

    tracing::debug!(metrics = %metrics_handle.render(), "Final metrics");

    match outcome {
        Some(Ok(body)) => {
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Some(Err(failure)) => Err(failure).context(format!("probe GET {probe_path}")),
        None => Ok(()),
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        integration = %config.custodian.name,
        base_url = %config.custodian.base_url,
        max_attempts = config.envelope.max_attempts,
        attempt_ceiling = config.envelope.attempt_ceiling,
        "Configuration loaded"
    );
    tracing::debug!(
        token_url = %config.custodian.token_url,
        base_backoff_ms = config.envelope.base_backoff.as_millis(),
        max_backoff_ms = config.envelope.max_backoff.as_millis(),
        safety_margin_ms = config.envelope.token_safety_margin.as_millis(),
        "Envelope settings"
    );
}

/// Load .env from the current directory or the nearest ancestor.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Cancel the probe on Ctrl+C or SIGTERM.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, cancelling probe");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, cancelling probe");
        }
    }

    shutdown_token.cancel();
}
