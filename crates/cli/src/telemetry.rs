//! Logging and metrics setup for the binary.

use std::net::SocketAddr;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "INFORMA_LOG";
const METRICS_ENV: &str = "INFORMA_METRICS_ADDR";

/// Filter directives, falling back to `info` when unset or unparsable.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// `Ok(None)` when no exporter is requested.
fn metrics_addr(raw: Option<&str>) -> Result<Option<SocketAddr>, String> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s.parse().map(Some).map_err(|_| s.to_string()),
    }
}

/// Logs go to stderr so `-o json` output on stdout stays machine-readable.
pub fn init_tracing() {
    let env = std::env::var(LOG_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(env.as_deref()))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Install the Prometheus exporter when `INFORMA_METRICS_ADDR` names a socket.
pub fn init_metrics() {
    let raw = std::env::var(METRICS_ENV).ok();
    match metrics_addr(raw.as_deref()) {
        Ok(None) => {}
        Ok(Some(sock)) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(()) => info!(addr = %sock, "telemetry: Prometheus exporter listening"),
            Err(e) => warn!(error = %e, "telemetry: failed to install metrics exporter"),
        },
        Err(bad) => warn!(addr = %bad, env = METRICS_ENV, "telemetry: invalid address; expected host:port"),
    }
}
