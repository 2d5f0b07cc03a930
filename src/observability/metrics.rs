//! Metrics collection and exposition.
//!
//! # Metrics
//! - `http_connections_total` (counter): accepted connections by `tls`
//! - `http_connections_active` (gauge): current connection count
//! - `http_requests_total` (counter): completed requests by protocol, status
//! - `http_request_duration_seconds` (histogram): handler latency by protocol
//! - `http_protocol_errors_total` (counter): rejected input by kind
//! - `websocket_frames_total` (counter): frames by direction
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, which keeps tests and embedders quiet
//! - The Prometheus exporter is only installed by the host binary

use std::net::SocketAddr;
use std::time::Duration;

use http::StatusCode;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Start the Prometheus scrape endpoint on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn connection_opened(tls: bool) {
    ::metrics::counter!("http_connections_total", "tls" => if tls { "true" } else { "false" })
        .increment(1);
    ::metrics::gauge!("http_connections_active").increment(1.0);
}

pub fn connection_closed() {
    ::metrics::gauge!("http_connections_active").decrement(1.0);
}

pub fn request_completed(protocol: &'static str, status: StatusCode, elapsed: Duration) {
    ::metrics::counter!(
        "http_requests_total",
        "protocol" => protocol,
        "status" => status.as_u16().to_string()
    )
    .increment(1);
    ::metrics::histogram!("http_request_duration_seconds", "protocol" => protocol)
        .record(elapsed.as_secs_f64());
}

pub fn protocol_error(kind: &'static str) {
    ::metrics::counter!("http_protocol_errors_total", "kind" => kind).increment(1);
}

pub fn websocket_frame(direction: &'static str) {
    ::metrics::counter!("websocket_frames_total", "direction" => direction).increment(1);
}
