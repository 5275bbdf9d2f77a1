//! Metrics collection and exposition.
//!
//! # Metrics
//! - `tether_lb_servers` (gauge): ring size per service
//! - `tether_lb_failovers_total` (counter): ring advances per service
//! - `tether_lb_dial_errors_total` (counter): failed dials per service
//! - `tether_lb_connections` (gauge): tracked connections per server address

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

pub fn record_servers(service: &str, count: usize) {
    metrics::gauge!("tether_lb_servers", "service" => service.to_string()).set(count as f64);
}

pub fn record_failover(service: &str) {
    metrics::counter!("tether_lb_failovers_total", "service" => service.to_string()).increment(1);
}

pub fn record_dial_error(service: &str) {
    metrics::counter!("tether_lb_dial_errors_total", "service" => service.to_string()).increment(1);
}

pub fn record_server_connections(server: &str, count: usize) {
    metrics::gauge!("tether_lb_connections", "server" => server.to_string()).set(count as f64);
}

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}
