//! Prometheus metrics for request forwarding.
//!
//! Registered once in the default registry and shared by every component.

use lazy_static::lazy_static;
use prometheus::{Histogram, IntCounter, TextEncoder, register_histogram, register_int_counter};

lazy_static! {
    /// Latency of forwarding calls made by a standby, successful or not.
    pub static ref FORWARD_SECONDS: Histogram = register_histogram!(
        "fwd_client_forward_seconds",
        "Latency of forwarded requests in seconds."
    )
    .unwrap();
    /// Forwarding calls that did not produce a response.
    pub static ref FORWARD_ERRORS_TOTAL: IntCounter = register_int_counter!(
        "fwd_client_forward_errors_total",
        "Total number of failed forwarding calls."
    )
    .unwrap();
    pub static ref SERVER_FORWARDED_REQUESTS_TOTAL: IntCounter = register_int_counter!(
        "fwd_server_forwarded_requests_total",
        "Total number of forwarded requests served by the active node."
    )
    .unwrap();
    pub static ref HEARTBEAT_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "fwd_heartbeat_failures_total",
        "Total number of failed forwarding heartbeats."
    )
    .unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathered_text_names_every_metric() {
        FORWARD_SECONDS.observe(0.01);
        FORWARD_ERRORS_TOTAL.inc_by(0);
        SERVER_FORWARDED_REQUESTS_TOTAL.inc_by(0);
        HEARTBEAT_FAILURES_TOTAL.inc_by(0);

        let text = gather_metrics();
        for name in [
            "fwd_client_forward_seconds",
            "fwd_client_forward_errors_total",
            "fwd_server_forwarded_requests_total",
            "fwd_heartbeat_failures_total",
        ] {
            assert!(text.contains(name), "missing {name}");
        }
    }
}
