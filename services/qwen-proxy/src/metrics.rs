//! Dispatch-path counters
//!
//! Emitted through the `metrics` facade; a recorder is optional: without
//! one installed these are no-ops, which is exactly right for tests.

/// Record a completed proxied chat request.
pub fn record_request(status: u16, streamed: bool) {
    metrics::counter!(
        "proxy_requests_total",
        "status" => status.to_string(),
        "mode" => if streamed { "stream" } else { "buffered" },
    )
    .increment(1);
}

/// Record an upstream failure by coarse classification.
pub fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type).increment(1);
}
