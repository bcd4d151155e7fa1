//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase with the `metrics` crate's
//! macros. This module installs the Prometheus exporter and registers
//! human-readable descriptions for each metric.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests sharing
/// a process). Recording still works — the macros route to whichever
/// recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    // -- Request path --
    describe_counter!("vastmux_requests_total", "Requests by dispatch outcome");
    describe_histogram!(
        "vastmux_request_duration_seconds",
        "Time from request arrival to upstream response headers"
    );
    describe_gauge!(
        "vastmux_active_requests",
        "In-flight client requests across all backends"
    );
    describe_gauge!(
        "vastmux_sticky_percent",
        "Share of recent requests presenting the sticky header (-1 = none seen)"
    );

    // -- Fleet --
    describe_gauge!("vastmux_tracked_instances", "Instances tracked by the watcher");
    describe_gauge!("vastmux_backends_total", "Backends registered with the balancer");
    describe_gauge!("vastmux_backend_healthy", "Per-backend health (1 = healthy)");
    describe_counter!(
        "vastmux_poll_failures_total",
        "Control-plane polls that failed"
    );
    describe_counter!(
        "vastmux_events_dropped_total",
        "Lifecycle events dropped on full subscriber sinks"
    );
    describe_counter!(
        "vastmux_tunnel_failures_total",
        "Tunnel creation attempts that failed"
    );
    describe_counter!("vastmux_aborts_total", "Abort fan-outs delivered per backend");

    // -- Accelerators --
    describe_gauge!("vastmux_gpu_utilization", "Per-GPU utilization percent");
    describe_gauge!("vastmux_gpu_temperature", "Per-GPU temperature in °C");
}
