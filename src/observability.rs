use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: admission attempts that were granted.
pub const ADMISSIONS_TOTAL: &str = "daypass_admissions_total";

/// Counter: admission attempts rejected. Labels: reason.
pub const ADMISSION_REJECTIONS_TOTAL: &str = "daypass_admission_rejections_total";

/// Histogram: admission decision latency in seconds.
pub const ADMIT_DURATION_SECONDS: &str = "daypass_admit_duration_seconds";

/// Counter: requests rejected by a rate limiter. Labels: purpose.
pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "daypass_rate_limit_rejections_total";

/// Counter: transfer proposals created.
pub const TRANSFERS_CREATED_TOTAL: &str = "daypass_transfers_created_total";

/// Counter: transfer responses processed. Labels: action.
pub const TRANSFER_RESPONSES_TOTAL: &str = "daypass_transfer_responses_total";

/// Counter: transfers rewritten as expired (on touch or by the sweeper).
pub const TRANSFERS_EXPIRED_TOTAL: &str = "daypass_transfers_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: rate-limit windows evicted by cleanup.
pub const RATE_LIMIT_EVICTIONS_TOTAL: &str = "daypass_rate_limit_evictions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
