use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder for the metrics facade.
///
/// Must run before any counters are touched; repeated calls (tests) are
/// no-ops and the first installed handle keeps serving `/metrics`.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    if metrics::set_global_recorder(recorder).is_err() {
        return Ok(handle);
    }

    let _ = PROMETHEUS_HANDLE.set(handle.clone());
    tracing::info!("Prometheus metrics recorder installed");
    Ok(handle)
}

pub mod sip {
    /// Increment for every admitted SIP request
    pub fn request(method: &str, tenant_id: &str) {
        metrics::counter!(
            "sip_requests_total",
            "method" => method.to_string(),
            "tenant_id" => tenant_id.to_string()
        )
        .increment(1);
    }

    /// Record a response the proxy sent or relayed upstream
    pub fn response(method: &str, status: &str) {
        metrics::counter!(
            "sip_responses_total",
            "method" => method.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
    }

    /// Set the current number of tracked active calls
    pub fn set_active_calls(count: usize) {
        metrics::gauge!("sip_active_calls").set(count as f64);
    }
}

pub mod billing {
    /// Increment when a per-second deduction fails
    pub fn deduction_error() {
        metrics::counter!("billing_deduction_errors_total").increment(1);
    }
}

pub mod firewall {
    /// Increment when a request is silently dropped at admission
    pub fn blocked() {
        metrics::counter!("firewall_blocks_total").increment(1);
    }

    /// Increment when an IP crosses the failed-auth threshold
    pub fn blacklisted() {
        metrics::counter!("sip_firewall_blacklisted_total").increment(1);
    }
}
