//! Prometheus metrics and the `/metrics` HTTP endpoint (§4.3).
//!
//! Each service registers one [`ServiceMetrics`] and serves it over `axum`,
//! the same combination the pack's relayer binaries use for their exporter
//! endpoints (see DESIGN.md).

use crate::config::MetricsConfig;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Per-service counters and gauges (§4.3). One instance per running binary;
/// `service_name` is burned into the `info` gauge's label so a shared
/// Prometheus scrape config can distinguish Finder from Validator etc.
#[derive(Clone)]
pub struct ServiceMetrics {
    registry: Registry,
    info: IntGauge,
    cycles_success: IntGauge,
    cycles_failed: IntGauge,
    errors_by_kind: IntCounterVec,
    consecutive_failures: IntGauge,
    last_cycle_timestamp: IntGauge,
    cycle_duration_seconds: Histogram,
    networks_active: IntGaugeVec,
}

impl ServiceMetrics {
    pub fn new(service_name: &str) -> Self {
        let registry = Registry::new();

        let info = IntGauge::with_opts(
            Opts::new("bigbrotr_service_info", "Static service identity")
                .const_label("service", service_name),
        )
        .expect("valid metric");
        info.set(1);

        let cycles_success = IntGauge::with_opts(
            Opts::new("bigbrotr_cycles_success_total", "Successful service cycles")
                .const_label("service", service_name),
        )
        .expect("valid metric");

        let cycles_failed = IntGauge::with_opts(
            Opts::new("bigbrotr_cycles_failed_total", "Failed service cycles")
                .const_label("service", service_name),
        )
        .expect("valid metric");

        let errors_by_kind = IntCounterVec::new(
            Opts::new("bigbrotr_errors_total", "Errors by kind")
                .const_label("service", service_name),
            &["kind"],
        )
        .expect("valid metric");

        let consecutive_failures = IntGauge::with_opts(
            Opts::new(
                "bigbrotr_consecutive_failures",
                "Current consecutive-failure streak",
            )
            .const_label("service", service_name),
        )
        .expect("valid metric");

        let last_cycle_timestamp = IntGauge::with_opts(
            Opts::new(
                "bigbrotr_last_cycle_timestamp_seconds",
                "Unix timestamp of the last completed cycle",
            )
            .const_label("service", service_name),
        )
        .expect("valid metric");

        let cycle_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("bigbrotr_cycle_duration_seconds", "Cycle wall-clock duration")
                .const_label("service", service_name)
                .buckets(vec![
                    0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
                ]),
        )
        .expect("valid metric");

        let networks_active = IntGaugeVec::new(
            Opts::new("bigbrotr_network_concurrency_active", "In-flight probes per network")
                .const_label("service", service_name),
            &["network"],
        )
        .expect("valid metric");

        for c in [
            registry.register(Box::new(info.clone())),
            registry.register(Box::new(cycles_success.clone())),
            registry.register(Box::new(cycles_failed.clone())),
            registry.register(Box::new(errors_by_kind.clone())),
            registry.register(Box::new(consecutive_failures.clone())),
            registry.register(Box::new(last_cycle_timestamp.clone())),
            registry.register(Box::new(cycle_duration_seconds.clone())),
            registry.register(Box::new(networks_active.clone())),
        ] {
            c.expect("metric registration never collides within one ServiceMetrics");
        }

        Self {
            registry,
            info,
            cycles_success,
            cycles_failed,
            errors_by_kind,
            consecutive_failures,
            last_cycle_timestamp,
            cycle_duration_seconds,
            networks_active,
        }
    }

    pub fn record_success(&self, started: Instant, now_unix: i64) {
        self.cycles_success.inc();
        self.consecutive_failures.set(0);
        self.last_cycle_timestamp.set(now_unix);
        self.cycle_duration_seconds
            .observe(started.elapsed().as_secs_f64());
    }

    pub fn record_failure(&self, started: Instant, now_unix: i64, consecutive: u32, kind: &str) {
        self.cycles_failed.inc();
        self.errors_by_kind.with_label_values(&[kind]).inc();
        self.consecutive_failures.set(consecutive as i64);
        self.last_cycle_timestamp.set(now_unix);
        self.cycle_duration_seconds
            .observe(started.elapsed().as_secs_f64());
    }

    pub fn set_network_active(&self, network: &str, count: i64) {
        self.networks_active.with_label_values(&[network]).set(count);
    }

    fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&metric_families, &mut buf)
            .expect("prometheus text encoding never fails");
        String::from_utf8(buf).expect("prometheus text encoder emits valid utf8")
    }
}

async fn metrics_handler(State(metrics): State<Arc<ServiceMetrics>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        metrics.gather(),
    )
}

/// Serves `cfg.path` on `cfg.host:cfg.port` until the process exits. Returns
/// immediately if `cfg.enabled` is false.
pub async fn serve(cfg: &MetricsConfig, metrics: Arc<ServiceMetrics>) -> std::io::Result<()> {
    if !cfg.enabled {
        return Ok(());
    }
    let app = Router::new()
        .route(&cfg.path, get(metrics_handler))
        .with_state(metrics);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    tracing::info!(target: "bigbrotr::metrics", %addr, path = %cfg.path, "metrics endpoint listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_includes_service_label() {
        let m = ServiceMetrics::new("finder");
        let text = m.gather();
        assert!(text.contains("service=\"finder\""));
        assert!(text.contains("bigbrotr_cycles_success_total"));
    }

    #[test]
    fn record_success_resets_consecutive_failures() {
        let m = ServiceMetrics::new("validator");
        m.record_failure(Instant::now(), 1, 3, "probe");
        m.record_success(Instant::now(), 2);
        let text = m.gather();
        assert!(text.contains("bigbrotr_consecutive_failures{service=\"validator\"} 0"));
    }
}
