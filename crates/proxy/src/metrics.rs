use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static ENGINE_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static OWNERSHIP_DENIALS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static PARTITION_TAGS_CREATED_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static RATE_LIMITED_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static AUDIT_WRITE_FAILURES_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static IDENTITY_FALLBACKS_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("pmos_proxy_http_requests_total", "Proxy HTTP request count."),
                &["route", "method", "status"],
            )
            .expect("create pmos_proxy_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "pmos_proxy_http_request_duration_seconds",
                    "Proxy HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create pmos_proxy_http_request_duration_seconds"),
        )
    })
}

fn engine_calls_total() -> &'static IntCounterVec {
    ENGINE_CALLS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "pmos_proxy_engine_calls_total",
                    "Forwarded engine call count.",
                ),
                &["operation", "outcome"],
            )
            .expect("create pmos_proxy_engine_calls_total"),
        )
    })
}

fn ownership_denials_total() -> &'static IntCounterVec {
    OWNERSHIP_DENIALS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "pmos_proxy_ownership_denials_total",
                    "Write-path ownership denials.",
                ),
                &["action"],
            )
            .expect("create pmos_proxy_ownership_denials_total"),
        )
    })
}

fn partition_tags_created_total() -> &'static IntCounter {
    PARTITION_TAGS_CREATED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "pmos_proxy_partition_tags_created_total",
                "Partition tags created on the engine.",
            )
            .expect("create pmos_proxy_partition_tags_created_total"),
        )
    })
}

fn rate_limited_total() -> &'static IntCounter {
    RATE_LIMITED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "pmos_proxy_rate_limited_total",
                "Requests rejected by the per-workspace rate limiter.",
            )
            .expect("create pmos_proxy_rate_limited_total"),
        )
    })
}

fn audit_write_failures_total() -> &'static IntCounter {
    AUDIT_WRITE_FAILURES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "pmos_proxy_audit_write_failures_total",
                "Audit events that could not be persisted.",
            )
            .expect("create pmos_proxy_audit_write_failures_total"),
        )
    })
}

fn identity_fallbacks_total() -> &'static IntCounter {
    IDENTITY_FALLBACKS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "pmos_proxy_identity_fallbacks_total",
                "Times the service identity was substituted after a provisioning failure.",
            )
            .expect("create pmos_proxy_identity_fallbacks_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_engine_call(operation: &str, outcome: &str) {
    engine_calls_total()
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn inc_ownership_denial(action: &str) {
    ownership_denials_total().with_label_values(&[action]).inc();
}

pub fn inc_partition_tag_created() {
    partition_tags_created_total().inc();
}

pub fn inc_rate_limited() {
    rate_limited_total().inc();
}

pub fn inc_audit_write_failure() {
    audit_write_failures_total().inc();
}

pub fn inc_identity_fallback() {
    identity_fallbacks_total().inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = audit_write_failures_total();
    let _ = identity_fallbacks_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
