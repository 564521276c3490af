use lazy_static::lazy_static;
use prometheus::{
    Counter, Gauge, Histogram, IntCounterVec, register_counter, register_gauge,
    register_histogram, register_int_counter_vec,
};


lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("gateway_requests_total", "Total number of proxy requests").unwrap();
    pub static ref RESPONSES: IntCounterVec = register_int_counter_vec!(
        "gateway_responses_total",
        "Proxy responses by HTTP status",
        &["status"]
    )
    .unwrap();
    pub static ref AUTH_FAILURES: Counter =
        register_counter!("gateway_auth_failures_total", "Requests rejected by the credential check").unwrap();
    pub static ref RATE_LIMITED: Counter =
        register_counter!("gateway_rate_limited_total", "Requests rejected by the rate limiter").unwrap();
    pub static ref UPSTREAM_ERRORS: Counter =
        register_counter!("gateway_upstream_errors_total", "Failed upstream calls").unwrap();
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "gateway_request_latency_seconds",
        "Time to first response byte in seconds"
    )
    .unwrap();
    pub static ref TRACKED_KEYS: Gauge =
        register_gauge!("gateway_rate_limit_keys", "Rate limit records currently held").unwrap();
    pub static ref ACTIVE_STREAMS: Gauge =
        register_gauge!("gateway_active_streams", "Streaming responses in flight").unwrap();
}

pub fn render() -> Result<String, String> {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}
