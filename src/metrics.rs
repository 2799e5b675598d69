//! Prometheus registry for the gateway.
//!
//! All metric families live behind one `GatewayMetrics` handle owned by the
//! application root and threaded into subsystems; nothing registers into a
//! process-global registry. The handle also keeps a small in-process window
//! of recent request latencies backing the `/_metrics` JSON summary.

use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use serde::Serialize;

/// Default request-duration buckets, in seconds.
pub const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0];

const LATENCY_WINDOW: usize = 1024;

pub struct GatewayMetrics {
    registry: Registry,

    pub http_requests_total: IntCounter,
    pub http_requests_by_status: IntCounterVec,
    pub http_request_duration_seconds: Histogram,

    pub rate_limit_hits_total: IntCounter,
    pub rate_limit_allowed_total: IntCounter,

    pub nats_messages_sent_total: IntCounter,
    pub nats_messages_received_total: IntCounter,
    pub nats_publish_failures_total: IntCounter,
    pub nats_connection_status: IntGauge,

    pub ipc_requests_total: IntCounter,

    pub abuse_events_total: IntCounterVec,
    pub abuse_blocked_tenants: IntGauge,

    pub redis_limiter_requests_total: IntCounter,
    pub redis_limiter_allowed_total: IntCounter,
    pub redis_limiter_limited_total: IntCounter,
    pub redis_limiter_errors_total: IntCounter,
    pub redis_limiter_cb_transitions_total: IntCounter,
    pub redis_limiter_cb_state: IntGauge,

    pub spans_dropped_total: IntCounter,

    started_at: Instant,
    latency: Mutex<LatencyWindow>,
    errors_total: IntCounter,
}

struct LatencyWindow {
    samples_ms: Vec<u32>,
    next: usize,
}

impl LatencyWindow {
    fn record(&mut self, ms: u32) {
        if self.samples_ms.len() < LATENCY_WINDOW {
            self.samples_ms.push(ms);
        } else {
            self.samples_ms[self.next] = ms;
            self.next = (self.next + 1) % LATENCY_WINDOW;
        }
    }

    fn percentile(&self, p: u32) -> i64 {
        if self.samples_ms.is_empty() {
            return -1;
        }
        let mut sorted = self.samples_ms.clone();
        sorted.sort_unstable();
        let rank = (p as usize * sorted.len()) / 100;
        sorted[rank.min(sorted.len() - 1)] as i64
    }
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total = IntCounter::with_opts(Opts::new(
            "gateway_http_requests_total",
            "Total number of HTTP requests processed",
        ))?;
        let http_requests_by_status = IntCounterVec::new(
            Opts::new(
                "gateway_http_requests_by_status",
                "Total number of HTTP requests by status class",
            ),
            &["status"],
        )?;
        let http_request_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "gateway_http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;

        let rate_limit_hits_total = IntCounter::with_opts(Opts::new(
            "gateway_rate_limit_hits_total",
            "Total number of rate limit hits",
        ))?;
        let rate_limit_allowed_total = IntCounter::with_opts(Opts::new(
            "gateway_rate_limit_allowed_total",
            "Total number of requests allowed by the rate limiter",
        ))?;

        let nats_messages_sent_total = IntCounter::with_opts(Opts::new(
            "gateway_nats_messages_sent_total",
            "Total number of bus messages sent",
        ))?;
        let nats_messages_received_total = IntCounter::with_opts(Opts::new(
            "gateway_nats_messages_received_total",
            "Total number of bus messages received",
        ))?;
        let nats_publish_failures_total = IntCounter::with_opts(Opts::new(
            "gateway_nats_publish_failures_total",
            "Total number of bus publish failures",
        ))?;
        let nats_connection_status = IntGauge::with_opts(Opts::new(
            "gateway_nats_connection_status",
            "Bus connection status (1=connected, 0=disconnected)",
        ))?;

        let ipc_requests_total = IntCounter::with_opts(Opts::new(
            "gateway_ipc_requests_total",
            "Total number of IPC frames handled",
        ))?;

        let abuse_events_total = IntCounterVec::new(
            Opts::new(
                "gateway_abuse_events_total",
                "Total number of abuse events detected, by type",
            ),
            &["type"],
        )?;
        let abuse_blocked_tenants = IntGauge::with_opts(Opts::new(
            "gateway_abuse_blocked_tenants",
            "Number of currently blocked tenants",
        ))?;

        let redis_limiter_requests_total = IntCounter::with_opts(Opts::new(
            "gateway_redis_rate_limiter_requests_total",
            "Total number of requests checked by the Redis rate limiter",
        ))?;
        let redis_limiter_allowed_total = IntCounter::with_opts(Opts::new(
            "gateway_redis_rate_limiter_requests_allowed_total",
            "Number of requests allowed by the Redis rate limiter",
        ))?;
        let redis_limiter_limited_total = IntCounter::with_opts(Opts::new(
            "gateway_redis_rate_limiter_requests_limited_total",
            "Number of requests limited by the Redis rate limiter",
        ))?;
        let redis_limiter_errors_total = IntCounter::with_opts(Opts::new(
            "gateway_redis_rate_limiter_redis_errors_total",
            "Total number of Redis errors encountered",
        ))?;
        let redis_limiter_cb_transitions_total = IntCounter::with_opts(Opts::new(
            "gateway_redis_rate_limiter_cb_transitions_total",
            "Total number of Redis circuit-breaker state transitions",
        ))?;
        let redis_limiter_cb_state = IntGauge::with_opts(Opts::new(
            "gateway_redis_rate_limiter_cb_state",
            "Redis circuit-breaker state (0=closed, 1=open, 2=half_open)",
        ))?;

        let spans_dropped_total = IntCounter::with_opts(Opts::new(
            "gateway_spans_dropped_total",
            "Spans dropped because the exporter was unavailable or failed",
        ))?;

        let errors_total = IntCounter::with_opts(Opts::new(
            "gateway_http_request_errors_total",
            "Total number of HTTP requests answered with an error envelope",
        ))?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_requests_by_status.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(rate_limit_hits_total.clone()))?;
        registry.register(Box::new(rate_limit_allowed_total.clone()))?;
        registry.register(Box::new(nats_messages_sent_total.clone()))?;
        registry.register(Box::new(nats_messages_received_total.clone()))?;
        registry.register(Box::new(nats_publish_failures_total.clone()))?;
        registry.register(Box::new(nats_connection_status.clone()))?;
        registry.register(Box::new(ipc_requests_total.clone()))?;
        registry.register(Box::new(abuse_events_total.clone()))?;
        registry.register(Box::new(abuse_blocked_tenants.clone()))?;
        registry.register(Box::new(redis_limiter_requests_total.clone()))?;
        registry.register(Box::new(redis_limiter_allowed_total.clone()))?;
        registry.register(Box::new(redis_limiter_limited_total.clone()))?;
        registry.register(Box::new(redis_limiter_errors_total.clone()))?;
        registry.register(Box::new(redis_limiter_cb_transitions_total.clone()))?;
        registry.register(Box::new(redis_limiter_cb_state.clone()))?;
        registry.register(Box::new(spans_dropped_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(GatewayMetrics {
            registry,
            http_requests_total,
            http_requests_by_status,
            http_request_duration_seconds,
            rate_limit_hits_total,
            rate_limit_allowed_total,
            nats_messages_sent_total,
            nats_messages_received_total,
            nats_publish_failures_total,
            nats_connection_status,
            ipc_requests_total,
            abuse_events_total,
            abuse_blocked_tenants,
            redis_limiter_requests_total,
            redis_limiter_allowed_total,
            redis_limiter_limited_total,
            redis_limiter_errors_total,
            redis_limiter_cb_transitions_total,
            redis_limiter_cb_state,
            spans_dropped_total,
            started_at: Instant::now(),
            latency: Mutex::new(LatencyWindow {
                samples_ms: Vec::with_capacity(LATENCY_WINDOW),
                next: 0,
            }),
            errors_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Records one finished HTTP request.
    pub fn record_http_request(&self, status: u16, duration_secs: f64) {
        self.http_requests_total.inc();
        let class = match status {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            _ => "5xx",
        };
        self.http_requests_by_status.with_label_values(&[class]).inc();
        self.http_request_duration_seconds.observe(duration_secs);
        if status >= 400 {
            self.errors_total.inc();
        }
        self.latency
            .lock()
            .unwrap()
            .record((duration_secs * 1000.0) as u32);
    }

    /// JSON operational summary for `GET /_metrics`.
    pub fn json_summary(&self, bus_status: &str) -> serde_json::Value {
        let uptime = self.started_at.elapsed().as_secs_f64().max(1.0);
        let total = self.http_requests_total.get();
        let errors = self.errors_total.get();
        let latency = self.latency.lock().unwrap();

        let summary = MetricsSummary {
            rps: total as f64 / uptime,
            latency: LatencySummary {
                p50: latency.percentile(50),
                p95: latency.percentile(95),
            },
            error_rate: if total > 0 {
                errors as f64 / total as f64
            } else {
                0.0
            },
            rate_limit: RateLimitSummary {
                total_hits: self.rate_limit_hits_total.get()
                    + self.rate_limit_allowed_total.get(),
                total_exceeded: self.rate_limit_hits_total.get(),
            },
            nats: bus_status.to_string(),
            ts: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        // String keys only; serialization cannot fail.
        serde_json::to_value(summary).unwrap()
    }
}

#[derive(Serialize)]
struct MetricsSummary {
    rps: f64,
    latency: LatencySummary,
    error_rate: f64,
    rate_limit: RateLimitSummary,
    nats: String,
    ts: u64,
}

#[derive(Serialize)]
struct LatencySummary {
    p50: i64,
    p95: i64,
}

#[derive(Serialize)]
struct RateLimitSummary {
    total_hits: u64,
    total_exceeded: u64,
}
