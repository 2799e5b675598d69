//! HTTP request pipeline: routing, admission chain, Router forwarding.

pub mod context;
pub mod error;
pub mod registry;
pub mod routes;
pub mod schema;
pub mod sse;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Instant;

use hyper::{Body, Request, Response};
use serde_json::json;

use crate::abuse::AbuseDetector;
use crate::backpressure::BackpressureProbe;
use crate::bus::router::RouterClient;
use crate::config::GatewayConfig;
use crate::health::HealthRegistry;
use crate::logging::{self, Level};
use crate::metrics::GatewayMetrics;
use crate::rate_limit::RateLimiter;
use crate::tracing_utils::Tracer;

use self::context::RequestContext;
use self::error::GatewayError;
use self::registry::BlockRegistry;
use self::sse::SseBroadcaster;

/// Root application state threaded into every request worker.
pub struct AppState {
    pub config: GatewayConfig,
    pub metrics: Arc<GatewayMetrics>,
    pub tracer: Tracer,
    pub limiter: Arc<dyn RateLimiter>,
    pub router: Arc<RouterClient>,
    pub backpressure: Arc<BackpressureProbe>,
    pub abuse: Arc<AbuseDetector>,
    pub registry: Arc<BlockRegistry>,
    pub sse: Arc<SseBroadcaster>,
    pub health: Arc<HealthRegistry>,
}

pub type RouteResult = Result<Response<Body>, GatewayError>;
pub type RouteFuture<'a> =
    std::pin::Pin<Box<dyn std::future::Future<Output = RouteResult> + Send + 'a>>;
pub type RouteHandler =
    for<'a> fn(Request<Body>, Arc<AppState>, &'a mut RequestContext) -> RouteFuture<'a>;

/// Per-request wrapper around every route handler.
///
/// Builds the request context and server span, runs the handler, converts
/// a rejection into the conflict-contract envelope, finalizes the span on
/// every exit path, and emits the access log record and request metrics.
pub async fn run_route(
    req: Request<Body>,
    handler: RouteHandler,
) -> Result<Response<Body>, GatewayError> {
    use routerify::ext::RequestExt;

    let state = match req.data::<Arc<AppState>>() {
        Some(state) => state.clone(),
        // Data is installed at router build time; reaching here without it
        // is a wiring bug surfaced through the err_handler.
        None => return Err(GatewayError::internal("application state missing")),
    };

    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let client_ip = req.remote_addr().ip().to_string();
    let started = Instant::now();

    let mut ctx = RequestContext::from_request(&req, &state.tracer, client_ip);
    let outcome = handler(req, state.clone(), &mut ctx).await;

    let response = match outcome {
        Ok(response) => response,
        Err(err) => err.into_response(&ctx.ids()),
    };

    let status = response.status().as_u16();
    let elapsed = started.elapsed();
    ctx.finish_span(status);
    state.metrics.record_http_request(status, elapsed.as_secs_f64());

    logging::log_event(
        if method == "GET" && status < 400 {
            Level::Debug
        } else {
            Level::Info
        },
        "c-gateway",
        &format!("{method} {path}"),
        Some(&ctx.ids()),
        Some(json!({
            "stage": "http_request",
            "method": method,
            "path": path,
            "status": status,
            "latency_ms": elapsed.as_millis() as u64,
        })),
    );

    Ok(response)
}
