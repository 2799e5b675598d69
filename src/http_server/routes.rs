//! Route table and handlers.

use std::sync::Arc;

use bytes::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Request, Response, StatusCode};
use prometheus::Encoder;
use routerify::ext::RequestExt;
use routerify::{RouteError, Router, RouterBuilder};
use serde_json::{json, Value};
use tracing::error;

use crate::abuse::ResponseAction;
use crate::backpressure::BackpressureStatus;
use crate::bus::BusError;
use crate::logging;
use crate::rate_limit::{CallerIdentity, Decision, Endpoint};
use crate::tracing_utils::{SpanKind, SpanStatus};

use super::context::RequestContext;
use super::error::{classify_router_reply, GatewayError, RateLimitInfo, RouterOutcome};
use super::registry::{RegistryError, UpsertOutcome};
use super::schema;
use super::{run_route, AppState, RouteFuture, RouteResult};

/// Bodies above this size are rejected before parsing.
const MAX_REQUEST_BODY: usize = 64 * 1024;

const BACKPRESSURE_RETRY_AFTER_SECS: u32 = 30;
const ABUSE_BLOCK_SECS: u64 = 300;

pub fn make_router(state: Arc<AppState>) -> RouterBuilder<Body, GatewayError> {
    Router::builder()
        .data(state)
        .get("/health", |r| run_route(r, handle_health))
        .get("/_health", |r| run_route(r, handle_health))
        .get("/ready", |r| run_route(r, handle_ready))
        .get("/metrics", |r| run_route(r, handle_metrics))
        .get("/_metrics", |r| run_route(r, handle_metrics_json))
        .post("/api/v1/routes/decide", |r| run_route(r, handle_decide))
        .get("/api/v1/routes/decide/:message_id", |r| {
            run_route(r, handle_get_decision)
        })
        .post("/api/v1/messages", |r| run_route(r, handle_message_create))
        .get("/api/v1/messages/stream", |r| {
            run_route(r, handle_message_stream)
        })
        .put("/api/v1/messages/:message_id", |r| {
            run_route(r, handle_message_update)
        })
        .delete("/api/v1/messages/:message_id", |r| {
            run_route(r, handle_message_delete)
        })
        .post("/api/v1/registry/blocks/:type/:version", |r| {
            run_route(r, handle_registry_write)
        })
        .put("/api/v1/registry/blocks/:type/:version", |r| {
            run_route(r, handle_registry_write)
        })
        .delete("/api/v1/registry/blocks/:type/:version", |r| {
            run_route(r, handle_registry_delete)
        })
        .get("/api/v1/extensions/health", |r| {
            run_route(r, handle_extensions_health)
        })
        .get("/api/v1/extensions/circuit-breakers", |r| {
            run_route(r, handle_circuit_breakers)
        })
        .post("/api/v1/policies/dry-run", |r| run_route(r, handle_dry_run))
        .get("/api/v1/policies/:tenant_id/:policy_id/complexity", |r| {
            run_route(r, handle_pipeline_complexity)
        })
        .any(|r| run_route(r, handle_not_found))
        .err_handler(route_error_handler)
}

/// Last-resort conversion for errors that escape `run_route`.
async fn route_error_handler(err: RouteError) -> Response<Body> {
    match err.downcast::<GatewayError>() {
        Ok(gateway_error) => gateway_error.into_response(&Default::default()),
        Err(other) => {
            error!("unhandled error in HTTP pipeline: {other:?}");
            GatewayError::internal("unhandled error").into_response(&Default::default())
        }
    }
}

fn json_response(status: StatusCode, body: &Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(format!("{body}\n")))
        .expect("static response parts are valid")
}

/// Relay of a Router reply body, status already mapped.
fn passthrough_response(status: StatusCode, body: Bytes) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static response parts are valid")
}

async fn read_body(req: Request<Body>) -> Result<Bytes, GatewayError> {
    let body = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| GatewayError::invalid_request(format!("failed to read body: {e}")))?;
    if body.len() > MAX_REQUEST_BODY {
        return Err(GatewayError::invalid_request("request body too large"));
    }
    Ok(body)
}

fn parse_json_object(body: &[u8]) -> Result<Value, GatewayError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|_| GatewayError::invalid_request("invalid JSON"))?;
    if !value.is_object() {
        return Err(GatewayError::invalid_request("expected a JSON object"));
    }
    Ok(value)
}

fn require_tenant(ctx: &RequestContext) -> Result<(), GatewayError> {
    if ctx.tenant_id.is_empty() {
        return Err(GatewayError::invalid_request("missing X-Tenant-ID header"));
    }
    Ok(())
}

fn require_auth(state: &AppState, ctx: &RequestContext) -> Result<(), GatewayError> {
    if state.config.auth_required && !ctx.has_auth_header {
        return Err(GatewayError::unauthorized("missing Authorization header"));
    }
    Ok(())
}

fn endpoint_path(endpoint: Endpoint) -> &'static str {
    match endpoint {
        Endpoint::RoutesDecide => "/api/v1/routes/decide",
        Endpoint::Messages => "/api/v1/messages",
        Endpoint::RegistryBlocks => "/api/v1/registry/blocks",
    }
}

async fn enforce_rate_limit(
    state: &AppState,
    endpoint: Endpoint,
    ctx: &RequestContext,
) -> Result<(), GatewayError> {
    let caller = CallerIdentity {
        tenant_id: (!ctx.tenant_id.is_empty()).then_some(ctx.tenant_id.as_str()),
        api_key: None,
        client_ip: (!ctx.client_ip.is_empty()).then_some(ctx.client_ip.as_str()),
    };
    match state.limiter.check(endpoint, &caller).await {
        Decision::Allowed { .. } => {
            state.metrics.rate_limit_allowed_total.inc();
            Ok(())
        }
        Decision::Exceeded {
            limit,
            retry_after_secs,
            reset_at,
        } => {
            state.metrics.rate_limit_hits_total.inc();
            Err(GatewayError::rate_limited(
                endpoint_path(endpoint),
                RateLimitInfo {
                    limit,
                    remaining: 0,
                    reset_at,
                    retry_after_secs,
                },
            ))
        }
        Decision::Error => Err(GatewayError::unavailable("rate limiter unavailable")),
    }
}

/// Abuse tracking plus the blocklist gate.
fn enforce_abuse_policy(
    state: &AppState,
    ctx: &RequestContext,
    payload_size: usize,
    endpoint: Endpoint,
) -> Result<(), GatewayError> {
    if !state.abuse.enabled() || ctx.tenant_id.is_empty() {
        return Ok(());
    }
    state
        .abuse
        .track_request(&ctx.tenant_id, None, &ctx.client_ip, payload_size);

    if state.abuse.is_tenant_blocked(&ctx.tenant_id) {
        let mut err = GatewayError::rate_limited(
            endpoint_path(endpoint),
            RateLimitInfo {
                limit: 0,
                remaining: 0,
                reset_at: 0,
                retry_after_secs: ABUSE_BLOCK_SECS as u32,
            },
        );
        err.message = "Tenant temporarily blocked due to abuse detection".into();
        return Err(err);
    }

    if let Some(event) = state.abuse.check_patterns(&ctx.tenant_id, payload_size) {
        state
            .abuse
            .log_event(event, &ctx.ids(), endpoint_path(endpoint));
        match state.abuse.response_action(event) {
            ResponseAction::TemporaryBlock => {
                state
                    .abuse
                    .block_tenant(&ctx.tenant_id, std::time::Duration::from_secs(ABUSE_BLOCK_SECS));
                let mut err = GatewayError::rate_limited(
                    endpoint_path(endpoint),
                    RateLimitInfo {
                        limit: 0,
                        remaining: 0,
                        reset_at: 0,
                        retry_after_secs: ABUSE_BLOCK_SECS as u32,
                    },
                );
                err.message = "Tenant temporarily blocked due to abuse detection".into();
                return Err(err);
            }
            // Stricter limits are the rate limiter's concern; logging
            // already happened.
            ResponseAction::RateLimit | ResponseAction::LogOnly => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Liveness, readiness, metrics

fn handle_health<'a>(
    _req: Request<Body>,
    _state: Arc<AppState>,
    _ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        Ok(json_response(
            StatusCode::OK,
            &json!({ "status": "healthy", "timestamp": logging::iso8601_now() }),
        ))
    })
}

fn handle_ready<'a>(
    _req: Request<Body>,
    state: Arc<AppState>,
    _ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        let readiness = state.health.readiness();
        let status = if readiness.healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        Ok(json_response(
            status,
            &json!({ "status": readiness.status_label(), "message": readiness.message }),
        ))
    })
}

fn handle_metrics<'a>(
    _req: Request<Body>,
    state: Arc<AppState>,
    _ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        let encoder = prometheus::TextEncoder::new();
        let mut out = Vec::with_capacity(16 * 1024);
        encoder
            .encode(&state.metrics.registry().gather(), &mut out)
            .map_err(|e| GatewayError::internal(format!("metrics encoding failed: {e}")))?;
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, encoder.format_type())
            .body(Body::from(out))
            .expect("static response parts are valid"))
    })
}

fn handle_metrics_json<'a>(
    _req: Request<Body>,
    state: Arc<AppState>,
    _ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        let summary = state.metrics.json_summary(state.router.status());
        Ok(json_response(StatusCode::OK, &summary))
    })
}

// ---------------------------------------------------------------------------
// Decide pipeline

/// Validates the decide DTO and captures `request_id`/`run_id`.
fn validate_decide_request(body: &Value, ctx: &mut RequestContext) -> Result<(), GatewayError> {
    let version_ok = body.get("version").and_then(Value::as_str) == Some("1");
    let tenant_ok = body.get("tenant_id").map_or(false, Value::is_string);
    let request_id = body.get("request_id").and_then(Value::as_str);
    let task = body.get("task");
    let task_ok = task.map_or(false, |t| {
        t.is_object()
            && t.get("type").map_or(false, Value::is_string)
            && t.get("payload").map_or(false, Value::is_object)
    });

    if !(version_ok && tenant_ok && request_id.is_some() && task_ok) {
        return Err(GatewayError::invalid_request("invalid decide request DTO"));
    }

    ctx.request_id = request_id.unwrap_or_default().to_string();
    if let Some(run_id) = body.get("run_id").and_then(Value::as_str) {
        ctx.run_id = run_id.to_string();
    }
    Ok(())
}

/// Builds the RouteRequest envelope forwarded to the Router. Header-derived
/// identifiers win over body fields.
fn build_route_request(body: &Value, ctx: &RequestContext) -> Value {
    let mut route = serde_json::Map::new();

    if let Some(version) = body.get("version") {
        route.insert("version".into(), version.clone());
    }
    if !ctx.tenant_id.is_empty() {
        route.insert("tenant_id".into(), json!(ctx.tenant_id));
    } else if let Some(tenant) = body.get("tenant_id") {
        route.insert("tenant_id".into(), tenant.clone());
    }
    if let Some(request_id) = body.get("request_id") {
        route.insert("request_id".into(), request_id.clone());
    }
    if !ctx.trace_id.is_empty() {
        route.insert("trace_id".into(), json!(ctx.trace_id));
    } else if let Some(trace) = body.get("trace_id") {
        route.insert("trace_id".into(), trace.clone());
    }
    if let Some(run_id) = body.get("run_id") {
        route.insert("run_id".into(), run_id.clone());
    }

    let mut message = serde_json::Map::new();
    for key in ["message_id", "message_type"] {
        if let Some(value) = body.get(key) {
            if value.is_string() {
                message.insert(key.into(), value.clone());
            }
        }
    }
    for key in ["payload", "metadata"] {
        if let Some(value) = body.get(key) {
            if value.is_object() {
                message.insert(key.into(), value.clone());
            }
        }
    }
    route.insert("message".into(), Value::Object(message));

    if let Some(policy) = body.get("policy_id") {
        if policy.is_string() {
            route.insert("policy_id".into(), policy.clone());
        }
    }
    // Propagate the trace context so Router spans join this trace.
    if let Some(span_ctx) = ctx.span_context() {
        route.insert(
            "traceparent".into(),
            json!(crate::tracing_utils::format_traceparent(&span_ctx)),
        );
    }
    if let Some(context) = body.get("context") {
        if context.is_object() {
            route.insert("context".into(), context.clone());
        }
    }
    if let Some(task) = body.get("task") {
        route.insert("task".into(), task.clone());
    }

    Value::Object(route)
}

/// Forwards a prepared payload over the bus inside a client span.
async fn bus_round_trip(
    state: &AppState,
    ctx: &RequestContext,
    subject: &str,
    call: impl std::future::Future<Output = Result<Bytes, BusError>>,
) -> Result<Bytes, GatewayError> {
    let mut span =
        state
            .tracer
            .start_span("gateway.nats.publish", SpanKind::Client, ctx.span_context().as_ref());
    span.set_attribute("nats.subject", subject);

    let result = call.await;
    span.set_status(if result.is_ok() {
        SpanStatus::Ok
    } else {
        SpanStatus::Error
    });
    span.end();

    result.map_err(|err| match err {
        BusError::Timeout(_) => GatewayError::unavailable("router request timed out"),
        _ => GatewayError::unavailable("router or NATS unavailable"),
    })
}

/// Maps a Router reply onto the HTTP response: success passes through,
/// errors become conflict-contract envelopes, garbage is an internal
/// runtime failure.
fn relay_router_reply(reply: Bytes, ctx: &RequestContext) -> RouteResult {
    match classify_router_reply(&reply) {
        RouterOutcome::Success => Ok(passthrough_response(StatusCode::OK, reply)),
        RouterOutcome::Error {
            status,
            code,
            message,
            intake_error_code,
            conflict,
        } => Err(GatewayError::from_router(
            status,
            code,
            message,
            intake_error_code,
            conflict,
        )),
        RouterOutcome::Unparseable => {
            let snippet = String::from_utf8_lossy(&reply[..reply.len().min(256)]).into_owned();
            logging::log_event(
                logging::Level::Error,
                "c-gateway",
                "router reply was not valid JSON",
                Some(&ctx.ids()),
                Some(json!({ "reply": logging::redact_json_text(&snippet) })),
            );
            Err(GatewayError::from_router(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal".into(),
                "invalid Router response".into(),
                None,
                super::error::ConflictLevel::RouterRuntime,
            ))
        }
    }
}

fn handle_decide<'a>(
    req: Request<Body>,
    state: Arc<AppState>,
    ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        require_auth(&state, ctx)?;
        require_tenant(ctx)?;

        let body = read_body(req).await?;
        if body.is_empty() {
            return Err(GatewayError::invalid_request("empty request body"));
        }

        // Backpressure fast-fail before any limiter or bus traffic.
        if state.backpressure.status().await == BackpressureStatus::Active {
            return Err(GatewayError::service_overloaded(
                BACKPRESSURE_RETRY_AFTER_SECS,
            ));
        }

        enforce_rate_limit(&state, Endpoint::RoutesDecide, ctx).await?;
        enforce_abuse_policy(&state, ctx, body.len(), Endpoint::RoutesDecide)?;

        let parsed = parse_json_object(&body)?;
        validate_decide_request(&parsed, ctx)?;
        let route_request = build_route_request(&parsed, ctx);

        let reply = bus_round_trip(
            &state,
            ctx,
            &state.config.bus.subjects.decide,
            state.router.decide(Bytes::from(route_request.to_string())),
        )
        .await?;

        relay_router_reply(reply, ctx)
    })
}

fn handle_get_decision<'a>(
    req: Request<Body>,
    state: Arc<AppState>,
    ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        let message_id = req
            .param("message_id")
            .cloned()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::invalid_request("missing message_id path parameter"))?;

        if ctx.tenant_id.is_empty() {
            return Err(GatewayError::invalid_request(
                "missing tenant_id for decision lookup",
            ));
        }
        enforce_rate_limit(&state, Endpoint::RoutesDecide, ctx).await?;

        let reply = bus_round_trip(
            &state,
            ctx,
            &state.config.bus.subjects.get_decision,
            state.router.get_decision(&ctx.tenant_id, &message_id),
        )
        .await?;

        let response = relay_router_reply(reply.clone(), ctx)?;
        if response.status() == StatusCode::OK {
            if let Ok(decision) = serde_json::from_slice::<Value>(&reply) {
                state.sse.broadcast(&ctx.tenant_id, "message_created", &decision);
            }
        }
        Ok(response)
    })
}

// ---------------------------------------------------------------------------
// Messages and the SSE stream

fn handle_message_create<'a>(
    req: Request<Body>,
    state: Arc<AppState>,
    ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        require_auth(&state, ctx)?;
        require_tenant(ctx)?;
        enforce_rate_limit(&state, Endpoint::Messages, ctx).await?;

        let body = read_body(req).await?;
        if body.is_empty() {
            return Err(GatewayError::invalid_request("empty body"));
        }
        enforce_abuse_policy(&state, ctx, body.len(), Endpoint::Messages)?;
        let message = parse_json_object(&body)?;

        if let Some(request_id) = message.get("request_id").and_then(Value::as_str) {
            ctx.request_id = request_id.to_string();
        }
        state.sse.broadcast(&ctx.tenant_id, "message_created", &message);
        Ok(json_response(StatusCode::CREATED, &message))
    })
}

fn handle_message_update<'a>(
    req: Request<Body>,
    state: Arc<AppState>,
    ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        let message_id = req
            .param("message_id")
            .cloned()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::invalid_request("missing message_id"))?;
        require_tenant(ctx)?;
        enforce_rate_limit(&state, Endpoint::Messages, ctx).await?;

        let body = read_body(req).await?;
        if body.is_empty() {
            return Err(GatewayError::invalid_request("empty body"));
        }
        let message = parse_json_object(&body)?;

        if let Some(body_id) = message.get("message_id").and_then(Value::as_str) {
            if body_id != message_id {
                return Err(GatewayError::conflict("message_id mismatch with path"));
            }
        }

        state.sse.broadcast(&ctx.tenant_id, "message_updated", &message);
        Ok(json_response(StatusCode::OK, &message))
    })
}

fn handle_message_delete<'a>(
    req: Request<Body>,
    state: Arc<AppState>,
    ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        let message_id = req
            .param("message_id")
            .cloned()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::invalid_request("missing message_id"))?;
        require_tenant(ctx)?;
        enforce_rate_limit(&state, Endpoint::Messages, ctx).await?;

        let event = json!({ "message_id": message_id });
        state.sse.broadcast(&ctx.tenant_id, "message_deleted", &event);
        Ok(json_response(
            StatusCode::OK,
            &json!({ "status": "deleted", "message_id": message_id }),
        ))
    })
}

fn handle_message_stream<'a>(
    req: Request<Body>,
    state: Arc<AppState>,
    _ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        let tenant = req
            .uri()
            .query()
            .and_then(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .find(|(k, _)| k == "tenant_id")
                    .map(|(_, v)| v.into_owned())
            })
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::invalid_request("missing tenant_id"))?;

        let body = state
            .sse
            .register(&tenant)
            .ok_or_else(|| GatewayError::unavailable("subscriber table full"))?;

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("Access-Control-Allow-Origin", "*")
            .body(body)
            .expect("static response parts are valid"))
    })
}

// ---------------------------------------------------------------------------
// Extension registry

fn handle_registry_write<'a>(
    req: Request<Body>,
    state: Arc<AppState>,
    ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        let block_type = req
            .param("type")
            .cloned()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::invalid_request("missing type segment"))?;
        let version = req
            .param("version")
            .cloned()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::invalid_request("empty version"))?;

        enforce_rate_limit(&state, Endpoint::RegistryBlocks, ctx).await?;

        let body = read_body(req).await?;
        let manifest = parse_json_object(&body)?;

        let body_type = manifest.get("type").and_then(Value::as_str);
        let body_version = manifest.get("version").and_then(Value::as_str);
        if body_type != Some(block_type.as_str()) || body_version != Some(version.as_str()) {
            return Err(GatewayError::conflict("type/version mismatch with path"));
        }

        if let Some(capabilities) = manifest.get("capabilities") {
            let ok = capabilities
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false);
            if !ok {
                return Err(GatewayError::invalid_request(
                    "capabilities must be an array of strings",
                ));
            }
        }
        if let Some(metadata) = manifest.get("metadata") {
            if !metadata.is_object() {
                return Err(GatewayError::invalid_request("metadata must be object"));
            }
        }

        let schema_input = manifest.get("schema").and_then(|s| s.get("input"));
        let schema_output = manifest.get("schema").and_then(|s| s.get("output"));
        if !schema::validate_schemas(schema_input, schema_output) {
            return Err(GatewayError::invalid_schema("schema validation failed"));
        }

        let outcome = state
            .registry
            .upsert(&block_type, &version, manifest)
            .map_err(|RegistryError::CapacityReached| {
                GatewayError::internal("registry capacity reached")
            })?;

        let (status, label) = match outcome {
            UpsertOutcome::Created => (StatusCode::CREATED, "created"),
            UpsertOutcome::Updated => (StatusCode::OK, "updated"),
        };
        Ok(json_response(
            status,
            &json!({
                "type": block_type,
                "version": version,
                "status": label,
                "ts": unix_now(),
            }),
        ))
    })
}

fn handle_registry_delete<'a>(
    req: Request<Body>,
    state: Arc<AppState>,
    ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        let block_type = req
            .param("type")
            .cloned()
            .ok_or_else(|| GatewayError::invalid_request("missing type segment"))?;
        let version = req
            .param("version")
            .cloned()
            .ok_or_else(|| GatewayError::invalid_request("empty version"))?;

        enforce_rate_limit(&state, Endpoint::RegistryBlocks, ctx).await?;

        if !state.registry.remove(&block_type, &version) {
            return Err(GatewayError::not_found("block not found"));
        }
        Ok(json_response(
            StatusCode::OK,
            &json!({
                "status": "unregistered",
                "type": block_type,
                "version": version,
                "ts": unix_now(),
            }),
        ))
    })
}

// ---------------------------------------------------------------------------
// Admin passthroughs

fn handle_extensions_health<'a>(
    _req: Request<Body>,
    state: Arc<AppState>,
    ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        let reply = bus_round_trip(
            &state,
            ctx,
            &state.config.bus.subjects.extension_health,
            state.router.extension_health(),
        )
        .await?;
        relay_router_reply(reply, ctx)
    })
}

fn handle_circuit_breakers<'a>(
    _req: Request<Body>,
    state: Arc<AppState>,
    ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        let reply = bus_round_trip(
            &state,
            ctx,
            &state.config.bus.subjects.circuit_breaker_states,
            state.router.circuit_breaker_states(),
        )
        .await?;
        relay_router_reply(reply, ctx)
    })
}

fn handle_dry_run<'a>(
    req: Request<Body>,
    state: Arc<AppState>,
    ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        let body = read_body(req).await?;
        if body.is_empty() {
            return Err(GatewayError::invalid_request("empty request body"));
        }
        let reply = bus_round_trip(
            &state,
            ctx,
            &state.config.bus.subjects.dry_run_pipeline,
            state.router.dry_run_pipeline(body),
        )
        .await?;
        relay_router_reply(reply, ctx)
    })
}

fn handle_pipeline_complexity<'a>(
    req: Request<Body>,
    state: Arc<AppState>,
    ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        let tenant_id = req
            .param("tenant_id")
            .cloned()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::invalid_request("missing tenant_id or policy_id"))?;
        let policy_id = req
            .param("policy_id")
            .cloned()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| GatewayError::invalid_request("missing tenant_id or policy_id"))?;

        let reply = bus_round_trip(
            &state,
            ctx,
            &state.config.bus.subjects.pipeline_complexity,
            state.router.pipeline_complexity(&tenant_id, &policy_id),
        )
        .await?;
        relay_router_reply(reply, ctx)
    })
}

fn handle_not_found<'a>(
    _req: Request<Body>,
    _state: Arc<AppState>,
    _ctx: &'a mut RequestContext,
) -> RouteFuture<'a> {
    Box::pin(async move {
        Err(GatewayError::not_found("route not found"))
    })
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
