//! End-to-end pipeline scenarios against an in-process gateway with the
//! stub bus transport.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::abuse::AbuseDetector;
use crate::backpressure::BackpressureProbe;
use crate::bus::resilience::ResilienceState;
use crate::bus::router::RouterClient;
use crate::config::{
    AbuseConfig, BackpressureConfig, BreakerMode, BusConfig, BusSubjects, GatewayConfig,
    IpcConfig, RateLimitConfig, RateLimitMode, RedisLimiterConfig, ResilienceConfig,
};
use crate::health::HealthRegistry;
use crate::http_server::registry::BlockRegistry;
use crate::http_server::routes::make_router;
use crate::http_server::sse::SseBroadcaster;
use crate::http_server::AppState;
use crate::metrics::GatewayMetrics;
use crate::rate_limit;
use crate::tracing_utils::Tracer;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Method, Request, Response, StatusCode};
use serde_json::{json, Value};

fn test_config() -> GatewayConfig {
    GatewayConfig {
        port: 0,
        health_port: 0,
        auth_required: false,
        rate_limit: RateLimitConfig {
            mode: RateLimitMode::Local,
            window: Duration::from_secs(60),
            routes_decide_limit: 50,
            messages_limit: 100,
            registry_blocks_limit: 200,
            fallback_to_local: true,
        },
        redis_limiter: RedisLimiterConfig {
            url: "redis://localhost:6379".into(),
            window: Duration::from_secs(1),
            global_limit: 1000,
            route_limit_messages: 200,
            pool_size: 4,
            pool_acquire_timeout: Duration::from_millis(10),
            command_timeout: Duration::from_millis(30),
            retries: 2,
            retry_backoff: Duration::from_millis(5),
            breaker_mode: BreakerMode::FailOpen,
            breaker_error_threshold: 5,
            breaker_cooldown: Duration::from_secs(15),
            breaker_half_open_attempts: 2,
        },
        ipc: IpcConfig {
            enabled: false,
            socket_path: "/tmp/beamline-gateway-test.sock".into(),
            max_connections: 8,
            nats_enabled: false,
            request_timeout: Duration::from_secs(1),
        },
        bus: BusConfig {
            url: "nats://localhost:4222".into(),
            subjects: BusSubjects {
                decide: "beamline.router.v1.decide".into(),
                get_decision: "beamline.router.v1.get_decision".into(),
                extension_health: "beamline.router.v1.admin.get_extension_health".into(),
                circuit_breaker_states: "beamline.router.v1.admin.get_circuit_breaker_states"
                    .into(),
                dry_run_pipeline: "beamline.router.v1.admin.dry_run_pipeline".into(),
                pipeline_complexity: "beamline.router.v1.admin.get_pipeline_complexity".into(),
            },
            min_connections: 1,
            max_connections: 4,
            connection_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_secs(60),
            pool_acquire_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_millis(500),
        },
        resilience: ResilienceConfig {
            max_inflight: 32,
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            degraded_threshold: 3,
        },
        backpressure: BackpressureConfig {
            // Nothing listens here; the probe keeps its cached Inactive.
            router_metrics_url: "http://127.0.0.1:9/_metrics".into(),
            check_interval: Duration::from_secs(600),
            fetch_timeout: Duration::from_millis(50),
        },
        abuse: AbuseConfig {
            enabled: false,
            min_payload_size: 2,
            large_payload_threshold: 524_288,
            large_payload_ratio_threshold: 80,
            targeted_tenant_rate_threshold: 500,
            evasion_api_keys_threshold: 10,
            evasion_ips_threshold: 10,
            multi_tenant_active_threshold: 20,
            retention_window: Duration::from_secs(300),
        },
        otlp_endpoint: None,
        audit_log_path: None,
    }
}

async fn start_gateway(
    mutate: impl FnOnce(&mut GatewayConfig),
) -> (SocketAddr, Arc<AppState>) {
    let mut config = test_config();
    mutate(&mut config);

    let metrics = Arc::new(GatewayMetrics::new().unwrap());
    let resilience = Arc::new(ResilienceState::new(config.resilience.clone()));
    let router_client = Arc::new(RouterClient::new(
        config.bus.clone(),
        resilience.clone(),
        metrics.clone(),
        true,
    ));
    router_client.warm_up().await;

    let limiter = rate_limit::build(&config.rate_limit, &config.redis_limiter, metrics.clone());
    let health = Arc::new(HealthRegistry::new());

    let state = Arc::new(AppState {
        metrics: metrics.clone(),
        tracer: Tracer::disabled(metrics.spans_dropped_total.clone()),
        limiter,
        router: router_client,
        backpressure: BackpressureProbe::new(config.backpressure.clone()),
        abuse: Arc::new(AbuseDetector::new(config.abuse.clone(), metrics.clone())),
        registry: Arc::new(BlockRegistry::new()),
        sse: Arc::new(SseBroadcaster::new()),
        health,
        config,
    });

    let router = make_router(state.clone()).build().unwrap();
    let service = routerify::RouterService::new(router).unwrap();
    let server = hyper::Server::bind(&([127, 0, 0, 1], 0).into()).serve(service);
    let addr = server.local_addr();
    tokio::spawn(server);

    (addr, state)
}

fn decide_body() -> Value {
    json!({
        "version": "1",
        "tenant_id": "t",
        "request_id": "r1",
        "task": { "type": "t", "payload": {} }
    })
}

async fn post_decide(addr: SocketAddr, tenant: Option<&str>, body: &Value) -> Response<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{addr}/api/v1/routes/decide"))
        .header("content-type", "application/json");
    if let Some(tenant) = tenant {
        builder = builder.header("X-Tenant-ID", tenant);
    }
    Client::new()
        .request(builder.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap()
}

async fn body_json(response: Response<Body>) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn decide_round_trip_returns_the_bus_reply() {
    let (addr, state) = start_gateway(|_| {}).await;

    let response = post_decide(addr, Some("t"), &decide_body()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;
    assert_eq!(value["provider_id"], "provider-1");
    assert_eq!(value["reason"], "stub");
    assert_eq!(value["expected_latency_ms"], 42);

    assert_eq!(state.metrics.http_requests_total.get(), 1);
    assert_eq!(
        state
            .metrics
            .http_request_duration_seconds
            .get_sample_count(),
        1
    );
    assert_eq!(state.metrics.nats_messages_sent_total.get(), 1);
}

#[tokio::test]
async fn missing_tenant_header_is_a_request_gateway_rejection() {
    let (addr, _state) = start_gateway(|_| {}).await;

    let response = post_decide(addr, None, &decide_body()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let value = body_json(response).await;
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "invalid_request");
    assert_eq!(value["error"]["intake_error_code"], Value::Null);
    assert!(value["context"]["request_id"].is_string());
    assert!(value["context"]["trace_id"].is_string());
    assert_eq!(value["context"]["tenant_id"], "");
}

#[tokio::test]
async fn auth_required_rejects_before_tenant_validation() {
    let (addr, _state) = start_gateway(|c| c.auth_required = true).await;

    // Neither Authorization nor X-Tenant-ID: the auth guard must win.
    let response = post_decide(addr, None, &decide_body()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn rate_limit_exceeded_after_the_window_allowance() {
    let limit = 3u32;
    let (addr, state) = start_gateway(|c| c.rate_limit.routes_decide_limit = limit).await;

    for _ in 0..limit {
        let response = post_decide(addr, Some("t"), &decide_body()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = post_decide(addr, Some("t"), &decide_body()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response.headers().get("X-RateLimit-Remaining").unwrap(),
        "0"
    );
    assert_eq!(response.headers().get("X-RateLimit-Limit").unwrap(), "3");
    let retry_after: u32 = response
        .headers()
        .get("Retry-After")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);

    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], "rate_limit_exceeded");

    assert_eq!(state.metrics.rate_limit_allowed_total.get(), limit as u64);
    assert_eq!(state.metrics.rate_limit_hits_total.get(), 1);
}

async fn spawn_router_metrics_stub(text: &'static str) -> SocketAddr {
    let make_service = make_service_fn(move |_| async move {
        Ok::<_, Infallible>(service_fn(move |_req| async move {
            Ok::<_, Infallible>(Response::new(Body::from(text)))
        }))
    });
    let server = hyper::Server::bind(&([127, 0, 0, 1], 0).into()).serve(make_service);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

#[tokio::test]
async fn active_backpressure_short_circuits_to_503() {
    let metrics_addr =
        spawn_router_metrics_stub("router_intake_backpressure_active 1\n").await;
    let (addr, state) = start_gateway(|c| {
        c.backpressure.router_metrics_url = format!("http://{metrics_addr}/_metrics");
        c.backpressure.check_interval = Duration::from_millis(1);
    })
    .await;

    let response = post_decide(addr, Some("t"), &decide_body()).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers().get("Retry-After").unwrap(), "30");
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], "service_overloaded");

    // The bus was never contacted.
    assert_eq!(state.router.pool_stats().total_acquired, 0);
    assert_eq!(state.metrics.nats_messages_sent_total.get(), 0);
}

#[tokio::test]
async fn readiness_reports_failing_critical_checks() {
    let (addr, state) = start_gateway(|_| {}).await;
    state.health.register("nats_connection", true, || false);

    let response = Client::new()
        .request(
            Request::builder()
                .method(Method::GET)
                .uri(format!("http://{addr}/ready"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let value = body_json(response).await;
    assert_eq!(value["status"], "unhealthy");
    assert_eq!(value["message"], "Not ready: 1 critical checks failing");
}

#[tokio::test]
async fn liveness_is_always_healthy() {
    let (addr, _state) = start_gateway(|_| {}).await;
    for path in ["/health", "/_health"] {
        let response = Client::new()
            .request(
                Request::builder()
                    .uri(format!("http://{addr}{path}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["status"], "healthy");
        assert!(value["timestamp"].is_string());
    }
}

#[tokio::test]
async fn prometheus_exposition_contains_request_counters() {
    let (addr, _state) = start_gateway(|_| {}).await;
    post_decide(addr, Some("t"), &decide_body()).await;

    let response = Client::new()
        .request(
            Request::builder()
                .uri(format!("http://{addr}/metrics"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(
        hyper::body::to_bytes(response.into_body())
            .await
            .unwrap()
            .to_vec(),
    )
    .unwrap();
    assert!(text.contains("gateway_http_requests_total 1"));
    assert!(text.contains("gateway_http_request_duration_seconds_count 1"));
    assert!(text.contains("gateway_nats_messages_sent_total 1"));
}

#[tokio::test]
async fn json_metrics_summary_reports_bus_state() {
    let (addr, _state) = start_gateway(|_| {}).await;
    let response = Client::new()
        .request(
            Request::builder()
                .uri(format!("http://{addr}/_metrics"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let value = body_json(response).await;
    assert_eq!(value["nats"], "stub");
    assert!(value["latency"].is_object());
    assert!(value["rate_limit"].is_object());
}

#[tokio::test]
async fn registry_write_validate_and_delete() {
    let (addr, _state) = start_gateway(|_| {}).await;
    let client = Client::new();
    let base = format!("http://{addr}/api/v1/registry/blocks/summarize/1.0.0");

    let manifest = json!({
        "type": "summarize",
        "version": "1.0.0",
        "capabilities": ["text"],
        "schema": {
            "input": { "type": "object", "properties": { "text": { "type": "string" } } },
            "output": { "type": "object" }
        }
    });

    // Create.
    let response = client
        .request(
            Request::builder()
                .method(Method::POST)
                .uri(&base)
                .body(Body::from(manifest.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let value = body_json(response).await;
    assert_eq!(value["status"], "created");

    // Update.
    let response = client
        .request(
            Request::builder()
                .method(Method::PUT)
                .uri(&base)
                .body(Body::from(manifest.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Path/body mismatch is a conflict.
    let response = client
        .request(
            Request::builder()
                .method(Method::PUT)
                .uri(format!(
                    "http://{addr}/api/v1/registry/blocks/summarize/2.0.0"
                ))
                .body(Body::from(manifest.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], "conflict");

    // Bad schema is rejected.
    let bad = json!({
        "type": "summarize",
        "version": "1.0.0",
        "schema": { "input": { "type": "bogus" }, "output": { "type": "object" } }
    });
    let response = client
        .request(
            Request::builder()
                .method(Method::POST)
                .uri(&base)
                .body(Body::from(bad.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], "invalid_schema");

    // Delete, then the block is gone.
    let response = client
        .request(
            Request::builder()
                .method(Method::DELETE)
                .uri(&base)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = client
        .request(
            Request::builder()
                .method(Method::DELETE)
                .uri(&base)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn message_events_reach_sse_subscribers() {
    use hyper::body::HttpBody;

    let (addr, _state) = start_gateway(|_| {}).await;
    let client = Client::new();

    // Subscribe first.
    let mut stream = client
        .request(
            Request::builder()
                .uri(format!(
                    "http://{addr}/api/v1/messages/stream?tenant_id=acme"
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(stream.status(), StatusCode::OK);
    assert_eq!(
        stream.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let first = stream.body_mut().data().await.unwrap().unwrap();
    assert_eq!(&first[..], b": connected\n\n");

    // Publish a message for the tenant.
    let response = client
        .request(
            Request::builder()
                .method(Method::POST)
                .uri(format!("http://{addr}/api/v1/messages"))
                .header("X-Tenant-ID", "acme")
                .body(Body::from(json!({ "message_id": "m1" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let event = stream.body_mut().data().await.unwrap().unwrap();
    let text = String::from_utf8(event.to_vec()).unwrap();
    assert!(text.starts_with("event: message_created\n"));
    assert!(text.contains("\"message_id\":\"m1\""));
}

#[tokio::test]
async fn message_update_enforces_id_match_and_broadcasts() {
    use hyper::body::HttpBody;

    let (addr, _state) = start_gateway(|_| {}).await;
    let client = Client::new();

    let mut stream = client
        .request(
            Request::builder()
                .uri(format!("http://{addr}/api/v1/messages/stream?tenant_id=t"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let _ = stream.body_mut().data().await;

    // Mismatched id is a conflict.
    let response = client
        .request(
            Request::builder()
                .method(Method::PUT)
                .uri(format!("http://{addr}/api/v1/messages/m1"))
                .header("X-Tenant-ID", "t")
                .body(Body::from(json!({ "message_id": "other" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Delete emits its event.
    let response = client
        .request(
            Request::builder()
                .method(Method::DELETE)
                .uri(format!("http://{addr}/api/v1/messages/m1"))
                .header("X-Tenant-ID", "t")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let event = stream.body_mut().data().await.unwrap().unwrap();
    let text = String::from_utf8(event.to_vec()).unwrap();
    assert!(text.starts_with("event: message_deleted\n"));
}

#[tokio::test]
async fn admin_passthroughs_answer_from_the_bus() {
    let (addr, _state) = start_gateway(|_| {}).await;
    let client = Client::new();

    let response = client
        .request(
            Request::builder()
                .uri(format!("http://{addr}/api/v1/extensions/health"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;
    assert!(value["health"].is_object());

    let response = client
        .request(
            Request::builder()
                .method(Method::POST)
                .uri(format!("http://{addr}/api/v1/policies/dry-run"))
                .body(Body::from(json!({ "policy": "p" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = client
        .request(
            Request::builder()
                .uri(format!("http://{addr}/api/v1/policies/t1/p1/complexity"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;
    assert!(value["complexity"].is_object());
}

#[tokio::test]
async fn unknown_routes_get_the_error_envelope() {
    let (addr, _state) = start_gateway(|_| {}).await;
    let response = Client::new()
        .request(
            Request::builder()
                .uri(format!("http://{addr}/api/v1/nope"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let value = body_json(response).await;
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "not_found");
    assert!(value["context"].is_object());
}

#[tokio::test]
async fn malformed_decide_body_is_invalid_request() {
    let (addr, _state) = start_gateway(|_| {}).await;

    // Valid JSON, wrong shape.
    let response = post_decide(addr, Some("t"), &json!({ "version": "2" })).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], "invalid_request");

    // Not JSON at all.
    let response = Client::new()
        .request(
            Request::builder()
                .method(Method::POST)
                .uri(format!("http://{addr}/api/v1/routes/decide"))
                .header("X-Tenant-ID", "t")
                .body(Body::from("{{{"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
