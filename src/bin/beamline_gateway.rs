//!
//! Beamline API gateway: HTTP admission and Router forwarding over the bus.
//!
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use beamline_gateway::abuse::AbuseDetector;
use beamline_gateway::audit_log::AuditLog;
use beamline_gateway::backpressure::BackpressureProbe;
use beamline_gateway::bus::resilience::{ConnectionState, ResilienceState};
use beamline_gateway::bus::router::RouterClient;
use beamline_gateway::config::GatewayConfig;
use beamline_gateway::health::{spawn_health_server, HealthRegistry};
use beamline_gateway::http_server::registry::BlockRegistry;
use beamline_gateway::http_server::sse::SseBroadcaster;
use beamline_gateway::http_server::{routes, AppState};
use beamline_gateway::ipc::bridge::BusBridge;
use beamline_gateway::metrics::GatewayMetrics;
use beamline_gateway::rate_limit;
use beamline_gateway::tcp_listener;
use beamline_gateway::tracing_utils::Tracer;
use beamline_gateway::{ipc, logging};
use clap::{Arg, Command};
use tracing::info;

const AUDIT_GATEWAY_STARTED: u32 = 1;
const AUDIT_GATEWAY_STOPPED: u32 = 2;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let arg_matches = cli().get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = GatewayConfig::from_env()?;
    if let Some(port) = arg_matches.get_one::<String>("port") {
        config.port = port.parse()?;
    }
    if let Some(port) = arg_matches.get_one::<String>("health-port") {
        config.health_port = port.parse()?;
    }
    if let Some(path) = arg_matches.get_one::<String>("ipc-socket") {
        config.ipc.socket_path = path.into();
    }

    let metrics = Arc::new(GatewayMetrics::new()?);
    let tracer = match &config.otlp_endpoint {
        Some(endpoint) => Tracer::with_otlp_exporter(
            endpoint.clone(),
            "beamline-gateway".to_string(),
            metrics.spans_dropped_total.clone(),
        ),
        None => Tracer::disabled(metrics.spans_dropped_total.clone()),
    };

    let audit = match &config.audit_log_path {
        Some(path) => Some(Arc::new(AuditLog::open(path)?)),
        None => None,
    };
    if let Some(audit) = &audit {
        audit.write(AUDIT_GATEWAY_STARTED, b"gateway started")?;
    }

    // Bus client: real NATS when the bridge is enabled for it, stub
    // otherwise.
    let stub_mode = !config.ipc.nats_enabled;
    let resilience = Arc::new(ResilienceState::new(config.resilience.clone()));
    let router_client = Arc::new(RouterClient::new(
        config.bus.clone(),
        resilience.clone(),
        metrics.clone(),
        stub_mode,
    ));
    router_client.warm_up().await;

    let limiter = rate_limit::build(&config.rate_limit, &config.redis_limiter, metrics.clone());
    info!(mode = limiter.mode(), "rate limiter ready");

    let health = Arc::new(HealthRegistry::new());
    {
        let resilience = resilience.clone();
        health.register("nats_connection", true, move || {
            matches!(
                resilience.state(),
                ConnectionState::Connected | ConnectionState::Degraded
            )
        });
    }
    if config.ipc.enabled {
        let socket_path = config.ipc.socket_path.clone();
        health.register("ipc_server", true, move || socket_path.exists());
    }
    let health_server = spawn_health_server(health.clone(), config.health_port)?;

    let ipc_handle = if config.ipc.enabled {
        let bridge_router = router_client.clone();
        Some(ipc::server::spawn(
            config.ipc.clone(),
            metrics.clone(),
            move || BusBridge::new(bridge_router),
        )?)
    } else {
        None
    };

    // Idle-reap loop for the bus pool.
    let reaper = {
        let router_client = router_client.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                router_client.pool_health_check().await;
            }
        })
    };

    let state = Arc::new(AppState {
        metrics: metrics.clone(),
        tracer,
        limiter,
        router: router_client.clone(),
        backpressure: BackpressureProbe::new(config.backpressure.clone()),
        abuse: Arc::new(AbuseDetector::new(config.abuse.clone(), metrics.clone())),
        registry: Arc::new(BlockRegistry::new()),
        sse: Arc::new(SseBroadcaster::new()),
        health,
        config,
    });

    let http_listener = tcp_listener::bind(&format!("0.0.0.0:{}", state.config.port))?;
    let router = routes::make_router(state.clone())
        .build()
        .map_err(|err| anyhow!(err))?;
    let service = routerify::RouterService::new(router).unwrap();
    let server = hyper::Server::from_tcp(http_listener)?
        .serve(service)
        .with_graceful_shutdown(shutdown_watcher());

    logging::log_event(
        logging::Level::Info,
        "c-gateway",
        &format!("gateway listening on port {}", state.config.port),
        None,
        None,
    );

    // Run the server until shutdown requested
    if let Err(e) = server.await {
        eprintln!("Server error: {}", e);
    }

    // Orderly shutdown: stop accepts, close the IPC socket, drain the bus
    // pool, flush the final records.
    info!("shutting down");
    if let Some(handle) = ipc_handle {
        handle.stop();
    }
    reaper.abort();
    health_server.abort();
    router_client.shutdown();
    if let Some(audit) = &audit {
        let _ = audit.write(AUDIT_GATEWAY_STOPPED, b"gateway stopped");
    }
    logging::log_event(
        logging::Level::Info,
        "c-gateway",
        "shutdown complete",
        None,
        None,
    );

    Ok(())
}

async fn shutdown_watcher() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term =
        signal(SignalKind::terminate()).expect("Failed to install SIGTERM signal handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

fn cli() -> Command {
    Command::new("Beamline gateway")
        .version("0.1.0")
        .arg(
            Arg::new("port")
                .long("port")
                .help("HTTP listen port (overrides GATEWAY_PORT)"),
        )
        .arg(
            Arg::new("health-port")
                .long("health-port")
                .help("Health endpoint port (overrides GATEWAY_HEALTH_PORT)"),
        )
        .arg(
            Arg::new("ipc-socket")
                .long("ipc-socket")
                .help("IPC socket path (overrides CGW_IPC_SOCKET_PATH)"),
        )
}

#[test]
fn verify_cli() {
    cli().debug_assert();
}
