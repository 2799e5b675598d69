//! Health probes and the dedicated health endpoint server.
//!
//! Liveness (`/health`) answers 200 while the process runs; readiness
//! (`/ready`) consults only the critical probes. The health server binds
//! its own port and runs independently of the main HTTP pipeline so a
//! wedged request path cannot take the probes down with it.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::json;
use tracing::info;

use crate::logging;

type Probe = Arc<dyn Fn() -> bool + Send + Sync>;

struct RegisteredCheck {
    name: String,
    probe: Probe,
    critical: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub healthy: bool,
    pub status: HealthStatus,
    pub message: String,
}

impl HealthReport {
    pub fn status_label(&self) -> &'static str {
        match self.status {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Default)]
pub struct HealthRegistry {
    checks: Mutex<Vec<RegisteredCheck>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        HealthRegistry::default()
    }

    pub fn register(
        &self,
        name: &str,
        critical: bool,
        probe: impl Fn() -> bool + Send + Sync + 'static,
    ) {
        self.checks.lock().unwrap().push(RegisteredCheck {
            name: name.to_string(),
            probe: Arc::new(probe),
            critical,
        });
    }

    /// Aggregate status over every registered probe.
    pub fn status(&self) -> HealthReport {
        let checks = self.checks.lock().unwrap();
        let mut critical_failed = 0;
        let mut noncritical_failed = 0;
        for check in checks.iter() {
            if !(check.probe)() {
                if check.critical {
                    critical_failed += 1;
                } else {
                    noncritical_failed += 1;
                }
            }
        }

        if critical_failed > 0 {
            HealthReport {
                healthy: false,
                status: HealthStatus::Unhealthy,
                message: format!("Critical checks failed: {critical_failed}"),
            }
        } else if noncritical_failed > 0 {
            HealthReport {
                healthy: false,
                status: HealthStatus::Degraded,
                message: format!("Non-critical checks failed: {noncritical_failed}"),
            }
        } else {
            HealthReport {
                healthy: true,
                status: HealthStatus::Healthy,
                message: "All checks passing".to_string(),
            }
        }
    }

    /// Readiness considers only critical probes.
    pub fn readiness(&self) -> HealthReport {
        let checks = self.checks.lock().unwrap();
        let failed = checks
            .iter()
            .filter(|c| c.critical && !(c.probe)())
            .count();
        if failed > 0 {
            HealthReport {
                healthy: false,
                status: HealthStatus::Unhealthy,
                message: format!("Not ready: {failed} critical checks failing"),
            }
        } else {
            HealthReport {
                healthy: true,
                status: HealthStatus::Healthy,
                message: "Ready".to_string(),
            }
        }
    }

    pub fn check_names(&self) -> Vec<String> {
        self.checks
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }
}

fn health_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(format!("{body}\n")))
        .expect("static response parts are valid")
}

async fn serve_health(
    registry: Arc<HealthRegistry>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::GET {
        return Ok(health_response(
            StatusCode::NOT_FOUND,
            json!({ "error": "Not Found" }),
        ));
    }
    let response = match req.uri().path() {
        "/health" => health_response(
            StatusCode::OK,
            json!({ "status": "healthy", "timestamp": logging::iso8601_now() }),
        ),
        "/ready" => {
            let readiness = registry.readiness();
            let status = if readiness.healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            health_response(
                status,
                json!({ "status": readiness.status_label(), "message": readiness.message }),
            )
        }
        _ => health_response(StatusCode::NOT_FOUND, json!({ "error": "Not Found" })),
    };
    Ok(response)
}

/// Binds the health port and spawns its accept loop. Returns once bound so
/// a port conflict is a startup error.
pub fn spawn_health_server(
    registry: Arc<HealthRegistry>,
    port: u16,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = crate::tcp_listener::bind(&addr.to_string())?;

    let make_service = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| serve_health(registry.clone(), req)))
        }
    });

    let server = Server::from_tcp(listener)?.serve(make_service);
    info!(port, "health server listening");

    Ok(tokio::spawn(async move {
        if let Err(err) = server.await {
            tracing::error!("health server error: {err}");
        }
    }))
}
