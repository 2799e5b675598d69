//! Router RPC client: pool + resilience gate + subject map.
//!
//! The bridge and the HTTP pipeline borrow a transport from the pool for
//! exactly one request-reply and hand it straight back; nothing above this
//! module holds a bus connection.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::BusConfig;
use crate::metrics::GatewayMetrics;
use crate::pool::{ConnectionPool, Connector, PoolConfig, PoolError};

use super::nats::NatsTransport;
use super::resilience::{ConnectionState, ResilienceState};
use super::stub::StubTransport;
use super::{BusError, BusTransport};

/// Opens transports for the pool. Stub mode shares one in-process
/// transport; NATS mode dials a fresh client per pooled connection.
pub struct BusConnector {
    url: String,
    stub: Option<Arc<StubTransport>>,
    resilience: Arc<ResilienceState>,
}

#[async_trait]
impl Connector for BusConnector {
    type Conn = Arc<dyn BusTransport>;

    async fn connect(&self) -> Result<Arc<dyn BusTransport>, PoolError> {
        if let Some(stub) = &self.stub {
            self.resilience.mark_connected();
            return Ok(stub.clone());
        }
        match NatsTransport::connect(&self.url).await {
            Ok(transport) => {
                self.resilience.mark_connected();
                Ok(Arc::new(transport))
            }
            Err(err) => {
                self.resilience.mark_reconnecting();
                Err(PoolError::Connect(err.to_string()))
            }
        }
    }

    async fn check(&self, conn: &mut Arc<dyn BusTransport>) -> bool {
        conn.healthy().await
    }
}

pub struct RouterClient {
    config: BusConfig,
    pool: ConnectionPool<BusConnector>,
    resilience: Arc<ResilienceState>,
    metrics: Arc<GatewayMetrics>,
    stub_mode: bool,
}

impl RouterClient {
    pub fn new(
        config: BusConfig,
        resilience: Arc<ResilienceState>,
        metrics: Arc<GatewayMetrics>,
        stub_mode: bool,
    ) -> Self {
        let connector = BusConnector {
            url: config.url.clone(),
            stub: stub_mode.then(|| Arc::new(StubTransport::new())),
            resilience: resilience.clone(),
        };
        let pool = ConnectionPool::new(
            connector,
            PoolConfig {
                min_connections: config.min_connections,
                max_connections: config.max_connections,
                connection_timeout: config.connection_timeout,
                idle_timeout: config.idle_timeout,
            },
        );
        RouterClient {
            config,
            pool,
            resilience,
            metrics,
            stub_mode,
        }
    }

    /// Opens the initial connections; failures leave the resilience gate
    /// in its reconnecting state and the pool growing on demand.
    pub async fn warm_up(&self) {
        self.pool.warm_up().await;
        self.refresh_connection_gauge();
    }

    pub fn resilience(&self) -> &Arc<ResilienceState> {
        &self.resilience
    }

    pub fn pool_stats(&self) -> crate::pool::PoolStats {
        self.pool.stats()
    }

    /// Reaps idle or unhealthy pooled transports.
    pub async fn pool_health_check(&self) -> usize {
        let removed = self.pool.health_check().await;
        self.refresh_connection_gauge();
        removed
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    /// Bus status label exposed on `/_metrics`.
    pub fn status(&self) -> &'static str {
        if self.stub_mode {
            "stub"
        } else {
            self.resilience.state().as_str()
        }
    }

    fn refresh_connection_gauge(&self) {
        let connected = matches!(
            self.resilience.state(),
            ConnectionState::Connected | ConnectionState::Degraded
        );
        self.metrics
            .nats_connection_status
            .set(if connected { 1 } else { 0 });
    }

    /// One request-reply with the full gate sequence: resilience
    /// admission, pool acquire, transport call, completion accounting.
    pub async fn request(&self, subject: &str, payload: Bytes) -> Result<Bytes, BusError> {
        if !self.resilience.can_accept() {
            return Err(BusError::Unavailable(format!(
                "bus not accepting requests (state: {})",
                self.resilience.state().as_str()
            )));
        }

        self.resilience.request_start();
        let result = self.request_inner(subject, payload).await;
        match &result {
            Ok(_) => {
                self.metrics.nats_messages_received_total.inc();
                self.resilience.request_complete(true);
            }
            Err(_) => {
                self.metrics.nats_publish_failures_total.inc();
                self.resilience.request_complete(false);
            }
        }
        self.refresh_connection_gauge();
        result
    }

    async fn request_inner(&self, subject: &str, payload: Bytes) -> Result<Bytes, BusError> {
        let mut pooled = self
            .pool
            .acquire(self.config.pool_acquire_timeout)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        self.metrics.nats_messages_sent_total.inc();
        let result = pooled
            .conn()
            .request(subject, payload, self.config.request_timeout)
            .await;

        match result {
            Ok(reply) => {
                pooled.release();
                Ok(reply)
            }
            Err(err) => {
                // Dropping the guard destroys the suspect connection.
                drop(pooled);
                Err(err)
            }
        }
    }

    pub async fn decide(&self, route_request: Bytes) -> Result<Bytes, BusError> {
        let subject = self.config.subjects.decide.clone();
        self.request(&subject, route_request).await
    }

    pub async fn get_decision(
        &self,
        tenant_id: &str,
        message_id: &str,
    ) -> Result<Bytes, BusError> {
        let body = serde_json::json!({
            "tenant_id": tenant_id,
            "message_id": message_id,
        });
        let subject = self.config.subjects.get_decision.clone();
        self.request(&subject, Bytes::from(body.to_string())).await
    }

    pub async fn extension_health(&self) -> Result<Bytes, BusError> {
        let subject = self.config.subjects.extension_health.clone();
        self.request(&subject, Bytes::from_static(b"{}")).await
    }

    pub async fn circuit_breaker_states(&self) -> Result<Bytes, BusError> {
        let subject = self.config.subjects.circuit_breaker_states.clone();
        self.request(&subject, Bytes::from_static(b"{}")).await
    }

    pub async fn dry_run_pipeline(&self, body: Bytes) -> Result<Bytes, BusError> {
        let subject = self.config.subjects.dry_run_pipeline.clone();
        self.request(&subject, body).await
    }

    pub async fn pipeline_complexity(
        &self,
        tenant_id: &str,
        policy_id: &str,
    ) -> Result<Bytes, BusError> {
        let body = serde_json::json!({
            "tenant_id": tenant_id,
            "policy_id": policy_id,
        });
        let subject = self.config.subjects.pipeline_complexity.clone();
        self.request(&subject, Bytes::from(body.to_string())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{BusSubjects, ResilienceConfig};

    fn test_client() -> (RouterClient, Arc<GatewayMetrics>) {
        let resilience = Arc::new(ResilienceState::new(ResilienceConfig {
            max_inflight: 4,
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            degraded_threshold: 3,
        }));
        let config = BusConfig {
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
            max_connections: 2,
            connection_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(60),
            pool_acquire_timeout: Duration::from_millis(100),
            request_timeout: Duration::from_millis(500),
        };
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        let client = RouterClient::new(config, resilience, metrics.clone(), true);
        (client, metrics)
    }

    #[tokio::test]
    async fn stub_decide_round_trip() {
        let (client, _metrics) = test_client();
        client.warm_up().await;
        assert_eq!(client.status(), "stub");

        let reply = client.decide(Bytes::from_static(b"{}")).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(value["provider_id"], "provider-1");

        let stats = client.pool_stats();
        assert_eq!(stats.total_acquired, stats.total_released);
    }

    #[tokio::test]
    async fn disconnected_gate_refuses_before_touching_the_pool() {
        let (client, _metrics) = test_client();
        // No warm-up: resilience still Disconnected.
        let err = client.decide(Bytes::from_static(b"{}")).await.unwrap_err();
        assert!(matches!(err, BusError::Unavailable(_)));
        assert_eq!(client.pool_stats().total_acquired, 0);
    }

    #[tokio::test]
    async fn success_updates_counters_and_gauge() {
        let (client, metrics) = test_client();
        client.warm_up().await;
        client.decide(Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(metrics.nats_messages_sent_total.get(), 1);
        assert_eq!(metrics.nats_messages_received_total.get(), 1);
        assert_eq!(metrics.nats_connection_status.get(), 1);
    }
}
