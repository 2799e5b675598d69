//! In-process stub transport.
//!
//! Used when `CGW_IPC_NATS_ENABLE=false`: decide subjects answer with a
//! canned decision, admin subjects with small fixed documents, and unknown
//! subjects echo the request. Lets the gateway run end-to-end without a
//! Router peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use super::{BusError, BusTransport};

#[derive(Default)]
pub struct StubTransport {
    requests: AtomicU64,
}

impl StubTransport {
    pub fn new() -> Self {
        StubTransport::default()
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BusTransport for StubTransport {
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        _timeout: Duration,
    ) -> Result<Bytes, BusError> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let reply = if subject.ends_with(".decide") || subject.ends_with(".get_decision") {
            json!({
                "message_id": "dummy",
                "provider_id": "provider-1",
                "reason": "stub",
                "priority": 1,
                "expected_latency_ms": 42,
                "expected_cost": 0.001,
                "currency": "USD",
                "trace_id": "trace-stub",
            })
        } else if subject.ends_with(".get_extension_health") {
            json!({
                "health": {
                    "extension_1": {
                        "extension_id": "extension_1",
                        "status": "healthy",
                        "success_rate": 0.95,
                        "avg_latency_ms": 25.5,
                    }
                }
            })
        } else if subject.ends_with(".get_circuit_breaker_states") {
            json!({ "circuit_breakers": {} })
        } else if subject.ends_with(".dry_run_pipeline") {
            json!({ "ok": true, "steps": [] })
        } else if subject.ends_with(".get_pipeline_complexity") {
            json!({ "complexity": { "steps": 1, "estimated_latency_ms": 5 } })
        } else {
            let input: serde_json::Value =
                serde_json::from_slice(&payload).unwrap_or(serde_json::Value::Null);
            json!({ "message_id": "stub", "status": "ok", "result": { "echo": input } })
        };

        Ok(Bytes::from(reply.to_string()))
    }

    async fn healthy(&self) -> bool {
        true
    }

    fn status(&self) -> &'static str {
        "stub"
    }
}
