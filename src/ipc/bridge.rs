//! IPC ⇄ bus bridge.
//!
//! Control frames (`Ping`, `Capabilities`) are answered locally. Task
//! frames are wrapped in the Router envelope and sent as one bus
//! request-reply; the reply body becomes the IPC response payload
//! verbatim. The bridge borrows a bus transport through the
//! [`RouterClient`] per request and never stores one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use crate::bus::router::RouterClient;
use crate::bus::BusError;
use crate::logging::{self, Level};

use super::capabilities;
use super::protocol::{error_response, IpcError, IpcMessage, MessageType};
use super::server::IpcHandler;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    pub total_requests: u64,
    pub bus_errors: u64,
    pub timeouts: u64,
}

pub struct BusBridge {
    router: Arc<RouterClient>,
    total_requests: AtomicU64,
    bus_errors: AtomicU64,
    timeouts: AtomicU64,
    next_message_id: AtomicU64,
}

impl BusBridge {
    pub fn new(router: Arc<RouterClient>) -> Self {
        BusBridge {
            router,
            total_requests: AtomicU64::new(0),
            bus_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            next_message_id: AtomicU64::new(1),
        }
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            bus_errors: self.bus_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Router envelope around the raw IPC payload. A payload that parses
    /// as JSON is embedded structurally; anything else rides as a string.
    fn build_envelope(&self, payload: &[u8]) -> serde_json::Value {
        let input = if payload.is_empty() {
            json!({})
        } else {
            serde_json::from_slice(payload)
                .unwrap_or_else(|_| json!(String::from_utf8_lossy(payload)))
        };
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        json!({
            "from": "ide@localhost",
            "to": "router",
            "message_id": format!("ipc-{message_id}"),
            "tenant_id": "default",
            "policy_id": "default",
            "input": input,
        })
    }

    async fn forward(&self, request: &IpcMessage) -> IpcMessage {
        let envelope = self.build_envelope(&request.payload);
        match self.router.decide(Bytes::from(envelope.to_string())).await {
            Ok(reply) => IpcMessage::new(MessageType::ResponseOk, reply),
            Err(BusError::Timeout(after)) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                logging::log_event(
                    Level::Warn,
                    "ipc_bridge",
                    &format!("bus request timed out after {after:?}"),
                    None,
                    None,
                );
                error_response(IpcError::Timeout, Some("bus request timed out"))
            }
            Err(err) => {
                self.bus_errors.fetch_add(1, Ordering::Relaxed);
                logging::log_event(
                    Level::Error,
                    "ipc_bridge",
                    &format!("bus request failed: {err}"),
                    None,
                    None,
                );
                error_response(IpcError::Internal, Some("bus request failed"))
            }
        }
    }
}

#[async_trait(?Send)]
impl IpcHandler for BusBridge {
    async fn handle(&self, request: IpcMessage) -> IpcMessage {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        match request.message_type {
            MessageType::Ping => IpcMessage::empty(MessageType::Pong),
            MessageType::Capabilities => IpcMessage::new(
                MessageType::ResponseOk,
                Bytes::from(capabilities::capabilities_json().to_string()),
            ),
            MessageType::TaskSubmit | MessageType::TaskQuery | MessageType::TaskCancel => {
                self.forward(&request).await
            }
            _ => error_response(IpcError::InvalidType, Some("Unsupported message type")),
        }
    }
}
