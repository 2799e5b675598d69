//! Server-sent-events broadcaster.
//!
//! A bounded table of subscribers keyed by tenant. Writes use the body
//! channel's non-blocking send; a subscriber whose channel is full or
//! closed is dropped on the spot, so a stuck client can never stall a
//! publisher.

use std::sync::Mutex;

use bytes::Bytes;
use hyper::body::Sender;
use hyper::Body;

pub const MAX_SSE_CLIENTS: usize = 64;

struct SseClient {
    tenant_id: String,
    sender: Sender,
}

#[derive(Default)]
pub struct SseBroadcaster {
    clients: Mutex<Vec<SseClient>>,
}

impl SseBroadcaster {
    pub fn new() -> Self {
        SseBroadcaster::default()
    }

    /// Registers a subscriber and returns the streaming body, or `None`
    /// when the table is full.
    pub fn register(&self, tenant_id: &str) -> Option<Body> {
        let mut clients = self.clients.lock().unwrap();
        if clients.len() >= MAX_SSE_CLIENTS {
            return None;
        }
        let (mut sender, body) = Body::channel();
        // Initial comment flushes intermediaries.
        let _ = sender.try_send_data(Bytes::from_static(b": connected\n\n"));
        clients.push(SseClient {
            tenant_id: tenant_id.to_string(),
            sender,
        });
        Some(body)
    }

    /// Sends one event to every subscriber of the tenant. Failing
    /// subscribers are unregistered. Returns the number of deliveries.
    pub fn broadcast(&self, tenant_id: &str, event: &str, data: &serde_json::Value) -> usize {
        let frame = Bytes::from(format!("event: {event}\ndata: {data}\n\n"));
        let mut clients = self.clients.lock().unwrap();
        let mut delivered = 0;
        clients.retain_mut(|client| {
            if client.tenant_id != tenant_id {
                return true;
            }
            match client.sender.try_send_data(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}
