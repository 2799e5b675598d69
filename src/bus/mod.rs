//! Messaging-bus client layer.
//!
//! The Router is a request-reply peer on a pub/sub bus. Everything above
//! this module talks to [`router::RouterClient`]; everything below the
//! [`BusTransport`] trait is swappable, with a real NATS transport and an
//! in-process stub for development without a Router peer.

pub mod nats;
pub mod resilience;
pub mod router;
pub mod stub;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("bus unavailable: {0}")]
    Unavailable(String),

    #[error("request failed: {0}")]
    Request(String),
}

/// Request-reply transport over the bus.
#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BusError>;

    /// Cheap connectivity probe used by the pool reaper and health checks.
    async fn healthy(&self) -> bool;

    /// Human label for logs and `/_metrics` (`connected`, `stub`, ...).
    fn status(&self) -> &'static str;
}
