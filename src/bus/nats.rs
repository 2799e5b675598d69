//! NATS-backed bus transport.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{BusError, BusTransport};

pub struct NatsTransport {
    client: async_nats::Client,
}

impl NatsTransport {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        Ok(NatsTransport { client })
    }
}

#[async_trait]
impl BusTransport for NatsTransport {
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BusError> {
        let reply = tokio::time::timeout(
            timeout,
            self.client.request(subject.to_string(), payload),
        )
        .await
        .map_err(|_| BusError::Timeout(timeout))?
        .map_err(|e| BusError::Request(e.to_string()))?;
        Ok(reply.payload)
    }

    async fn healthy(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    fn status(&self) -> &'static str {
        match self.client.connection_state() {
            async_nats::connection::State::Connected => "connected",
            async_nats::connection::State::Pending => "reconnecting",
            async_nats::connection::State::Disconnected => "disconnected",
        }
    }
}
