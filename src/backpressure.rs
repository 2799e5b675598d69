//! Cached Router backpressure indicator.
//!
//! The Router exports `router_intake_backpressure_active` on its metrics
//! endpoint; the gateway polls it at most once per `check_interval` and
//! short-circuits decide traffic to 503 while it reads 1. A fetch failure
//! keeps the previous reading rather than flapping the pipeline.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use hyper::{Body, Client, Uri};

use crate::config::BackpressureConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureStatus {
    Inactive,
    Warning,
    Active,
}

struct Cache {
    status: BackpressureStatus,
    checked_at: Option<Instant>,
}

pub struct BackpressureProbe {
    config: BackpressureConfig,
    client: Client<hyper::client::HttpConnector, Body>,
    cache: Mutex<Cache>,
}

/// Scans Prometheus text exposition for the backpressure indicator.
pub fn parse_backpressure_metrics(text: &str) -> BackpressureStatus {
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("router_intake_backpressure_active") {
            let rest = match rest.find('}') {
                Some(i) => &rest[i + 1..],
                None => rest,
            };
            if rest.split_whitespace().next() == Some("1") {
                return BackpressureStatus::Active;
            }
        }
    }

    // Queue-depth or latency series present means the Router is exporting
    // stress indicators: treat as warning.
    if text.contains("router_jetstream_pending_messages")
        || text.contains("router_intake_processing_latency_p95")
    {
        return BackpressureStatus::Warning;
    }

    BackpressureStatus::Inactive
}

impl BackpressureProbe {
    pub fn new(config: BackpressureConfig) -> Arc<Self> {
        Arc::new(BackpressureProbe {
            config,
            client: Client::new(),
            cache: Mutex::new(Cache {
                status: BackpressureStatus::Inactive,
                checked_at: None,
            }),
        })
    }

    /// Current status, refreshed no more often than the check interval.
    pub async fn status(&self) -> BackpressureStatus {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(at) = cache.checked_at {
                if at.elapsed() < self.config.check_interval {
                    return cache.status;
                }
            }
        }

        let fetched = self.fetch().await;
        let mut cache = self.cache.lock().unwrap();
        if let Some(status) = fetched {
            cache.status = status;
        }
        cache.checked_at = Some(Instant::now());
        cache.status
    }

    pub fn cached_status(&self) -> BackpressureStatus {
        self.cache.lock().unwrap().status
    }

    async fn fetch(&self) -> Option<BackpressureStatus> {
        let uri: Uri = self.config.router_metrics_url.parse().ok()?;
        let response = tokio::time::timeout(self.config.fetch_timeout, self.client.get(uri))
            .await
            .ok()?
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body = tokio::time::timeout(
            self.config.fetch_timeout,
            hyper::body::to_bytes(response.into_body()),
        )
        .await
        .ok()?
        .ok()?;
        Some(parse_backpressure_metrics(&String::from_utf8_lossy(&body)))
    }
}
