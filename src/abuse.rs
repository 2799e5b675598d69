//! Abuse-pattern detection.
//!
//! Tracks per-tenant request behavior inside a retention window and flags
//! the patterns the Router team cares about: single-tenant floods, rate
//! limit evasion across identities, heavy-payload abuse and many-tenant
//! floods. Distinct API keys and IPs are tracked as exact sets per tenant.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::config::AbuseConfig;
use crate::logging::{self, Level, RequestIds};
use crate::metrics::GatewayMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbuseEvent {
    TargetedTenant,
    RateLimitEvasion,
    HeavyPayload,
    MultiTenantFlood,
}

impl AbuseEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbuseEvent::TargetedTenant => "targeted_tenant",
            AbuseEvent::RateLimitEvasion => "rate_limit_evasion",
            AbuseEvent::HeavyPayload => "heavy_payload",
            AbuseEvent::MultiTenantFlood => "multi_tenant_flood",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    LogOnly,
    RateLimit,
    TemporaryBlock,
}

#[derive(Debug)]
struct TenantEntry {
    first_seen: Instant,
    last_seen: Instant,
    request_count: u64,
    api_keys: HashSet<String>,
    ips: HashSet<String>,
    large_payload_count: u64,
    total_payload_bytes: u64,
}

#[derive(Debug)]
struct Inner {
    tenants: HashMap<String, TenantEntry>,
    blocked: HashMap<String, Instant>,
    flood_window_start: Option<Instant>,
    flood_requests: u64,
}

pub struct AbuseDetector {
    config: AbuseConfig,
    inner: Mutex<Inner>,
    metrics: Arc<GatewayMetrics>,
}

impl AbuseDetector {
    pub fn new(config: AbuseConfig, metrics: Arc<GatewayMetrics>) -> Self {
        AbuseDetector {
            config,
            inner: Mutex::new(Inner {
                tenants: HashMap::new(),
                blocked: HashMap::new(),
                flood_window_start: None,
                flood_requests: 0,
            }),
            metrics,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Records one request against the tenant's window.
    pub fn track_request(
        &self,
        tenant_id: &str,
        api_key: Option<&str>,
        client_ip: &str,
        payload_size: usize,
    ) {
        if !self.config.enabled || tenant_id.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let retention = self.config.retention_window;
        inner
            .tenants
            .retain(|_, e| now.duration_since(e.last_seen) < retention);

        let entry = inner
            .tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantEntry {
                first_seen: now,
                last_seen: now,
                request_count: 0,
                api_keys: HashSet::new(),
                ips: HashSet::new(),
                large_payload_count: 0,
                total_payload_bytes: 0,
            });
        entry.last_seen = now;
        entry.request_count += 1;
        entry.total_payload_bytes += payload_size as u64;
        if payload_size > self.config.large_payload_threshold {
            entry.large_payload_count += 1;
        }
        if let Some(key) = api_key {
            if !key.is_empty() {
                entry.api_keys.insert(key.to_string());
            }
        }
        if !client_ip.is_empty() {
            entry.ips.insert(client_ip.to_string());
        }
    }

    /// Checks the tracked window for abuse patterns. `None` means the
    /// request looks ordinary.
    pub fn check_patterns(&self, tenant_id: &str, payload_size: usize) -> Option<AbuseEvent> {
        if !self.config.enabled || tenant_id.is_empty() {
            return None;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        let (request_count, window_secs, distinct_keys, distinct_ips, large_ratio) = {
            let entry = inner.tenants.get(tenant_id)?;
            if entry.request_count == 0 {
                return None;
            }
            let window_secs = now.duration_since(entry.first_seen).as_secs().max(1);
            let large_ratio = if entry.request_count > 10 {
                entry.large_payload_count * 100 / entry.request_count
            } else {
                0
            };
            (
                entry.request_count,
                window_secs,
                entry.api_keys.len(),
                entry.ips.len(),
                large_ratio,
            )
        };

        let per_minute = request_count * 60 / window_secs;
        if per_minute > self.config.targeted_tenant_rate_threshold as u64 {
            return Some(AbuseEvent::TargetedTenant);
        }
        if distinct_keys > self.config.evasion_api_keys_threshold
            || distinct_ips > self.config.evasion_ips_threshold
        {
            return Some(AbuseEvent::RateLimitEvasion);
        }
        if large_ratio > self.config.large_payload_ratio_threshold as u64 {
            return Some(AbuseEvent::HeavyPayload);
        }
        if payload_size < self.config.min_payload_size {
            // Sub-minimum payloads alone are not an event; they only feed
            // the tracking window.
            return None;
        }

        // Rolling one-minute flood window across all tenants.
        match inner.flood_window_start {
            Some(start) if now.duration_since(start) <= Duration::from_secs(60) => {
                inner.flood_requests += 1;
            }
            _ => {
                inner.flood_window_start = Some(now);
                inner.flood_requests = 1;
            }
        }
        let active_tenants = inner.tenants.len();
        if active_tenants > self.config.multi_tenant_active_threshold {
            let avg = inner.flood_requests / active_tenants.max(1) as u64;
            if avg > 10 {
                return Some(AbuseEvent::MultiTenantFlood);
            }
        }

        None
    }

    /// Policy table mapping a detected pattern to its response.
    pub fn response_action(&self, event: AbuseEvent) -> ResponseAction {
        match event {
            AbuseEvent::TargetedTenant => ResponseAction::TemporaryBlock,
            AbuseEvent::RateLimitEvasion => ResponseAction::TemporaryBlock,
            AbuseEvent::HeavyPayload => ResponseAction::RateLimit,
            AbuseEvent::MultiTenantFlood => ResponseAction::LogOnly,
        }
    }

    pub fn block_tenant(&self, tenant_id: &str, duration: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .blocked
            .insert(tenant_id.to_string(), Instant::now() + duration);
        self.metrics.abuse_blocked_tenants.set(inner.blocked.len() as i64);
    }

    pub fn unblock_tenant(&self, tenant_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocked.remove(tenant_id);
        self.metrics.abuse_blocked_tenants.set(inner.blocked.len() as i64);
    }

    pub fn is_tenant_blocked(&self, tenant_id: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.blocked.retain(|_, until| *until > now);
        self.metrics.abuse_blocked_tenants.set(inner.blocked.len() as i64);
        inner.blocked.contains_key(tenant_id)
    }

    /// Emits the abuse event record and bumps the per-type counter.
    pub fn log_event(&self, event: AbuseEvent, ids: &RequestIds, endpoint: &str) {
        self.metrics
            .abuse_events_total
            .with_label_values(&[event.as_str()])
            .inc();
        logging::log_event(
            Level::Warn,
            "abuse_detection",
            &format!("abuse pattern detected: {}", event.as_str()),
            Some(ids),
            Some(json!({ "pattern": event.as_str(), "endpoint": endpoint })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(mutate: impl FnOnce(&mut AbuseConfig)) -> AbuseDetector {
        let mut config = AbuseConfig {
            enabled: true,
            min_payload_size: 2,
            large_payload_threshold: 1000,
            large_payload_ratio_threshold: 80,
            targeted_tenant_rate_threshold: 500,
            evasion_api_keys_threshold: 3,
            evasion_ips_threshold: 3,
            multi_tenant_active_threshold: 20,
            retention_window: Duration::from_secs(300),
        };
        mutate(&mut config);
        AbuseDetector::new(config, Arc::new(GatewayMetrics::new().unwrap()))
    }

    #[test]
    fn quiet_tenant_is_not_flagged() {
        let detector = detector(|_| {});
        detector.track_request("t1", None, "10.0.0.1", 100);
        assert_eq!(detector.check_patterns("t1", 100), None);
    }

    #[test]
    fn burst_above_rate_threshold_is_targeted_tenant() {
        let detector = detector(|c| c.targeted_tenant_rate_threshold = 50);
        for _ in 0..100 {
            detector.track_request("t1", None, "10.0.0.1", 100);
        }
        // 100 requests inside a second dwarf 50/min.
        assert_eq!(
            detector.check_patterns("t1", 100),
            Some(AbuseEvent::TargetedTenant)
        );
    }

    #[test]
    fn many_distinct_identities_is_evasion() {
        let detector = detector(|_| {});
        for i in 0..5 {
            detector.track_request("t1", Some(&format!("key-{i}")), "10.0.0.1", 100);
        }
        assert_eq!(
            detector.check_patterns("t1", 100),
            Some(AbuseEvent::RateLimitEvasion)
        );
    }

    #[test]
    fn repeated_identities_count_once() {
        let detector = detector(|_| {});
        // The same key and IP seen many times is one identity, not many.
        for _ in 0..20 {
            detector.track_request("t1", Some("key-0"), "10.0.0.1", 100);
        }
        assert_eq!(detector.check_patterns("t1", 100), None);
    }

    #[test]
    fn heavy_payload_ratio_flags_after_warmup() {
        let detector = detector(|c| c.large_payload_threshold = 10);
        for _ in 0..12 {
            detector.track_request("t1", None, "10.0.0.1", 100);
        }
        assert_eq!(
            detector.check_patterns("t1", 100),
            Some(AbuseEvent::HeavyPayload)
        );
    }

    #[test]
    fn block_expires_after_duration() {
        let detector = detector(|_| {});
        detector.block_tenant("t1", Duration::from_millis(30));
        assert!(detector.is_tenant_blocked("t1"));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!detector.is_tenant_blocked("t1"));
    }

    #[test]
    fn disabled_detector_never_flags() {
        let detector = detector(|c| c.enabled = false);
        for i in 0..50 {
            detector.track_request("t1", Some(&format!("k{i}")), "10.0.0.1", 1);
        }
        assert_eq!(detector.check_patterns("t1", 1), None);
    }
}
