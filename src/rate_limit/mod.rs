//! Request rate limiting.
//!
//! Two concrete backends behind one trait: a single-node fixed-window
//! counter and a Redis-backed distributed limiter. The factory wires the
//! backend from configuration and, when fallback is enabled, wraps the
//! remote backend so that backend errors are served by an internal
//! in-memory limiter until the Redis circuit closes again.

pub mod memory;
pub mod redis;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{RateLimitConfig, RateLimitMode, RedisLimiterConfig};
use crate::logging::{self, Level};
use crate::metrics::GatewayMetrics;

use self::memory::MemoryRateLimiter;
use self::redis::RedisRateLimiter;

/// The closed set of rate-limited endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    RoutesDecide,
    Messages,
    RegistryBlocks,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::RoutesDecide => "routes_decide",
            Endpoint::Messages => "messages",
            Endpoint::RegistryBlocks => "registry_blocks",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Endpoint::RoutesDecide => 0,
            Endpoint::Messages => 1,
            Endpoint::RegistryBlocks => 2,
        }
    }
}

/// Caller identity the limiter keys on.
#[derive(Debug, Clone, Default)]
pub struct CallerIdentity<'a> {
    pub tenant_id: Option<&'a str>,
    pub api_key: Option<&'a str>,
    pub client_ip: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed {
        limit: u32,
        remaining: u32,
        /// True when the backend was unavailable and the breaker's
        /// fail-open policy admitted the request.
        degraded: bool,
    },
    Exceeded {
        limit: u32,
        retry_after_secs: u32,
        reset_at: u64,
    },
    Error,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, endpoint: Endpoint, caller: &CallerIdentity<'_>) -> Decision;

    /// Backend label for logs and the JSON metrics summary.
    fn mode(&self) -> &'static str;
}

/// Remote backend with transparent in-memory fallback.
///
/// Every remote `Error` flips the limiter into fallback; the next breaker
/// close flips it back. The flip is logged once per state change, not per
/// call.
pub struct FallbackRateLimiter {
    remote: RedisRateLimiter,
    local: MemoryRateLimiter,
    in_fallback: AtomicBool,
}

impl FallbackRateLimiter {
    pub fn new(remote: RedisRateLimiter, local: MemoryRateLimiter) -> Self {
        FallbackRateLimiter {
            remote,
            local,
            in_fallback: AtomicBool::new(false),
        }
    }

    fn enter_fallback(&self) {
        if !self.in_fallback.swap(true, Ordering::SeqCst) {
            logging::log_event(
                Level::Warn,
                "rate_limiter",
                "remote backend failing, serving from in-memory fallback",
                None,
                None,
            );
        }
    }

    fn leave_fallback(&self) {
        if self.in_fallback.swap(false, Ordering::SeqCst) {
            logging::log_event(
                Level::Info,
                "rate_limiter",
                "remote backend recovered, leaving in-memory fallback",
                None,
                None,
            );
        }
    }
}

#[async_trait]
impl RateLimiter for FallbackRateLimiter {
    async fn check(&self, endpoint: Endpoint, caller: &CallerIdentity<'_>) -> Decision {
        if self.in_fallback.load(Ordering::SeqCst) {
            if self.remote.breaker_closed() {
                self.leave_fallback();
            } else {
                return self.local.check(endpoint, caller).await;
            }
        }

        match self.remote.check(endpoint, caller).await {
            Decision::Error => {
                self.enter_fallback();
                self.local.check(endpoint, caller).await
            }
            decision => decision,
        }
    }

    fn mode(&self) -> &'static str {
        if self.in_fallback.load(Ordering::SeqCst) {
            "fallback"
        } else {
            "redis"
        }
    }
}

/// Builds the limiter chosen by configuration.
///
/// A remote backend that cannot be constructed is itself subject to the
/// fallback rule: with `fallback_to_local` the gateway starts on the
/// in-memory limiter instead of refusing to boot.
pub fn build(
    config: &RateLimitConfig,
    redis_config: &RedisLimiterConfig,
    metrics: Arc<GatewayMetrics>,
) -> Arc<dyn RateLimiter> {
    match config.mode {
        RateLimitMode::Local => Arc::new(MemoryRateLimiter::new(config)),
        RateLimitMode::Redis | RateLimitMode::Hybrid => {
            match RedisRateLimiter::new(redis_config, metrics) {
                Ok(remote) => Arc::new(FallbackRateLimiter::new(
                    remote,
                    MemoryRateLimiter::new(config),
                )),
                Err(err) if config.fallback_to_local => {
                    logging::log_event(
                        Level::Warn,
                        "rate_limiter",
                        &format!("redis backend init failed ({err}), using memory mode"),
                        None,
                        None,
                    );
                    Arc::new(MemoryRateLimiter::new(config))
                }
                Err(err) => {
                    logging::log_event(
                        Level::Error,
                        "rate_limiter",
                        &format!("redis backend init failed and fallback disabled: {err}"),
                        None,
                        None,
                    );
                    Arc::new(DenyAllLimiter)
                }
            }
        }
    }
}

/// Terminal limiter used when the remote backend cannot start and fallback
/// is disabled: every check reports a backend error, which the pipeline
/// turns into 503.
struct DenyAllLimiter;

#[async_trait]
impl RateLimiter for DenyAllLimiter {
    async fn check(&self, _endpoint: Endpoint, _caller: &CallerIdentity<'_>) -> Decision {
        Decision::Error
    }

    fn mode(&self) -> &'static str {
        "error"
    }
}
