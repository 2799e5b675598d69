//! Redis-backed distributed fixed-window limiter.
//!
//! Per request the backend runs one atomic Lua script: INCR the window
//! bucket, set its TTL on first touch, return `(count, ttl)`. Only
//! IO-class errors are retried, with a fixed backoff and a bounded attempt
//! count; every call is guarded by the circuit breaker, and the breaker's
//! fail-open/fail-closed mode decides what an open circuit answers.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;

use crate::breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
use crate::config::{BreakerMode, RedisLimiterConfig};
use crate::metrics::GatewayMetrics;
use crate::pool::{ConnectionPool, Connector, PoolConfig, PoolError};

use super::{CallerIdentity, Decision, Endpoint, RateLimiter};

// INCR + first-touch EXPIRE must be atomic, otherwise a crash between the
// two leaves an immortal counter.
const FIXED_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local window_sec = tonumber(ARGV[1])
local count = redis.call('INCR', key)
if count == 1 then
  redis.call('EXPIRE', key, window_sec)
end
local ttl = redis.call('TTL', key)
return {count, ttl}
"#;

/// Slack added to the key TTL to absorb clock skew between gateway nodes.
const TTL_SLACK_SECS: u64 = 2;

pub struct RedisConnector {
    client: redis::Client,
}

#[async_trait]
impl Connector for RedisConnector {
    type Conn = MultiplexedConnection;

    async fn connect(&self) -> Result<MultiplexedConnection, PoolError> {
        self.client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| PoolError::Connect(e.to_string()))
    }

    async fn check(&self, conn: &mut MultiplexedConnection) -> bool {
        let pong: Result<String, _> = redis::cmd("PING").query_async(conn).await;
        matches!(pong.as_deref(), Ok("PONG"))
    }
}

pub struct RedisRateLimiter {
    config: RedisLimiterConfig,
    pool: Arc<ConnectionPool<RedisConnector>>,
    breaker: CircuitBreaker,
    script: Script,
    metrics: Arc<GatewayMetrics>,
}

/// djb2 over the observed client address. Non-cryptographic on purpose:
/// the hash only spreads keys, it does not hide the caller.
pub fn hash_client_ip(ip: &str) -> u32 {
    let mut hash: u32 = 5381;
    for b in ip.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// `rl:ip:<route_id>:<client_ip_hash>:<bucket_ts>`
pub fn build_key(route_id: &str, client_ip_hash: u32, bucket_ts: u64) -> String {
    format!("rl:ip:{route_id}:{client_ip_hash}:{bucket_ts}")
}

pub fn bucket_ts(now_secs: u64, window_secs: u64) -> u64 {
    (now_secs / window_secs) * window_secs
}

impl RedisRateLimiter {
    pub fn new(
        config: &RedisLimiterConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(config.url.as_str())?;
        let pool_config = PoolConfig {
            min_connections: 0,
            max_connections: config.pool_size,
            connection_timeout: config.command_timeout,
            idle_timeout: config.breaker_cooldown.max(config.window) * 4,
        };
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.breaker_error_threshold,
            success_threshold: config.breaker_half_open_attempts,
            open_timeout: config.breaker_cooldown,
            half_open_max_calls: config.breaker_half_open_attempts,
        });
        metrics.redis_limiter_cb_state.set(0);

        // No warm-up (min 0): the limiter must construct even when Redis
        // is down, the breaker handles the rest.
        let pool = Arc::new(ConnectionPool::new(RedisConnector { client }, pool_config));

        Ok(RedisRateLimiter {
            config: config.clone(),
            pool,
            breaker,
            script: Script::new(FIXED_WINDOW_SCRIPT),
            metrics,
        })
    }

    pub fn breaker_closed(&self) -> bool {
        self.breaker.state() == BreakerState::Closed
    }

    fn effective_limit(&self, endpoint: Endpoint) -> u32 {
        let route_limit = match endpoint {
            Endpoint::Messages => self.config.route_limit_messages,
            _ => 0,
        };
        if route_limit > 0 {
            route_limit
        } else {
            self.config.global_limit
        }
    }

    fn record_breaker_state(&self) {
        let state = self.breaker.state();
        self.metrics.redis_limiter_cb_state.set(state.as_gauge());
    }

    fn on_backend_error(&self) {
        let before = self.breaker.state();
        self.breaker.on_failure();
        self.metrics.redis_limiter_errors_total.inc();
        if self.breaker.state() != before {
            self.metrics.redis_limiter_cb_transitions_total.inc();
        }
        self.record_breaker_state();
    }

    fn on_backend_success(&self) {
        let before = self.breaker.state();
        self.breaker.on_success();
        if self.breaker.state() != before {
            self.metrics.redis_limiter_cb_transitions_total.inc();
        }
        self.record_breaker_state();
    }

    fn open_circuit_decision(&self, limit: u32) -> Decision {
        match self.config.breaker_mode {
            BreakerMode::FailOpen => Decision::Allowed {
                limit,
                remaining: limit,
                degraded: true,
            },
            BreakerMode::FailClosed => Decision::Exceeded {
                limit,
                retry_after_secs: self.config.breaker_cooldown.as_secs().max(1) as u32,
                reset_at: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs()
                    + self.config.breaker_cooldown.as_secs(),
            },
        }
    }

    async fn run_script(&self, key: &str, window_secs: u64) -> Result<(i64, i64), PoolError> {
        let mut attempt = 0u32;
        loop {
            let mut pooled = self
                .pool
                .acquire(self.config.pool_acquire_timeout)
                .await?;

            let result: Result<(i64, i64), redis::RedisError> = tokio::time::timeout(
                self.config.command_timeout,
                self.script
                    .key(key)
                    .arg(window_secs)
                    .invoke_async(pooled.conn()),
            )
            .await
            .unwrap_or_else(|_| {
                Err(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "command timed out",
                )))
            });

            match result {
                Ok(reply) => {
                    pooled.release();
                    return Ok(reply);
                }
                Err(err) => {
                    // A failed connection is discarded, not recycled.
                    drop(pooled);
                    let retryable = matches!(err.kind(), redis::ErrorKind::IoError);
                    if retryable && attempt < self.config.retries {
                        attempt += 1;
                        tokio::time::sleep(self.config.retry_backoff).await;
                        continue;
                    }
                    return Err(PoolError::Connect(err.to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(&self, endpoint: Endpoint, caller: &CallerIdentity<'_>) -> Decision {
        self.metrics.redis_limiter_requests_total.inc();
        let limit = self.effective_limit(endpoint);

        // Breaker gate before any network traffic.
        if !self.breaker.allow_request() {
            let decision = self.open_circuit_decision(limit);
            match decision {
                Decision::Allowed { .. } => self.metrics.redis_limiter_allowed_total.inc(),
                Decision::Exceeded { .. } => self.metrics.redis_limiter_limited_total.inc(),
                Decision::Error => {}
            }
            return decision;
        }

        let window_secs = self.config.window.as_secs().max(1);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let bucket = bucket_ts(now, window_secs);
        let route_id = format!("POST_/api/v1/{}", endpoint.as_str());
        let key = build_key(
            &route_id,
            hash_client_ip(caller.client_ip.unwrap_or("unknown")),
            bucket,
        );
        // TTL is set by the script; slack is folded into the argument.
        let script_window = window_secs + TTL_SLACK_SECS;

        match self.run_script(&key, script_window).await {
            Ok((count, ttl)) => {
                self.on_backend_success();
                if count > limit as i64 {
                    self.metrics.redis_limiter_limited_total.inc();
                    Decision::Exceeded {
                        limit,
                        retry_after_secs: if ttl > 0 { ttl as u32 } else { window_secs as u32 },
                        reset_at: bucket + window_secs,
                    }
                } else {
                    self.metrics.redis_limiter_allowed_total.inc();
                    Decision::Allowed {
                        limit,
                        remaining: (limit as i64 - count).max(0) as u32,
                        degraded: false,
                    }
                }
            }
            Err(_) => {
                self.on_backend_error();
                Decision::Error
            }
        }
    }

    fn mode(&self) -> &'static str {
        "redis"
    }
}
