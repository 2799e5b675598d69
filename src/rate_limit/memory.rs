//! Single-node fixed-window limiter.
//!
//! One `window_started_at` is shared by every endpoint of a limiter
//! instance: when the window rolls over, all endpoint counters reset
//! together. Single-node only; there is no cross-instance coordination.

use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::config::RateLimitConfig;

use super::{CallerIdentity, Decision, Endpoint, RateLimiter};

struct Window {
    started_at: Option<Instant>,
    counters: [u32; 3],
}

pub struct MemoryRateLimiter {
    window: Duration,
    limits: [u32; 3],
    state: Mutex<Window>,
}

impl MemoryRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        MemoryRateLimiter {
            window: config.window,
            limits: [
                config.routes_decide_limit,
                config.messages_limit,
                config.registry_blocks_limit,
            ],
            state: Mutex::new(Window {
                started_at: None,
                counters: [0; 3],
            }),
        }
    }

    fn check_sync(&self, endpoint: Endpoint) -> Decision {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        let expired = match state.started_at {
            None => true,
            Some(started) => now.duration_since(started) >= self.window,
        };
        if expired {
            state.started_at = Some(now);
            state.counters = [0; 3];
        }

        let limit = self.limits[endpoint.index()];
        let count = state.counters[endpoint.index()];
        if count >= limit {
            let elapsed = state
                .started_at
                .map(|s| now.duration_since(s))
                .unwrap_or_default();
            let retry_after = self.window.saturating_sub(elapsed).as_secs().max(1) as u32;
            let reset_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
                + retry_after as u64;
            return Decision::Exceeded {
                limit,
                retry_after_secs: retry_after,
                reset_at,
            };
        }

        state.counters[endpoint.index()] = count + 1;
        Decision::Allowed {
            limit,
            remaining: limit - (count + 1),
            degraded: false,
        }
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(&self, endpoint: Endpoint, _caller: &CallerIdentity<'_>) -> Decision {
        self.check_sync(endpoint)
    }

    fn mode(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitMode;

    fn limiter(window: Duration, limit: u32) -> MemoryRateLimiter {
        let config = RateLimitConfig {
            mode: RateLimitMode::Local,
            window,
            routes_decide_limit: limit,
            messages_limit: limit * 2,
            registry_blocks_limit: limit * 4,
            fallback_to_local: true,
        };
        MemoryRateLimiter::new(&config)
    }

    #[test]
    fn allows_exactly_limit_calls_per_window() {
        let limiter = limiter(Duration::from_secs(60), 5);
        let mut allowed = 0;
        let mut exceeded = 0;
        for _ in 0..12 {
            match limiter.check_sync(Endpoint::RoutesDecide) {
                Decision::Allowed { .. } => allowed += 1,
                Decision::Exceeded { .. } => exceeded += 1,
                Decision::Error => panic!("memory limiter cannot error"),
            }
        }
        assert_eq!(allowed, 5);
        assert_eq!(exceeded, 7);
    }

    #[test]
    fn remaining_counts_down() {
        let limiter = limiter(Duration::from_secs(60), 3);
        for expected in [2u32, 1, 0] {
            match limiter.check_sync(Endpoint::RoutesDecide) {
                Decision::Allowed { remaining, .. } => assert_eq!(remaining, expected),
                other => panic!("unexpected decision {other:?}"),
            }
        }
    }

    #[test]
    fn window_rollover_resets_all_endpoints_together() {
        let limiter = limiter(Duration::from_millis(40), 1);
        assert!(matches!(
            limiter.check_sync(Endpoint::RoutesDecide),
            Decision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check_sync(Endpoint::Messages),
            Decision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check_sync(Endpoint::RoutesDecide),
            Decision::Exceeded { .. }
        ));

        std::thread::sleep(Duration::from_millis(60));

        // One quiet window later, every endpoint starts fresh.
        assert!(matches!(
            limiter.check_sync(Endpoint::RoutesDecide),
            Decision::Allowed { remaining: 0, .. }
        ));
        assert!(matches!(
            limiter.check_sync(Endpoint::Messages),
            Decision::Allowed { .. }
        ));
    }

    #[test]
    fn per_endpoint_limits_are_independent_within_a_window() {
        let limiter = limiter(Duration::from_secs(60), 1);
        assert!(matches!(
            limiter.check_sync(Endpoint::RoutesDecide),
            Decision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check_sync(Endpoint::RoutesDecide),
            Decision::Exceeded { .. }
        ));
        // Messages has its own (higher) limit and its own counter.
        assert!(matches!(
            limiter.check_sync(Endpoint::Messages),
            Decision::Allowed { .. }
        ));
    }

    #[test]
    fn exceeded_carries_retry_hints() {
        let limiter = limiter(Duration::from_secs(60), 1);
        limiter.check_sync(Endpoint::RoutesDecide);
        match limiter.check_sync(Endpoint::RoutesDecide) {
            Decision::Exceeded {
                limit,
                retry_after_secs,
                reset_at,
            } => {
                assert_eq!(limit, 1);
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap()
                    .as_secs();
                assert!(reset_at >= now);
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }
}
