//! Three-state circuit breaker.
//!
//! Shared by the Redis rate-limiter backend and admission paths. All
//! transitions happen under one mutex; timestamps use `Instant` so
//! wall-clock jumps cannot reopen or re-close the circuit.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Gauge encoding: 0 closed, 1 open, 2 half-open.
    pub fn as_gauge(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(15),
            half_open_max_calls: 2,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BreakerStats {
    pub successes: u64,
    pub failures: u64,
    pub rejects: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_inflight: u32,
    state_entered_at: Instant,
    stats: BreakerStats,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                half_open_inflight: 0,
                state_entered_at: Instant::now(),
                stats: BreakerStats::default(),
            }),
        }
    }

    fn transition(inner: &mut Inner, to: BreakerState) {
        inner.state = to;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.half_open_inflight = 0;
        inner.state_entered_at = Instant::now();
    }

    /// Admission check. `Open` admits only once the reopen timer elapsed
    /// (flipping to `HalfOpen`); `HalfOpen` admits up to the probe cap.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if inner.state_entered_at.elapsed() >= self.config.open_timeout {
                    Self::transition(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_inflight = 1;
                    true
                } else {
                    inner.stats.rejects += 1;
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_inflight < self.config.half_open_max_calls {
                    inner.half_open_inflight += 1;
                    true
                } else {
                    inner.stats.rejects += 1;
                    false
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.successes += 1;
        inner.consecutive_successes += 1;
        inner.consecutive_failures = 0;

        if inner.state == BreakerState::HalfOpen
            && inner.consecutive_successes >= self.config.success_threshold
        {
            Self::transition(&mut inner, BreakerState::Closed);
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.failures += 1;
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;

        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    Self::transition(&mut inner, BreakerState::Open);
                }
            }
            // A single failure while probing reopens the circuit and
            // restarts the timer.
            BreakerState::HalfOpen => Self::transition(&mut inner, BreakerState::Open),
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::transition(&mut inner, BreakerState::Closed);
    }

    pub fn stats(&self) -> BreakerStats {
        self.inner.lock().unwrap().stats
    }
}
