//! Bus resilience gate.
//!
//! Independent of the connection pool: a healthy pool can still sit in
//! front of a misbehaving peer. Every outbound call consults this gate for
//! admission and reports its outcome back.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::ResilienceConfig;
use crate::logging::{self, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Degraded,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResilienceStats {
    pub inflight: u32,
    pub total_errors: u64,
    pub reconnect_attempts: u32,
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    inflight: u32,
    consecutive_errors: u32,
    total_errors: u64,
    reconnect_attempts: u32,
    current_backoff: Duration,
    last_error_at: Option<Instant>,
}

pub struct ResilienceState {
    config: ResilienceConfig,
    inner: Mutex<Inner>,
}

impl ResilienceState {
    pub fn new(config: ResilienceConfig) -> Self {
        let min_backoff = config.min_backoff;
        ResilienceState {
            config,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                inflight: 0,
                consecutive_errors: 0,
                total_errors: 0,
                reconnect_attempts: 0,
                current_backoff: min_backoff,
                last_error_at: None,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state
    }

    /// Admission: refuses when the inflight cap is reached or the link is
    /// down or still reconnecting. `Degraded` keeps accepting.
    pub fn can_accept(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.inflight >= self.config.max_inflight {
            return false;
        }
        !matches!(
            inner.state,
            ConnectionState::Disconnected | ConnectionState::Reconnecting
        )
    }

    pub fn request_start(&self) {
        self.inner.lock().unwrap().inflight += 1;
    }

    pub fn request_complete(&self, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.inflight = inner.inflight.saturating_sub(1);

        if success {
            inner.consecutive_errors = 0;
            if inner.state == ConnectionState::Degraded {
                inner.state = ConnectionState::Connected;
                inner.current_backoff = self.config.min_backoff;
                logging::log_event(
                    Level::Info,
                    "bus_resilience",
                    "recovered to connected state",
                    None,
                    None,
                );
            }
        } else {
            inner.consecutive_errors += 1;
            inner.total_errors += 1;
            inner.last_error_at = Some(Instant::now());

            if inner.state == ConnectionState::Connected
                && inner.consecutive_errors >= self.config.degraded_threshold
            {
                inner.state = ConnectionState::Degraded;
                logging::log_event(
                    Level::Warn,
                    "bus_resilience",
                    &format!(
                        "entered degraded state after {} consecutive errors",
                        inner.consecutive_errors
                    ),
                    None,
                    None,
                );
            }

            inner.current_backoff =
                (inner.current_backoff * 2).min(self.config.max_backoff);
        }
    }

    pub fn mark_connected(&self) {
        let mut inner = self.inner.lock().unwrap();
        let was = inner.state;
        inner.state = ConnectionState::Connected;
        inner.consecutive_errors = 0;
        inner.current_backoff = self.config.min_backoff;
        inner.reconnect_attempts = 0;
        if was != ConnectionState::Connected {
            logging::log_event(Level::Info, "bus_resilience", "connection established", None, None);
        }
    }

    pub fn mark_reconnecting(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnectionState::Reconnecting {
            inner.state = ConnectionState::Reconnecting;
            inner.reconnect_attempts += 1;
            logging::log_event(Level::Warn, "bus_resilience", "reconnecting to bus", None, None);
        }
    }

    pub fn backoff(&self) -> Duration {
        self.inner.lock().unwrap().current_backoff
    }

    pub fn stats(&self) -> ResilienceStats {
        let inner = self.inner.lock().unwrap();
        ResilienceStats {
            inflight: inner.inflight,
            total_errors: inner.total_errors,
            reconnect_attempts: inner.reconnect_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(max_inflight: u32, degraded_threshold: u32) -> ResilienceState {
        ResilienceState::new(ResilienceConfig {
            max_inflight,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(800),
            degraded_threshold,
        })
    }

    #[test]
    fn disconnected_rejects_until_marked_connected() {
        let res = state(10, 3);
        assert!(!res.can_accept());
        res.mark_connected();
        assert!(res.can_accept());
    }

    #[test]
    fn inflight_cap_blocks_admission() {
        let res = state(2, 3);
        res.mark_connected();
        res.request_start();
        res.request_start();
        assert!(!res.can_accept());
        res.request_complete(true);
        assert!(res.can_accept());
    }

    #[test]
    fn degraded_after_threshold_and_still_accepting() {
        let res = state(10, 3);
        res.mark_connected();
        for _ in 0..3 {
            res.request_start();
            res.request_complete(false);
        }
        assert_eq!(res.state(), ConnectionState::Degraded);
        // Degraded still admits traffic.
        assert!(res.can_accept());
    }

    #[test]
    fn success_resets_error_streak_and_recovers() {
        let res = state(10, 3);
        res.mark_connected();
        for _ in 0..3 {
            res.request_start();
            res.request_complete(false);
        }
        assert_eq!(res.state(), ConnectionState::Degraded);

        res.request_start();
        res.request_complete(true);
        assert_eq!(res.state(), ConnectionState::Connected);
        assert_eq!(res.backoff(), Duration::from_millis(100));
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let res = state(10, 100);
        res.mark_connected();
        let mut previous = res.backoff();
        for _ in 0..5 {
            res.request_start();
            res.request_complete(false);
            let now = res.backoff();
            assert!(now >= previous);
            previous = now;
        }
        assert_eq!(res.backoff(), Duration::from_millis(800));
    }

    #[test]
    fn reconnecting_rejects_and_counts_attempts() {
        let res = state(10, 3);
        res.mark_connected();
        res.mark_reconnecting();
        assert!(!res.can_accept());
        assert_eq!(res.stats().reconnect_attempts, 1);
        res.mark_connected();
        assert_eq!(res.stats().reconnect_attempts, 0);
    }
}
