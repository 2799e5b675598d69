//! Bounded async connection pool.
//!
//! One implementation backs both the bus pool and the Redis rate-limiter
//! backend: a `Connector` knows how to open and probe a connection, the
//! pool owns the bounded slot array, the timed acquire wait, the idle
//! reaper and the statistics.
//!
//! Pool invariants, checked by the tests:
//! `active + idle == current`, `total_created - total_destroyed == current`,
//! `total_acquired - total_released == active`.
//!
//! The interior mutex is a `std::sync::Mutex`: every critical section is
//! short and never held across an await; connects happen against a reserved
//! slot outside the lock.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out waiting for a connection")]
    AcquireTimeout,

    #[error("pool is shut down")]
    Shutdown,

    #[error("connect failed: {0}")]
    Connect(String),
}

/// Opens and probes connections for one pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn connect(&self) -> Result<Self::Conn, PoolError>;

    /// Liveness probe used by the idle reaper.
    async fn check(&self, conn: &mut Self::Conn) -> bool;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub current: usize,
    pub active: usize,
    pub idle: usize,
    pub total_created: u64,
    pub total_destroyed: u64,
    pub total_acquired: u64,
    pub total_released: u64,
    pub acquire_timeouts: u64,
    pub health_check_failures: u64,
}

struct Slot<T> {
    conn: T,
    last_used: Instant,
}

struct Inner<T> {
    idle: Vec<Slot<T>>,
    active: usize,
    // Slots reserved by in-progress connects; counted against the cap.
    reserving: usize,
    shutdown: bool,
    stats: PoolStats,
}

impl<T> Inner<T> {
    fn sync_stats(&mut self) {
        self.stats.active = self.active;
        self.stats.idle = self.idle.len();
    }
}

pub struct ConnectionPool<C: Connector> {
    connector: C,
    config: PoolConfig,
    inner: Mutex<Inner<C::Conn>>,
    available: Notify,
}

/// A checked-out connection. Hand it back with [`PooledConn::release`]; a
/// plain drop destroys the connection instead, so a failed request never
/// puts a suspect connection back into rotation.
pub struct PooledConn<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    conn: Option<C::Conn>,
}

impl<'a, C: Connector> std::fmt::Debug for PooledConn<'a, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("has_conn", &self.conn.is_some())
            .finish()
    }
}

impl<'a, C: Connector> PooledConn<'a, C> {
    pub fn conn(&mut self) -> &mut C::Conn {
        self.conn.as_mut().expect("connection present until release")
    }

    /// Returns the connection to the idle set and wakes one waiter.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            let mut inner = self.pool.inner.lock().unwrap();
            inner.active -= 1;
            inner.stats.total_released += 1;
            if inner.shutdown {
                inner.stats.total_destroyed += 1;
                inner.stats.current -= 1;
            } else {
                inner.idle.push(Slot {
                    conn,
                    last_used: Instant::now(),
                });
            }
            inner.sync_stats();
            drop(inner);
            self.pool.available.notify_one();
        }
    }
}

impl<'a, C: Connector> Drop for PooledConn<'a, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn);
            let mut inner = self.pool.inner.lock().unwrap();
            inner.active -= 1;
            inner.stats.total_released += 1;
            inner.stats.total_destroyed += 1;
            inner.stats.current -= 1;
            inner.sync_stats();
            drop(inner);
            self.pool.available.notify_one();
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Builds an empty pool. Call [`ConnectionPool::warm_up`] to eagerly
    /// open `min_connections`; otherwise the pool grows on demand.
    pub fn new(connector: C, config: PoolConfig) -> Self {
        ConnectionPool {
            connector,
            config,
            inner: Mutex::new(Inner {
                idle: Vec::new(),
                active: 0,
                reserving: 0,
                shutdown: false,
                stats: PoolStats::default(),
            }),
            available: Notify::new(),
        }
    }

    /// Opens up to `min_connections` idle connections. Warm-up failures are
    /// logged and skipped; demand-driven growth covers the shortfall later.
    pub async fn warm_up(&self) {
        for _ in 0..self.config.min_connections {
            match self.open_connection().await {
                Ok(conn) => {
                    let mut inner = self.inner.lock().unwrap();
                    inner.idle.push(Slot {
                        conn,
                        last_used: Instant::now(),
                    });
                    inner.stats.total_created += 1;
                    inner.stats.current += 1;
                    inner.sync_stats();
                }
                Err(err) => {
                    tracing::warn!("pool warm-up connection failed: {err}");
                    break;
                }
            }
        }
    }

    async fn open_connection(&self) -> Result<C::Conn, PoolError> {
        tokio::time::timeout(self.config.connection_timeout, self.connector.connect())
            .await
            .map_err(|_| PoolError::Connect("connection timed out".into()))?
    }

    /// Returns an idle connection, creating one when under the cap, or
    /// waits up to `timeout` for a release.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConn<'_, C>, PoolError> {
        let deadline = Instant::now() + timeout;

        loop {
            let reserved = {
                let mut inner = self.inner.lock().unwrap();
                if inner.shutdown {
                    return Err(PoolError::Shutdown);
                }
                if let Some(slot) = inner.idle.pop() {
                    inner.active += 1;
                    inner.stats.total_acquired += 1;
                    inner.sync_stats();
                    return Ok(PooledConn {
                        pool: self,
                        conn: Some(slot.conn),
                    });
                }
                if inner.stats.current + inner.reserving < self.config.max_connections {
                    inner.reserving += 1;
                    true
                } else {
                    false
                }
            };

            if reserved {
                let result = self.open_connection().await;
                let mut inner = self.inner.lock().unwrap();
                inner.reserving -= 1;
                match result {
                    Ok(conn) => {
                        if inner.shutdown {
                            return Err(PoolError::Shutdown);
                        }
                        inner.active += 1;
                        inner.stats.current += 1;
                        inner.stats.total_created += 1;
                        inner.stats.total_acquired += 1;
                        inner.sync_stats();
                        return Ok(PooledConn {
                            pool: self,
                            conn: Some(conn),
                        });
                    }
                    Err(err) => return Err(err),
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, self.available.notified())
                    .await
                    .is_err()
            {
                self.inner.lock().unwrap().stats.acquire_timeouts += 1;
                return Err(PoolError::AcquireTimeout);
            }
        }
    }

    /// Destroys idle connections that outlived `idle_timeout` or fail the
    /// liveness probe. Returns the number removed.
    pub async fn health_check(&self) -> usize {
        let mut candidates = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.idle)
        };

        let now = Instant::now();
        let mut kept = Vec::with_capacity(candidates.len());
        let mut removed = 0usize;
        let mut probe_failures = 0u64;

        for mut slot in candidates.drain(..) {
            if now.duration_since(slot.last_used) > self.config.idle_timeout {
                removed += 1;
                continue;
            }
            if !self.connector.check(&mut slot.conn).await {
                removed += 1;
                probe_failures += 1;
                continue;
            }
            kept.push(slot);
        }

        let mut inner = self.inner.lock().unwrap();
        // Connections released while the probe ran stay.
        kept.append(&mut inner.idle);
        inner.idle = kept;
        inner.stats.current -= removed;
        inner.stats.total_destroyed += removed as u64;
        inner.stats.health_check_failures += probe_failures;
        inner.sync_stats();
        removed
    }

    /// Marks the pool shut down, destroys idle connections and wakes every
    /// waiter. In-flight connections are destroyed on release.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        let destroyed = inner.idle.len();
        inner.idle.clear();
        inner.stats.current -= destroyed;
        inner.stats.total_destroyed += destroyed as u64;
        inner.sync_stats();
        drop(inner);
        self.available.notify_waiters();
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.lock().unwrap().stats
    }
}
