//!
//! Beamline gateway: client admission, rate limiting and Router forwarding
//! for HTTP callers and IDE-side IPC helpers.
//!
pub mod abuse;
pub mod audit_log;
pub mod backpressure;
pub mod breaker;
pub mod buffer_pool;
pub mod bus;
pub mod config;
pub mod health;
pub mod http_server;
pub mod ipc;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod rate_limit;
pub mod tcp_listener;
pub mod tracing_utils;
