//! Environment-driven configuration, read once at startup.
//!
//! Every option is validated here; bad values fail startup with the
//! offending variable named. The single sanctioned soft failure is the
//! in-memory rate-limiter fallback, which is decided later by the limiter
//! factory, not by silently coercing values here.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: expected a boolean (true/false/1/0/yes/no), got {value:?}")]
    InvalidBool { var: &'static str, value: String },

    #[error("{var}: expected an integer, got {value:?}")]
    InvalidInt { var: &'static str, value: String },

    #[error("{var}: value {value} outside allowed range {min}..={max}")]
    OutOfRange {
        var: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("{var}: unknown mode {value:?} (expected local, redis or hybrid)")]
    InvalidMode { var: &'static str, value: String },

    #[error("{var}: invalid URL: {source}")]
    InvalidUrl {
        var: &'static str,
        source: url::ParseError,
    },
}

fn read_bool(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(var) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool { var, value: raw }),
        },
        Err(_) => Ok(default),
    }
}

fn read_int(var: &'static str, default: i64) -> Result<i64, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| ConfigError::InvalidInt { var, value: raw }),
        Err(_) => Ok(default),
    }
}

fn read_int_in(
    var: &'static str,
    default: i64,
    min: i64,
    max: i64,
) -> Result<i64, ConfigError> {
    let value = read_int(var, default)?;
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            var,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

fn read_string(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

/// Rate-limiter backend selector, from `GATEWAY_RATE_LIMIT_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitMode {
    Local,
    Redis,
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub mode: RateLimitMode,
    pub window: Duration,
    pub routes_decide_limit: u32,
    pub messages_limit: u32,
    pub registry_blocks_limit: u32,
    pub fallback_to_local: bool,
}

impl RateLimitConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let mode = match read_string("GATEWAY_RATE_LIMIT_MODE", "local").as_str() {
            "local" => RateLimitMode::Local,
            "redis" => RateLimitMode::Redis,
            "hybrid" => RateLimitMode::Hybrid,
            other => {
                return Err(ConfigError::InvalidMode {
                    var: "GATEWAY_RATE_LIMIT_MODE",
                    value: other.to_string(),
                })
            }
        };
        Ok(RateLimitConfig {
            mode,
            window: Duration::from_secs(read_int_in(
                "GATEWAY_RATE_LIMIT_TTL_SECONDS",
                60,
                1,
                86_400,
            )? as u64),
            routes_decide_limit: read_int_in(
                "GATEWAY_RATE_LIMIT_ROUTES_DECIDE_LIMIT",
                50,
                1,
                1_000_000,
            )? as u32,
            messages_limit: read_int_in("GATEWAY_RATE_LIMIT_MESSAGES", 100, 1, 1_000_000)?
                as u32,
            registry_blocks_limit: read_int_in(
                "GATEWAY_RATE_LIMIT_REGISTRY_BLOCKS",
                200,
                1,
                1_000_000,
            )? as u32,
            fallback_to_local: read_bool("GATEWAY_RATE_LIMIT_FALLBACK_TO_LOCAL", true)?,
        })
    }
}

/// Breaker policy applied while the Redis circuit is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerMode {
    FailOpen,
    FailClosed,
}

#[derive(Debug, Clone)]
pub struct RedisLimiterConfig {
    pub url: String,
    pub window: Duration,
    pub global_limit: u32,
    pub route_limit_messages: u32,
    pub pool_size: usize,
    pub pool_acquire_timeout: Duration,
    pub command_timeout: Duration,
    pub retries: u32,
    pub retry_backoff: Duration,
    pub breaker_mode: BreakerMode,
    pub breaker_error_threshold: u32,
    pub breaker_cooldown: Duration,
    pub breaker_half_open_attempts: u32,
}

impl RedisLimiterConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let url = match env::var("C_GATEWAY_REDIS_RATE_LIMIT_REDIS_URI") {
            Ok(uri) if !uri.is_empty() => {
                url::Url::parse(&uri).map_err(|source| ConfigError::InvalidUrl {
                    var: "C_GATEWAY_REDIS_RATE_LIMIT_REDIS_URI",
                    source,
                })?;
                uri
            }
            _ => {
                let host = read_string("C_GATEWAY_REDIS_RATE_LIMIT_REDIS_HOST", "localhost");
                let port =
                    read_int_in("C_GATEWAY_REDIS_RATE_LIMIT_REDIS_PORT", 6379, 1, 65_535)?;
                format!("redis://{host}:{port}")
            }
        };
        let mode = match read_string("C_GATEWAY_REDIS_RATE_LIMIT_CB_MODE", "fail_open").as_str()
        {
            "fail_closed" => BreakerMode::FailClosed,
            _ => BreakerMode::FailOpen,
        };
        Ok(RedisLimiterConfig {
            url,
            window: Duration::from_secs(read_int_in(
                "C_GATEWAY_REDIS_RATE_LIMIT_WINDOW_SEC",
                1,
                1,
                86_400,
            )? as u64),
            global_limit: read_int_in(
                "C_GATEWAY_REDIS_RATE_LIMIT_GLOBAL_LIMIT",
                1000,
                1,
                10_000_000,
            )? as u32,
            route_limit_messages: read_int_in(
                "C_GATEWAY_REDIS_RATE_LIMIT_ROUTE_LIMIT_MESSAGES",
                200,
                0,
                10_000_000,
            )? as u32,
            pool_size: read_int_in("C_GATEWAY_REDIS_RATE_LIMIT_POOL_SIZE", 32, 1, 1024)?
                as usize,
            pool_acquire_timeout: Duration::from_millis(read_int_in(
                "C_GATEWAY_REDIS_RATE_LIMIT_POOL_ACQUIRE_TIMEOUT_MS",
                10,
                1,
                60_000,
            )? as u64),
            command_timeout: Duration::from_millis(read_int_in(
                "C_GATEWAY_REDIS_RATE_LIMIT_REDIS_TIMEOUT_MS",
                30,
                1,
                60_000,
            )? as u64),
            retries: read_int_in("C_GATEWAY_REDIS_RATE_LIMIT_RETRIES", 2, 0, 10)? as u32,
            retry_backoff: Duration::from_millis(read_int_in(
                "C_GATEWAY_REDIS_RATE_LIMIT_RETRY_BACKOFF_MS",
                5,
                0,
                10_000,
            )? as u64),
            breaker_mode: mode,
            breaker_error_threshold: read_int_in(
                "C_GATEWAY_REDIS_RATE_LIMIT_CB_ERROR_THRESHOLD",
                5,
                1,
                10_000,
            )? as u32,
            breaker_cooldown: Duration::from_secs(read_int_in(
                "C_GATEWAY_REDIS_RATE_LIMIT_CB_COOLDOWN_SEC",
                15,
                1,
                3_600,
            )? as u64),
            breaker_half_open_attempts: read_int_in(
                "C_GATEWAY_REDIS_RATE_LIMIT_CB_HALF_OPEN_ATTEMPTS",
                2,
                1,
                100,
            )? as u32,
        })
    }
}

#[derive(Debug, Clone)]
pub struct IpcConfig {
    pub enabled: bool,
    pub socket_path: PathBuf,
    pub max_connections: usize,
    pub nats_enabled: bool,
    pub request_timeout: Duration,
}

impl IpcConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(IpcConfig {
            enabled: read_bool("CGW_IPC_ENABLE", true)?,
            socket_path: PathBuf::from(read_string(
                "CGW_IPC_SOCKET_PATH",
                "/tmp/beamline-gateway.sock",
            )),
            max_connections: read_int_in("CGW_IPC_MAX_CONNECTIONS", 64, 1, 1024)? as usize,
            nats_enabled: read_bool("CGW_IPC_NATS_ENABLE", false)?,
            request_timeout: Duration::from_millis(read_int_in(
                "CGW_IPC_TIMEOUT_MS",
                30_000,
                100,
                300_000,
            )? as u64),
        })
    }
}

/// Router RPC subjects on the bus, overridable per deployment.
#[derive(Debug, Clone)]
pub struct BusSubjects {
    pub decide: String,
    pub get_decision: String,
    pub extension_health: String,
    pub circuit_breaker_states: String,
    pub dry_run_pipeline: String,
    pub pipeline_complexity: String,
}

impl BusSubjects {
    fn from_env() -> Self {
        BusSubjects {
            decide: read_string("ROUTER_DECIDE_SUBJECT", "beamline.router.v1.decide"),
            get_decision: read_string(
                "ROUTER_GET_DECISION_SUBJECT",
                "beamline.router.v1.get_decision",
            ),
            extension_health: read_string(
                "ROUTER_EXTENSION_HEALTH_SUBJECT",
                "beamline.router.v1.admin.get_extension_health",
            ),
            circuit_breaker_states: read_string(
                "ROUTER_CIRCUIT_BREAKERS_SUBJECT",
                "beamline.router.v1.admin.get_circuit_breaker_states",
            ),
            dry_run_pipeline: read_string(
                "ROUTER_DRY_RUN_SUBJECT",
                "beamline.router.v1.admin.dry_run_pipeline",
            ),
            pipeline_complexity: read_string(
                "ROUTER_PIPELINE_COMPLEXITY_SUBJECT",
                "beamline.router.v1.admin.get_pipeline_complexity",
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub url: String,
    pub subjects: BusSubjects,
    pub min_connections: usize,
    pub max_connections: usize,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub pool_acquire_timeout: Duration,
    pub request_timeout: Duration,
}

impl BusConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let min = read_int_in("CGW_NATS_POOL_MIN_CONNECTIONS", 1, 1, 256)? as usize;
        let max = read_int_in("CGW_NATS_POOL_MAX_CONNECTIONS", 4, 1, 256)? as usize;
        let max = max.max(min);
        Ok(BusConfig {
            url: read_string("CGW_IPC_NATS_URL", "nats://localhost:4222"),
            subjects: BusSubjects::from_env(),
            min_connections: min,
            max_connections: max,
            connection_timeout: Duration::from_millis(read_int_in(
                "CGW_NATS_CONNECTION_TIMEOUT_MS",
                5_000,
                100,
                60_000,
            )? as u64),
            idle_timeout: Duration::from_secs(read_int_in(
                "CGW_NATS_IDLE_TIMEOUT_SEC",
                60,
                1,
                3_600,
            )? as u64),
            pool_acquire_timeout: Duration::from_millis(read_int_in(
                "CGW_NATS_POOL_ACQUIRE_TIMEOUT_MS",
                1_000,
                1,
                60_000,
            )? as u64),
            request_timeout: Duration::from_millis(read_int_in(
                "CGW_IPC_TIMEOUT_MS",
                30_000,
                100,
                300_000,
            )? as u64),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub max_inflight: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub degraded_threshold: u32,
}

impl ResilienceConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(ResilienceConfig {
            max_inflight: read_int_in("CGW_NATS_MAX_INFLIGHT", 100, 1, 100_000)? as u32,
            min_backoff: Duration::from_millis(read_int_in(
                "CGW_NATS_MIN_BACKOFF_MS",
                100,
                1,
                60_000,
            )? as u64),
            max_backoff: Duration::from_millis(read_int_in(
                "CGW_NATS_MAX_BACKOFF_MS",
                30_000,
                1,
                600_000,
            )? as u64),
            degraded_threshold: read_int_in("CGW_NATS_DEGRADED_THRESHOLD", 3, 1, 1_000)?
                as u32,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    pub router_metrics_url: String,
    pub check_interval: Duration,
    pub fetch_timeout: Duration,
}

impl BackpressureConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(BackpressureConfig {
            router_metrics_url: read_string(
                "GATEWAY_ROUTER_METRICS_URL",
                "http://localhost:8080/_metrics",
            ),
            check_interval: Duration::from_secs(read_int_in(
                "GATEWAY_BACKPRESSURE_CHECK_INTERVAL_SECONDS",
                5,
                1,
                3_600,
            )? as u64),
            fetch_timeout: Duration::from_millis(read_int_in(
                "GATEWAY_BACKPRESSURE_TIMEOUT_MS",
                1_000,
                10,
                60_000,
            )? as u64),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AbuseConfig {
    pub enabled: bool,
    pub min_payload_size: usize,
    pub large_payload_threshold: usize,
    pub large_payload_ratio_threshold: u32,
    pub targeted_tenant_rate_threshold: u32,
    pub evasion_api_keys_threshold: usize,
    pub evasion_ips_threshold: usize,
    pub multi_tenant_active_threshold: usize,
    pub retention_window: Duration,
}

impl AbuseConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(AbuseConfig {
            enabled: read_bool("GATEWAY_ABUSE_DETECTION_ENABLED", false)?,
            min_payload_size: read_int_in("GATEWAY_ABUSE_MIN_PAYLOAD_SIZE", 2, 0, 1 << 20)?
                as usize,
            large_payload_threshold: read_int_in(
                "GATEWAY_ABUSE_LARGE_PAYLOAD_THRESHOLD",
                524_288,
                1,
                64 << 20,
            )? as usize,
            large_payload_ratio_threshold: read_int_in(
                "GATEWAY_ABUSE_LARGE_PAYLOAD_RATIO_THRESHOLD",
                80,
                1,
                100,
            )? as u32,
            targeted_tenant_rate_threshold: read_int_in(
                "GATEWAY_ABUSE_TARGETED_TENANT_THRESHOLD",
                500,
                1,
                1_000_000,
            )? as u32,
            evasion_api_keys_threshold: read_int_in(
                "GATEWAY_ABUSE_EVASION_API_KEYS_THRESHOLD",
                10,
                1,
                10_000,
            )? as usize,
            evasion_ips_threshold: read_int_in(
                "GATEWAY_ABUSE_EVASION_IPS_THRESHOLD",
                10,
                1,
                10_000,
            )? as usize,
            multi_tenant_active_threshold: read_int_in(
                "GATEWAY_ABUSE_MULTI_TENANT_ACTIVE_THRESHOLD",
                20,
                1,
                100_000,
            )? as usize,
            retention_window: Duration::from_secs(read_int_in(
                "GATEWAY_ABUSE_RETENTION_WINDOW_SECONDS",
                300,
                1,
                86_400,
            )? as u64),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub health_port: u16,
    pub auth_required: bool,
    pub rate_limit: RateLimitConfig,
    pub redis_limiter: RedisLimiterConfig,
    pub ipc: IpcConfig,
    pub bus: BusConfig,
    pub resilience: ResilienceConfig,
    pub backpressure: BackpressureConfig,
    pub abuse: AbuseConfig,
    pub otlp_endpoint: Option<String>,
    pub audit_log_path: Option<PathBuf>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let otlp_endpoint = match env::var("OTLP_ENDPOINT") {
            Ok(e) if !e.is_empty() => {
                url::Url::parse(&e).map_err(|source| ConfigError::InvalidUrl {
                    var: "OTLP_ENDPOINT",
                    source,
                })?;
                Some(e)
            }
            _ => None,
        };
        Ok(GatewayConfig {
            port: read_int_in("GATEWAY_PORT", 8080, 1, 65_535)? as u16,
            health_port: read_int_in("GATEWAY_HEALTH_PORT", 8081, 1, 65_535)? as u16,
            auth_required: read_bool("GATEWAY_AUTH_REQUIRED", false)?,
            rate_limit: RateLimitConfig::from_env()?,
            redis_limiter: RedisLimiterConfig::from_env()?,
            ipc: IpcConfig::from_env()?,
            bus: BusConfig::from_env()?,
            resilience: ResilienceConfig::from_env()?,
            backpressure: BackpressureConfig::from_env()?,
            abuse: AbuseConfig::from_env()?,
            otlp_endpoint,
            audit_log_path: env::var("GATEWAY_AUDIT_LOG_PATH").ok().map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test to avoid
    // interleaving with each other under the parallel test runner.
    #[test]
    fn env_parsing_round_trip() {
        env::remove_var("GATEWAY_RATE_LIMIT_MODE");
        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.rate_limit.mode, RateLimitMode::Local);
        assert_eq!(config.rate_limit.routes_decide_limit, 50);
        assert_eq!(config.ipc.max_connections, 64);
        assert_eq!(config.bus.subjects.decide, "beamline.router.v1.decide");

        env::set_var("GATEWAY_RATE_LIMIT_MODE", "hybrid");
        env::set_var("GATEWAY_RATE_LIMIT_MESSAGES", "200");
        env::set_var("C_GATEWAY_REDIS_RATE_LIMIT_GLOBAL_LIMIT", "1000");
        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.rate_limit.mode, RateLimitMode::Hybrid);
        assert_eq!(config.rate_limit.messages_limit, 200);
        assert_eq!(config.redis_limiter.global_limit, 1000);

        env::set_var("GATEWAY_RATE_LIMIT_MODE", "turbo");
        assert!(matches!(
            GatewayConfig::from_env(),
            Err(ConfigError::InvalidMode { .. })
        ));
        env::remove_var("GATEWAY_RATE_LIMIT_MODE");

        env::set_var("CGW_IPC_TIMEOUT_MS", "50");
        assert!(matches!(
            GatewayConfig::from_env(),
            Err(ConfigError::OutOfRange { .. })
        ));
        env::remove_var("CGW_IPC_TIMEOUT_MS");

        env::set_var("CGW_IPC_MAX_CONNECTIONS", "4096");
        assert!(matches!(
            GatewayConfig::from_env(),
            Err(ConfigError::OutOfRange { .. })
        ));
        env::remove_var("CGW_IPC_MAX_CONNECTIONS");

        env::set_var("GATEWAY_AUTH_REQUIRED", "maybe");
        assert!(matches!(
            GatewayConfig::from_env(),
            Err(ConfigError::InvalidBool { .. })
        ));
        env::remove_var("GATEWAY_AUTH_REQUIRED");
        env::remove_var("GATEWAY_RATE_LIMIT_MESSAGES");
        env::remove_var("C_GATEWAY_REDIS_RATE_LIMIT_GLOBAL_LIMIT");
    }
}
