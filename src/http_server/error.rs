//! Error envelope and the conflict priority contract.
//!
//! The first rejecting guard decides the response; its conflict level is
//! stable and wire-visible so clients can reason about which layer said
//! no. Every error response carries the same envelope shape and emits one
//! conflict-aware log record.

use http::StatusCode;
use hyper::header::{CONTENT_TYPE, RETRY_AFTER};
use hyper::{Body, Response};
use serde_json::json;
use thiserror::Error;

use crate::logging::{self, ConflictFields, Level, RequestIds};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictLevel {
    RateLimit,
    AuthGateway,
    RequestGateway,
    RouterIntake,
    RouterRuntime,
    InternalGateway,
}

impl ConflictLevel {
    pub fn level(&self) -> u8 {
        match self {
            ConflictLevel::RateLimit => 1,
            ConflictLevel::AuthGateway => 2,
            ConflictLevel::RequestGateway => 3,
            ConflictLevel::RouterIntake => 4,
            ConflictLevel::RouterRuntime => 5,
            ConflictLevel::InternalGateway => 6,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ConflictLevel::RateLimit => "rate_limit",
            ConflictLevel::AuthGateway => "auth_gateway",
            ConflictLevel::RequestGateway => "request_gateway",
            ConflictLevel::RouterIntake => "router_intake",
            ConflictLevel::RouterRuntime => "router_runtime",
            ConflictLevel::InternalGateway => "internal_gateway",
        }
    }

    pub fn severity(&self) -> Level {
        match self {
            ConflictLevel::RateLimit
            | ConflictLevel::AuthGateway
            | ConflictLevel::RequestGateway => Level::Warn,
            _ => Level::Error,
        }
    }
}

/// Rate-limit response headers attached to a 429.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: u64,
    pub retry_after_secs: u32,
}

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct GatewayError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub conflict: ConflictLevel,
    pub intake_error_code: Option<String>,
    pub retry_after_secs: Option<u32>,
    pub rate_limit: Option<RateLimitInfo>,
    pub details: serde_json::Value,
}

impl GatewayError {
    fn new(
        status: StatusCode,
        code: &str,
        message: impl Into<String>,
        conflict: ConflictLevel,
    ) -> Self {
        GatewayError {
            status,
            code: code.to_string(),
            message: message.into(),
            conflict,
            intake_error_code: None,
            retry_after_secs: None,
            rate_limit: None,
            details: json!({}),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            message,
            ConflictLevel::RequestGateway,
        )
    }

    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "invalid_schema",
            message,
            ConflictLevel::RequestGateway,
        )
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            message,
            ConflictLevel::AuthGateway,
        )
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            "conflict",
            message,
            ConflictLevel::RequestGateway,
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "not_found",
            message,
            ConflictLevel::RequestGateway,
        )
    }

    pub fn rate_limited(endpoint: &str, info: RateLimitInfo) -> Self {
        let mut err = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_exceeded",
            "Too many requests",
            ConflictLevel::RateLimit,
        );
        err.details = json!({
            "endpoint": endpoint,
            "retry_after_seconds": info.retry_after_secs,
        });
        err.rate_limit = Some(info);
        err
    }

    /// Backpressure fast-fail: 503 with a retry hint, bus never contacted.
    pub fn service_overloaded(retry_after_secs: u32) -> Self {
        let mut err = Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_overloaded",
            "Router is overloaded, please retry later",
            ConflictLevel::RouterRuntime,
        );
        err.retry_after_secs = Some(retry_after_secs);
        err
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            message,
            ConflictLevel::RouterRuntime,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            message,
            ConflictLevel::InternalGateway,
        )
    }

    /// Error relayed from a Router `ok=false` reply.
    pub fn from_router(
        status: StatusCode,
        code: String,
        message: String,
        intake_error_code: Option<String>,
        conflict: ConflictLevel,
    ) -> Self {
        let mut err = Self::new(status, &code, message, conflict);
        err.intake_error_code = intake_error_code;
        err
    }

    /// Builds the error envelope, emits the conflict log record and
    /// converts into the HTTP response.
    pub fn into_response(self, ids: &RequestIds) -> Response<Body> {
        let body = json!({
            "ok": false,
            "error": {
                "code": self.code,
                "message": self.message,
                "intake_error_code": self.intake_error_code,
                "details": self.details,
            },
            "context": {
                "request_id": ids.request_id,
                "trace_id": ids.trace_id,
                "tenant_id": ids.tenant_id,
            },
        });

        logging::log_error_envelope(
            "c-gateway",
            "http_response",
            &self.message,
            ids,
            &ConflictFields {
                error_type: self.conflict.error_type(),
                severity: self.conflict.severity(),
                http_status: self.status.as_u16(),
                gateway_error_code: &self.code,
                intake_error_code: self.intake_error_code.as_deref(),
                conflict_priority_level: self.conflict.level(),
            },
            None,
        );

        let mut builder = Response::builder()
            .status(self.status)
            .header(CONTENT_TYPE, "application/json");
        if let Some(info) = self.rate_limit {
            builder = builder
                .header("X-RateLimit-Limit", info.limit)
                .header("X-RateLimit-Remaining", info.remaining)
                .header("X-RateLimit-Reset", info.reset_at)
                .header(RETRY_AFTER, info.retry_after_secs);
        } else if let Some(retry_after) = self.retry_after_secs {
            builder = builder.header(RETRY_AFTER, retry_after);
        }

        // Envelope is a map with string keys; serialization cannot fail.
        builder
            .body(Body::from(format!("{body}\n")))
            .expect("static response parts are valid")
    }
}

/// Outcome of inspecting a Router reply.
///
/// `Unparseable` is its own case: a reply that is not JSON is a runtime
/// failure, never a success path.
#[derive(Debug, PartialEq, Eq)]
pub enum RouterOutcome {
    Success,
    Error {
        status: StatusCode,
        code: String,
        message: String,
        intake_error_code: Option<String>,
        conflict: ConflictLevel,
    },
    Unparseable,
}

fn router_code_status(code: &str) -> StatusCode {
    match code {
        "invalid_request" => StatusCode::BAD_REQUEST,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "policy_not_found" | "extension_not_found" => StatusCode::NOT_FOUND,
        "validator_blocked" => StatusCode::FORBIDDEN,
        "extension_timeout" => StatusCode::GATEWAY_TIMEOUT,
        "extension_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Classifies a Router reply body. `ok=false` maps the error code family
/// to an HTTP status; `internal`/`unavailable` are runtime-class, every
/// other code is intake-class. The router code is preserved verbatim as
/// `intake_error_code` when the reply does not carry one explicitly.
pub fn classify_router_reply(body: &[u8]) -> RouterOutcome {
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return RouterOutcome::Unparseable,
    };
    if !value.is_object() {
        return RouterOutcome::Unparseable;
    }
    match value.get("ok") {
        Some(serde_json::Value::Bool(false)) => {}
        _ => return RouterOutcome::Success,
    }

    let error = value.get("error").cloned().unwrap_or(json!({}));
    let code = error
        .get("code")
        .and_then(|c| c.as_str())
        .unwrap_or("internal")
        .to_string();
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("Router error")
        .to_string();
    let explicit_intake = error
        .get("intake_error_code")
        .and_then(|c| c.as_str())
        .map(str::to_string);

    let conflict = if code == "internal" || code == "unavailable" {
        ConflictLevel::RouterRuntime
    } else {
        ConflictLevel::RouterIntake
    };

    RouterOutcome::Error {
        status: router_code_status(&code),
        intake_error_code: explicit_intake.or_else(|| Some(code.clone())),
        code,
        message,
        conflict,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_code_mapping_matches_the_contract() {
        let cases = [
            ("invalid_request", 400),
            ("unauthorized", 401),
            ("policy_not_found", 404),
            ("extension_not_found", 404),
            ("validator_blocked", 403),
            ("extension_timeout", 504),
            ("extension_unavailable", 503),
            ("extension_error", 500),
            ("post_processor_failed", 500),
            ("decision_failed", 500),
            ("internal", 500),
        ];
        for (code, status) in cases {
            assert_eq!(router_code_status(code).as_u16(), status, "code {code}");
        }
    }

    #[test]
    fn ok_false_is_classified_with_preserved_code() {
        let body = br#"{"ok":false,"error":{"code":"policy_not_found","message":"x"}}"#;
        match classify_router_reply(body) {
            RouterOutcome::Error {
                status,
                code,
                intake_error_code,
                conflict,
                ..
            } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(code, "policy_not_found");
                assert_eq!(intake_error_code.as_deref(), Some("policy_not_found"));
                assert_eq!(conflict, ConflictLevel::RouterIntake);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn runtime_family_is_runtime_conflict() {
        let body = br#"{"ok":false,"error":{"code":"internal","message":"boom"}}"#;
        match classify_router_reply(body) {
            RouterOutcome::Error { conflict, .. } => {
                assert_eq!(conflict, ConflictLevel::RouterRuntime);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn ok_true_and_plain_decisions_are_success() {
        assert_eq!(
            classify_router_reply(br#"{"ok":true,"result":{}}"#),
            RouterOutcome::Success
        );
        // A decision document without an "ok" field is the success shape.
        assert_eq!(
            classify_router_reply(br#"{"message_id":"m1","provider_id":"p1"}"#),
            RouterOutcome::Success
        );
    }

    #[test]
    fn garbage_is_unparseable_not_success() {
        assert_eq!(classify_router_reply(b"not json"), RouterOutcome::Unparseable);
        assert_eq!(classify_router_reply(b"[1,2,3]"), RouterOutcome::Unparseable);
    }

    #[test]
    fn envelope_shape_and_rate_limit_headers() {
        let ids = RequestIds {
            request_id: "r1".into(),
            trace_id: "t1".into(),
            tenant_id: "acme".into(),
            run_id: String::new(),
        };
        let err = GatewayError::rate_limited(
            "/api/v1/routes/decide",
            RateLimitInfo {
                limit: 50,
                remaining: 0,
                reset_at: 1_700_000_060,
                retry_after_secs: 30,
            },
        );
        let response = err.into_response(&ids);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("X-RateLimit-Remaining").unwrap(),
            "0"
        );
        assert_eq!(response.headers().get("Retry-After").unwrap(), "30");
        assert_eq!(
            response.headers().get("X-RateLimit-Reset").unwrap(),
            "1700000060"
        );
    }

    #[test]
    fn conflict_levels_are_stable() {
        assert_eq!(ConflictLevel::RateLimit.level(), 1);
        assert_eq!(ConflictLevel::AuthGateway.level(), 2);
        assert_eq!(ConflictLevel::RequestGateway.level(), 3);
        assert_eq!(ConflictLevel::RouterIntake.level(), 4);
        assert_eq!(ConflictLevel::RouterRuntime.level(), 5);
        assert_eq!(ConflictLevel::InternalGateway.level(), 6);
    }
}
