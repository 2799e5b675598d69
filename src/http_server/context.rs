//! Per-request context: correlation ids and the server span.

use hyper::{Body, Request};

use crate::logging::RequestIds;
use crate::tracing_utils::{
    parse_traceparent, SpanContext, SpanKind, SpanStatus, Tracer,
};

/// Threaded through admission and forwarding for one request. All emitted
/// log records and error envelopes carry these identifiers (empty when
/// unset) so logs, metrics and traces always correlate.
pub struct RequestContext {
    pub request_id: String,
    pub trace_id: String,
    pub tenant_id: String,
    pub run_id: String,
    pub has_auth_header: bool,
    pub client_ip: String,
    span: Option<crate::tracing_utils::Span>,
}

fn header_str<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

impl RequestContext {
    /// Populates the context from headers and starts the server span:
    /// a child of a well-formed `traceparent` when present, else a new
    /// root.
    pub fn from_request(req: &Request<Body>, tracer: &Tracer, client_ip: String) -> Self {
        let tenant_id = header_str(req, "x-tenant-id").unwrap_or("").trim().to_string();
        let header_trace_id = header_str(req, "x-trace-id").unwrap_or("").trim().to_string();
        let has_auth_header = req.headers().contains_key("authorization");

        let parent: Option<SpanContext> =
            header_str(req, "traceparent").and_then(parse_traceparent);

        let mut span = tracer.start_span("gateway.http.request", SpanKind::Server, parent.as_ref());
        span.set_attribute("http.method", req.method());
        span.set_attribute("http.url", req.uri());

        let trace_id = if !header_trace_id.is_empty() {
            header_trace_id
        } else if let Some(parent) = &parent {
            parent.trace_id.to_string()
        } else {
            span.trace_id.to_string()
        };

        if !tenant_id.is_empty() {
            span.set_attribute("tenant_id", &tenant_id);
        }
        span.set_attribute("trace_id", &trace_id);

        RequestContext {
            request_id: String::new(),
            trace_id,
            tenant_id,
            run_id: String::new(),
            has_auth_header,
            client_ip,
            span: Some(span),
        }
    }

    pub fn ids(&self) -> RequestIds {
        RequestIds {
            request_id: self.request_id.clone(),
            trace_id: self.trace_id.clone(),
            tenant_id: self.tenant_id.clone(),
            run_id: self.run_id.clone(),
        }
    }

    /// Child-span context for outbound bus calls.
    pub fn span_context(&self) -> Option<SpanContext> {
        self.span.as_ref().map(|s| s.context())
    }

    /// Ends the server span with the final HTTP status. Idempotent so
    /// every exit path may call it.
    pub fn finish_span(&mut self, http_status: u16) {
        if let Some(mut span) = self.span.take() {
            if !self.request_id.is_empty() {
                span.set_attribute("request_id", &self.request_id);
            }
            span.set_attribute("http.status_code", http_status);
            span.set_status(if http_status >= 400 {
                SpanStatus::Error
            } else {
                SpanStatus::Ok
            });
            span.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::IntCounter;

    fn tracer() -> Tracer {
        Tracer::disabled(IntCounter::new("spans_dropped", "test").unwrap())
    }

    fn request(headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/api/v1/routes/decide");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn pulls_ids_from_headers() {
        let req = request(&[
            ("X-Tenant-ID", "acme"),
            ("X-Trace-ID", "trace-123"),
            ("Authorization", "Bearer x"),
        ]);
        let ctx = RequestContext::from_request(&req, &tracer(), "10.1.2.3".into());
        assert_eq!(ctx.tenant_id, "acme");
        assert_eq!(ctx.trace_id, "trace-123");
        assert!(ctx.has_auth_header);
        assert_eq!(ctx.client_ip, "10.1.2.3");
    }

    #[test]
    fn traceparent_supplies_the_trace_root() {
        let req = request(&[(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )]);
        let ctx = RequestContext::from_request(&req, &tracer(), String::new());
        assert_eq!(ctx.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        let span_ctx = ctx.span_context().unwrap();
        assert_eq!(
            span_ctx.trace_id.to_string(),
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
    }

    #[test]
    fn malformed_traceparent_starts_a_new_root() {
        let req = request(&[("traceparent", "garbage")]);
        let ctx = RequestContext::from_request(&req, &tracer(), String::new());
        assert_eq!(ctx.trace_id.len(), 32);
        assert!(ctx.span_context().is_some());
    }

    #[test]
    fn finish_span_is_idempotent() {
        let req = request(&[]);
        let mut ctx = RequestContext::from_request(&req, &tracer(), String::new());
        ctx.finish_span(200);
        ctx.finish_span(500);
        assert!(ctx.span_context().is_none());
    }
}
