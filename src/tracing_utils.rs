//! Request tracing: span tree, W3C traceparent propagation and OTLP export.
//!
//! Spans are plain values handed to a background export task when ended;
//! nothing on the request path ever blocks on the collector, and an export
//! failure only increments `gateway_spans_dropped_total`.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hyper::{Body, Client, Method, Request};
use prometheus::IntCounter;
use rand::RngCore;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceId(pub [u8; 16]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanId(pub [u8; 8]);

impl TraceId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        TraceId(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl SpanId {
    pub const ZERO: SpanId = SpanId([0u8; 8]);

    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        SpanId(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    // OTLP numeric kinds.
    fn as_otlp(&self) -> u8 {
        match self {
            SpanKind::Internal => 1,
            SpanKind::Server => 2,
            SpanKind::Client => 3,
            SpanKind::Producer => 4,
            SpanKind::Consumer => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

/// Remote or local parent context a span can be started under.
#[derive(Debug, Clone, Copy)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

/// A span in flight. Ended explicitly with [`Span::end`]; every exit path of
/// a request must end its span.
pub struct Span {
    pub name: String,
    pub kind: SpanKind,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: SpanId,
    pub status: SpanStatus,
    pub start_time: SystemTime,
    pub attributes: Vec<(String, String)>,
    tracer: Tracer,
}

impl Span {
    pub fn context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.trace_id,
            span_id: self.span_id,
        }
    }

    pub fn set_attribute(&mut self, key: &str, value: impl ToString) {
        self.attributes.push((key.to_string(), value.to_string()));
    }

    pub fn set_status(&mut self, status: SpanStatus) {
        self.status = status;
    }

    /// Marks the end time and hands the span to the exporter.
    pub fn end(self) {
        let finished = FinishedSpan {
            name: self.name,
            kind: self.kind,
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_span_id: self.parent_span_id,
            status: self.status,
            start_time: self.start_time,
            end_time: SystemTime::now(),
            attributes: self.attributes,
        };
        self.tracer.submit(finished);
    }
}

#[derive(Debug)]
pub struct FinishedSpan {
    pub name: String,
    pub kind: SpanKind,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: SpanId,
    pub status: SpanStatus,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub attributes: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

struct TracerInner {
    sender: Option<mpsc::UnboundedSender<FinishedSpan>>,
    dropped: IntCounter,
}

impl Tracer {
    /// A tracer without an exporter: spans are counted as dropped on end.
    /// Used when `OTLP_ENDPOINT` is not configured and in tests.
    pub fn disabled(dropped: IntCounter) -> Self {
        Tracer {
            inner: Arc::new(TracerInner {
                sender: None,
                dropped,
            }),
        }
    }

    /// Spawns the export task and returns the connected tracer.
    pub fn with_otlp_exporter(
        endpoint: String,
        service_name: String,
        dropped: IntCounter,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let exporter = OtlpExporter {
            endpoint,
            service_name,
            client: Client::new(),
            dropped: dropped.clone(),
        };
        tokio::spawn(exporter.run(receiver));
        Tracer {
            inner: Arc::new(TracerInner {
                sender: Some(sender),
                dropped,
            }),
        }
    }

    pub fn start_span(
        &self,
        name: &str,
        kind: SpanKind,
        parent: Option<&SpanContext>,
    ) -> Span {
        let (trace_id, parent_span_id) = match parent {
            Some(ctx) => (ctx.trace_id, ctx.span_id),
            None => (TraceId::generate(), SpanId::ZERO),
        };
        Span {
            name: name.to_string(),
            kind,
            trace_id,
            span_id: SpanId::generate(),
            parent_span_id,
            status: SpanStatus::Unset,
            start_time: SystemTime::now(),
            attributes: Vec::new(),
            tracer: self.clone(),
        }
    }

    fn submit(&self, span: FinishedSpan) {
        match &self.inner.sender {
            Some(sender) => {
                if sender.send(span).is_err() {
                    self.inner.dropped.inc();
                }
            }
            None => self.inner.dropped.inc(),
        }
    }
}

struct OtlpExporter {
    endpoint: String,
    service_name: String,
    client: Client<hyper::client::HttpConnector>,
    dropped: IntCounter,
}

impl OtlpExporter {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<FinishedSpan>) {
        while let Some(span) = receiver.recv().await {
            if let Err(err) = self.export(&span).await {
                self.dropped.inc();
                debug!("span export failed: {err:#}");
            }
        }
    }

    async fn export(&self, span: &FinishedSpan) -> anyhow::Result<()> {
        let url = format!("{}/v1/traces", self.endpoint.trim_end_matches('/'));
        let body = serde_json::to_vec(&self.to_otlp(span))?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(url)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))?;
        let response = tokio::time::timeout(
            Duration::from_secs(5),
            self.client.request(request),
        )
        .await??;
        if !response.status().is_success() {
            anyhow::bail!("collector returned {}", response.status());
        }
        Ok(())
    }

    fn to_otlp(&self, span: &FinishedSpan) -> serde_json::Value {
        let to_nanos = |t: SystemTime| {
            t.duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
                .to_string()
        };
        let attributes: Vec<_> = span
            .attributes
            .iter()
            .map(|(k, v)| json!({"key": k, "value": {"stringValue": v}}))
            .collect();
        let status_code = match span.status {
            SpanStatus::Unset => 0,
            SpanStatus::Ok => 1,
            SpanStatus::Error => 2,
        };
        json!({
            "resourceSpans": [{
                "resource": {
                    "attributes": [{
                        "key": "service.name",
                        "value": {"stringValue": self.service_name}
                    }]
                },
                "scopeSpans": [{
                    "scope": {"name": "beamline-gateway"},
                    "spans": [{
                        "traceId": span.trace_id.to_string(),
                        "spanId": span.span_id.to_string(),
                        "parentSpanId": if span.parent_span_id.is_zero() {
                            String::new()
                        } else {
                            span.parent_span_id.to_string()
                        },
                        "name": span.name,
                        "kind": span.kind.as_otlp(),
                        "startTimeUnixNano": to_nanos(span.start_time),
                        "endTimeUnixNano": to_nanos(span.end_time),
                        "attributes": attributes,
                        "status": {"code": status_code},
                    }]
                }]
            }]
        })
    }
}

fn decode_hex<const N: usize>(hex: &str) -> Option<[u8; N]> {
    if hex.len() != N * 2 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut out = [0u8; N];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let high = (chunk[0] as char).to_digit(16)?;
        let low = (chunk[1] as char).to_digit(16)?;
        out[i] = ((high << 4) | low) as u8;
    }
    Some(out)
}

/// Parses a W3C traceparent header: `00-<32 hex>-<16 hex>-<2 hex>`.
/// All-zero trace or span ids are invalid per W3C trace-context.
pub fn parse_traceparent(header: &str) -> Option<SpanContext> {
    let mut parts = header.trim().split('-');
    let version = parts.next()?;
    let trace_hex = parts.next()?;
    let span_hex = parts.next()?;
    let flags = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if version != "00" || flags.len() != 2 || !flags.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let trace_id = TraceId(decode_hex::<16>(trace_hex)?);
    let span_id = SpanId(decode_hex::<8>(span_hex)?);
    if trace_id.is_zero() || span_id.is_zero() {
        return None;
    }
    Some(SpanContext { trace_id, span_id })
}

/// Emits a traceparent header for the given context, sampled flag set.
pub fn format_traceparent(ctx: &SpanContext) -> String {
    format!("00-{}-{}-01", ctx.trace_id, ctx.span_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_counter() -> IntCounter {
        IntCounter::new("test_spans_dropped_total", "test").unwrap()
    }

    #[test]
    fn traceparent_round_trip() {
        let header = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
        let ctx = parse_traceparent(header).unwrap();
        assert_eq!(ctx.trace_id.to_string(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ctx.span_id.to_string(), "00f067aa0ba902b7");
        assert_eq!(format_traceparent(&ctx), header);
    }

    #[test]
    fn traceparent_rejects_malformed_input() {
        assert!(parse_traceparent("").is_none());
        assert!(parse_traceparent("00-abc-def-01").is_none());
        assert!(parse_traceparent(
            "01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        )
        .is_none());
        // All-zero ids are invalid.
        assert!(parse_traceparent(
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01"
        )
        .is_none());
        assert!(parse_traceparent(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01"
        )
        .is_none());
        // Non-hex flags.
        assert!(parse_traceparent(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-zz"
        )
        .is_none());
    }

    #[test]
    fn child_spans_share_the_trace_root_spans_generate_it() {
        let tracer = Tracer::disabled(test_counter());
        let root = tracer.start_span("root", SpanKind::Server, None);
        assert!(root.parent_span_id.is_zero());
        assert!(!root.trace_id.is_zero());

        let child = tracer.start_span("child", SpanKind::Client, Some(&root.context()));
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id, root.span_id);
        assert_ne!(child.span_id, root.span_id);
    }

    #[test]
    fn ended_spans_without_exporter_count_as_dropped() {
        let counter = test_counter();
        let tracer = Tracer::disabled(counter.clone());
        let mut span = tracer.start_span("s", SpanKind::Internal, None);
        span.set_attribute("k", "v");
        span.set_status(SpanStatus::Ok);
        span.end();
        assert_eq!(counter.get(), 1);
    }
}
