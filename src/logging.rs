//! Structured JSONL event records.
//!
//! One JSON object per line on stderr. These records are the wire-visible
//! log contract shared with the Router side (correlation ids, conflict
//! fields); `tracing` remains in use for ordinary operator diagnostics.
//!
//! Every value that could carry caller data passes through the redactor
//! before emission.

use std::fmt;
use std::io::Write;
use std::sync::Mutex;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Correlation identifiers carried by request-scoped records.
///
/// All four are emitted even when empty so log consumers can rely on the
/// fields existing.
#[derive(Debug, Clone, Default)]
pub struct RequestIds {
    pub request_id: String,
    pub trace_id: String,
    pub tenant_id: String,
    pub run_id: String,
}

/// Sensitive key fragments. Matching is case-insensitive and by substring,
/// so `X-Api-Key`, `refresh_token` and `AUTHORIZATION` all match.
const SENSITIVE_KEYS: &[&str] = &[
    "token",
    "api_key",
    "authorization",
    "password",
    "secret",
    "auth",
    "bearer",
    "key",
    "credit_card",
    "ssn",
    "email",
    "phone",
    "x-api-key",
    "x-auth-token",
    "x-authorization",
];

pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|k| lowered.contains(k))
}

/// Replaces values of sensitive keys with `"[REDACTED]"`, recursively
/// through objects and arrays. Non-sensitive leaves are kept as-is.
pub fn redact_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *v = Value::String("[REDACTED]".to_string());
                } else {
                    redact_value(v);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_value(item);
            }
        }
        _ => {}
    }
}

/// Masks values of sensitive keys inside an opaque JSON string with `***`,
/// without parsing it as a document. Used for payloads we log verbatim but
/// cannot assume are well-formed JSON.
pub fn redact_json_text(input: &str) -> String {
    let mut out: Vec<u8> = Vec::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'"' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        // Copy a quoted segment and remember it as a potential key.
        out.push(b'"');
        i += 1;
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'"' {
            out.push(bytes[i]);
            i += 1;
        }
        let key = String::from_utf8_lossy(&bytes[key_start..i]).into_owned();
        if i < bytes.len() {
            out.push(b'"');
            i += 1;
        }

        if !is_sensitive_key(&key) {
            continue;
        }

        // Copy separator, then mask the value.
        while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b':') {
            out.push(bytes[i]);
            i += 1;
        }
        if i < bytes.len() && bytes[i] == b'"' {
            out.push(b'"');
            i += 1;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            out.extend_from_slice(b"***");
            if i < bytes.len() {
                out.push(b'"');
                i += 1;
            }
        } else {
            while i < bytes.len() && bytes[i] != b',' && bytes[i] != b'}' && bytes[i] != b']' {
                i += 1;
            }
            out.extend_from_slice(b"\"***\"");
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Masks a free-form message that mentions any sensitive keyword. A message
/// is opaque text, so the whole thing is replaced rather than edited.
pub fn redact_message(message: &str) -> String {
    if is_sensitive_key(message) {
        "[REDACTED]".to_string()
    } else {
        message.to_string()
    }
}

/// ISO-8601 UTC with microsecond precision.
pub fn iso8601_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn format_iso8601(at: SystemTime) -> String {
    DateTime::<Utc>::from(at).to_rfc3339_opts(SecondsFormat::Micros, true)
}

static SINK: Lazy<Mutex<Box<dyn Write + Send>>> =
    Lazy::new(|| Mutex::new(Box::new(std::io::stderr())));

/// Redirects the event stream, returning nothing; tests use this to capture
/// records through a shared buffer.
pub fn set_sink(sink: Box<dyn Write + Send>) {
    *SINK.lock().unwrap() = sink;
}

fn emit(record: Value) {
    if let Ok(line) = serde_json::to_string(&record) {
        let mut sink = SINK.lock().unwrap();
        let _ = writeln!(sink, "{line}");
        let _ = sink.flush();
    }
}

fn base_record(level: Level, component: &str, message: &str) -> Map<String, Value> {
    let mut record = Map::new();
    record.insert("timestamp".into(), json!(iso8601_now()));
    record.insert("level".into(), json!(level.to_string()));
    record.insert("component".into(), json!(component));
    record.insert("message".into(), json!(redact_message(message)));
    record
}

fn insert_ids(record: &mut Map<String, Value>, ids: &RequestIds) {
    record.insert("request_id".into(), json!(ids.request_id));
    record.insert("trace_id".into(), json!(ids.trace_id));
    record.insert("tenant_id".into(), json!(ids.tenant_id));
    record.insert("run_id".into(), json!(ids.run_id));
}

/// Emits one event record. `context` is redacted before emission.
pub fn log_event(
    level: Level,
    component: &str,
    message: &str,
    ids: Option<&RequestIds>,
    context: Option<Value>,
) {
    let mut record = base_record(level, component, message);
    if let Some(ids) = ids {
        insert_ids(&mut record, ids);
    }
    if let Some(mut ctx) = context {
        redact_value(&mut ctx);
        record.insert("context".into(), ctx);
    }
    emit(Value::Object(record));
}

/// Conflict-contract fields attached to error-envelope records.
pub struct ConflictFields<'a> {
    pub error_type: &'a str,
    pub severity: Level,
    pub http_status: u16,
    pub gateway_error_code: &'a str,
    pub intake_error_code: Option<&'a str>,
    pub conflict_priority_level: u8,
}

/// Emits the error record mandated for every rejected request.
pub fn log_error_envelope(
    component: &str,
    stage: &str,
    message: &str,
    ids: &RequestIds,
    fields: &ConflictFields<'_>,
    context: Option<Value>,
) {
    let mut record = base_record(fields.severity, component, message);
    record.insert("subsystem".into(), json!(stage));
    record.insert("severity".into(), json!(fields.severity.to_string()));
    record.insert("error_type".into(), json!(fields.error_type));
    record.insert("http_status".into(), json!(fields.http_status));
    record.insert(
        "gateway_error_code".into(),
        json!(fields.gateway_error_code),
    );
    record.insert(
        "intake_error_code".into(),
        fields
            .intake_error_code
            .map(|c| json!(c))
            .unwrap_or(Value::Null),
    );
    record.insert(
        "conflict_priority_level".into(),
        json!(fields.conflict_priority_level),
    );
    insert_ids(&mut record, ids);

    let mut ctx = context.unwrap_or_else(|| json!({}));
    if let Value::Object(map) = &mut ctx {
        map.insert("stage".into(), json!(stage));
        map.insert("error_code".into(), json!(fields.gateway_error_code));
    }
    redact_value(&mut ctx);
    record.insert("context".into(), ctx);

    emit(Value::Object(record));
}
