//! Structured logging for the analytics pipeline.
//!
//! Every record is a single JSON line on stderr so the host can ship it
//! alongside its own logs. Records are filtered by level (`LOG_LEVEL`) and by
//! domain (`LOG_DOMAINS`, comma-separated or `all`).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Tracker,     // Event construction, fan-out
    Adapter,     // Sink init and dispatch
    Queue,       // Buffering, flush, retry, beacon
    Storage,     // Cookie/session access
    Attribution, // UTM capture
    Experiment,  // Bucketing, validation
    System,      // Startup, shutdown
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Tracker => "tracker",
            Domain::Adapter => "adapter",
            Domain::Queue => "queue",
            Domain::Storage => "storage",
            Domain::Attribution => "attribution",
            Domain::Experiment => "experiment",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Sequence counter for ordering
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

const REDACTED_KEYS: &[&str] = &[
    "authorization",
    "Authorization",
    "email",
    "phone",
    "em",
    "ph",
];

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    redact_map(&mut fields);
    fields
}

/// Redacts sensitive keys at any depth, including inside arrays.
fn redact_map(fields: &mut Map<String, Value>) {
    for (key, value) in fields.iter_mut() {
        if REDACTED_KEYS.contains(&key.as_str()) {
            *value = Value::String("[REDACTED]".to_string());
        } else {
            redact_value(value);
        }
    }
}

fn redact_value(value: &mut Value) {
    match value {
        Value::Object(map) => redact_map(map),
        Value::Array(items) => items.iter_mut().for_each(redact_value),
        _ => {}
    }
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["event_name", "experiment_id", "adapter", "session_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }
    let line = render_record(level, domain.as_str(), event, fields);
    let stderr = std::io::stderr();
    let mut w = stderr.lock();
    let _ = writeln!(w, "{}", line);
}

fn render_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) -> String {
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));
    Value::Object(entry).to_string()
}

// =============================================================================
// Pipeline helpers
// =============================================================================

pub fn log_storage_failure(op: &str, key: &str, err: &dyn std::fmt::Display) {
    log(
        Level::Warn,
        Domain::Storage,
        "storage_unavailable",
        obj(&[
            ("op", v_str(op)),
            ("key", v_str(key)),
            ("msg", v_str(&err.to_string())),
        ]),
    );
}

pub fn log_adapter_failure(adapter: &str, stage: &str, err: &dyn std::fmt::Display) {
    log(
        Level::Error,
        Domain::Adapter,
        "adapter_failure",
        obj(&[
            ("adapter", v_str(adapter)),
            ("stage", v_str(stage)),
            ("msg", v_str(&err.to_string())),
        ]),
    );
}

pub fn log_delivery_failure(event_type: &str, attempt: u32, max_attempts: u32, err: &dyn std::fmt::Display) {
    log(
        Level::Warn,
        Domain::Queue,
        "delivery_failure",
        obj(&[
            ("event_name", v_str(event_type)),
            ("attempt", json!(attempt)),
            ("max_attempts", json!(max_attempts)),
            ("msg", v_str(&err.to_string())),
        ]),
    );
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Tests
// =============================================================================
