// Events that flow from the stream tap to the bus, plugins, and storage
//
// These are the parsed records we extract from the wrapped tool's output,
// plus the persistent record shapes the store understands. Using enums
// allows pattern matching and type-safe communication between async tasks.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event kinds observable on the bus. `Error` doubles as the synthetic
/// kind the bus emits when a subscriber fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Query,
    Response,
    ToolUse,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Query => "query",
            EventKind::Response => "response",
            EventKind::ToolUse => "tool_use",
            EventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an event was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Parsed out of a wrapped child process's output stream
    Child,
    /// Emitted by the direct-invocation adapter
    Direct,
}

/// Metadata stamped on every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub session_id: String,
    /// Groups a query with its responses and errors
    pub correlation_id: String,
    pub source: EventSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

/// Main event type that flows through the application. Immutable after
/// emission: subscribers receive it by reference or by clone, never by
/// mutable handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub timestamp_ms: i64,
    pub payload: Value,
    pub metadata: EventMetadata,
}

impl Event {
    /// Build an event around a structured record parsed from a stream.
    ///
    /// The record's `kind` (or legacy `type`) field selects the event kind;
    /// records without one are classified as responses unless they carry an
    /// `error` field. The correlation id prefers the query linkage so that
    /// a query and its responses group together.
    pub fn from_record(payload: Value, source: EventSource, session_id: &str) -> Self {
        let kind = classify_record(&payload);
        let query_id = payload
            .get("queryId")
            .or_else(|| payload.get("query_id"))
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| match kind {
                EventKind::Query => payload.get("id").and_then(Value::as_str).map(String::from),
                _ => None,
            });
        let id = generate_id();
        let correlation_id = query_id.clone().unwrap_or_else(|| id.clone());

        Event {
            id,
            kind,
            timestamp_ms: Utc::now().timestamp_millis(),
            payload,
            metadata: EventMetadata {
                session_id: session_id.to_string(),
                correlation_id,
                source,
                query_id,
                latency_ms: None,
            },
        }
    }

    /// Synthetic error event the bus publishes when a subscriber fails.
    pub fn handler_error(
        session_id: &str,
        cause: &str,
        failing_kind: EventKind,
        handler_id: u64,
    ) -> Self {
        let id = generate_id();
        Event {
            id: id.clone(),
            kind: EventKind::Error,
            timestamp_ms: Utc::now().timestamp_millis(),
            payload: serde_json::json!({
                "cause": cause,
                "failingKind": failing_kind.as_str(),
                "handlerId": handler_id,
            }),
            metadata: EventMetadata {
                session_id: session_id.to_string(),
                correlation_id: id,
                source: EventSource::Child,
                query_id: None,
                latency_ms: None,
            },
        }
    }
}

fn classify_record(payload: &Value) -> EventKind {
    let declared = payload
        .get("kind")
        .or_else(|| payload.get("type"))
        .and_then(Value::as_str);
    match declared {
        Some("query") => EventKind::Query,
        Some("response") => EventKind::Response,
        Some("tool_use") | Some("tool_call") => EventKind::ToolUse,
        Some("error") => EventKind::Error,
        _ if payload.get("error").is_some() => EventKind::Error,
        _ => EventKind::Response,
    }
}

/// Query complexity buckets used by the advisor plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Complexity::Low),
            "medium" => Some(Complexity::Medium),
            "high" => Some(Complexity::High),
            _ => None,
        }
    }
}

/// Confidence attached to an optimization suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Confidence::Low),
            "medium" => Some(Confidence::Medium),
            "high" => Some(Confidence::High),
            _ => None,
        }
    }
}

/// A persisted query observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecord {
    pub id: String,
    pub session_id: String,
    pub timestamp_ms: i64,
    pub text: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_json: Option<Value>,
}

impl QueryRecord {
    /// Extract a query record from a `query` event. Returns `None` when the
    /// payload doesn't carry enough to persist (no text at all).
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind != EventKind::Query {
            return None;
        }
        let text = event
            .payload
            .get("text")
            .or_else(|| event.payload.get("prompt"))
            .and_then(Value::as_str)?
            .to_string();
        Some(QueryRecord {
            id: event
                .metadata
                .query_id
                .clone()
                .unwrap_or_else(|| event.id.clone()),
            session_id: event.metadata.session_id.clone(),
            timestamp_ms: event.timestamp_ms,
            text,
            model: event
                .payload
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            category: None,
            complexity: None,
            token_count: event
                .payload
                .get("tokenCount")
                .and_then(Value::as_u64)
                .map(|n| n as u32),
            metadata_json: event.payload.get("metadata").cloned(),
        })
    }
}

/// A persisted response observation. `query_id` references a QueryRecord by
/// logical identity only; orphan responses are permitted and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub id: String,
    pub query_id: String,
    pub session_id: String,
    pub timestamp_ms: i64,
    pub text: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseRecord {
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind != EventKind::Response && event.kind != EventKind::Error {
            return None;
        }
        let query_id = event
            .metadata
            .query_id
            .clone()
            .unwrap_or_else(|| event.metadata.correlation_id.clone());
        Some(ResponseRecord {
            id: event.id.clone(),
            query_id,
            session_id: event.metadata.session_id.clone(),
            timestamp_ms: event.timestamp_ms,
            text: event
                .payload
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            model: event
                .payload
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            input_tokens: event
                .payload
                .get("inputTokens")
                .and_then(Value::as_u64)
                .map(|n| n as u32),
            output_tokens: event
                .payload
                .get("outputTokens")
                .and_then(Value::as_u64)
                .map(|n| n as u32),
            latency_ms: event.metadata.latency_ms,
            finish_reason: event
                .payload
                .get("finishReason")
                .and_then(Value::as_str)
                .map(String::from),
            error: match event.kind {
                EventKind::Error => Some(
                    event
                        .payload
                        .get("error")
                        .or_else(|| event.payload.get("cause"))
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                ),
                _ => event
                    .payload
                    .get("error")
                    .and_then(Value::as_str)
                    .map(String::from),
            },
        })
    }
}

/// A cost-optimization suggestion produced by an advisor plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationNote {
    pub query_id: String,
    pub suggestion: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternative_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_savings: Option<f64>,
    pub confidence: Confidence,
}

/// Discriminated record handed to `Store::save_batch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum StoreRecord {
    Query(QueryRecord),
    Response(ResponseRecord),
    Optimization(OptimizationNote),
}

/// Helper to generate unique IDs for correlating events within a run
pub fn generate_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let count = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}-{}", Utc::now().timestamp_millis(), count)
}

/// Generate a session ID for this run
/// Format: YYYYMMDD-HHMMSS-XXXX (timestamp + 4 random hex chars)
pub fn generate_session_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    // Use RandomState to get a random value without adding a dependency
    let random = RandomState::new().build_hasher().finish();
    let short_hash = format!("{:04x}", random & 0xFFFF);

    format!("{}-{}", timestamp, short_hash)
}
