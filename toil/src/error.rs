//! Normalization of arbitrary failure payloads into a stored record.
//!
//! Whatever a worker fails with — a typed error and its `source()` chain, a
//! plain JSON object carrying custom diagnostic properties, a bare string, or
//! nothing at all — [`normalize`] turns it into a JSON object that can be
//! stored as the job's `output` and queried later. The function is total: it
//! never fails, and self-referential error chains are broken with a marker
//! instead of looping.

use std::error::Error;
use std::time::Duration;

use serde_json::{json, Map, Value};

/// Marker substituted when a back-reference is found in an error chain.
pub const CIRCULAR_MARKER: &str = "[circular]";

/// Marker substituted for values nested beyond the depth cap.
pub const TRUNCATED_MARKER: &str = "[truncated]";

const MAX_DEPTH: usize = 32;
const MAX_CHAIN: usize = 32;

/// An arbitrary failure payload reported for a job.
#[derive(Debug)]
pub enum FailurePayload {
    /// No payload supplied. Normalizes to an empty record; failing a job
    /// with nothing to say is valid.
    Empty,
    /// A JSON payload: an object is stored as-is, anything else is wrapped
    /// as `{"value": ..}`.
    Value(Value),
    /// A typed error; its message and `source()` chain are recorded.
    Error(Box<dyn Error + Send + Sync + 'static>),
}

impl FailurePayload {
    /// Wraps a typed error.
    pub fn from_error(error: impl Error + Send + Sync + 'static) -> Self {
        Self::Error(Box::new(error))
    }

    /// The payload recorded when a handler panics.
    pub fn panic(message: impl Into<String>) -> Self {
        Self::Value(json!({"message": message.into(), "kind": "panic"}))
    }

    /// The payload recorded when a handler exceeds its timeout.
    pub fn timeout(limit: Duration) -> Self {
        Self::Value(json!({
            "message": format!("handler failed to complete within {limit:?}"),
            "kind": "timeout",
        }))
    }
}

impl From<()> for FailurePayload {
    fn from(_: ()) -> Self {
        Self::Empty
    }
}

impl From<Value> for FailurePayload {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<String> for FailurePayload {
    fn from(value: String) -> Self {
        Self::Value(Value::String(value))
    }
}

impl From<&str> for FailurePayload {
    fn from(value: &str) -> Self {
        Self::Value(Value::String(value.to_owned()))
    }
}

impl From<Box<dyn Error + Send + Sync + 'static>> for FailurePayload {
    fn from(value: Box<dyn Error + Send + Sync + 'static>) -> Self {
        Self::Error(value)
    }
}

impl<T> From<Option<T>> for FailurePayload
where
    T: Into<FailurePayload>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(inner) => inner.into(),
            None => Self::Empty,
        }
    }
}

/// Converts a failure payload into the canonical stored record.
///
/// Always returns a JSON object:
///
/// - [`FailurePayload::Empty`] → `{}`
/// - an object → the object itself, depth-capped
/// - any other JSON value → `{"value": <v>}`
/// - an error → `{"message": <display>, "stack": <source chain>}`, where the
///   chain walk is guarded against cycles by pointer identity
///
/// The result is idempotent in content for acyclic input: deriving the record
/// from the same payload twice yields equal JSON.
pub fn normalize(payload: &FailurePayload) -> Value {
    match payload {
        FailurePayload::Empty => Value::Object(Map::new()),
        FailurePayload::Value(value) => match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), clamp(value, 1)))
                    .collect(),
            ),
            other => json!({"value": clamp(other, 1)}),
        },
        FailurePayload::Error(error) => normalize_error(error.as_ref()),
    }
}

fn clamp(value: &Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return Value::String(TRUNCATED_MARKER.to_owned());
    }
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), clamp(value, depth + 1)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|item| clamp(item, depth + 1)).collect()),
        other => other.clone(),
    }
}

fn normalize_error(error: &(dyn Error + 'static)) -> Value {
    let mut record = Map::new();
    record.insert("message".to_owned(), Value::String(error.to_string()));

    let mut visited: Vec<*const ()> = vec![error as *const _ as *const ()];
    let mut chain = Vec::new();
    let mut current = error.source();
    while let Some(cause) = current {
        let identity = cause as *const _ as *const ();
        if visited.contains(&identity) {
            chain.push(CIRCULAR_MARKER.to_owned());
            break;
        }
        if chain.len() >= MAX_CHAIN {
            chain.push(TRUNCATED_MARKER.to_owned());
            break;
        }
        visited.push(identity);
        chain.push(cause.to_string());
        current = cause.source();
    }

    if !chain.is_empty() {
        let stack = chain
            .iter()
            .map(|cause| format!("caused by: {cause}"))
            .collect::<Vec<_>>()
            .join("\n");
        record.insert("stack".to_owned(), Value::String(stack));
    }

    Value::Object(record)
}
