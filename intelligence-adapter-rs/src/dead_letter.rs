//! # Dead Letter Router
//!
//! Wraps messages that can never succeed (undecodable envelopes, unknown
//! operations) together with the failure context. This path never touches a
//! resilience client or the backend.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::bus::BusMessage;
use crate::envelope::{DecodeError, EventEnvelope, EventSource, EventType};
use crate::router::UnroutableError;

/// Replacement for every redacted value
pub const REDACTED: &str = "[REDACTED]";

/// Suffix appended to the input topic
pub const DLQ_SUFFIX: &str = ".dlq";

// Bearer credentials and JWTs embedded in otherwise harmless string values
static INLINE_SECRET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)bearer\s+[a-z0-9._~+/=-]+|eyJ[a-zA-Z0-9_-]+\.eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+")
        .unwrap_or_else(|e| panic!("invalid inline secret pattern: {}", e))
});

/// Why a message was dead-lettered
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeadLetterCause {
    #[error("decode failure: {0}")]
    Decode(#[from] DecodeError),

    #[error("unroutable message: {0}")]
    Unroutable(#[from] UnroutableError),
}

impl DeadLetterCause {
    /// Stable category recorded as `error_type`
    pub fn error_type(&self) -> &'static str {
        match self {
            DeadLetterCause::Decode(_) => "decode_error",
            DeadLetterCause::Unroutable(_) => "unroutable",
        }
    }
}

/// Payload of a dead letter event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterEnvelope {
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    /// The inbound message with secrets redacted. Undecodable JSON is kept
    /// as a (lossy UTF-8) string.
    pub original_envelope: Value,
    pub error_type: String,
    pub error_message: String,
    pub error_timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub routed_by: EventSource,
}

/// Identifiers recovered from a message, decodable or not
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SalvagedIds {
    pub event_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,
    pub event_type: Option<EventType>,
}

impl SalvagedIds {
    pub fn from_envelope(envelope: &EventEnvelope) -> Self {
        Self {
            event_id: Some(envelope.event_id),
            correlation_id: Some(envelope.correlation_id),
            event_type: Some(envelope.event_type.clone()),
        }
    }

    /// Best effort extraction from raw bytes; every malformed field is `None`
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let Ok(Value::Object(obj)) = serde_json::from_slice::<Value>(bytes) else {
            return Self::default();
        };
        let uuid = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
        };

        Self {
            event_id: uuid("event_id"),
            correlation_id: uuid("correlation_id"),
            event_type: obj
                .get("event_type")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok()),
        }
    }
}

/// Recursive key-based secret redaction
#[derive(Debug, Clone)]
pub struct Redactor {
    keys: Vec<String>,
}

impl Redactor {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(|k| k.as_ref().trim().to_ascii_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Matches a configured key exactly or as a `_`/`-` separated suffix,
    /// ignoring ASCII case
    pub fn is_sensitive_key(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.keys.iter().any(|secret| {
            key == *secret
                || key
                    .strip_suffix(secret.as_str())
                    .is_some_and(|prefix| prefix.ends_with('_') || prefix.ends_with('-'))
        })
    }

    /// Returns a redacted copy of `value`
    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(obj) => Value::Object(
                obj.iter()
                    .map(|(k, v)| {
                        let redacted = if self.is_sensitive_key(k) && !v.is_null() {
                            Value::String(REDACTED.to_string())
                        } else {
                            self.redact(v)
                        };
                        (k.clone(), redacted)
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            Value::String(s) => Value::String(redact_inline(s)),
            other => other.clone(),
        }
    }
}

fn redact_inline(s: &str) -> String {
    INLINE_SECRET_RE.replace_all(s, REDACTED).into_owned()
}

/// Builds dead letter envelopes for one service instance
#[derive(Debug, Clone)]
pub struct DeadLetterRouter {
    redactor: Redactor,
    identity: EventSource,
}

impl DeadLetterRouter {
    pub fn new(redactor: Redactor, identity: EventSource) -> Self {
        Self { redactor, identity }
    }

    /// `<original_topic>.dlq`
    pub fn dlq_topic(original_topic: &str) -> String {
        format!("{}{}", original_topic, DLQ_SUFFIX)
    }

    /// Captures `message` with its failure. The original bytes are kept
    /// verbatim apart from redaction.
    pub fn to_dead_letter(
        &self,
        message: &BusMessage,
        cause: &DeadLetterCause,
        retry_count: u32,
    ) -> DeadLetterEnvelope {
        let original_envelope = match serde_json::from_slice::<Value>(&message.payload) {
            Ok(value) => self.redactor.redact(&value),
            Err(_) => Value::String(redact_inline(&String::from_utf8_lossy(&message.payload))),
        };

        DeadLetterEnvelope {
            original_topic: message.topic.clone(),
            original_partition: message.partition,
            original_offset: message.offset,
            original_envelope,
            error_type: cause.error_type().to_string(),
            error_message: cause.to_string(),
            error_timestamp: Utc::now(),
            retry_count,
            routed_by: self.identity.clone(),
        }
    }
}
