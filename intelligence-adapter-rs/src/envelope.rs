//! # Event Envelope Codec
//!
//! Every bus message is a JSON [`EventEnvelope`]. [`decode`] validates each
//! required field individually so a malformed message produces a precise
//! [`DecodeError`] for the dead letter queue instead of a generic serde
//! message. Decoding and encoding are pure and do no I/O.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Envelope schema version stamped on events created by this service
pub const ENVELOPE_VERSION: &str = "1.0.0";

static EVENT_TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<env>[A-Za-z0-9_-]+)\.(?P<domain>[A-Za-z0-9_-]+)\.(?P<kind>request|response|event)\.(?P<name>[A-Za-z0-9_-]+(?:\.[A-Za-z0-9_-]+)*)\.v(?P<version>\d+)$",
    )
    .unwrap_or_else(|e| panic!("invalid event type pattern: {}", e))
});

static SEMVER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?$")
        .unwrap_or_else(|e| panic!("invalid semver pattern: {}", e))
});

/// Envelope validation failures. None of these is ever retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("message is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("envelope must be a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("field '{field}' is not a valid UUID: '{value}'")]
    InvalidUuid { field: &'static str, value: String },

    #[error("event_type '{0}' does not match env.domain.(request|response|event).name.vN")]
    InvalidEventType(String),

    #[error("timestamp '{0}' is not a valid UTC timestamp")]
    InvalidTimestamp(String),

    #[error("version '{0}' is not a semantic version")]
    InvalidVersion(String),
}

/// The message category segment of an event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Request,
    Response,
    Event,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Request => "request",
            EventKind::Response => "response",
            EventKind::Event => "event",
        }
    }
}

/// A parsed `env.domain.kind.name.vN` event type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventType {
    pub env: String,
    pub domain: String,
    pub kind: EventKind,
    /// One or more dot separated segments
    pub name: String,
    pub version: u32,
}

impl EventType {
    /// Returns a sibling event type with a new kind and a suffixed name,
    /// e.g. `code-analysis` + `-completed`
    pub fn derive(&self, kind: EventKind, name_suffix: &str) -> EventType {
        EventType {
            env: self.env.clone(),
            domain: self.domain.clone(),
            kind,
            name: format!("{}{}", self.name, name_suffix),
            version: self.version,
        }
    }
}

impl FromStr for EventType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DecodeError::InvalidEventType(s.to_string());
        let caps = EVENT_TYPE_RE.captures(s).ok_or_else(invalid)?;

        let kind = match &caps["kind"] {
            "request" => EventKind::Request,
            "response" => EventKind::Response,
            _ => EventKind::Event,
        };
        let version = caps["version"].parse::<u32>().map_err(|_| invalid())?;

        Ok(EventType {
            env: caps["env"].to_string(),
            domain: caps["domain"].to_string(),
            kind,
            name: caps["name"].to_string(),
            version,
        })
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.v{}",
            self.env,
            self.domain,
            self.kind.as_str(),
            self.name,
            self.version
        )
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Identity of the service that produced an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSource {
    pub service: String,
    pub instance_id: String,
}

/// The standard wrapper around every bus message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub correlation_id: Uuid,
    pub causation_id: Option<Uuid>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub source: EventSource,
    pub metadata: Map<String, Value>,
    pub payload: Value,
}

impl EventEnvelope {
    /// Creates an envelope with a fresh `event_id` and the current time
    pub fn new(
        event_type: EventType,
        correlation_id: Uuid,
        causation_id: Option<Uuid>,
        source: EventSource,
        payload: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            correlation_id,
            causation_id,
            timestamp: truncate_to_millis(Utc::now()),
            version: ENVELOPE_VERSION.to_string(),
            source,
            metadata: Map::new(),
            payload,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// `payload.operation_type` if present and a string
    pub fn operation_type(&self) -> Option<&str> {
        self.payload.get("operation_type").and_then(Value::as_str)
    }
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Drops sub-millisecond precision
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts.timestamp_millis())
        .single()
        .unwrap_or(ts)
}

/// Decodes and validates an envelope from raw message bytes
pub fn decode(bytes: &[u8]) -> Result<EventEnvelope, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    let Value::Object(mut obj) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let event_id = required_uuid(&obj, "event_id")?;
    let event_type = required_str(&obj, "event_type")?.parse::<EventType>()?;
    let correlation_id = required_uuid(&obj, "correlation_id")?;
    let causation_id = match obj.get("causation_id") {
        None | Some(Value::Null) => None,
        Some(_) => Some(required_uuid(&obj, "causation_id")?),
    };

    let raw_ts = required_str(&obj, "timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(raw_ts)
        .map(|ts| truncate_to_millis(ts.with_timezone(&Utc)))
        .map_err(|_| DecodeError::InvalidTimestamp(raw_ts.to_string()))?;

    let version = required_str(&obj, "version")?;
    if !SEMVER_RE.is_match(version) {
        return Err(DecodeError::InvalidVersion(version.to_string()));
    }
    let version = version.to_string();

    let source = match obj.get("source") {
        None | Some(Value::Null) => return Err(DecodeError::MissingField("source")),
        Some(Value::Object(src)) => EventSource {
            service: nested_str(src, "service", "source.service")?,
            instance_id: nested_str(src, "instance_id", "source.instance_id")?,
        },
        Some(_) => {
            return Err(DecodeError::WrongType {
                field: "source",
                expected: "an object",
            })
        }
    };

    let metadata = match obj.remove("metadata") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(DecodeError::WrongType {
                field: "metadata",
                expected: "an object",
            })
        }
    };

    let payload = match obj.remove("payload") {
        None | Some(Value::Null) => return Err(DecodeError::MissingField("payload")),
        Some(payload @ Value::Object(_)) => payload,
        Some(_) => {
            return Err(DecodeError::WrongType {
                field: "payload",
                expected: "an object",
            })
        }
    };

    Ok(EventEnvelope {
        event_id,
        event_type,
        correlation_id,
        causation_id,
        timestamp,
        version,
        source,
        metadata,
        payload,
    })
}

/// Encodes an envelope as JSON bytes
pub fn encode(envelope: &EventEnvelope) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(envelope)
}

fn required_str<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, DecodeError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(DecodeError::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(DecodeError::WrongType {
            field,
            expected: "a string",
        }),
    }
}

fn required_uuid(obj: &Map<String, Value>, field: &'static str) -> Result<Uuid, DecodeError> {
    let raw = required_str(obj, field)?;
    Uuid::parse_str(raw).map_err(|_| DecodeError::InvalidUuid {
        field,
        value: raw.to_string(),
    })
}

fn nested_str(
    obj: &Map<String, Value>,
    key: &str,
    field: &'static str,
) -> Result<String, DecodeError> {
    match obj.get(key) {
        None | Some(Value::Null) => Err(DecodeError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(DecodeError::WrongType {
            field,
            expected: "a string",
        }),
    }
}
