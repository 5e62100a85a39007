//! Operation types and the request derived from an inbound envelope.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::envelope::EventEnvelope;

/// The fixed set of backend operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    AssessQuality,
    CheckCompliance,
    AnalyzePerformance,
    GetPatterns,
}

/// Response mapping family of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationFamily {
    Quality,
    Performance,
    Pattern,
}

impl OperationType {
    pub const ALL: [OperationType; 4] = [
        OperationType::AssessQuality,
        OperationType::CheckCompliance,
        OperationType::AnalyzePerformance,
        OperationType::GetPatterns,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::AssessQuality => "assess-quality",
            OperationType::CheckCompliance => "check-compliance",
            OperationType::AnalyzePerformance => "analyze-performance",
            OperationType::GetPatterns => "get-patterns",
        }
    }

    pub fn family(&self) -> OperationFamily {
        match self {
            OperationType::AssessQuality | OperationType::CheckCompliance => OperationFamily::Quality,
            OperationType::AnalyzePerformance => OperationFamily::Performance,
            OperationType::GetPatterns => OperationFamily::Pattern,
        }
    }

    /// Backend path serving this operation
    pub fn endpoint(&self) -> &'static str {
        match self {
            OperationType::AssessQuality => "/assess/code",
            OperationType::CheckCompliance => "/compliance/check",
            OperationType::AnalyzePerformance => "/performance/baseline",
            OperationType::GetPatterns => "/patterns/extract",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned for an operation name outside the fixed set
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown operation type '{0}'")]
pub struct UnknownOperation(pub String);

impl FromStr for OperationType {
    type Err = UnknownOperation;

    /// Accepts kebab or snake case, ignoring ASCII case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        OperationType::ALL
            .into_iter()
            .find(|op| op.as_str() == normalized)
            .ok_or_else(|| UnknownOperation(s.to_string()))
    }
}

/// Problems with an otherwise routable request payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request has neither a source path nor content to analyse")]
    MissingTarget,

    #[error("payload field '{field}' must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
}

/// What to analyse
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisTarget {
    pub path: Option<String>,
    pub content: Option<String>,
    pub language: Option<String>,
}

/// One backend request, derived once per inbound envelope
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub operation_type: OperationType,
    pub target: AnalysisTarget,
    pub options: Map<String, Value>,
}

impl OperationRequest {
    /// Extracts the target descriptor and options from the envelope payload.
    ///
    /// Target fields are read from `payload.target` when present, otherwise
    /// from the payload itself. `source_path`, `file_path` and `path` name the
    /// path; `content` and `code_content` name the content.
    pub fn from_envelope(
        operation_type: OperationType,
        envelope: &EventEnvelope,
    ) -> Result<Self, RequestError> {
        let payload = envelope.payload.as_object().ok_or(RequestError::InvalidField {
            field: "payload",
            expected: "an object",
        })?;

        let target_obj = match payload.get("target") {
            None | Some(Value::Null) => payload,
            Some(Value::Object(target)) => target,
            Some(_) => {
                return Err(RequestError::InvalidField {
                    field: "target",
                    expected: "an object",
                })
            }
        };

        let target = AnalysisTarget {
            path: first_str(target_obj, &["source_path", "file_path", "path"], "path")?,
            content: first_str(target_obj, &["content", "code_content"], "content")?,
            language: first_str(target_obj, &["language"], "language")?,
        };

        if target.path.is_none() && target.content.is_none() {
            return Err(RequestError::MissingTarget);
        }

        let options = match payload.get("options") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(options)) => options.clone(),
            Some(_) => {
                return Err(RequestError::InvalidField {
                    field: "options",
                    expected: "an object",
                })
            }
        };

        Ok(Self {
            operation_type,
            target,
            options,
        })
    }

    /// Request body for the operation's endpoint
    pub fn body(&self) -> Value {
        let path = self.target.path.clone();
        let content = self.target.content.clone();
        let language = self.target.language.clone();

        match self.operation_type {
            OperationType::AssessQuality => json!({
                "content": content,
                "source_path": path,
                "language": language,
                "include_recommendations": self.option_bool("include_recommendations", true),
                "options": self.options,
            }),
            OperationType::CheckCompliance => json!({
                "content": content,
                "source_path": path,
                "language": language,
                "architecture_type": self
                    .options
                    .get("architecture_type")
                    .and_then(Value::as_str)
                    .unwrap_or("default"),
                "options": self.options,
            }),
            OperationType::AnalyzePerformance => json!({
                "operation_name": path.clone().unwrap_or_else(|| "inline".to_string()),
                "code_content": content,
                "source_path": path,
                "language": language,
                "context": self.options,
            }),
            OperationType::GetPatterns => json!({
                "file_path": path,
                "content": content,
                "language": language,
                "min_confidence": self
                    .options
                    .get("min_confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.5),
                "options": self.options,
            }),
        }
    }

    fn option_bool(&self, key: &str, default: bool) -> bool {
        self.options.get(key).and_then(Value::as_bool).unwrap_or(default)
    }
}

fn first_str(
    obj: &Map<String, Value>,
    keys: &[&str],
    field: &'static str,
) -> Result<Option<String>, RequestError> {
    for key in keys {
        match obj.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) if s.trim().is_empty() => continue,
            Some(Value::String(s)) => return Ok(Some(s.clone())),
            Some(_) => {
                return Err(RequestError::InvalidField {
                    field,
                    expected: "a string",
                })
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EventSource, EventType};
    use uuid::Uuid;

    fn envelope(payload: Value) -> EventEnvelope {
        EventEnvelope::new(
            "dev.omniintelligence.request.code-analysis.v1".parse::<EventType>().unwrap(),
            Uuid::new_v4(),
            None,
            EventSource {
                service: "archon".into(),
                instance_id: "a-1".into(),
            },
            payload,
        )
    }

    #[test]
    fn test_parse_operation_type() {
        assert_eq!("assess-quality".parse::<OperationType>(), Ok(OperationType::AssessQuality));
        assert_eq!("CHECK_COMPLIANCE".parse::<OperationType>(), Ok(OperationType::CheckCompliance));
        assert_eq!(" get-patterns ".parse::<OperationType>(), Ok(OperationType::GetPatterns));
        assert_eq!(
            "summarize".parse::<OperationType>(),
            Err(UnknownOperation("summarize".to_string()))
        );
    }

    #[test]
    fn test_families_and_endpoints() {
        assert_eq!(OperationType::CheckCompliance.family(), OperationFamily::Quality);
        assert_eq!(OperationType::AnalyzePerformance.family(), OperationFamily::Performance);
        assert_eq!(OperationType::GetPatterns.endpoint(), "/patterns/extract");
    }

    #[test]
    fn test_request_from_flat_payload() {
        let env = envelope(json!({
            "operation_type": "assess-quality",
            "source_path": "src/lib.rs",
            "content": "pub fn f() {}",
            "language": "rust",
            "options": { "include_recommendations": false }
        }));

        let req = OperationRequest::from_envelope(OperationType::AssessQuality, &env).unwrap();
        assert_eq!(req.target.path.as_deref(), Some("src/lib.rs"));
        assert_eq!(req.target.language.as_deref(), Some("rust"));

        let body = req.body();
        assert_eq!(body["content"], "pub fn f() {}");
        assert_eq!(body["include_recommendations"], false);
    }

    #[test]
    fn test_request_from_nested_target_with_aliases() {
        let env = envelope(json!({
            "operation_type": "analyze-performance",
            "target": { "file_path": "api/handler.py", "code_content": "def f(): pass" }
        }));

        let req = OperationRequest::from_envelope(OperationType::AnalyzePerformance, &env).unwrap();
        let body = req.body();
        assert_eq!(body["operation_name"], "api/handler.py");
        assert_eq!(body["code_content"], "def f(): pass");
    }

    #[test]
    fn test_missing_target_rejected() {
        let env = envelope(json!({ "operation_type": "get-patterns", "content": "  " }));
        assert_eq!(
            OperationRequest::from_envelope(OperationType::GetPatterns, &env),
            Err(RequestError::MissingTarget)
        );
    }

    #[test]
    fn test_wrongly_typed_fields_rejected() {
        let env = envelope(json!({ "operation_type": "get-patterns", "content": "x", "options": [1] }));
        assert_eq!(
            OperationRequest::from_envelope(OperationType::GetPatterns, &env),
            Err(RequestError::InvalidField { field: "options", expected: "an object" })
        );

        let env = envelope(json!({ "operation_type": "get-patterns", "path": 7 }));
        assert!(matches!(
            OperationRequest::from_envelope(OperationType::GetPatterns, &env),
            Err(RequestError::InvalidField { field: "path", .. })
        ));
    }
}
