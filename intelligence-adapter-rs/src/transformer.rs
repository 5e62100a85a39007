//! # Response Transformer
//!
//! Maps heterogeneous backend bodies onto the canonical [`AnalysisOutput`].
//! The mapping is lenient: absent fields become empty values and scores
//! outside `[0.0, 1.0]` are clamped with a `score_clamped` warning recorded in
//! the output metadata.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::gateway::RawResponse;
use crate::operation::{OperationFamily, OperationType};

/// Machine-readable code carried by every failed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The route's circuit rejected the call
    CircuitOpen,
    /// Transient failures outlasted every retry
    BackendUnavailable,
    /// The backend refused the request
    BackendRejected,
    /// The payload lacks what the operation needs
    InvalidRequest,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ErrorCode::BackendRejected => "BACKEND_REJECTED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finding reported by the backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub message: String,
    pub severity: Option<String>,
    pub category: Option<String>,
    pub line: Option<u64>,
}

/// Success fields of an output
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisFindings {
    pub scores: BTreeMap<String, f64>,
    pub issues: Vec<Issue>,
    pub recommendations: Vec<String>,
    pub patterns: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Value>,
}

/// Failure fields of an output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetails {
    pub error_code: ErrorCode,
    pub error_message: String,
    pub retry_allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutputBody {
    Success(AnalysisFindings),
    Failure(FailureDetails),
}

/// The canonical result of one analysis request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisOutput {
    pub success: bool,
    pub operation_type: OperationType,
    pub correlation_id: Uuid,
    pub processing_time_ms: u64,
    #[serde(flatten)]
    pub body: OutputBody,
    pub metadata: Map<String, Value>,
}

impl AnalysisOutput {
    pub fn failure(
        operation_type: OperationType,
        correlation_id: Uuid,
        error_code: ErrorCode,
        error_message: impl Into<String>,
        retry_allowed: bool,
    ) -> Self {
        Self {
            success: false,
            operation_type,
            correlation_id,
            processing_time_ms: 0,
            body: OutputBody::Failure(FailureDetails {
                error_code,
                error_message: error_message.into(),
                retry_allowed,
            }),
            metadata: Map::new(),
        }
    }

    /// Stamps the dispatch-to-publish duration
    pub fn with_processing_time(mut self, processing_time_ms: u64) -> Self {
        self.processing_time_ms = processing_time_ms;
        self
    }

    pub fn findings(&self) -> Option<&AnalysisFindings> {
        match &self.body {
            OutputBody::Success(findings) => Some(findings),
            OutputBody::Failure(_) => None,
        }
    }

    pub fn failure_details(&self) -> Option<&FailureDetails> {
        match &self.body {
            OutputBody::Failure(details) => Some(details),
            OutputBody::Success(_) => None,
        }
    }

    pub fn warnings(&self) -> &[Value] {
        self.metadata
            .get("warnings")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Collects clamp warnings while a body is mapped
#[derive(Default)]
struct Warnings(Vec<Value>);

impl Warnings {
    fn clamp(&mut self, field: &str, value: f64) -> f64 {
        let clamped = value.clamp(0.0, 1.0);
        if clamped != value {
            self.0.push(json!({
                "kind": "score_clamped",
                "field": field,
                "original_value": value,
                "clamped_value": clamped,
            }));
        }
        clamped
    }
}

/// Maps a successful backend response for `operation_type`
pub fn transform(operation_type: OperationType, correlation_id: Uuid, raw: &RawResponse) -> AnalysisOutput {
    let empty = Map::new();
    let body = raw.body.as_object().unwrap_or(&empty);

    let mut metadata = Map::new();
    metadata.insert("backend_status".into(), json!(raw.status));
    metadata.insert("backend_latency_ms".into(), json!(raw.latency.as_millis() as u64));

    // A 2xx body may still report failure
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        let message = body
            .get("error")
            .or_else(|| body.get("message"))
            .map(value_text)
            .unwrap_or_else(|| "backend reported an unsuccessful analysis".to_string());
        let mut output = AnalysisOutput::failure(
            operation_type,
            correlation_id,
            ErrorCode::BackendRejected,
            message,
            false,
        );
        output.metadata = metadata;
        return output;
    }

    let mut warnings = Warnings::default();
    let mut findings = AnalysisFindings {
        scores: collect_scores(body, &mut warnings),
        issues: collect_issues(body),
        ..AnalysisFindings::default()
    };

    match operation_type.family() {
        OperationFamily::Quality => {
            findings.recommendations = collect_strings(body, &["recommendations", "suggestions"]);
            findings.patterns = collect_patterns(body, &["patterns", "code_patterns"], &mut warnings);
        }
        OperationFamily::Performance => {
            findings.recommendations =
                collect_strings(body, &["recommendations", "optimization_opportunities"]);
            findings.baseline = body
                .get("baseline")
                .or_else(|| body.get("baseline_metrics"))
                .filter(|v| !v.is_null())
                .cloned();
        }
        OperationFamily::Pattern => {
            findings.patterns = collect_patterns(
                body,
                &["patterns", "detected_patterns", "extracted_patterns"],
                &mut warnings,
            );
            findings.recommendations = collect_strings(body, &["recommendations"]);
        }
    }

    if !warnings.0.is_empty() {
        metadata.insert("warnings".into(), Value::Array(warnings.0));
    }

    AnalysisOutput {
        success: true,
        operation_type,
        correlation_id,
        processing_time_ms: 0,
        body: OutputBody::Success(findings),
        metadata,
    }
}

/// Numeric `*_score` fields, `{ "score": n }` sub-objects and an explicit
/// `scores` map, all clamped to `[0.0, 1.0]`
fn collect_scores(body: &Map<String, Value>, warnings: &mut Warnings) -> BTreeMap<String, f64> {
    let mut scores = BTreeMap::new();

    for (key, value) in body {
        if key == "scores" {
            continue;
        }
        match value {
            Value::Number(n) if key.ends_with("_score") || key == "score" => {
                if let Some(v) = n.as_f64() {
                    scores.insert(key.clone(), warnings.clamp(key, v));
                }
            }
            Value::Object(obj) => {
                if let Some(v) = obj.get("score").and_then(Value::as_f64) {
                    let field = format!("{}.score", key);
                    scores.insert(key.clone(), warnings.clamp(&field, v));
                }
            }
            _ => {}
        }
    }

    if let Some(Value::Object(explicit)) = body.get("scores") {
        for (key, value) in explicit {
            if let Some(v) = value.as_f64() {
                let field = format!("scores.{}", key);
                scores.insert(key.clone(), warnings.clamp(&field, v));
            }
        }
    }

    scores
}

fn collect_issues(body: &Map<String, Value>) -> Vec<Issue> {
    ["issues", "violations"]
        .iter()
        .filter_map(|key| body.get(*key).and_then(Value::as_array))
        .flatten()
        .filter_map(|item| match item {
            Value::String(message) => Some(Issue {
                message: message.clone(),
                severity: None,
                category: None,
                line: None,
            }),
            Value::Object(obj) => {
                let message = ["message", "description", "title"]
                    .iter()
                    .find_map(|k| obj.get(*k).and_then(Value::as_str))?;
                Some(Issue {
                    message: message.to_string(),
                    severity: obj.get("severity").and_then(Value::as_str).map(str::to_string),
                    category: obj
                        .get("category")
                        .or_else(|| obj.get("type"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    line: obj.get("line").and_then(Value::as_u64),
                })
            }
            _ => None,
        })
        .collect()
}

fn collect_strings(body: &Map<String, Value>, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .filter_map(|key| body.get(*key).and_then(Value::as_array))
        .flatten()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => ["recommendation", "description", "title", "message"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
                .map(str::to_string),
            _ => None,
        })
        .collect()
}

fn collect_patterns(body: &Map<String, Value>, keys: &[&str], warnings: &mut Warnings) -> Vec<Value> {
    let Some(items) = keys
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_array))
    else {
        return Vec::new();
    };

    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let mut pattern = item.clone();
            if let Some(obj) = pattern.as_object_mut() {
                if let Some(confidence) = obj.get("confidence").and_then(Value::as_f64) {
                    let field = format!("patterns[{}].confidence", idx);
                    obj.insert("confidence".into(), json!(warnings.clamp(&field, confidence)));
                }
            }
            pattern
        })
        .collect()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn raw(body: Value) -> RawResponse {
        RawResponse {
            status: 200,
            body,
            latency: Duration::from_millis(42),
        }
    }

    #[test]
    fn test_quality_score_clamped_with_warning() {
        let output = transform(
            OperationType::AssessQuality,
            Uuid::new_v4(),
            &raw(json!({ "success": true, "quality_score": 1.4 })),
        );

        let findings = output.findings().unwrap();
        assert_eq!(findings.scores["quality_score"], 1.0);

        let warnings = output.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0]["kind"], "score_clamped");
        assert_eq!(warnings[0]["field"], "quality_score");
        assert_eq!(warnings[0]["original_value"], 1.4);
        assert_eq!(warnings[0]["clamped_value"], 1.0);
    }

    #[test]
    fn test_quality_mapping_collects_nested_scores_and_issues() {
        let output = transform(
            OperationType::CheckCompliance,
            Uuid::new_v4(),
            &raw(json!({
                "quality_score": 0.82,
                "architectural_compliance": { "score": -0.2, "reasoning": "layering" },
                "issues": ["unused import", { "description": "deep nesting", "severity": "high", "line": 12 }],
                "recommendations": [{ "title": "split module" }, "add tests"],
            })),
        );

        let findings = output.findings().unwrap();
        assert_eq!(findings.scores["quality_score"], 0.82);
        assert_eq!(findings.scores["architectural_compliance"], 0.0);
        assert_eq!(findings.issues.len(), 2);
        assert_eq!(findings.issues[1].severity.as_deref(), Some("high"));
        assert_eq!(findings.issues[1].line, Some(12));
        assert_eq!(findings.recommendations, vec!["split module", "add tests"]);
        assert_eq!(output.warnings()[0]["field"], "architectural_compliance.score");
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        let output = transform(OperationType::GetPatterns, Uuid::new_v4(), &raw(Value::Null));

        assert!(output.success);
        let findings = output.findings().unwrap();
        assert!(findings.scores.is_empty());
        assert!(findings.patterns.is_empty());
        assert!(findings.issues.is_empty());
        assert!(output.warnings().is_empty());
    }

    #[test]
    fn test_pattern_confidence_clamped() {
        let output = transform(
            OperationType::GetPatterns,
            Uuid::new_v4(),
            &raw(json!({
                "detected_patterns": [
                    { "name": "singleton", "confidence": 0.9 },
                    { "name": "factory", "confidence": 3 }
                ]
            })),
        );

        let findings = output.findings().unwrap();
        assert_eq!(findings.patterns[1]["confidence"], 1.0);
        assert_eq!(output.warnings()[0]["field"], "patterns[1].confidence");
    }

    #[test]
    fn test_performance_baseline_and_opportunities() {
        let output = transform(
            OperationType::AnalyzePerformance,
            Uuid::new_v4(),
            &raw(json!({
                "baseline_metrics": { "p95_ms": 120 },
                "optimization_opportunities": [{ "description": "cache lookups" }],
                "efficiency_score": 0.7
            })),
        );

        let findings = output.findings().unwrap();
        assert_eq!(findings.baseline, Some(json!({ "p95_ms": 120 })));
        assert_eq!(findings.recommendations, vec!["cache lookups"]);
        assert_eq!(findings.scores["efficiency_score"], 0.7);
    }

    #[test]
    fn test_unsuccessful_body_becomes_failure() {
        let output = transform(
            OperationType::AssessQuality,
            Uuid::new_v4(),
            &raw(json!({ "success": false, "error": "unsupported language" })),
        );

        assert!(!output.success);
        let details = output.failure_details().unwrap();
        assert_eq!(details.error_code, ErrorCode::BackendRejected);
        assert_eq!(details.error_message, "unsupported language");
        assert!(!details.retry_allowed);
    }

    #[test]
    fn test_serialized_shape() {
        let correlation_id = Uuid::new_v4();
        let failed = AnalysisOutput::failure(
            OperationType::AnalyzePerformance,
            correlation_id,
            ErrorCode::CircuitOpen,
            "circuit open",
            true,
        )
        .with_processing_time(17);

        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["operation_type"], "analyze-performance");
        assert_eq!(value["error_code"], "CIRCUIT_OPEN");
        assert_eq!(value["retry_allowed"], true);
        assert_eq!(value["processing_time_ms"], 17);
        assert_eq!(value["correlation_id"], correlation_id.to_string());
    }
}
