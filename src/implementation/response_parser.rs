//! Structured output parsing for implementation responses
//!
//! The model answers with one JSON object, normally inside a ```json block.
//! Parsing is strict: unknown fields, missing required fields and out-of-range
//! values are all errors, and any error leaves the session stuck.

use crate::models::{CriterionResult, FileOperationKind, VerificationResults};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ResponseParseError {
    #[error("no JSON object found in response")]
    NoJson,

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("response does not match schema: {0}")]
    Schema(String),

    #[error("invalid response: {0}")]
    Invalid(String),
}

/// One file change declared by the model
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileChange {
    pub path: String,
    pub operation: FileOperationKind,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub previous_path: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SelfCheck {
    #[serde(default)]
    pub criteria: Vec<CriterionResult>,
    pub all_passed: bool,
    pub confidence: f64,
}

/// Parsed and validated model response
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImplementationResult {
    #[serde(default)]
    pub needs_human_input: bool,
    #[serde(default)]
    pub human_input_reason: Option<String>,
    #[serde(default)]
    pub changes: Vec<FileChange>,
    #[serde(default)]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub self_check: Option<SelfCheck>,
}

impl ImplementationResult {
    /// Verification record derived from the self-check
    pub fn verification(&self) -> Option<VerificationResults> {
        self.self_check.as_ref().map(|check| {
            let total = check.criteria.len();
            let passed = check.criteria.iter().filter(|c| c.passed).count();
            let score = if total == 0 {
                if check.all_passed {
                    1.0
                } else {
                    0.0
                }
            } else {
                passed as f64 / total as f64
            };
            VerificationResults {
                score,
                all_passed: check.all_passed,
                confidence: check.confidence,
                criteria: check.criteria.clone(),
            }
        })
    }
}

/// Parse and validate a raw model response
pub fn parse_implementation_response(raw: &str) -> Result<ImplementationResult, ResponseParseError> {
    let value = extract_json_object(raw)?;
    let result: ImplementationResult =
        serde_json::from_value(value).map_err(|e| ResponseParseError::Schema(e.to_string()))?;
    validate(&result)?;
    Ok(result)
}

/// Find the first JSON object, preferring a ```json block.
///
/// The object is read with a streaming deserializer rather than by searching
/// for the closing fence, since file contents may contain fences themselves.
fn extract_json_object(raw: &str) -> Result<Value, ResponseParseError> {
    let start = match raw.find("```json") {
        Some(fence) => {
            let after_fence = &raw[fence + "```json".len()..];
            after_fence
                .find('{')
                .map(|offset| fence + "```json".len() + offset)
        }
        None => raw.find('{'),
    }
    .ok_or(ResponseParseError::NoJson)?;

    let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) if value.is_object() => Ok(value),
        Some(Ok(_)) => Err(ResponseParseError::NoJson),
        Some(Err(e)) => Err(ResponseParseError::InvalidJson(e.to_string())),
        None => Err(ResponseParseError::NoJson),
    }
}

fn validate(result: &ImplementationResult) -> Result<(), ResponseParseError> {
    if result.needs_human_input {
        let has_reason = result
            .human_input_reason
            .as_deref()
            .map_or(false, |r| !r.trim().is_empty());
        if !has_reason {
            return Err(ResponseParseError::Invalid(
                "humanInputReason is required when needsHumanInput is true".to_string(),
            ));
        }
        return Ok(());
    }

    let check = result
        .self_check
        .as_ref()
        .ok_or_else(|| ResponseParseError::Invalid("selfCheck is required".to_string()))?;

    if !check.confidence.is_finite() || !(0.0..=1.0).contains(&check.confidence) {
        return Err(ResponseParseError::Invalid(format!(
            "confidence must be between 0 and 1, got {}",
            check.confidence
        )));
    }

    if !result.changes.is_empty() {
        let has_message = result
            .commit_message
            .as_deref()
            .map_or(false, |m| !m.trim().is_empty());
        if !has_message {
            return Err(ResponseParseError::Invalid(
                "commitMessage is required when changes are present".to_string(),
            ));
        }
    }

    for change in &result.changes {
        validate_path(&change.path)?;
        match change.operation {
            FileOperationKind::Create | FileOperationKind::Update => {
                if change.content.is_none() {
                    return Err(ResponseParseError::Invalid(format!(
                        "content is required for {} of {}",
                        change.operation.as_str(),
                        change.path
                    )));
                }
            }
            FileOperationKind::Rename => {
                let previous = change.previous_path.as_deref().ok_or_else(|| {
                    ResponseParseError::Invalid(format!(
                        "previousPath is required for rename of {}",
                        change.path
                    ))
                })?;
                validate_path(previous)?;
                if previous == change.path {
                    return Err(ResponseParseError::Invalid(format!(
                        "rename of {} has identical source and target",
                        change.path
                    )));
                }
            }
            FileOperationKind::Delete => {}
        }
    }

    Ok(())
}

fn validate_path(path: &str) -> Result<(), ResponseParseError> {
    let trimmed = path.trim();
    if trimmed.is_empty()
        || trimmed.starts_with('/')
        || trimmed.split('/').any(|segment| segment == ".." || segment.is_empty())
    {
        return Err(ResponseParseError::Invalid(format!(
            "invalid file path: '{}'",
            path
        )));
    }
    Ok(())
}
