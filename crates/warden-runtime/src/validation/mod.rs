//! Provider response validation.
//!
//! Provider output is untrusted text. [`ResponseValidator::validate`] is the
//! strict boundary used on the decision path: it either yields a fully typed
//! [`JudgmentPayload`] or a [`ValidationError`] listing every violation.
//! [`ResponseValidator::validate_partial`] is the salvage mode: it keeps
//! whichever top-level fields validate on their own and reports the rest as
//! warnings. The two never share a return type.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use thiserror::Error;

use warden_core::{Action, Answer, QuestionAnswer};

use crate::prompts::{JudgmentRequest, RequestKind};

const RISK_SCHEMA_JSON: &str = include_str!("../../schemas/risk_assessment.schema.json");
const ANSWERS_SCHEMA_JSON: &str = include_str!("../../schemas/question_answers.schema.json");

/// A schema-violating payload, with every violation found.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{} violation(s): {}", .violations.len(), .violations.join("; "))]
pub struct ValidationError {
    pub violations: Vec<String>,
}

impl ValidationError {
    pub fn new(violations: Vec<String>) -> Self {
        Self { violations }
    }
}

/// Why a response could not be turned into a payload.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResponseError {
    /// Not JSON at all
    #[error("Response is not valid JSON: {0}")]
    Malformed(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// High and critical results get the long cache TTL.
    pub fn is_high(self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

/// A full risk assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,
    pub confidence: u8,
    pub categories: Vec<String>,
    pub reasoning: String,
    pub recommended_action: Action,
}

/// A strictly validated payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JudgmentPayload {
    Risk(RiskAssessment),
    Answers(Vec<QuestionAnswer>),
}

impl JudgmentPayload {
    pub fn is_high_risk(&self) -> bool {
        match self {
            JudgmentPayload::Risk(r) => r.risk_level.is_high(),
            JudgmentPayload::Answers(_) => false,
        }
    }
}

/// Risk fields that validated on their own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialRisk {
    pub risk_level: Option<RiskLevel>,
    pub confidence: Option<u8>,
    pub categories: Option<Vec<String>>,
    pub reasoning: Option<String>,
    pub recommended_action: Option<Action>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Salvaged {
    Risk(PartialRisk),
    Answers(Vec<QuestionAnswer>),
}

/// Best-effort result. Not for the action-determining path.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialPayload {
    pub salvaged: Salvaged,
    pub warnings: Vec<String>,
}

struct CompiledSchema {
    whole: jsonschema::Validator,
    required: Vec<String>,
    properties: Vec<(String, jsonschema::Validator)>,
    /// `properties.answers.items`, when present
    answer_item: Option<jsonschema::Validator>,
}

fn compile_schema(source: &str) -> Result<CompiledSchema, String> {
    let doc: JsonValue =
        serde_json::from_str(source).map_err(|e| format!("Invalid schema JSON: {}", e))?;
    let build = |schema: &JsonValue| {
        jsonschema::options()
            .build(schema)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    };

    let whole = build(&doc)?;
    let required = doc["required"]
        .as_array()
        .map(|r| r.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let mut properties = Vec::new();
    if let Some(props) = doc["properties"].as_object() {
        for (name, schema) in props {
            properties.push((name.clone(), build(schema)?));
        }
    }
    let answer_item = match doc.pointer("/properties/answers/items") {
        Some(items) => Some(build(items)?),
        None => None,
    };

    Ok(CompiledSchema {
        whole,
        required,
        properties,
        answer_item,
    })
}

static RISK_SCHEMA: OnceLock<Result<CompiledSchema, String>> = OnceLock::new();
static ANSWERS_SCHEMA: OnceLock<Result<CompiledSchema, String>> = OnceLock::new();

fn schema_for(kind: RequestKind) -> Result<&'static CompiledSchema, ValidationError> {
    let slot = match kind {
        RequestKind::RiskAssessment => RISK_SCHEMA.get_or_init(|| compile_schema(RISK_SCHEMA_JSON)),
        RequestKind::Questions => ANSWERS_SCHEMA.get_or_init(|| compile_schema(ANSWERS_SCHEMA_JSON)),
    };
    slot.as_ref()
        .map_err(|e| ValidationError::new(vec![e.clone()]))
}

fn fence_pattern() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)^```[A-Za-z]*\s*(.*?)\s*```$").expect("Invalid regex")
    })
}

/// Parse provider text as JSON, tolerating a surrounding code fence.
pub fn extract_json(raw: &str) -> Result<JsonValue, ResponseError> {
    let trimmed = raw.trim();
    let body = fence_pattern()
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map_or(trimmed, |m| m.as_str());
    serde_json::from_str(body).map_err(|e| ResponseError::Malformed(e.to_string()))
}

/// Validates responses for one request.
#[derive(Debug, Clone)]
pub struct ResponseValidator {
    kind: RequestKind,
    expected: BTreeSet<String>,
}

impl ResponseValidator {
    pub fn new(kind: RequestKind, expected: impl IntoIterator<Item = String>) -> Self {
        Self {
            kind,
            expected: expected.into_iter().collect(),
        }
    }

    pub fn for_request(request: &JudgmentRequest) -> Self {
        Self::new(request.kind, request.question_ids().map(String::from))
    }

    /// Strict mode.
    pub fn validate(&self, raw: &str) -> Result<JudgmentPayload, ResponseError> {
        let value = extract_json(raw)?;
        let schema = schema_for(self.kind)?;

        let mut violations: Vec<String> = schema
            .whole
            .iter_errors(&value)
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();

        match self.kind {
            RequestKind::RiskAssessment => {
                if !violations.is_empty() {
                    return Err(ValidationError::new(violations).into());
                }
                risk_from_value(&value)
                    .map(JudgmentPayload::Risk)
                    .map_err(|v| ValidationError::new(vec![v]).into())
            }
            RequestKind::Questions => {
                let items = value["answers"].as_array().map(Vec::as_slice).unwrap_or_default();
                violations.extend(self.id_violations(items));
                if !violations.is_empty() {
                    return Err(ValidationError::new(violations).into());
                }

                let answers: Vec<QuestionAnswer> =
                    items.iter().filter_map(answer_from_value).collect();
                Ok(JudgmentPayload::Answers(answers))
            }
        }
    }

    /// Duplicate, unexpected and missing question ids among `items`. Items
    /// without a string id are left to the schema check.
    fn id_violations(&self, items: &[JsonValue]) -> Vec<String> {
        let mut violations = Vec::new();
        let mut seen = BTreeSet::new();
        for id in items.iter().filter_map(|item| item["question_id"].as_str()) {
            if !seen.insert(id.to_string()) {
                violations.push(format!("duplicate answer for '{}'", id));
            } else if !self.expected.contains(id) {
                violations.push(format!("unexpected question id '{}'", id));
            }
        }
        for missing in self.expected.difference(&seen) {
            violations.push(format!("missing answer for '{}'", missing));
        }
        violations
    }

    /// Salvage mode. Only non-JSON input is an error.
    pub fn validate_partial(&self, raw: &str) -> Result<PartialPayload, ResponseError> {
        let value = extract_json(raw)?;
        let schema = schema_for(self.kind)?;
        let mut warnings = Vec::new();

        let Some(object) = value.as_object() else {
            return Ok(PartialPayload {
                salvaged: self.empty_salvage(),
                warnings: vec!["payload is not a JSON object".to_string()],
            });
        };

        for field in &schema.required {
            if !object.contains_key(field) {
                warnings.push(format!("missing field '{}'", field));
            }
        }

        let mut valid_fields = BTreeSet::new();
        for (name, validator) in &schema.properties {
            let Some(field) = object.get(name) else {
                continue;
            };
            let errors: Vec<String> = validator
                .iter_errors(field)
                .map(|e| format!("{}: {}", name, e))
                .collect();
            if errors.is_empty() {
                valid_fields.insert(name.as_str());
            } else {
                warnings.extend(errors);
            }
        }

        let salvaged = match self.kind {
            RequestKind::RiskAssessment => {
                let keep = |name: &str| valid_fields.contains(name).then(|| &object[name]);
                Salvaged::Risk(PartialRisk {
                    risk_level: keep("risk_level")
                        .and_then(|v| serde_json::from_value(v.clone()).ok()),
                    confidence: keep("confidence").and_then(confidence_of),
                    categories: keep("categories")
                        .and_then(|v| serde_json::from_value(v.clone()).ok()),
                    reasoning: keep("reasoning").and_then(|v| v.as_str().map(String::from)),
                    recommended_action: keep("recommended_action")
                        .and_then(|v| serde_json::from_value(v.clone()).ok()),
                })
            }
            RequestKind::Questions => {
                let mut answers = Vec::new();
                let items = object.get("answers").and_then(JsonValue::as_array);
                for (i, item) in items.into_iter().flatten().enumerate() {
                    let item_ok = schema
                        .answer_item
                        .as_ref()
                        .map_or(true, |v| v.is_valid(item));
                    match answer_from_value(item).filter(|_| item_ok) {
                        Some(answer) if self.expected.is_empty()
                            || self.expected.contains(&answer.question_id) =>
                        {
                            answers.push(answer)
                        }
                        Some(answer) => warnings
                            .push(format!("unexpected question id '{}'", answer.question_id)),
                        None => warnings.push(format!("answers[{}] is invalid", i)),
                    }
                }
                Salvaged::Answers(answers)
            }
        };

        Ok(PartialPayload { salvaged, warnings })
    }

    fn empty_salvage(&self) -> Salvaged {
        match self.kind {
            RequestKind::RiskAssessment => Salvaged::Risk(PartialRisk::default()),
            RequestKind::Questions => Salvaged::Answers(Vec::new()),
        }
    }
}

/// `85` and `85.0` are both accepted.
fn confidence_of(value: &JsonValue) -> Option<u8> {
    let n = value.as_f64()?;
    (0.0..=100.0)
        .contains(&n)
        .then_some(n.round() as u8)
}

fn answer_from_value(value: &JsonValue) -> Option<QuestionAnswer> {
    Some(QuestionAnswer {
        question_id: value["question_id"].as_str()?.to_string(),
        answer: Answer::parse(value["answer"].as_str()?)?,
        confidence: confidence_of(&value["confidence"])?,
        reasoning: value["reasoning"].as_str().unwrap_or_default().to_string(),
    })
}

fn risk_from_value(value: &JsonValue) -> Result<RiskAssessment, String> {
    Ok(RiskAssessment {
        risk_level: field(value, "risk_level")?,
        confidence: confidence_of(&value["confidence"])
            .ok_or_else(|| "confidence: out of range".to_string())?,
        categories: field(value, "categories")?,
        reasoning: field(value, "reasoning")?,
        recommended_action: field(value, "recommended_action")?,
    })
}

fn field<T: DeserializeOwned>(value: &JsonValue, name: &str) -> Result<T, String> {
    serde_json::from_value(value[name].clone()).map_err(|e| format!("{}: {}", name, e))
}
