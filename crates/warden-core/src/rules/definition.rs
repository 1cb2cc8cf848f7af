//! Rule definitions and their definition-time compilation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

use super::condition::{Condition, ConditionDef};
use super::field::{AnswerView, EvaluationContext};
use super::template::MessageTemplate;
use crate::types::{Action, AnswerSet, ContentType, Question};

/// Errors raised while loading or compiling rules.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Failed to read rules file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Rule {rule_id}: missing required field '{field}'")]
    MissingField { rule_id: String, field: String },

    #[error("Rule {rule_id}: unknown field path '{path}'")]
    UnknownField { rule_id: String, path: String },

    #[error("Rule {rule_id}: question '{question_id}' is not declared by the rule")]
    UnknownQuestion { rule_id: String, question_id: String },

    #[error("Rule {rule_id}: type mismatch on '{path}': {detail}")]
    TypeMismatch {
        rule_id: String,
        path: String,
        detail: String,
    },

    #[error("Rule {rule_id}: invalid condition: {detail}")]
    InvalidCondition { rule_id: String, detail: String },

    #[error("Rule {rule_id}: rejected pattern '{pattern}': {reason}")]
    InvalidPattern {
        rule_id: String,
        pattern: String,
        reason: String,
    },

    #[error("Rule {rule_id}: invalid message template: {detail}")]
    InvalidTemplate { rule_id: String, detail: String },

    #[error("Rule {rule_id}: confidence threshold {threshold} is outside 0-100")]
    InvalidThreshold { rule_id: String, threshold: u8 },

    #[error("Duplicate rule ID: {0}")]
    DuplicateRuleId(String),

    #[error("Question '{question_id}' is declared with different texts")]
    ConflictingQuestion { question_id: String },

    #[error("Rules need {count} distinct questions, batch limit is {max}")]
    TooManyQuestions { count: usize, max: usize },
}

/// Content types a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Applicability {
    Posts,
    Comments,
    #[default]
    Both,
}

impl Applicability {
    pub fn matches(self, content_type: ContentType) -> bool {
        match self {
            Applicability::Both => true,
            Applicability::Posts => content_type == ContentType::Post,
            Applicability::Comments => content_type == ContentType::Comment,
        }
    }
}

fn default_threshold() -> u8 {
    70
}

fn default_enabled() -> bool {
    true
}

/// What an AI rule needs from a judgment provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiRequirement {
    pub questions: Vec<Question>,

    /// Minimum answer confidence (0 - 100) for the rule to see an answer
    #[serde(default = "default_threshold")]
    pub confidence_threshold: u8,
}

/// A rule as written in a rules file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Unique identifier (e.g., "new-account-links")
    pub id: String,

    /// Higher is evaluated first
    #[serde(default)]
    pub priority: i64,

    #[serde(default)]
    pub applies_to: Applicability,

    pub condition: ConditionDef,

    pub action: Action,

    /// Explanation shown with the action, `{field.path}` placeholders allowed
    #[serde(default)]
    pub message: String,

    /// Present only for AI rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai: Option<AiRequirement>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl RuleDefinition {
    /// Resolve every field path, pattern and placeholder.
    pub fn compile(&self) -> Result<Rule, RuleError> {
        if self.id.trim().is_empty() {
            return Err(RuleError::MissingField {
                rule_id: "<unnamed>".to_string(),
                field: "id".to_string(),
            });
        }

        let mut declared = BTreeSet::new();
        if let Some(ai) = &self.ai {
            if ai.confidence_threshold > 100 {
                return Err(RuleError::InvalidThreshold {
                    rule_id: self.id.clone(),
                    threshold: ai.confidence_threshold,
                });
            }
            if ai.questions.is_empty() {
                return Err(RuleError::MissingField {
                    rule_id: self.id.clone(),
                    field: "ai.questions".to_string(),
                });
            }
            for question in &ai.questions {
                if question.id.trim().is_empty() || question.text.trim().is_empty() {
                    return Err(RuleError::MissingField {
                        rule_id: self.id.clone(),
                        field: "ai.questions[].id/text".to_string(),
                    });
                }
                if !declared.insert(question.id.clone()) {
                    return Err(RuleError::InvalidCondition {
                        rule_id: self.id.clone(),
                        detail: format!("question '{}' declared twice", question.id),
                    });
                }
            }
        }

        let condition = self.condition.compile(&self.id, &declared)?;
        let message = MessageTemplate::compile(&self.message, &self.id, &declared)?;

        let mut referenced = BTreeSet::new();
        condition.referenced_questions(&mut referenced);

        Ok(Rule {
            id: self.id.clone(),
            priority: self.priority,
            applies_to: self.applies_to,
            condition,
            action: self.action,
            message,
            ai: self.ai.clone(),
            referenced,
        })
    }
}

/// A compiled, immutable rule.
#[derive(Debug, Clone)]
pub struct Rule {
    id: String,
    priority: i64,
    applies_to: Applicability,
    condition: Condition,
    action: Action,
    message: MessageTemplate,
    ai: Option<AiRequirement>,
    referenced: BTreeSet<String>,
}

impl Rule {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn applies_to(&self, content_type: ContentType) -> bool {
        self.applies_to.matches(content_type)
    }

    /// True for rules that declare questions.
    pub fn is_ai(&self) -> bool {
        self.ai.is_some()
    }

    pub fn questions(&self) -> &[Question] {
        self.ai.as_ref().map(|ai| ai.questions.as_slice()).unwrap_or(&[])
    }

    pub fn confidence_threshold(&self) -> Option<u8> {
        self.ai.as_ref().map(|ai| ai.confidence_threshold)
    }

    /// Answers as this rule sees them: gated by its threshold.
    pub fn answer_view<'a>(&self, answers: Option<&'a AnswerSet>) -> AnswerView<'a> {
        match (answers, &self.ai) {
            (Some(answers), Some(ai)) => AnswerView::Gated {
                answers,
                threshold: ai.confidence_threshold,
            },
            _ => AnswerView::Unknown,
        }
    }

    pub fn evaluate(&self, ctx: &EvaluationContext<'_>, answers: AnswerView<'_>) -> Option<bool> {
        self.condition.evaluate(ctx, answers)
    }

    pub fn render_message(&self, ctx: &EvaluationContext<'_>, answers: AnswerView<'_>) -> String {
        self.message.render(ctx, answers)
    }

    /// Lowest confidence among the answers this rule's condition references.
    pub fn answer_confidence(&self, answers: &AnswerSet) -> Option<u8> {
        self.referenced
            .iter()
            .filter_map(|id| answers.get(id))
            .map(|a| a.confidence)
            .min()
    }

    /// Reasoning from the referenced answers, in question id order.
    pub fn answer_reasoning(&self, answers: &AnswerSet) -> Vec<String> {
        self.referenced
            .iter()
            .filter_map(|id| answers.get(id))
            .filter(|a| !a.reasoning.is_empty())
            .map(|a| format!("{}: {}", a.question_id, a.reasoning))
            .collect()
    }
}

/// A rules file.
///
/// ```yaml
/// rules:
///   - id: new-account-links
///     priority: 100
///     condition:
///       and:
///         - { field: profile.account_age_days, op: lt, value: 7 }
///         - { field: content.has_url, op: eq, value: true }
///     action: flag
///     message: "New account ({profile.account_age_days} days) posting links"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

impl RuleSet {
    /// Parse a rule set from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, RuleError> {
        let set: RuleSet = serde_yaml::from_str(yaml)?;
        set.validate_unique_ids()?;
        Ok(set)
    }

    /// Parse a rule set from JSON string.
    pub fn from_json(json: &str) -> Result<Self, RuleError> {
        let set: RuleSet = serde_json::from_str(json)?;
        set.validate_unique_ids()?;
        Ok(set)
    }

    /// Parse a rule set from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a rule set from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Compile every enabled rule. Stops at the first invalid rule.
    pub fn compile(&self) -> Result<Vec<Rule>, RuleError> {
        self.validate_unique_ids()?;
        self.rules
            .iter()
            .filter(|r| r.enabled)
            .map(RuleDefinition::compile)
            .collect()
    }

    fn validate_unique_ids(&self) -> Result<(), RuleError> {
        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(RuleError::DuplicateRuleId(rule.id.clone()));
            }
        }
        Ok(())
    }
}
