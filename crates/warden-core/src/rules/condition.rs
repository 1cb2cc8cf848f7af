//! Condition trees: definitions as written in rule files, and their compiled
//! form.
//!
//! Compilation checks every field path against the whitelist, checks that
//! operator, field and literal types agree, and compiles regex patterns
//! under hard size limits. Evaluation is three-valued so the engine can
//! tell "false regardless of AI answers" apart from "depends on answers".

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;

use super::definition::RuleError;
use super::field::{AnswerView, EvaluationContext, FieldPath, FieldValue, Resolved, ValueKind};
use crate::types::Answer;

/// Longest accepted regex pattern, in bytes.
pub const MAX_PATTERN_LEN: usize = 256;

/// Compiled program size limit for a single pattern.
pub const PATTERN_SIZE_LIMIT: usize = 256 * 1024;

/// Lazy DFA cache limit for a single pattern.
pub const PATTERN_DFA_SIZE_LIMIT: usize = 1024 * 1024;

/// Maximum group/repetition nesting depth.
pub const PATTERN_NEST_LIMIT: u32 = 16;

/// Comparison operator for a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Case-insensitive substring
    Contains,
    NotContains,
    /// Case-insensitive prefix
    StartsWith,
    /// Regex search
    Matches,
    /// Equal to any element of a list
    In,
}

/// A condition as written in a rule file.
///
/// ```yaml
/// and:
///   - { field: profile.account_age_days, op: lt, value: 7 }
///   - or:
///       - { field: content.has_url, op: eq, value: true }
///       - { field: content.text, op: matches, value: "(?i)free money" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionDef {
    And { and: Vec<ConditionDef> },
    Or { or: Vec<ConditionDef> },
    Leaf {
        field: String,
        op: Operator,
        value: JsonValue,
    },
}

impl ConditionDef {
    pub fn leaf(field: impl Into<String>, op: Operator, value: JsonValue) -> Self {
        ConditionDef::Leaf {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn and(children: Vec<ConditionDef>) -> Self {
        ConditionDef::And { and: children }
    }

    pub fn or(children: Vec<ConditionDef>) -> Self {
        ConditionDef::Or { or: children }
    }

    /// Compile against the question ids the owning rule declares.
    pub fn compile(
        &self,
        rule_id: &str,
        declared_questions: &BTreeSet<String>,
    ) -> Result<Condition, RuleError> {
        match self {
            ConditionDef::And { and } => {
                Ok(Condition::And(compile_children(and, "and", rule_id, declared_questions)?))
            }
            ConditionDef::Or { or } => {
                Ok(Condition::Or(compile_children(or, "or", rule_id, declared_questions)?))
            }
            ConditionDef::Leaf { field, op, value } => {
                compile_leaf(field, *op, value, rule_id, declared_questions).map(Condition::Leaf)
            }
        }
    }
}

fn compile_children(
    children: &[ConditionDef],
    node: &str,
    rule_id: &str,
    declared_questions: &BTreeSet<String>,
) -> Result<Vec<Condition>, RuleError> {
    if children.is_empty() {
        return Err(RuleError::InvalidCondition {
            rule_id: rule_id.to_string(),
            detail: format!("'{}' node has no children", node),
        });
    }
    children
        .iter()
        .map(|c| c.compile(rule_id, declared_questions))
        .collect()
}

fn compile_leaf(
    path: &str,
    op: Operator,
    value: &JsonValue,
    rule_id: &str,
    declared_questions: &BTreeSet<String>,
) -> Result<Leaf, RuleError> {
    let field = FieldPath::parse(path).ok_or_else(|| RuleError::UnknownField {
        rule_id: rule_id.to_string(),
        path: path.to_string(),
    })?;

    if let Some(question_id) = field.question_id() {
        if !declared_questions.contains(question_id) {
            return Err(RuleError::UnknownQuestion {
                rule_id: rule_id.to_string(),
                question_id: question_id.to_string(),
            });
        }
    }

    let mismatch = |detail: String| RuleError::TypeMismatch {
        rule_id: rule_id.to_string(),
        path: path.to_string(),
        detail,
    };

    let kind = field.kind();
    let literal = match op {
        Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte => {
            if kind != ValueKind::Number {
                return Err(mismatch(format!("{:?} needs a number field, got {}", op, kind)));
            }
            literal_of_kind(value, kind).ok_or_else(|| mismatch("expected a number".into()))?
        }
        Operator::Contains | Operator::NotContains | Operator::StartsWith => {
            if kind != ValueKind::Text {
                return Err(mismatch(format!("{:?} needs a text field, got {}", op, kind)));
            }
            match value.as_str() {
                Some(s) => Literal::Text(s.to_lowercase()),
                None => return Err(mismatch("expected a string".into())),
            }
        }
        Operator::Matches => {
            if kind != ValueKind::Text {
                return Err(mismatch(format!("matches needs a text field, got {}", kind)));
            }
            let pattern = value
                .as_str()
                .ok_or_else(|| mismatch("expected a regex string".into()))?;
            Literal::Pattern(compile_bounded_regex(pattern, rule_id)?)
        }
        Operator::Eq | Operator::Ne => literal_of_kind(value, kind)
            .ok_or_else(|| mismatch(format!("expected a {} literal", kind)))?,
        Operator::In => {
            let items = value
                .as_array()
                .ok_or_else(|| mismatch("'in' expects a list".into()))?;
            if items.is_empty() {
                return Err(mismatch("'in' list is empty".into()));
            }
            let literals = items
                .iter()
                .map(|item| literal_of_kind(item, kind))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| mismatch(format!("every 'in' element must be a {}", kind)))?;
            Literal::List(literals)
        }
    };

    Ok(Leaf { field, op, literal })
}

/// Coerce a JSON literal to the field's kind. `"YES"`/`"NO"` are accepted
/// for boolean fields so answer conditions read naturally.
fn literal_of_kind(value: &JsonValue, kind: ValueKind) -> Option<Literal> {
    match kind {
        ValueKind::Number => value.as_f64().map(Literal::Number),
        ValueKind::Bool => match value {
            JsonValue::Bool(b) => Some(Literal::Bool(*b)),
            JsonValue::String(s) => Answer::parse(s).map(|a| Literal::Bool(a.as_bool())),
            _ => None,
        },
        ValueKind::Text => value.as_str().map(|s| Literal::Text(s.to_string())),
    }
}

/// Compile a user-supplied pattern under fixed limits.
///
/// The `regex` crate never backtracks, so matching is linear in the input;
/// the limits below bound the compile side (pattern length, program size,
/// nesting) before the pattern is ever run.
pub fn compile_bounded_regex(pattern: &str, rule_id: &str) -> Result<Regex, RuleError> {
    let invalid = |reason: String| RuleError::InvalidPattern {
        rule_id: rule_id.to_string(),
        pattern: pattern.to_string(),
        reason,
    };

    if pattern.is_empty() {
        return Err(invalid("pattern is empty".into()));
    }
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(invalid(format!(
            "pattern is {} bytes, limit is {}",
            pattern.len(),
            MAX_PATTERN_LEN
        )));
    }

    RegexBuilder::new(pattern)
        .size_limit(PATTERN_SIZE_LIMIT)
        .dfa_size_limit(PATTERN_DFA_SIZE_LIMIT)
        .nest_limit(PATTERN_NEST_LIMIT)
        .build()
        .map_err(|e| invalid(e.to_string()))
}

/// A compiled literal.
#[derive(Debug, Clone)]
enum Literal {
    Number(f64),
    Bool(bool),
    /// Lowercased for contains/starts_with, verbatim for eq/ne/in
    Text(String),
    Pattern(Regex),
    List(Vec<Literal>),
}

/// A compiled leaf comparison.
#[derive(Debug, Clone)]
pub struct Leaf {
    field: FieldPath,
    op: Operator,
    literal: Literal,
}

impl Leaf {
    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    fn compare(&self, value: &FieldValue) -> bool {
        match (self.op, value, &self.literal) {
            (_, FieldValue::Missing, _) => false,
            (Operator::Eq, v, lit) => literal_eq(v, lit),
            (Operator::Ne, v, lit) => !literal_eq(v, lit),
            (Operator::Lt, FieldValue::Number(a), Literal::Number(b)) => a < b,
            (Operator::Lte, FieldValue::Number(a), Literal::Number(b)) => a <= b,
            (Operator::Gt, FieldValue::Number(a), Literal::Number(b)) => a > b,
            (Operator::Gte, FieldValue::Number(a), Literal::Number(b)) => a >= b,
            (Operator::Contains, FieldValue::Text(s), Literal::Text(needle)) => {
                s.to_lowercase().contains(needle.as_str())
            }
            (Operator::NotContains, FieldValue::Text(s), Literal::Text(needle)) => {
                !s.to_lowercase().contains(needle.as_str())
            }
            (Operator::StartsWith, FieldValue::Text(s), Literal::Text(prefix)) => {
                s.to_lowercase().starts_with(prefix.as_str())
            }
            (Operator::Matches, FieldValue::Text(s), Literal::Pattern(re)) => re.is_match(s),
            (Operator::In, v, Literal::List(items)) => items.iter().any(|lit| literal_eq(v, lit)),
            _ => false,
        }
    }
}

fn literal_eq(value: &FieldValue, literal: &Literal) -> bool {
    match (value, literal) {
        (FieldValue::Number(a), Literal::Number(b)) => (a - b).abs() < f64::EPSILON,
        (FieldValue::Bool(a), Literal::Bool(b)) => a == b,
        (FieldValue::Text(a), Literal::Text(b)) => a == b,
        _ => false,
    }
}

/// A compiled condition tree.
#[derive(Debug, Clone)]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Leaf(Leaf),
}

impl Condition {
    /// Three-valued evaluation: `None` means the outcome depends on AI
    /// answers that are not available through `answers`.
    ///
    /// AND stops at the first false child, OR at the first true child.
    pub fn evaluate(&self, ctx: &EvaluationContext<'_>, answers: AnswerView<'_>) -> Option<bool> {
        match self {
            Condition::And(children) => {
                let mut unknown = false;
                for child in children {
                    match child.evaluate(ctx, answers) {
                        Some(false) => return Some(false),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                if unknown {
                    None
                } else {
                    Some(true)
                }
            }
            Condition::Or(children) => {
                let mut unknown = false;
                for child in children {
                    match child.evaluate(ctx, answers) {
                        Some(true) => return Some(true),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                if unknown {
                    None
                } else {
                    Some(false)
                }
            }
            Condition::Leaf(leaf) => match ctx.resolve(&leaf.field, answers) {
                Resolved::Unknown => None,
                Resolved::Value(value) => Some(leaf.compare(&value)),
            },
        }
    }

    /// Question ids referenced by `ai.*` leaves.
    pub fn referenced_questions(&self, out: &mut BTreeSet<String>) {
        match self {
            Condition::And(children) | Condition::Or(children) => {
                for child in children {
                    child.referenced_questions(out);
                }
            }
            Condition::Leaf(leaf) => {
                if let Some(id) = leaf.field.question_id() {
                    out.insert(id.to_string());
                }
            }
        }
    }
}
