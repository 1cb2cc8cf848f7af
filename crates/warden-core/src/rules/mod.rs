//! Rule definitions, the field whitelist, condition trees and message
//! templates.

pub mod condition;
pub mod definition;
pub mod field;
pub mod template;

pub use condition::{compile_bounded_regex, Condition, ConditionDef, Operator};
pub use definition::{AiRequirement, Applicability, Rule, RuleDefinition, RuleError, RuleSet};
pub use field::{
    AnswerView, ContentSignals, EvaluationContext, FieldPath, FieldValue, Resolved, ValueKind,
};
pub use template::MessageTemplate;
