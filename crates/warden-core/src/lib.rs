//! # warden-core
//!
//! Deterministic content moderation rule engine.
//!
//! This crate decides what happens to a post or comment from:
//! - the author's profile and history,
//! - the content itself (after sanitizing),
//! - a trust score, and
//! - optionally, answers from an AI judgment obtained by `warden-runtime`.
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: Same rules and input always select the same rule
//! 2. **No LLM calls**: The engine only says which questions it needs
//! 3. **Checked at load**: Unknown fields, bad patterns and unknown
//!    placeholders make a rule uninstallable
//! 4. **Never silent on failure**: A rule that needs unavailable answers
//!    yields the configured no-judgment action
//!
//! ## Example
//!
//! ```rust,ignore
//! use warden_core::{EngineConfig, Evaluation, EvaluationContext, Judgment, RuleEngine, RuleSet};
//!
//! let rules = RuleSet::from_yaml_file("rules.yaml")?;
//! let engine = RuleEngine::from_rule_set(&rules, EngineConfig::default())?;
//! let ctx = EvaluationContext::with_sanitizer(&subject, &profile, Some(42), &sanitizer);
//!
//! match engine.evaluate(&ctx, Judgment::Pending) {
//!     Evaluation::Decided(decision) => println!("{}: {}", decision.action, decision.matched_rule_id),
//!     Evaluation::NeedsJudgment(questions) => println!("ask {} questions", questions.len()),
//! }
//! ```

pub mod engine;
pub mod rules;
pub mod sanitizer;
pub mod types;

// Re-export main types at crate root
pub use engine::{
    Decision, EngineConfig, Evaluation, RuleEngine, DEFAULT_MAX_QUESTIONS, DEFAULT_RULE_ID,
    NO_JUDGMENT_RULE_ID,
};
pub use rules::{
    AnswerView, ConditionDef, ContentSignals, EvaluationContext, FieldPath, FieldValue, Operator,
    Rule, RuleDefinition, RuleError, RuleSet,
};
pub use sanitizer::{ContentSanitizer, PatternSanitizer, SanitizedText};
pub use types::{
    Action, Answer, AnswerSet, AuthorProfile, ContentType, Judgment, JudgmentMeta, Question,
    QuestionAnswer, RecentItem, Subject, SubjectId,
};
