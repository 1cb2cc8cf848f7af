//! First-match rule evaluation.
//!
//! The engine is consulted up to twice per subject. The first pass runs
//! with [`Judgment::Pending`]: rules whose outcome does not depend on AI
//! answers are decided immediately, and the questions of AI rules that
//! rank above the first decisive match are collected. Only when that set is
//! non-empty does the caller pay for a judgment and run the second pass
//! with the answers (or with [`Judgment::Unavailable`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::rules::{AnswerView, EvaluationContext, Rule, RuleError, RuleSet};
use crate::types::{Action, AnswerSet, Judgment, JudgmentMeta, Question};

/// `matched_rule_id` when no rule matched.
pub const DEFAULT_RULE_ID: &str = "default";

/// `matched_rule_id` when a rule needed answers that could not be obtained.
pub const NO_JUDGMENT_RULE_ID: &str = "no_judgment";

/// Default cap on distinct questions sent in one call.
pub const DEFAULT_MAX_QUESTIONS: usize = 10;

fn default_max_questions() -> usize {
    DEFAULT_MAX_QUESTIONS
}

fn default_default_action() -> Action {
    Action::Approve
}

fn default_no_judgment_action() -> Action {
    Action::Flag
}

/// Engine-level policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Applied when no rule matches
    #[serde(default = "default_default_action")]
    pub default_action: Action,

    /// Applied when a rule needs answers that are unavailable
    #[serde(default = "default_no_judgment_action")]
    pub no_judgment_action: Action,

    #[serde(default = "default_max_questions")]
    pub max_questions_per_batch: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_action: default_default_action(),
            no_judgment_action: default_no_judgment_action(),
            max_questions_per_batch: DEFAULT_MAX_QUESTIONS,
        }
    }
}

/// The decision handed back for execution and audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,

    /// Winning rule id, [`DEFAULT_RULE_ID`] or [`NO_JUDGMENT_RULE_ID`]
    pub matched_rule_id: String,

    /// Lowest confidence among the answers the winning rule used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,

    pub reasoning: String,

    /// Rendered message template, if the rule has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub cost_usd: f64,
    pub latency_ms: u64,
    pub cache_hit: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Decision {
    fn new(action: Action, matched_rule_id: impl Into<String>, reasoning: String) -> Self {
        Self {
            action,
            matched_rule_id: matched_rule_id.into(),
            confidence: None,
            reasoning,
            message: None,
            cost_usd: 0.0,
            latency_ms: 0,
            cache_hit: false,
            correlation_id: None,
        }
    }

    fn with_meta(mut self, meta: &JudgmentMeta) -> Self {
        self.cost_usd = meta.cost_usd;
        self.latency_ms = meta.latency_ms;
        self.cache_hit = meta.cache_hit;
        if !meta.correlation_id.is_empty() {
            self.correlation_id = Some(meta.correlation_id.clone());
        }
        self
    }

    pub fn is_default(&self) -> bool {
        self.matched_rule_id == DEFAULT_RULE_ID
    }
}

/// Outcome of one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Decided(Decision),
    /// A judgment is needed for these questions before a decision exists
    NeedsJudgment(Vec<Question>),
}

/// Compiled, priority-ordered rules.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Vec<Rule>,
    config: EngineConfig,
}

impl RuleEngine {
    /// Order rules and check the question catalogue across rules.
    pub fn new(mut rules: Vec<Rule>, config: EngineConfig) -> Result<Self, RuleError> {
        let mut seen = std::collections::HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.id().to_string()) {
                return Err(RuleError::DuplicateRuleId(rule.id().to_string()));
            }
        }

        let mut catalogue: BTreeMap<&str, &str> = BTreeMap::new();
        for question in rules.iter().flat_map(|r| r.questions()) {
            match catalogue.get(question.id.as_str()) {
                Some(text) if *text != question.text => {
                    return Err(RuleError::ConflictingQuestion {
                        question_id: question.id.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    catalogue.insert(&question.id, &question.text);
                }
            }
        }
        if catalogue.len() > config.max_questions_per_batch {
            return Err(RuleError::TooManyQuestions {
                count: catalogue.len(),
                max: config.max_questions_per_batch,
            });
        }

        rules.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.id().cmp(b.id()))
        });

        Ok(Self { rules, config })
    }

    pub fn from_rule_set(set: &RuleSet, config: EngineConfig) -> Result<Self, RuleError> {
        Self::new(set.compile()?, config)
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn evaluate(&self, ctx: &EvaluationContext<'_>, judgment: Judgment<'_>) -> Evaluation {
        match judgment {
            Judgment::Pending => self.pre_pass(ctx),
            Judgment::Available { answers, meta } => {
                Evaluation::Decided(self.with_answers(ctx, answers, meta))
            }
            Judgment::Unavailable { reason } => {
                Evaluation::Decided(self.without_answers(ctx, reason))
            }
        }
    }

    fn applicable<'s>(&'s self, ctx: &EvaluationContext<'_>) -> impl Iterator<Item = &'s Rule> {
        let content_type = ctx.subject.content_type;
        self.rules.iter().filter(move |r| r.applies_to(content_type))
    }

    fn pre_pass(&self, ctx: &EvaluationContext<'_>) -> Evaluation {
        let mut needed: BTreeMap<String, Question> = BTreeMap::new();

        for rule in self.applicable(ctx) {
            match rule.evaluate(ctx, AnswerView::Unknown) {
                Some(true) if needed.is_empty() => {
                    return Evaluation::Decided(self.matched(rule, ctx, None));
                }
                Some(true) => break,
                Some(false) => {}
                None => {
                    for question in rule.questions() {
                        needed
                            .entry(question.id.clone())
                            .or_insert_with(|| question.clone());
                    }
                }
            }
        }

        if needed.is_empty() {
            Evaluation::Decided(self.default_decision())
        } else {
            debug!(
                subject = %ctx.subject.id,
                questions = needed.len(),
                "Rules need a judgment"
            );
            Evaluation::NeedsJudgment(needed.into_values().collect())
        }
    }

    fn with_answers(
        &self,
        ctx: &EvaluationContext<'_>,
        answers: &AnswerSet,
        meta: &JudgmentMeta,
    ) -> Decision {
        for rule in self.applicable(ctx) {
            let view = rule.answer_view(Some(answers));
            if rule.evaluate(ctx, view) == Some(true) {
                return self.matched(rule, ctx, Some(answers)).with_meta(meta);
            }
        }
        self.default_decision().with_meta(meta)
    }

    fn without_answers(&self, ctx: &EvaluationContext<'_>, reason: &str) -> Decision {
        for rule in self.applicable(ctx) {
            match rule.evaluate(ctx, AnswerView::Unknown) {
                Some(true) => return self.matched(rule, ctx, None),
                Some(false) => {}
                None => {
                    return Decision::new(
                        self.config.no_judgment_action,
                        NO_JUDGMENT_RULE_ID,
                        format!(
                            "AI judgment unavailable ({}); rule {} needs answers",
                            reason,
                            rule.id()
                        ),
                    );
                }
            }
        }
        self.default_decision()
    }

    fn matched(
        &self,
        rule: &Rule,
        ctx: &EvaluationContext<'_>,
        answers: Option<&AnswerSet>,
    ) -> Decision {
        let view = rule.answer_view(answers);
        let mut reasoning = format!("Rule {} matched", rule.id());
        let mut confidence = None;
        if let Some(answers) = answers {
            confidence = rule.answer_confidence(answers);
            let notes = rule.answer_reasoning(answers);
            if !notes.is_empty() {
                reasoning = format!("{}: {}", reasoning, notes.join("; "));
            }
        }
        let message = rule.render_message(ctx, view);

        let mut decision = Decision::new(rule.action(), rule.id(), reasoning);
        decision.confidence = confidence;
        decision.message = (!message.is_empty()).then_some(message);
        decision
    }

    fn default_decision(&self) -> Decision {
        Decision::new(
            self.config.default_action,
            DEFAULT_RULE_ID,
            "No rule matched".to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ContentSignals;
    use crate::types::{
        Answer, AuthorProfile, ContentType, QuestionAnswer, Subject, SubjectId,
    };
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    const RULES: &str = r#"
rules:
  - id: new-account-links
    priority: 100
    condition:
      and:
        - { field: profile.account_age_days, op: lt, value: 7 }
        - { field: profile.karma, op: lt, value: 50 }
        - { field: content.has_url, op: eq, value: true }
    action: flag
    message: "Account is {profile.account_age_days} days old"
  - id: dating-spam
    priority: 50
    condition: { field: ai.dating_intent.answer, op: eq, value: "YES" }
    action: remove
    message: "Looks like dating spam"
    ai:
      confidence_threshold: 80
      questions:
        - id: dating_intent
          text: "Is the author soliciting dates?"
  - id: shouting
    priority: 10
    condition: { field: content.body, op: matches, value: "^[A-Z !]{20,}$" }
    action: comment
"#;

    fn engine() -> RuleEngine {
        let set = RuleSet::from_yaml(RULES).unwrap();
        RuleEngine::from_rule_set(&set, EngineConfig::default()).unwrap()
    }

    fn subject(body: &str) -> Subject {
        Subject {
            id: SubjectId::new("t3_1"),
            content_type: ContentType::Post,
            author: "a".to_string(),
            community: "c".to_string(),
            title: None,
            body: body.to_string(),
            url: None,
            created_at: Utc::now(),
        }
    }

    fn profile(age_days: i64, karma: i64) -> AuthorProfile {
        AuthorProfile {
            username: "a".to_string(),
            created_at: Utc::now() - Duration::days(age_days),
            link_karma: karma,
            comment_karma: 0,
            has_verified_email: true,
            is_verified: false,
            recent_items: vec![],
        }
    }

    fn signals(url_count: usize) -> ContentSignals {
        ContentSignals {
            url_count,
            pii_count: 0,
        }
    }

    fn answers(confidence: u8) -> AnswerSet {
        AnswerSet::new(vec![QuestionAnswer {
            question_id: "dating_intent".to_string(),
            answer: Answer::Yes,
            confidence,
            reasoning: "asks for DMs from singles".to_string(),
        }])
    }

    fn meta() -> JudgmentMeta {
        JudgmentMeta {
            provider: "scripted".to_string(),
            correlation_id: "corr-1".to_string(),
            cost_usd: 0.002,
            latency_ms: 120,
            cache_hit: false,
        }
    }

    #[test]
    fn test_hard_rule_decides_without_judgment() {
        let engine = engine();
        let s = subject("check out my site");
        let p = profile(2, 10);
        let ctx = EvaluationContext::new(&s, &p, Some(30), signals(1));

        match engine.evaluate(&ctx, Judgment::Pending) {
            Evaluation::Decided(d) => {
                assert_eq!(d.action, Action::Flag);
                assert_eq!(d.matched_rule_id, "new-account-links");
                assert_eq!(d.message.as_deref(), Some("Account is 2 days old"));
                assert_eq!(d.cost_usd, 0.0);
            }
            other => panic!("expected decision, got {:?}", other),
        }
    }

    #[test]
    fn test_ai_rule_requests_questions() {
        let engine = engine();
        let s = subject("hello");
        let p = profile(400, 5000);
        let ctx = EvaluationContext::new(&s, &p, Some(90), signals(0));

        match engine.evaluate(&ctx, Judgment::Pending) {
            Evaluation::NeedsJudgment(questions) => {
                assert_eq!(questions.len(), 1);
                assert_eq!(questions[0].id, "dating_intent");
            }
            other => panic!("expected questions, got {:?}", other),
        }
    }

    #[test]
    fn test_answer_above_threshold_applies_rule() {
        let engine = engine();
        let s = subject("hello");
        let p = profile(400, 5000);
        let ctx = EvaluationContext::new(&s, &p, Some(90), signals(0));
        let answers = answers(85);
        let meta = meta();

        let Evaluation::Decided(d) = engine.evaluate(
            &ctx,
            Judgment::Available {
                answers: &answers,
                meta: &meta,
            },
        ) else {
            panic!("expected decision");
        };
        assert_eq!(d.action, Action::Remove);
        assert_eq!(d.matched_rule_id, "dating-spam");
        assert_eq!(d.confidence, Some(85));
        assert!(d.reasoning.contains("asks for DMs"));
        assert_eq!(d.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(d.latency_ms, 120);
    }

    #[test]
    fn test_answer_below_threshold_falls_through() {
        let engine = engine();
        let s = subject("hello");
        let p = profile(400, 5000);
        let ctx = EvaluationContext::new(&s, &p, Some(90), signals(0));
        let answers = answers(70);
        let meta = meta();

        let Evaluation::Decided(d) = engine.evaluate(
            &ctx,
            Judgment::Available {
                answers: &answers,
                meta: &meta,
            },
        ) else {
            panic!("expected decision");
        };
        assert_eq!(d.action, Action::Approve);
        assert_eq!(d.matched_rule_id, DEFAULT_RULE_ID);
        assert_eq!(d.cost_usd, 0.002);
    }

    #[test]
    fn test_unavailable_judgment_never_silently_approves() {
        let engine = engine();
        let s = subject("hello");
        let p = profile(400, 5000);
        let ctx = EvaluationContext::new(&s, &p, Some(90), signals(0));

        let Evaluation::Decided(d) = engine.evaluate(
            &ctx,
            Judgment::Unavailable {
                reason: "budget exceeded",
            },
        ) else {
            panic!("expected decision");
        };
        assert_eq!(d.action, Action::Flag);
        assert_eq!(d.matched_rule_id, NO_JUDGMENT_RULE_ID);
        assert!(d.reasoning.contains("budget exceeded"));
    }

    #[test]
    fn test_lower_rules_skipped_after_match() {
        let engine = engine();
        let s = subject("BUY NOW BUY NOW BUY NOW");
        let p = profile(1, 0);
        let ctx = EvaluationContext::new(&s, &p, None, signals(2));

        let Evaluation::Decided(d) = engine.evaluate(&ctx, Judgment::Pending) else {
            panic!("expected decision");
        };
        assert_eq!(d.matched_rule_id, "new-account-links");
    }

    #[test]
    fn test_questions_only_collected_above_decisive_match() {
        let yaml = r#"
rules:
  - id: hard-top
    priority: 200
    condition: { field: profile.karma, op: lt, value: 0 }
    action: remove
  - id: ai-mid
    priority: 100
    condition: { field: ai.scam.answer, op: eq, value: "YES" }
    action: remove
    ai:
      questions: [{ id: scam, text: "Is this a scam?" }]
  - id: hard-low
    priority: 50
    condition: { field: profile.karma, op: gte, value: 0 }
    action: approve
  - id: ai-bottom
    priority: 10
    condition: { field: ai.nsfw.answer, op: eq, value: "YES" }
    action: remove
    ai:
      questions: [{ id: nsfw, text: "Is this NSFW?" }]
"#;
        let set = RuleSet::from_yaml(yaml).unwrap();
        let engine = RuleEngine::from_rule_set(&set, EngineConfig::default()).unwrap();
        let s = subject("hello");
        let p = profile(100, 10);
        let ctx = EvaluationContext::new(&s, &p, None, signals(0));

        match engine.evaluate(&ctx, Judgment::Pending) {
            Evaluation::NeedsJudgment(qs) => {
                let ids: Vec<_> = qs.iter().map(|q| q.id.as_str()).collect();
                assert_eq!(ids, vec!["scam"]);
            }
            other => panic!("expected questions, got {:?}", other),
        }
    }

    #[test]
    fn test_conflicting_question_texts_rejected() {
        let yaml = r#"
rules:
  - id: a
    condition: { field: ai.q.answer, op: eq, value: "YES" }
    action: flag
    ai: { questions: [{ id: q, text: "one" }] }
  - id: b
    condition: { field: ai.q.answer, op: eq, value: "YES" }
    action: flag
    ai: { questions: [{ id: q, text: "two" }] }
"#;
        let set = RuleSet::from_yaml(yaml).unwrap();
        assert!(matches!(
            RuleEngine::from_rule_set(&set, EngineConfig::default()),
            Err(RuleError::ConflictingQuestion { .. })
        ));
    }

    #[test]
    fn test_too_many_questions_rejected() {
        let yaml = r#"
rules:
  - id: a
    condition: { field: ai.q1.answer, op: eq, value: "YES" }
    action: flag
    ai: { questions: [{ id: q1, text: "1" }, { id: q2, text: "2" }, { id: q3, text: "3" }] }
"#;
        let set = RuleSet::from_yaml(yaml).unwrap();
        let config = EngineConfig {
            max_questions_per_batch: 2,
            ..EngineConfig::default()
        };
        assert!(matches!(
            RuleEngine::from_rule_set(&set, config),
            Err(RuleError::TooManyQuestions { count: 3, max: 2 })
        ));
    }

    #[test]
    fn test_comment_rules_do_not_apply_to_posts() {
        let yaml = r#"
rules:
  - id: comments-only
    applies_to: comments
    condition: { field: profile.karma, op: gte, value: 0 }
    action: remove
"#;
        let set = RuleSet::from_yaml(yaml).unwrap();
        let engine = RuleEngine::from_rule_set(&set, EngineConfig::default()).unwrap();
        let s = subject("x");
        let p = profile(5, 5);
        let ctx = EvaluationContext::new(&s, &p, None, signals(0));
        let Evaluation::Decided(d) = engine.evaluate(&ctx, Judgment::Pending) else {
            panic!("expected decision");
        };
        assert!(d.is_default());
    }

    fn tie_rules(order: &[usize]) -> RuleSet {
        let defs = [
            ("b-low-karma", 10, "lt", 100, "flag"),
            ("a-low-karma", 10, "lt", 100, "remove"),
            ("c-any", 5, "gte", 0, "comment"),
            ("d-high", 20, "gt", 1000, "remove"),
        ];
        let rules = order
            .iter()
            .map(|&i| {
                let (id, priority, op, value, action) = defs[i];
                format!(
                    "  - {{ id: {id}, priority: {priority}, action: {action}, condition: {{ field: profile.karma, op: {op}, value: {value} }} }}\n"
                )
            })
            .collect::<String>();
        RuleSet::from_yaml(&format!("rules:\n{}", rules)).unwrap()
    }

    proptest! {
        #[test]
        fn prop_evaluation_is_deterministic(
            karma in -50i64..2000,
            age in 0i64..1000,
            order in Just(vec![0usize, 1, 2, 3]).prop_shuffle(),
        ) {
            let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
            let s = subject("text");
            let mut p = profile(0, karma);
            p.created_at = now - Duration::days(age);
            let ctx = EvaluationContext::new(&s, &p, None, signals(0)).at(now);

            let reference = RuleEngine::from_rule_set(&tie_rules(&[0, 1, 2, 3]), EngineConfig::default()).unwrap();
            let shuffled = RuleEngine::from_rule_set(&tie_rules(&order), EngineConfig::default()).unwrap();

            let first = reference.evaluate(&ctx, Judgment::Pending);
            let again = reference.evaluate(&ctx, Judgment::Pending);
            let other = shuffled.evaluate(&ctx, Judgment::Pending);
            prop_assert_eq!(&first, &again);
            prop_assert_eq!(&first, &other);

            // Equal priorities resolve by id
            if let Evaluation::Decided(d) = first {
                if karma < 100 {
                    prop_assert_eq!(d.matched_rule_id, "a-low-karma");
                }
            }
        }
    }
}
