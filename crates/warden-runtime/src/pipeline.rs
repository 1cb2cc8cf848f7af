//! The moderation pipeline: rule engine plus orchestrator.
//!
//! Hard rules are settled before anything is paid for. Only when the
//! engine's pre-pass asks for answers does the pipeline call the
//! orchestrator, and every analysis failure becomes an unavailable judgment
//! so the engine applies its no-judgment action instead of approving.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use warden_core::{
    Action, ContentSanitizer, Decision, Evaluation, EvaluationContext, Judgment, RuleEngine,
    Subject,
};

use crate::clock::Clock;
use crate::collaborators::{ActionExecutor, CollaboratorError, ProfileSource, TrustScoreSource};
use crate::orchestrator::{AnalysisInput, AnalysisOrchestrator};
use crate::prompts::AuthorContext;

const DEFAULT_CONCURRENCY: usize = 8;

/// Why a subject got no decision.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Profile lookup for {author} failed: {source}")]
    Profile {
        author: String,
        #[source]
        source: CollaboratorError,
    },

    #[error("Executing {action} on {subject} failed: {source}")]
    Execution {
        subject: String,
        action: Action,
        #[source]
        source: CollaboratorError,
    },

    #[error("Rules for {subject} still need answers after judgment")]
    Unresolved { subject: String },
}

/// Decides subjects end to end.
pub struct ModerationPipeline {
    engine: RuleEngine,
    orchestrator: Arc<AnalysisOrchestrator>,
    profiles: Arc<dyn ProfileSource>,
    trust: Arc<dyn TrustScoreSource>,
    sanitizer: Arc<dyn ContentSanitizer>,
    clock: Arc<dyn Clock>,
    concurrency: usize,
}

impl ModerationPipeline {
    pub fn new(
        engine: RuleEngine,
        orchestrator: Arc<AnalysisOrchestrator>,
        profiles: Arc<dyn ProfileSource>,
        trust: Arc<dyn TrustScoreSource>,
        sanitizer: Arc<dyn ContentSanitizer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            orchestrator,
            profiles,
            trust,
            sanitizer,
            clock,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Bound for [`moderate_many`](Self::moderate_many).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    pub fn orchestrator(&self) -> &AnalysisOrchestrator {
        &self.orchestrator
    }

    pub async fn moderate(&self, subject: &Subject) -> Result<Decision, PipelineError> {
        let profile = self
            .profiles
            .profile(&subject.author)
            .await
            .map_err(|source| PipelineError::Profile {
                author: subject.author.clone(),
                source,
            })?;
        let trust_score = match self.trust.trust_score(&subject.author, &subject.community).await {
            Ok(score) => score.map(|s| s.min(100)),
            Err(e) => {
                warn!(subject = %subject.id, error = %e, "Trust score unavailable");
                None
            }
        };

        let now = self.clock.now();
        let ctx = EvaluationContext::with_sanitizer(
            subject,
            &profile,
            trust_score,
            self.sanitizer.as_ref(),
        )
        .at(now);

        let questions = match self.engine.evaluate(&ctx, Judgment::Pending) {
            Evaluation::Decided(decision) => {
                debug!(
                    subject = %subject.id,
                    rule = %decision.matched_rule_id,
                    "Decided without judgment"
                );
                return Ok(decision);
            }
            Evaluation::NeedsJudgment(questions) => questions,
        };

        let input = AnalysisInput::new(subject.clone(), AuthorContext::from_profile(&profile, now))
            .with_questions(questions)
            .with_trust_score(trust_score);

        let evaluation = match self.orchestrator.analyze_accounted(input).await {
            Ok(result) => {
                let answers = result.answers();
                let meta = result.meta();
                self.engine.evaluate(
                    &ctx,
                    Judgment::Available {
                        answers: &answers,
                        meta: &meta,
                    },
                )
            }
            Err(failure) => {
                let e = &failure.error;
                let reason = format!("{}: {}", e.kind(), e);
                warn!(
                    subject = %subject.id,
                    correlation_id = %failure.correlation_id,
                    charged_usd = failure.cost_usd,
                    error = %e,
                    "No judgment available"
                );
                match self
                    .engine
                    .evaluate(&ctx, Judgment::Unavailable { reason: &reason })
                {
                    Evaluation::Decided(decision) => Evaluation::Decided(Decision {
                        cost_usd: failure.cost_usd,
                        latency_ms: failure.latency_ms,
                        correlation_id: Some(failure.correlation_id),
                        ..decision
                    }),
                    pending => pending,
                }
            }
        };

        match evaluation {
            Evaluation::Decided(decision) => {
                info!(
                    subject = %subject.id,
                    action = %decision.action,
                    rule = %decision.matched_rule_id,
                    cost_usd = decision.cost_usd,
                    cache_hit = decision.cache_hit,
                    "Subject decided"
                );
                Ok(decision)
            }
            Evaluation::NeedsJudgment(_) => Err(PipelineError::Unresolved {
                subject: subject.id.to_string(),
            }),
        }
    }

    /// Decide, then hand the decision to `executor`.
    pub async fn moderate_and_execute(
        &self,
        subject: &Subject,
        executor: &dyn ActionExecutor,
    ) -> Result<Decision, PipelineError> {
        let decision = self.moderate(subject).await?;
        executor
            .execute(subject, &decision)
            .await
            .map_err(|source| PipelineError::Execution {
                subject: subject.id.to_string(),
                action: decision.action,
                source,
            })?;
        Ok(decision)
    }

    /// Decide independent subjects concurrently. Results are in input order.
    pub async fn moderate_many(&self, subjects: &[Subject]) -> Vec<Result<Decision, PipelineError>> {
        stream::iter(subjects)
            .map(|subject| self.moderate(subject))
            .buffered(self.concurrency)
            .collect()
            .await
    }
}

impl std::fmt::Debug for ModerationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModerationPipeline")
            .field("rules", &self.engine.rules().len())
            .field("orchestrator", &self.orchestrator)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collaborators::NoTrustScores;
    use crate::config::RuntimeConfig;
    use crate::orchestrator::tests::{answers_json, Reply, Scripted};
    use crate::providers::JudgmentProvider;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use warden_core::{AuthorProfile, ContentType, PatternSanitizer, RuleSet, SubjectId};

    const RULES: &str = r#"
rules:
  - id: new-account-links
    priority: 100
    condition:
      and:
        - { field: profile.account_age_days, op: lt, value: 7 }
        - { field: content.has_url, op: eq, value: true }
    action: flag
  - id: dating-spam
    priority: 50
    condition: { field: ai.dating_intent.answer, op: eq, value: "YES" }
    action: remove
    ai:
      confidence_threshold: 80
      questions:
        - { id: dating_intent, text: "Is the author looking for a date?" }
"#;

    struct Profiles(Option<AuthorProfile>);

    #[async_trait]
    impl ProfileSource for Profiles {
        async fn profile(&self, username: &str) -> Result<AuthorProfile, CollaboratorError> {
            self.0
                .clone()
                .ok_or_else(|| CollaboratorError::NotFound(username.to_string()))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, Action)>>);

    #[async_trait]
    impl ActionExecutor for Recorder {
        async fn execute(&self, subject: &Subject, decision: &Decision) -> Result<(), CollaboratorError> {
            self.0.lock().push((subject.id.to_string(), decision.action));
            Ok(())
        }
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn profile(age_days: i64) -> AuthorProfile {
        AuthorProfile {
            username: "someone".to_string(),
            created_at: now() - chrono::Duration::days(age_days),
            link_karma: 10,
            comment_karma: 0,
            has_verified_email: false,
            is_verified: false,
            recent_items: vec![],
        }
    }

    fn subject(id: &str, url: Option<&str>) -> Subject {
        Subject {
            id: SubjectId::new(id),
            content_type: ContentType::Post,
            author: "someone".to_string(),
            community: "askwarden".to_string(),
            title: Some("hi".to_string()),
            body: "looking for company".to_string(),
            url: url.map(String::from),
            created_at: now(),
        }
    }

    fn pipeline(provider: Arc<Scripted>, profile: Option<AuthorProfile>) -> ModerationPipeline {
        let config = RuntimeConfig::default();
        let clock = Arc::new(ManualClock::new(now()));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let sanitizer: Arc<dyn ContentSanitizer> = Arc::new(PatternSanitizer::new());
        let providers: Vec<Arc<dyn JudgmentProvider>> = vec![provider];
        let orchestrator = Arc::new(AnalysisOrchestrator::new(
            &config,
            providers,
            store,
            clock.clone(),
            sanitizer.clone(),
        ));
        let rules = RuleSet::from_yaml(RULES).unwrap();
        let engine = RuleEngine::from_rule_set(&rules, config.engine_config()).unwrap();
        ModerationPipeline::new(
            engine,
            orchestrator,
            Arc::new(Profiles(profile)),
            Arc::new(NoTrustScores),
            sanitizer,
            clock,
        )
    }

    #[tokio::test]
    async fn test_hard_rule_skips_judgment() {
        let provider = Arc::new(Scripted::new("primary", Reply::Transient));
        let p = pipeline(provider.clone(), Some(profile(2)));

        let decision = p.moderate(&subject("t3_a", Some("https://x.test"))).await.unwrap();
        assert_eq!(decision.action, Action::Flag);
        assert_eq!(decision.matched_rule_id, "new-account-links");
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_profile_failure_is_an_error() {
        let provider = Arc::new(Scripted::new("primary", Reply::Transient));
        let p = pipeline(provider, None);
        assert!(matches!(
            p.moderate(&subject("t3_a", None)).await,
            Err(PipelineError::Profile { .. })
        ));
    }

    #[tokio::test]
    async fn test_decision_is_executed() {
        let reply = Reply::Text(answers_json(&[("dating_intent", "YES", 90)]));
        let provider = Arc::new(Scripted::new("primary", reply));
        let p = pipeline(provider, Some(profile(30)));
        let executor = Recorder::default();

        let decision = p
            .moderate_and_execute(&subject("t3_a", None), &executor)
            .await
            .unwrap();
        assert_eq!(decision.action, Action::Remove);
        assert_eq!(decision.confidence, Some(90));
        assert!(decision.correlation_id.is_some());
        assert_eq!(*executor.0.lock(), vec![("t3_a".to_string(), Action::Remove)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_analysis_falls_back_to_review() {
        let provider = Arc::new(Scripted::new("primary", Reply::Transient));
        let p = pipeline(provider, Some(profile(30)));

        let decision = p.moderate(&subject("t3_a", None)).await.unwrap();
        assert_eq!(decision.action, Action::Flag);
        assert_eq!(decision.matched_rule_id, warden_core::NO_JUDGMENT_RULE_ID);
        assert!(decision.reasoning.contains("provider_error"));

        // The failed chain was charged its estimate, and the record says so
        let spent = p.orchestrator().costs().daily_spend().await.unwrap();
        assert!(decision.cost_usd > 0.0);
        assert!((decision.cost_usd - spent).abs() < 1e-9);
        assert!(decision.latency_ms >= 600);
        assert!(decision.correlation_id.is_some());
    }

    #[tokio::test]
    async fn test_many_keeps_input_order() {
        let reply = Reply::Text(answers_json(&[("dating_intent", "NO", 95)]));
        let provider = Arc::new(Scripted::new("primary", reply));
        let p = pipeline(provider, Some(profile(2))).with_concurrency(2);

        let subjects = vec![
            subject("t3_a", Some("https://x.test")),
            subject("t3_b", None),
            subject("t3_c", Some("https://y.test")),
        ];
        let rules: Vec<_> = p
            .moderate_many(&subjects)
            .await
            .into_iter()
            .map(|r| r.unwrap().matched_rule_id)
            .collect();
        assert_eq!(rules, vec!["new-account-links", "default", "new-account-links"]);
    }
}
