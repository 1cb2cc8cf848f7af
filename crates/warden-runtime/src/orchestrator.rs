//! Analysis orchestrator.
//!
//! One `analyze` call turns a subject plus a question set into a validated
//! judgment, or explains why there is none. The flow:
//!
//! 1. Serve a live cache entry if there is one (no spend, no lock)
//! 2. Build the request and check the budget before anything is paid for
//! 3. Take the coalescing lock, or wait for whoever holds it
//! 4. As the holder: select a provider, reserve the estimate, and run the
//!    call under retry, circuit breaker and timeout, validating inside the
//!    breaker so schema violations count as provider failures
//! 5. Fail over once to a different provider for failover-eligible errors
//! 6. Settle the reservation, write the cache, then release the lock
//!
//! The cache write precedes the lock release, so a caller arriving after
//! the release always sees the result instead of starting a second call.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use warden_core::{AnswerSet, ContentSanitizer, JudgmentMeta, Question, Subject};

use crate::cache::{CacheKey, DifferentialCache};
use crate::clock::Clock;
use crate::coalescer::{LockStatus, RequestCoalescer, WaitOutcome};
use crate::config::{duration_str, RuntimeConfig};
use crate::error::AnalysisError;
use crate::prompts::{AuthorContext, JudgmentRequest, RequestBuilder};
use crate::providers::{JudgmentProvider, ProviderError, ProviderRegistry, TokenUsage};
use crate::resilience::{
    CircuitBreaker, CostRecord, CostTracker, ProviderSelector, RetryPolicy, Settlement,
};
use crate::store::StateStore;
use crate::validation::{JudgmentPayload, ResponseError, ResponseValidator};

/// A validated judgment with its provenance. This is what gets cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub payload: JudgmentPayload,

    pub provider: String,

    pub model: String,

    /// Summed over every attempt on the answering provider
    pub usage: TokenUsage,

    pub cost_usd: f64,

    pub latency_ms: u64,

    /// Id of the call that produced the result
    pub correlation_id: String,

    #[serde(with = "duration_str")]
    pub cache_ttl: Duration,

    pub prompt_version: String,

    pub fingerprint: String,

    pub created_at: DateTime<Utc>,

    /// Served from the cache or from a coalesced caller's result
    #[serde(default)]
    pub cache_hit: bool,
}

impl AnalysisResult {
    /// Answers keyed by question id. Empty for a risk assessment.
    pub fn answers(&self) -> AnswerSet {
        match &self.payload {
            JudgmentPayload::Answers(answers) => AnswerSet::new(answers.iter().cloned()),
            JudgmentPayload::Risk(_) => AnswerSet::default(),
        }
    }

    pub fn meta(&self) -> JudgmentMeta {
        JudgmentMeta {
            provider: self.provider.clone(),
            correlation_id: self.correlation_id.clone(),
            cost_usd: self.cost_usd,
            latency_ms: self.latency_ms,
            cache_hit: self.cache_hit,
        }
    }
}

/// What to analyze.
#[derive(Debug, Clone)]
pub struct AnalysisInput {
    pub subject: Subject,
    pub author: AuthorContext,
    /// Only used to pick the cache TTL
    pub trust_score: Option<u8>,
    /// Empty asks for a full risk assessment
    pub questions: Vec<Question>,
    /// Generated when absent
    pub correlation_id: Option<String>,
}

impl AnalysisInput {
    pub fn new(subject: Subject, author: AuthorContext) -> Self {
        Self {
            subject,
            author,
            trust_score: None,
            questions: Vec::new(),
            correlation_id: None,
        }
    }

    pub fn with_questions(mut self, questions: Vec<Question>) -> Self {
        self.questions = questions;
        self
    }

    pub fn with_trust_score(mut self, score: Option<u8>) -> Self {
        self.trust_score = score;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// An analysis that ended without a judgment.
#[derive(Debug, Clone)]
pub struct AnalysisFailure {
    pub error: AnalysisError,
    pub correlation_id: String,
    /// Estimates charged for calls that were issued and then failed
    pub cost_usd: f64,
    pub latency_ms: u64,
}

/// Coordinates one judgment per subject key across every handler sharing
/// the same state store.
pub struct AnalysisOrchestrator {
    selector: ProviderSelector,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    coalescer: RequestCoalescer,
    costs: CostTracker,
    cache: Arc<DifferentialCache>,
    builder: RequestBuilder,
    clock: Arc<dyn Clock>,
}

impl AnalysisOrchestrator {
    /// Wire every component over one store. `providers` is in priority order.
    pub fn new(
        config: &RuntimeConfig,
        providers: Vec<Arc<dyn JudgmentProvider>>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        sanitizer: Arc<dyn ContentSanitizer>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            store.clone(),
            clock.clone(),
            config.circuit_breaker.clone(),
        ));
        let cache = Arc::new(DifferentialCache::new(
            store.clone(),
            clock.clone(),
            &config.cache,
        ));
        Self {
            selector: ProviderSelector::new(providers, breaker.clone(), config.health_cache_ttl),
            breaker,
            retry: RetryPolicy::new(config.retry.clone()),
            coalescer: RequestCoalescer::new(
                store.clone(),
                cache.clone(),
                clock.clone(),
                config.coalescing.clone(),
            ),
            costs: CostTracker::new(store, clock.clone(), config.budget.clone()),
            cache,
            builder: RequestBuilder::new(sanitizer, config.max_questions_per_batch),
            clock,
        }
    }

    /// Build the providers named in `config` from `registry`.
    pub fn from_config(
        config: &RuntimeConfig,
        registry: &ProviderRegistry,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        sanitizer: Arc<dyn ContentSanitizer>,
    ) -> Result<Self, ProviderError> {
        let providers = registry.create_all(&config.providers)?;
        Ok(Self::new(config, providers, store, clock, sanitizer))
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn costs(&self) -> &CostTracker {
        &self.costs
    }

    pub fn cache(&self) -> &DifferentialCache {
        &self.cache
    }

    pub fn coalescer(&self) -> &RequestCoalescer {
        &self.coalescer
    }

    pub fn builder(&self) -> &RequestBuilder {
        &self.builder
    }

    /// Analyze `input`, calling a provider at most once per key at a time.
    pub async fn analyze(&self, input: AnalysisInput) -> Result<AnalysisResult, AnalysisError> {
        self.analyze_accounted(input)
            .await
            .map_err(|failure| failure.error)
    }

    /// Like [`analyze`](Self::analyze), but a failure also reports what the
    /// failed attempts were charged and how long they took.
    pub async fn analyze_accounted(
        &self,
        input: AnalysisInput,
    ) -> Result<AnalysisResult, AnalysisFailure> {
        let correlation_id = input
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let started = Instant::now();
        let charged = Mutex::new(0.0);

        let outcome = self.run(&input, &correlation_id, &charged).await;
        outcome.map_err(|error| AnalysisFailure {
            error,
            correlation_id,
            cost_usd: charged.into_inner(),
            latency_ms: elapsed_ms(started),
        })
    }

    async fn run(
        &self,
        input: &AnalysisInput,
        correlation_id: &str,
        charged: &Mutex<f64>,
    ) -> Result<AnalysisResult, AnalysisError> {
        let questions = self.builder.normalize_questions(&input.questions)?;
        let key = CacheKey::for_questions(&input.subject.id, questions.iter().map(|q| q.id.as_str()));

        if let Some(hit) = self.cache.get(&key).await {
            return Ok(self.served(hit, input, correlation_id).await);
        }

        let request = self
            .builder
            .build(&input.subject, &input.author, &questions, correlation_id)?;
        self.check_budget(&request).await?;

        let max_wait = self.coalescer.config().max_wait;
        let deadline = Instant::now() + max_wait;
        loop {
            let status = self.coalescer.acquire_lock(&key, correlation_id).await;
            match status {
                LockStatus::Acquired => {
                    let work = self.analyze_as_holder(&key, &request, input, charged);
                    let outcome = self.coalescer.hold_while(&key, correlation_id, work).await;
                    self.coalescer.release_lock(&key, correlation_id).await;
                    return outcome;
                }
                LockStatus::Unguarded => {
                    return self.analyze_as_holder(&key, &request, input, charged).await;
                }
                LockStatus::Held => {}
            }

            let left = deadline.saturating_duration_since(Instant::now());
            match self.coalescer.wait_for_result(&key, left).await {
                WaitOutcome::Ready(result) => {
                    return Ok(self.served(result, input, correlation_id).await)
                }
                WaitOutcome::Released => {
                    debug!(key = %key, "Lock released without a result, retrying acquisition");
                }
                WaitOutcome::TimedOut => {
                    warn!(
                        key = %key,
                        correlation_id = %correlation_id,
                        waited = ?max_wait,
                        "Timed out waiting for in-flight analysis"
                    );
                    return Err(AnalysisError::LockTimeout {
                        key: key.to_string(),
                        waited: max_wait,
                    });
                }
            }
        }
    }

    /// Deny before anything is paid for. Priced on the first-priority
    /// provider.
    async fn check_budget(&self, request: &JudgmentRequest) -> Result<(), AnalysisError> {
        let Some(primary) = self.selector.providers().first() else {
            return Err(AnalysisError::NoProviderAvailable);
        };
        let estimate_usd = self.costs.estimate(primary.as_ref(), request);
        if self.costs.can_afford(estimate_usd).await {
            return Ok(());
        }
        let remaining_usd = self.costs.remaining().await;
        warn!(
            subject = %request.subject_id,
            correlation_id = %request.correlation_id,
            estimate_usd,
            remaining_usd,
            "Budget exceeded, no judgment available"
        );
        Err(AnalysisError::BudgetExceeded {
            estimate_usd,
            remaining_usd,
        })
    }

    async fn analyze_as_holder(
        &self,
        key: &CacheKey,
        request: &JudgmentRequest,
        input: &AnalysisInput,
        charged: &Mutex<f64>,
    ) -> Result<AnalysisResult, AnalysisError> {
        // Someone may have finished between our miss and the lock
        if let Some(hit) = self.cache.get(key).await {
            return Ok(self.served(hit, input, &request.correlation_id).await);
        }

        let primary = self.selector.select_provider(&[]).await?;
        let result = match self.attempt(&primary, request, input.trust_score, charged).await {
            Ok(result) => result,
            Err(e) if e.allows_failover() => {
                let Ok(fallback) = self.selector.select_provider(&[primary.name()]).await else {
                    return Err(e);
                };
                warn!(
                    from = %primary.name(),
                    to = %fallback.name(),
                    error = %e,
                    correlation_id = %request.correlation_id,
                    "Failing over to next provider"
                );
                self.attempt(&fallback, request, input.trust_score, charged).await?
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = self.cache.put(key, &result).await {
            warn!(key = %key, error = %e, "Failed to cache analysis result");
        }
        Ok(result)
    }

    /// One provider's attempt chain: reserve, retry around breaker around
    /// call plus validation, settle.
    async fn attempt(
        &self,
        provider: &Arc<dyn JudgmentProvider>,
        request: &JudgmentRequest,
        trust_score: Option<u8>,
        charged: &Mutex<f64>,
    ) -> Result<AnalysisResult, AnalysisError> {
        let name = provider.name();
        let estimate = self.costs.estimate(provider.as_ref(), request);
        let reservation = self.costs.reserve(estimate).await?;

        let validator = ResponseValidator::for_request(request);
        let usage = Mutex::new(TokenUsage::default());
        let issued = AtomicBool::new(false);
        let started = Instant::now();

        let last_failure: Mutex<Option<AnalysisError>> = Mutex::new(None);

        let outcome = {
            let (provider, validator, usage, issued, last_failure) =
                (provider.as_ref(), &validator, &usage, &issued, &last_failure);
            self.retry
                .run(name, move || async move {
                    let result = self.breaker.execute(name, move || async move {
                        issued.store(true, Ordering::SeqCst);
                        let response = provider
                            .complete(request)
                            .await
                            .map_err(|e| AnalysisError::from_provider(name, e))?;
                        {
                            let mut total = usage.lock();
                            total.input_tokens =
                                total.input_tokens.saturating_add(response.usage.input_tokens);
                            total.output_tokens =
                                total.output_tokens.saturating_add(response.usage.output_tokens);
                        }
                        let payload = validator
                            .validate(&response.content)
                            .map_err(|e| rejected(name, e))?;
                        Ok::<_, AnalysisError>((payload, response.model))
                    })
                    .await;
                    if let Err(e) = &result {
                        if e.is_provider_failure() {
                            *last_failure.lock() = Some(e.clone());
                        }
                    }
                    result
                })
                .await
        };

        // A circuit that opened partway through this chain reports the
        // failure that opened it, so failover still applies
        let outcome = match (outcome, last_failure.into_inner()) {
            (Err(AnalysisError::CircuitOpen { .. }), Some(opened_by))
                if issued.load(Ordering::SeqCst) =>
            {
                Err(opened_by)
            }
            (outcome, _) => outcome,
        };

        let usage = usage.into_inner();
        let latency_ms = elapsed_ms(started);
        let record = |cost_usd: f64| CostRecord {
            timestamp: self.clock.now(),
            provider: name.to_string(),
            subject_id: request.subject_id.to_string(),
            correlation_id: request.correlation_id.clone(),
            usage,
            cost_usd,
            cache_hit: false,
            estimated: false,
        };

        match outcome {
            Ok((payload, model)) => {
                let cost_usd = provider.compute_cost(&usage);
                self.costs
                    .settle(reservation, Settlement::Completed(record(cost_usd)))
                    .await;

                let cache_ttl = self
                    .cache
                    .policy()
                    .select(trust_score, payload.is_high_risk());
                info!(
                    provider = %name,
                    subject = %request.subject_id,
                    correlation_id = %request.correlation_id,
                    cost_usd,
                    latency_ms,
                    "Judgment obtained"
                );
                Ok(AnalysisResult {
                    payload,
                    provider: name.to_string(),
                    model,
                    usage,
                    cost_usd,
                    latency_ms,
                    correlation_id: request.correlation_id.clone(),
                    cache_ttl,
                    prompt_version: request.prompt_version.to_string(),
                    fingerprint: request.fingerprint.clone(),
                    created_at: self.clock.now(),
                    cache_hit: false,
                })
            }
            Err(e) => {
                let settlement = if issued.load(Ordering::SeqCst) {
                    *charged.lock() += reservation.estimate_usd();
                    Settlement::Failed(record(0.0))
                } else {
                    Settlement::NotRun
                };
                warn!(
                    provider = %name,
                    subject = %request.subject_id,
                    correlation_id = %request.correlation_id,
                    error = %e,
                    "Provider attempt failed"
                );
                self.costs.settle(reservation, settlement).await;
                Err(e)
            }
        }
    }

    /// A result this caller did not pay for. Logged as a zero-cost row.
    async fn served(
        &self,
        mut result: AnalysisResult,
        input: &AnalysisInput,
        correlation_id: &str,
    ) -> AnalysisResult {
        result.cache_hit = true;
        debug!(
            subject = %input.subject.id,
            correlation_id = %correlation_id,
            source = %result.correlation_id,
            "Serving cached judgment"
        );
        self.costs
            .record_cost(CostRecord {
                timestamp: self.clock.now(),
                provider: result.provider.clone(),
                subject_id: input.subject.id.to_string(),
                correlation_id: correlation_id.to_string(),
                usage: TokenUsage::default(),
                cost_usd: 0.0,
                cache_hit: true,
                estimated: false,
            })
            .await;
        result
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn rejected(provider: &str, err: ResponseError) -> AnalysisError {
    let provider = provider.to_string();
    match err {
        ResponseError::Malformed(message) => AnalysisError::InvalidResponse { provider, message },
        ResponseError::Invalid(source) => AnalysisError::Validation { provider, source },
    }
}

impl std::fmt::Debug for AnalysisOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisOrchestrator")
            .field("selector", &self.selector)
            .field("costs", &self.costs)
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::testing::TokioClock;
    use crate::clock::ManualClock;
    use crate::providers::{Pricing, ProviderResponse};
    use crate::resilience::{BudgetConfig, CircuitBreakerConfig, CircuitState};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use warden_core::{
        Answer, AuthorProfile, ContentType, PatternSanitizer, QuestionAnswer, SubjectId,
    };

    pub(crate) fn sample_result() -> AnalysisResult {
        AnalysisResult {
            payload: JudgmentPayload::Answers(vec![QuestionAnswer {
                question_id: "dating_intent".to_string(),
                answer: Answer::Yes,
                confidence: 85,
                reasoning: "asks to meet".to_string(),
            }]),
            provider: "primary".to_string(),
            model: "scripted-1".to_string(),
            usage: TokenUsage {
                input_tokens: 1000,
                output_tokens: 200,
            },
            cost_usd: 0.006,
            latency_ms: 840,
            correlation_id: "corr-1".to_string(),
            cache_ttl: Duration::from_secs(3600),
            prompt_version: crate::prompts::PROMPT_VERSION.to_string(),
            fingerprint: "abc123".to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap(),
            cache_hit: false,
        }
    }

    #[derive(Clone)]
    pub(crate) enum Reply {
        Text(String),
        Transient,
        /// Never answers within the breaker timeout
        Hang,
    }

    pub(crate) struct Scripted {
        name: &'static str,
        script: Mutex<VecDeque<Reply>>,
        otherwise: Reply,
        delay: Duration,
        pub(crate) calls: AtomicUsize,
    }

    impl Scripted {
        pub(crate) fn new(name: &'static str, otherwise: Reply) -> Self {
            Self {
                name,
                script: Mutex::new(VecDeque::new()),
                otherwise,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn then(self, reply: Reply) -> Self {
            self.script.lock().push_back(reply);
            self
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JudgmentProvider for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn complete(&self, _: &JudgmentRequest) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let reply = self
                .script
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.otherwise.clone());
            match reply {
                Reply::Text(content) => Ok(ProviderResponse {
                    content,
                    usage: TokenUsage {
                        input_tokens: 1000,
                        output_tokens: 200,
                    },
                    model: "scripted-1".to_string(),
                }),
                Reply::Transient => Err(ProviderError::ApiError {
                    status: 503,
                    message: "overloaded".to_string(),
                }),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(ProviderError::HttpError("hung".to_string()))
                }
            }
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn pricing(&self) -> Pricing {
            Pricing::default()
        }

        fn max_output_tokens(&self) -> u32 {
            500
        }
    }

    pub(crate) fn answers_json(answers: &[(&str, &str, u8)]) -> String {
        let items: Vec<_> = answers
            .iter()
            .map(|(id, answer, confidence)| {
                serde_json::json!({
                    "question_id": id,
                    "answer": answer,
                    "confidence": confidence,
                    "reasoning": "scripted",
                })
            })
            .collect();
        serde_json::json!({ "answers": items }).to_string()
    }

    fn subject() -> Subject {
        Subject {
            id: SubjectId::new("t3_orch"),
            content_type: ContentType::Post,
            author: "someone".to_string(),
            community: "askwarden".to_string(),
            title: Some("hello".to_string()),
            body: "anyone want to meet up tonight?".to_string(),
            url: None,
            created_at: Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap(),
        }
    }

    fn input() -> AnalysisInput {
        let profile = AuthorProfile {
            username: "someone".to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            link_karma: 10,
            comment_karma: 5,
            has_verified_email: true,
            is_verified: false,
            recent_items: vec![],
        };
        let now = Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap();
        AnalysisInput::new(subject(), AuthorContext::from_profile(&profile, now))
            .with_questions(vec![Question::new("dating_intent", "Is the author seeking a date?")])
            .with_trust_score(Some(50))
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn orchestrator(
        providers: Vec<Arc<dyn JudgmentProvider>>,
        tweak: impl FnOnce(&mut RuntimeConfig),
    ) -> AnalysisOrchestrator {
        orchestrator_on(Arc::new(ManualClock::new(start())), providers, tweak)
    }

    fn orchestrator_on(
        clock: Arc<dyn Clock>,
        providers: Vec<Arc<dyn JudgmentProvider>>,
        tweak: impl FnOnce(&mut RuntimeConfig),
    ) -> AnalysisOrchestrator {
        let mut config = RuntimeConfig::default();
        config.retry.jitter = false;
        tweak(&mut config);
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        AnalysisOrchestrator::new(
            &config,
            providers,
            store,
            clock,
            Arc::new(PatternSanitizer::new()),
        )
    }

    fn good() -> Reply {
        Reply::Text(answers_json(&[("dating_intent", "YES", 85)]))
    }

    #[tokio::test]
    async fn test_second_call_served_from_cache() {
        let primary = Arc::new(Scripted::new("primary", good()));
        let orch = orchestrator(vec![primary.clone()], |_| {});

        let first = orch.analyze(input().with_correlation_id("c1")).await.unwrap();
        assert!(!first.cache_hit);
        assert_eq!(first.provider, "primary");
        assert!((first.cost_usd - 0.006).abs() < 1e-9);
        assert_eq!(first.cache_ttl, Duration::from_secs(6 * 3600));
        assert_eq!(first.answers().get("dating_intent").unwrap().confidence, 85);

        let second = orch.analyze(input().with_correlation_id("c2")).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.correlation_id, "c1");
        assert_eq!(primary.calls(), 1);

        let ledger = orch.costs().ledger("2026-05-04").await.unwrap();
        assert_eq!(ledger.len(), 2);
        assert!(ledger[1].cache_hit);
        assert_eq!(ledger[1].correlation_id, "c2");
        assert!((orch.costs().daily_spend().await.unwrap() - 0.006).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_different_question_sets_do_not_collide() {
        let primary = Arc::new(
            Scripted::new("primary", good())
                .then(good())
                .then(Reply::Text(answers_json(&[("spam", "NO", 90)]))),
        );
        let orch = orchestrator(vec![primary.clone()], |_| {});

        orch.analyze(input()).await.unwrap();
        let other = orch
            .analyze(input().with_questions(vec![Question::new("spam", "Is this spam?")]))
            .await
            .unwrap();
        assert!(!other.cache_hit);
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_response_fails_over_without_retry() {
        let primary = Arc::new(Scripted::new("primary", Reply::Text("I think yes".into())));
        let backup = Arc::new(Scripted::new("backup", good()));
        let orch = orchestrator(vec![primary.clone(), backup.clone()], |_| {});

        let result = orch.analyze(input()).await.unwrap();
        assert_eq!(result.provider, "backup");
        assert_eq!(primary.calls(), 1);
        assert_eq!(backup.calls(), 1);
    }

    #[tokio::test]
    async fn test_schema_violation_fails_over() {
        let wrong_id = Reply::Text(answers_json(&[("other", "YES", 85)]));
        let primary = Arc::new(Scripted::new("primary", wrong_id));
        let backup = Arc::new(Scripted::new("backup", good()));
        let orch = orchestrator(vec![primary.clone(), backup.clone()], |_| {});

        assert_eq!(orch.analyze(input()).await.unwrap().provider, "backup");
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retry_then_fail_over() {
        let primary = Arc::new(Scripted::new("primary", Reply::Transient));
        let backup = Arc::new(Scripted::new("backup", good()));
        let orch = orchestrator(vec![primary.clone(), backup.clone()], |_| {});

        let result = orch.analyze(input()).await.unwrap();
        assert_eq!(result.provider, "backup");
        assert_eq!(primary.calls(), 3);
        assert_eq!(backup.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opening_mid_retry_still_fails_over() {
        let primary = Arc::new(Scripted::new("primary", Reply::Transient));
        let backup = Arc::new(Scripted::new("backup", good()));
        let orch = orchestrator(vec![primary.clone(), backup.clone()], |c| {
            c.circuit_breaker.failure_threshold = 2;
        });

        let result = orch.analyze(input()).await.unwrap();
        assert_eq!(result.provider, "backup");
        assert_eq!(primary.calls(), 2);
        assert_eq!(backup.calls(), 1);
        assert_eq!(orch.breaker().state("primary").await, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opening_on_lone_provider_reports_the_failure() {
        let primary = Arc::new(Scripted::new("primary", Reply::Transient));
        let orch = orchestrator(vec![primary.clone()], |c| {
            c.circuit_breaker.failure_threshold = 2;
        });

        let err = orch.analyze(input()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::ProviderError { .. }), "{err:?}");
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_failure_propagates() {
        let primary = Arc::new(Scripted::new("primary", Reply::Text("nope".into())));
        let backup = Arc::new(Scripted::new("backup", Reply::Text("nope".into())));
        let orch = orchestrator(vec![primary.clone(), backup.clone()], |_| {});

        let err = orch.analyze(input()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidResponse { ref provider, .. } if provider == "backup"));
        assert!(orch.cache().get(&CacheKey::questions(&subject().id, ["dating_intent"])).await.is_none());
    }

    #[tokio::test]
    async fn test_budget_denial_makes_no_call() {
        let primary = Arc::new(Scripted::new("primary", good()));
        let orch = orchestrator(vec![primary.clone()], |c| {
            c.budget = BudgetConfig {
                daily_limit_usd: 0.001,
                ..Default::default()
            };
        });

        let err = orch.analyze(input()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::BudgetExceeded { .. }));
        assert_eq!(primary.calls(), 0);
        assert_eq!(orch.costs().daily_spend().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_open_circuits_leave_no_provider() {
        let primary = Arc::new(Scripted::new("primary", good()));
        let orch = orchestrator(vec![primary.clone()], |c| {
            c.circuit_breaker = CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            };
        });
        orch.breaker().record_failure("primary").await;

        let err = orch.analyze(input()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::NoProviderAvailable));
        assert_eq!(primary.calls(), 0);
        assert_eq!(orch.costs().daily_spend().await.unwrap(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_estimate_and_opens_circuit() {
        let primary = Arc::new(Scripted::new("primary", Reply::Hang));
        let orch = orchestrator(vec![primary.clone()], |c| {
            c.circuit_breaker.failure_threshold = 3;
        });

        let err = orch.analyze(input()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Timeout { .. }));
        assert_eq!(primary.calls(), 3);
        assert_eq!(orch.breaker().state("primary").await, CircuitState::Open);

        let ledger = orch.costs().ledger("2026-05-04").await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger[0].estimated);
        assert!(orch.costs().daily_spend().await.unwrap() > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_call() {
        let primary = Arc::new(Scripted::new("primary", good()).with_delay(Duration::from_secs(1)));
        let orch = orchestrator(vec![primary.clone()], |_| {});

        let (a, b) = tokio::join!(
            orch.analyze(input().with_correlation_id("a")),
            orch.analyze(input().with_correlation_id("b")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(primary.calls(), 1);
        assert_eq!(a.correlation_id, b.correlation_id);
        assert_eq!(a.cost_usd, b.cost_usd);
        assert!(a.cache_hit != b.cache_hit);
        assert!(orch.coalescer().holder(&CacheKey::questions(&subject().id, ["dating_intent"])).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_outlives_slow_holder() {
        // Three timed-out primary attempts plus failover run past lock_ttl
        let primary = Arc::new(Scripted::new("primary", Reply::Hang));
        let backup = Arc::new(Scripted::new("backup", good()).with_delay(Duration::from_secs(5)));
        let orch = orchestrator_on(
            Arc::new(TokioClock::new(start())),
            vec![primary.clone(), backup.clone()],
            |c| c.coalescing.max_wait = Duration::from_secs(90),
        );

        let late = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            orch.analyze(input().with_correlation_id("b")).await
        };
        let (a, b) = tokio::join!(orch.analyze(input().with_correlation_id("a")), late);
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.provider, "backup");
        assert!(!a.cache_hit);
        assert!(b.cache_hit);
        assert_eq!(b.correlation_id, "a");
        assert_eq!(primary.calls(), 3);
        assert_eq!(backup.calls(), 1);
    }

    #[tokio::test]
    async fn test_too_many_questions_rejected_up_front() {
        let primary = Arc::new(Scripted::new("primary", good()));
        let orch = orchestrator(vec![primary.clone()], |c| c.max_questions_per_batch = 1);
        let questions = vec![Question::new("a", "?"), Question::new("b", "?")];

        let err = orch.analyze(input().with_questions(questions)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::TooManyQuestions { count: 2, max: 1 }));
        assert_eq!(primary.calls(), 0);
    }

    #[test]
    fn test_result_meta() {
        let meta = sample_result().meta();
        assert_eq!(meta.provider, "primary");
        assert_eq!(meta.correlation_id, "corr-1");
        assert!(!meta.cache_hit);
    }
}
