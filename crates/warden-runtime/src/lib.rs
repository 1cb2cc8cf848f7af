//! # warden-runtime
//!
//! AI judgment orchestration for Warden.
//!
//! `warden-core` decides; this crate obtains the answers its AI rules ask
//! for. Every paid call goes through the same gates:
//!
//! - a differential cache, keyed by subject and question set, with TTLs
//!   chosen by author trust and confirmed risk
//! - a daily (and optionally monthly) budget checked before the call
//! - a coalescing lock so one subject key has at most one call in flight
//! - per-provider circuit breakers, retries and failover in priority order
//! - strict schema validation of every response
//!
//! All shared state (circuits, locks, counters, ledger, cache) lives behind
//! [`StateStore`], so handlers in different processes that share a store
//! also share breaker, budget and lock state.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use warden_runtime::{
//!     AnalysisOrchestrator, MemoryStore, ModerationPipeline, ProviderRegistry, RuntimeConfig,
//!     SystemClock,
//! };
//!
//! let config = RuntimeConfig::from_file("warden.yaml")?;
//! config.validate()?;
//! let orchestrator = AnalysisOrchestrator::from_config(
//!     &config,
//!     &ProviderRegistry::with_defaults(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(SystemClock),
//!     sanitizer.clone(),
//! )?;
//! let pipeline = ModerationPipeline::new(engine, Arc::new(orchestrator), profiles, trust, sanitizer, clock);
//! let decision = pipeline.moderate(&subject).await?;
//! ```

pub mod cache;
pub mod clock;
pub mod coalescer;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod prompts;
pub mod providers;
pub mod resilience;
pub mod store;
pub mod validation;

pub use cache::{CacheConfig, CacheKey, DifferentialCache, TtlPolicy, TtlTier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coalescer::{CoalescingConfig, LockStatus, RequestCoalescer, WaitOutcome};
pub use collaborators::{
    ActionExecutor, CollaboratorError, NoTrustScores, ProfileSource, TrustScoreSource,
};
pub use config::{ConfigError, RuntimeConfig};
pub use error::AnalysisError;
pub use orchestrator::{AnalysisFailure, AnalysisInput, AnalysisOrchestrator, AnalysisResult};
pub use pipeline::{ModerationPipeline, PipelineError};
pub use prompts::{AuthorContext, JudgmentRequest, RequestBuilder, RequestKind, PROMPT_VERSION};
pub use providers::{
    JudgmentProvider, Pricing, ProviderConfig, ProviderError, ProviderRegistry, ProviderResponse,
    TokenUsage,
};
pub use resilience::{
    BudgetConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState, CostRecord, CostTracker,
    ProviderSelector, RetryConfig, RetryPolicy,
};
pub use store::{MemoryStore, StateStore, StoreError};
pub use validation::{
    JudgmentPayload, ResponseValidator, RiskAssessment, RiskLevel, ValidationError,
};
