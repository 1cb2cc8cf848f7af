//! Resilience patterns for warden-runtime.
//!
//! This module provides:
//! - Circuit breaker to isolate failing providers
//! - Provider selection with health checks
//! - Retry with backoff
//! - Cost tracking and the budget gate

mod budget;
mod circuit_breaker;
mod retry;
mod selector;

pub use budget::{BudgetConfig, CostRecord, CostTracker, Reservation, Settlement};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitRecord, CircuitState};
pub use retry::{RetryConfig, RetryPolicy};
pub use selector::ProviderSelector;
