//! Cost tracking and the budget gate.
//!
//! Spend is kept as integer micro-dollars in shared counters so that every
//! update is a single atomic increment. A paid call first *reserves* its
//! estimated cost: the reservation increments the daily (and monthly)
//! counter and is rolled back when it would cross the ceiling, so
//! concurrent callers cannot jointly overshoot. After the call the
//! reservation is settled against the real cost.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::AnalysisError;
use crate::prompts::JudgmentRequest;
use crate::providers::{JudgmentProvider, TokenUsage};
use crate::store::{encode_json, keys, StateStore, StoreError};

const MICROS_PER_USD: f64 = 1_000_000.0;

const DAY_COUNTER_TTL: Duration = Duration::from_secs(2 * 24 * 3600);
const MONTH_COUNTER_TTL: Duration = Duration::from_secs(32 * 24 * 3600);
const LEDGER_RETENTION: Duration = Duration::from_secs(35 * 24 * 3600);

fn default_daily_limit() -> f64 {
    5.0
}

fn default_safety_margin() -> f64 {
    1.25
}

/// Budget configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub daily_limit_usd: f64,

    pub monthly_limit_usd: Option<f64>,

    /// Multiplier applied to every pre-call estimate
    pub safety_margin: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit_usd: default_daily_limit(),
            monthly_limit_usd: None,
            safety_margin: default_safety_margin(),
        }
    }
}

impl BudgetConfig {
    pub(crate) fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.daily_limit_usd.is_nan() || self.daily_limit_usd <= 0.0 {
            problems.push("budget.daily_limit_usd must be positive".to_string());
        }
        if let Some(monthly) = self.monthly_limit_usd {
            if monthly < self.daily_limit_usd {
                problems.push("budget.monthly_limit_usd is below the daily limit".to_string());
            }
        }
        if self.safety_margin.is_nan() || self.safety_margin < 1.0 {
            problems.push("budget.safety_margin must be at least 1.0".to_string());
        }
        problems
    }
}

fn to_micros(usd: f64) -> i64 {
    (usd * MICROS_PER_USD).round() as i64
}

fn counter_ttl(key: &str) -> Duration {
    if key.starts_with("budget:month:") {
        MONTH_COUNTER_TTL
    } else {
        DAY_COUNTER_TTL
    }
}

fn to_usd(micros: i64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub subject_id: String,
    pub correlation_id: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub cache_hit: bool,
    /// True when the call failed and the estimate was charged
    #[serde(default)]
    pub estimated: bool,
}

/// Spend reserved ahead of a paid call.
#[derive(Debug)]
#[must_use = "a reservation must be settled"]
pub struct Reservation {
    micros: i64,
    counters: Vec<String>,
    at: DateTime<Utc>,
}

impl Reservation {
    pub fn estimate_usd(&self) -> f64 {
        to_usd(self.micros)
    }
}

/// How a reserved call ended.
#[derive(Debug, Clone)]
pub enum Settlement {
    /// The call returned; `cost_usd` is the real cost
    Completed(CostRecord),
    /// The call was issued but failed or timed out; the estimate stands
    Failed(CostRecord),
    /// The call was never issued
    NotRun,
}

/// Running spend ledger and budget gate.
pub struct CostTracker {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: BudgetConfig,
}

impl CostTracker {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, config: BudgetConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Conservative pre-call estimate: the whole output allowance is assumed
    /// to be used, then the safety margin is applied.
    pub fn estimate(&self, provider: &dyn JudgmentProvider, request: &JudgmentRequest) -> f64 {
        let usage = TokenUsage {
            input_tokens: provider
                .estimate_tokens(&request.system_prompt)
                .saturating_add(provider.estimate_tokens(&request.payload)),
            output_tokens: provider.max_output_tokens(),
        };
        provider.compute_cost(&usage) * self.config.safety_margin
    }

    /// Whether `estimate_usd` fits under every ceiling. Unreadable counters
    /// deny.
    pub async fn can_afford(&self, estimate_usd: f64) -> bool {
        let now = self.clock.now();
        let estimate = to_micros(estimate_usd);
        for (key, limit) in self.ceilings(now) {
            match self.read_counter(&key).await {
                Ok(spent) if spent + estimate > to_micros(limit) => {
                    debug!(key = %key, spent_usd = to_usd(spent), estimate_usd, "Budget would be exceeded");
                    return false;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "Budget counter unreadable, denying");
                    return false;
                }
            }
        }
        true
    }

    /// Atomically reserve `estimate_usd` against every ceiling.
    pub async fn reserve(&self, estimate_usd: f64) -> Result<Reservation, AnalysisError> {
        let now = self.clock.now();
        let micros = to_micros(estimate_usd);
        let mut taken: Vec<String> = Vec::new();

        for (key, limit) in self.counters(now) {
            let total = match self.store.incr_by(&key, micros, Some(counter_ttl(&key))).await {
                Ok(total) => total,
                Err(e) => {
                    self.rollback(&taken, micros).await;
                    return Err(e.into());
                }
            };
            taken.push(key.clone());

            let Some(limit) = limit.map(to_micros) else {
                continue;
            };
            if total > limit {
                self.rollback(&taken, micros).await;
                let remaining = to_usd((limit - (total - micros)).max(0));
                warn!(
                    key = %key,
                    estimate_usd,
                    remaining_usd = remaining,
                    "Budget exceeded, denying paid call"
                );
                return Err(AnalysisError::BudgetExceeded {
                    estimate_usd,
                    remaining_usd: remaining,
                });
            }
        }

        Ok(Reservation {
            micros,
            counters: taken,
            at: now,
        })
    }

    /// Close out a reservation. Failures are logged, never returned.
    pub async fn settle(&self, reservation: Reservation, settlement: Settlement) {
        let counters = &reservation.counters;

        match settlement {
            Settlement::Completed(record) => {
                let delta = to_micros(record.cost_usd) - reservation.micros;
                if delta != 0 {
                    self.adjust(counters, delta).await;
                }
                self.bump_provider(&record, reservation.at).await;
                self.append(record).await;
            }
            Settlement::Failed(mut record) => {
                record.cost_usd = reservation.estimate_usd();
                record.estimated = true;
                self.bump_provider(&record, reservation.at).await;
                self.append(record).await;
            }
            Settlement::NotRun => self.adjust(counters, -reservation.micros).await,
        }
    }

    /// Record spend that was never reserved (cache-hit rows, external
    /// calls). Failures are logged, never returned.
    pub async fn record_cost(&self, record: CostRecord) {
        let micros = to_micros(record.cost_usd);
        if micros > 0 {
            let now = record.timestamp;
            let counters: Vec<String> = self.counters(now).into_iter().map(|(key, _)| key).collect();
            self.adjust(&counters, micros).await;
            self.bump_provider(&record, now).await;
        }
        self.append(record).await;
    }

    pub async fn daily_spend(&self) -> Result<f64, StoreError> {
        let key = keys::budget_day(self.clock.now());
        Ok(to_usd(self.read_counter(&key).await?))
    }

    /// Month-to-date spend, tracked whether or not a monthly limit is set.
    pub async fn monthly_spend(&self) -> Result<f64, StoreError> {
        let key = keys::budget_month(self.clock.now());
        Ok(to_usd(self.read_counter(&key).await?))
    }

    pub async fn provider_daily_spend(&self, provider: &str) -> Result<f64, StoreError> {
        let key = keys::budget_provider_day(self.clock.now(), provider);
        Ok(to_usd(self.read_counter(&key).await?))
    }

    /// Headroom under the tightest ceiling. An unreadable counter leaves none.
    pub async fn remaining(&self) -> f64 {
        let mut remaining = f64::INFINITY;
        for (key, limit) in self.ceilings(self.clock.now()) {
            let left = match self.read_counter(&key).await {
                Ok(spent) => to_usd((to_micros(limit) - spent).max(0)),
                Err(_) => 0.0,
            };
            remaining = remaining.min(left);
        }
        remaining
    }

    /// Ledger rows for a `YYYY-MM-DD` date, in append order.
    pub async fn ledger(&self, date: &str) -> Result<Vec<CostRecord>, StoreError> {
        let last = self.read_counter(&keys::ledger_seq(date)).await?;
        let mut records = Vec::new();
        for seq in 1..=last {
            let key = keys::ledger_entry(date, seq);
            if let Some(raw) = self.store.get(&key).await? {
                match serde_json::from_str(&raw) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(key = %key, error = %e, "Skipping unreadable ledger row"),
                }
            }
        }
        Ok(records)
    }

    /// Every spend counter for `now`, with its ceiling when one applies.
    fn counters(&self, now: DateTime<Utc>) -> [(String, Option<f64>); 2] {
        [
            (keys::budget_day(now), Some(self.config.daily_limit_usd)),
            (keys::budget_month(now), self.config.monthly_limit_usd),
        ]
    }

    fn ceilings(&self, now: DateTime<Utc>) -> impl Iterator<Item = (String, f64)> {
        self.counters(now)
            .into_iter()
            .filter_map(|(key, limit)| limit.map(|limit| (key, limit)))
    }

    async fn read_counter(&self, key: &str) -> Result<i64, StoreError> {
        match self.store.get(key).await? {
            None => Ok(0),
            Some(raw) => raw.parse().map_err(|_| StoreError::NotAnInteger {
                key: key.to_string(),
            }),
        }
    }

    async fn rollback(&self, keys: &[String], micros: i64) {
        self.adjust(keys, -micros).await;
    }

    async fn adjust(&self, counters: &[String], delta: i64) {
        for key in counters {
            if let Err(e) = self.store.incr_by(key, delta, Some(counter_ttl(key))).await {
                warn!(key = %key, delta, error = %e, "Failed to adjust budget counter");
            }
        }
    }

    async fn bump_provider(&self, record: &CostRecord, at: DateTime<Utc>) {
        let key = keys::budget_provider_day(at, &record.provider);
        let micros = to_micros(record.cost_usd);
        if micros == 0 {
            return;
        }
        if let Err(e) = self.store.incr_by(&key, micros, Some(DAY_COUNTER_TTL)).await {
            warn!(key = %key, error = %e, "Failed to record provider spend");
        }
    }

    async fn append(&self, record: CostRecord) {
        let date = keys::day(record.timestamp);
        let result = async {
            let seq = self
                .store
                .incr_by(&keys::ledger_seq(&date), 1, Some(LEDGER_RETENTION))
                .await?;
            let key = keys::ledger_entry(&date, seq);
            let value = encode_json(&key, &record)?;
            self.store.set(&key, value, Some(LEDGER_RETENTION)).await
        }
        .await;
        if let Err(e) = result {
            warn!(
                provider = %record.provider,
                subject = %record.subject_id,
                cost_usd = record.cost_usd,
                error = %e,
                "Failed to append cost ledger entry"
            );
        }
    }
}

impl std::fmt::Debug for CostTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostTracker")
            .field("config", &self.config)
            .finish()
    }
}
