//! AgentKern-Arbiter: Retry Engine
//!
//! Pluggable backoff strategies and jitter, with adaptive per-operation
//! tuning driven by a rolling window of recent outcomes.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::errors::RetryError;

/// Shape of the backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyKind {
    Fixed,
    Linear,
    Exponential,
    Fibonacci,
    Adaptive,
    Custom,
}

/// Jitter applied to the computed base delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterKind {
    None,
    Full,
    Equal,
    Decorrelated,
}

/// Categories of operation `optimized_defaults` knows how to tune for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Network,
    Git,
    Api,
    Database,
    Quick,
}

/// Outcome of one attempt, fed into `RetryEngine::record_outcome`.
#[derive(Debug, Clone, Copy)]
pub struct RetryOutcome {
    pub success: bool,
    pub observed_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub strategy: RetryStrategyKind,
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: JitterKind,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), RetryError> {
        if self.max_attempts < 1 {
            return Err(RetryError::InvalidMaxAttempts);
        }
        if self.max_delay < self.initial_delay {
            return Err(RetryError::MaxBelowInitial);
        }
        if self.multiplier <= 0.0 {
            return Err(RetryError::InvalidMultiplier);
        }
        Ok(())
    }

    /// Pure base-delay computation for `attempt` (1-indexed), with
    /// jitter applied after the base is computed.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = match self.strategy {
            RetryStrategyKind::Fixed => self.initial_delay,
            RetryStrategyKind::Linear => self.initial_delay * attempt.max(1),
            RetryStrategyKind::Exponential => {
                let factor = self.multiplier.powi((attempt.saturating_sub(1)) as i32);
                self.initial_delay.mul_f64(factor)
            }
            RetryStrategyKind::Fibonacci => self.initial_delay.mul_f64(fibonacci(attempt) as f64),
            RetryStrategyKind::Adaptive | RetryStrategyKind::Custom => self.initial_delay,
        };
        let capped = base.min(self.max_delay);
        apply_jitter(capped, self.jitter)
    }
}

/// Memoized Fibonacci, 1-indexed (`fibonacci(1) == 1`, `fibonacci(2) == 1`).
fn fibonacci(n: u32) -> u64 {
    thread_local! {
        static CACHE: std::cell::RefCell<Vec<u64>> = std::cell::RefCell::new(vec![1, 1]);
    }
    CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        while cache.len() < n as usize {
            let next = cache[cache.len() - 1] + cache[cache.len() - 2];
            cache.push(next);
        }
        cache[(n.max(1) - 1) as usize]
    })
}

/// Apply jitter to a computed base delay.
///
/// - `Equal`: `base +/- 0.5*base`, i.e. `U(0.5*base, 1.5*base)` — jitters
///   symmetrically around the un-jittered delay rather than only below it.
/// - `Decorrelated`: `min(0.1*base + U(0, base), 3*base)` — the AWS
///   "decorrelated jitter" formula, anchored to the current base rather
///   than the fixed initial delay.
fn apply_jitter(base: Duration, kind: JitterKind) -> Duration {
    let mut rng = rand::thread_rng();
    match kind {
        JitterKind::None => base,
        JitterKind::Full => Duration::from_secs_f64(rng.gen_range(0.0..=base.as_secs_f64())),
        JitterKind::Equal => {
            let secs = base.as_secs_f64();
            Duration::from_secs_f64(rng.gen_range((0.5 * secs)..=(1.5 * secs)))
        }
        JitterKind::Decorrelated => {
            let secs = base.as_secs_f64();
            let sampled = 0.1 * secs + rng.gen_range(0.0..=secs);
            Duration::from_secs_f64(sampled.min(3.0 * secs))
        }
    }
}

/// `optimized_defaults` table: per-operation-kind tuned starting configs.
pub fn optimized_defaults(kind: OperationKind) -> RetryConfig {
    match kind {
        OperationKind::Network => RetryConfig {
            strategy: RetryStrategyKind::Exponential,
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: JitterKind::Full,
        },
        OperationKind::Git => RetryConfig {
            strategy: RetryStrategyKind::Linear,
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 1.0,
            jitter: JitterKind::Equal,
        },
        OperationKind::Api => RetryConfig {
            strategy: RetryStrategyKind::Exponential,
            max_attempts: 4,
            initial_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(15),
            multiplier: 2.5,
            jitter: JitterKind::Decorrelated,
        },
        OperationKind::Database => RetryConfig {
            strategy: RetryStrategyKind::Fibonacci,
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(8),
            multiplier: 1.0,
            jitter: JitterKind::Equal,
        },
        OperationKind::Quick => RetryConfig {
            strategy: RetryStrategyKind::Fixed,
            max_attempts: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(50),
            multiplier: 1.0,
            jitter: JitterKind::None,
        },
    }
}

const ADAPTIVE_WINDOW: usize = 10;

/// Rolling per-operation outcome window driving adaptive scaling.
#[derive(Debug, Default)]
struct AdaptiveRetryState {
    outcomes: std::collections::VecDeque<RetryOutcome>,
    last_successful_delay: Option<Duration>,
}

impl AdaptiveRetryState {
    fn record(&mut self, outcome: RetryOutcome) {
        if self.outcomes.len() >= ADAPTIVE_WINDOW {
            self.outcomes.pop_front();
        }
        if outcome.success {
            self.last_successful_delay = Some(outcome.observed_delay);
        }
        self.outcomes.push_back(outcome);
    }

    fn success_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let successes = self.outcomes.iter().filter(|o| o.success).count();
        successes as f64 / self.outcomes.len() as f64
    }

    /// Scale a base delay: success rate below 0.5 widens delay (system
    /// struggling), above 0.8 narrows it toward the last successful
    /// delay (system healthy, retry sooner).
    fn scale(&self, base: Duration) -> Duration {
        let rate = self.success_rate();
        if rate < 0.5 {
            base.mul_f64(1.5)
        } else if rate > 0.8 {
            if let Some(last_good) = self.last_successful_delay {
                Duration::from_secs_f64((base.as_secs_f64() + last_good.as_secs_f64()) / 2.0)
            } else {
                base.mul_f64(0.75)
            }
        } else {
            base
        }
    }
}

/// A custom per-operation delay function registered via
/// `RetryEngine::with_custom_strategy`, keyed by operation name — the
/// same key space `configs` uses.
pub type CustomStrategyFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Owns configs and adaptive state across operations and strategies.
pub struct RetryEngine {
    configs: HashMap<String, RetryConfig>,
    adaptive: Mutex<HashMap<String, AdaptiveRetryState>>,
    custom_strategies: HashMap<String, CustomStrategyFn>,
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryEngine {
    pub fn new() -> Self {
        Self {
            configs: HashMap::new(),
            adaptive: Mutex::new(HashMap::new()),
            custom_strategies: HashMap::new(),
        }
    }

    pub fn with_config(mut self, operation: impl Into<String>, config: RetryConfig) -> Self {
        self.configs.insert(operation.into(), config);
        self
    }

    /// Register the delay function backing `RetryStrategyKind::Custom`
    /// for `operation`. `f` receives the 1-indexed attempt number.
    pub fn with_custom_strategy(
        mut self,
        operation: impl Into<String>,
        f: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.custom_strategies.insert(operation.into(), Arc::new(f));
        self
    }

    /// Confirm every config using `RetryStrategyKind::Custom` has a
    /// matching registered strategy function. Call after building the
    /// engine to fail fast instead of silently giving up at retry time.
    pub fn validate_registrations(&self) -> Result<(), RetryError> {
        for (operation, config) in &self.configs {
            if config.strategy == RetryStrategyKind::Custom
                && !self.custom_strategies.contains_key(operation)
            {
                return Err(RetryError::UnregisteredCustomStrategy(operation.clone()));
            }
        }
        Ok(())
    }

    pub fn record_outcome(&self, operation: &str, outcome: RetryOutcome) {
        let mut adaptive = self.adaptive.lock().unwrap();
        adaptive
            .entry(operation.to_string())
            .or_default()
            .record(outcome);
    }

    /// Convenience wrapper used by the orchestrating facade: look up the
    /// operation's config (or the `Quick` default), apply adaptive
    /// scaling, and signal `None` once `max_attempts` is exceeded.
    pub fn next_delay(&self, operation: &str, attempt: u32) -> Option<Duration> {
        let config = self
            .configs
            .get(operation)
            .cloned()
            .unwrap_or_else(|| optimized_defaults(OperationKind::Quick));

        if attempt > config.max_attempts {
            return None;
        }

        if config.strategy == RetryStrategyKind::Custom {
            return match self.custom_strategies.get(operation) {
                Some(f) => {
                    let base = f(attempt).min(config.max_delay);
                    Some(apply_jitter(base, config.jitter))
                }
                None => {
                    tracing::warn!(operation, "custom retry strategy not registered, giving up");
                    None
                }
            };
        }

        let base = config.delay(attempt);
        if config.strategy == RetryStrategyKind::Adaptive {
            let adaptive = self.adaptive.lock().unwrap();
            if let Some(state) = adaptive.get(operation) {
                return Some(state.scale(base));
            }
        }
        Some(base)
    }
}
