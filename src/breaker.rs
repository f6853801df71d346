//! AgentKern-Arbiter: Circuit Breaker
//!
//! Closed/Open/HalfOpen state machine over a fixed-capacity sliding
//! window of recent call outcomes, with an optional adaptive threshold
//! pass re-evaluated once per window close (see DESIGN.md for the
//! bounded +/-25%/window rule this resolves).

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};

use crate::errors::CircuitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub window_capacity: usize,
    pub volume_threshold: u32,
    pub failure_threshold: u32,
    pub error_rate_threshold: f64,
    pub slow_call_threshold: Duration,
    pub slow_call_rate_threshold: f64,
    pub reset_timeout: Duration,
    pub half_open_max_calls: usize,
    pub success_threshold: u32,
    pub adaptive: bool,
    pub adaptive_min_window: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window_capacity: 100,
            volume_threshold: 10,
            failure_threshold: 5,
            error_rate_threshold: 0.5,
            slow_call_threshold: Duration::from_secs(2),
            slow_call_rate_threshold: 0.5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
            success_threshold: 3,
            adaptive: false,
            adaptive_min_window: 20,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CircuitMetrics {
    pub total_calls: u64,
    pub failures: u64,
    pub successes: u64,
    pub slow_calls: u64,
    pub error_rate: f64,
    pub slow_call_rate: f64,
    pub state: Option<CircuitState>,
}

/// Carries the half-open probe permit (if one was acquired) for the
/// caller to hold for the duration of the call and drop afterward,
/// freeing the slot for another probe.
#[derive(Debug)]
pub struct AdmitDecision {
    pub allow: bool,
    pub reason: String,
    pub permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: Instant,
    pub reason: String,
}

struct Sample {
    outcome: Outcome,
    slow: bool,
}

struct WindowInner {
    samples: VecDeque<Sample>,
    capacity: usize,
    consecutive_failures: u32,
    calls_since_adaptive_check: u32,
}

impl WindowInner {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            consecutive_failures: 0,
            calls_since_adaptive_check: 0,
        }
    }

    fn push(&mut self, outcome: Outcome, slow: bool) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { outcome, slow });
        self.calls_since_adaptive_check += 1;
        match outcome {
            Outcome::Failure => self.consecutive_failures += 1,
            Outcome::Success => self.consecutive_failures = 0,
        }
    }

    fn total(&self) -> usize {
        self.samples.len()
    }

    fn failures(&self) -> usize {
        self.samples
            .iter()
            .filter(|s| s.outcome == Outcome::Failure)
            .count()
    }

    fn slow_calls(&self) -> usize {
        self.samples.iter().filter(|s| s.slow).count()
    }

    fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.samples.len() as f64
        }
    }

    fn slow_call_rate(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.slow_calls() as f64 / self.samples.len() as f64
        }
    }
}

/// Single named breaker. Cheap to clone via `Arc` internals for the
/// registry below.
pub struct CircuitBreaker {
    name: String,
    config: RwLock<CircuitConfig>,
    state: Mutex<CircuitState>,
    window: Mutex<WindowInner>,
    opened_at: Mutex<Option<Instant>>,
    half_open_successes: Mutex<u32>,
    half_open_permits: Mutex<Arc<Semaphore>>,
    half_open_max_calls: usize,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let window = Mutex::new(WindowInner::new(config.window_capacity));
        let half_open_max_calls = config.half_open_max_calls;
        Self {
            name: name.into(),
            config: RwLock::new(config),
            state: Mutex::new(CircuitState::Closed),
            window,
            opened_at: Mutex::new(None),
            half_open_successes: Mutex::new(0),
            half_open_permits: Mutex::new(Arc::new(Semaphore::new(half_open_max_calls))),
            half_open_max_calls,
        }
    }

    /// Try to take one of the half-open probe slots. At most
    /// `half_open_max_calls` concurrent admissions are allowed while the
    /// breaker is probing; the caller holds the returned permit for the
    /// duration of the call and drops it afterward to free the slot.
    fn try_half_open_admit(&self) -> AdmitDecision {
        let semaphore = self.half_open_permits.lock().clone();
        match semaphore.try_acquire_owned() {
            Ok(permit) => AdmitDecision {
                allow: true,
                reason: "half-open probe".into(),
                permit: Some(permit),
            },
            Err(_) => AdmitDecision {
                allow: false,
                reason: "half-open probe budget exceeded".into(),
                permit: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn admit(&self) -> AdmitDecision {
        let current = *self.state.lock();

        if current == CircuitState::Open {
            let reset_timeout = self.config.read().await.reset_timeout;
            let elapsed = self
                .opened_at
                .lock()
                .map(|at| at.elapsed())
                .unwrap_or_default();

            if elapsed >= reset_timeout {
                let mut state = self.state.lock();
                // Re-check under the lock: another caller may have
                // already flipped this to HalfOpen while we awaited.
                if *state == CircuitState::Open {
                    *state = CircuitState::HalfOpen;
                    *self.half_open_successes.lock() = 0;
                    *self.half_open_permits.lock() =
                        Arc::new(Semaphore::new(self.half_open_max_calls));
                    tracing::info!(name = %self.name, "breaker.state_change open->half_open");
                }
                drop(state);
                return self.try_half_open_admit();
            }
            return AdmitDecision {
                allow: false,
                reason: "open".into(),
                permit: None,
            };
        }

        match current {
            CircuitState::Closed => AdmitDecision {
                allow: true,
                reason: "closed".into(),
                permit: None,
            },
            CircuitState::HalfOpen => self.try_half_open_admit(),
            CircuitState::Open => unreachable!("handled above"),
        }
    }

    pub async fn record(&self, outcome: Outcome, duration: Duration) {
        let config = self.config.read().await.clone();
        let slow = duration >= config.slow_call_threshold;

        {
            let mut window = self.window.lock();
            window.push(outcome, slow);
        }

        let mut state = self.state.lock();
        match *state {
            CircuitState::HalfOpen => match outcome {
                Outcome::Failure => {
                    *state = CircuitState::Open;
                    *self.opened_at.lock() = Some(Instant::now());
                    tracing::warn!(name = %self.name, "breaker.state_change half_open->open");
                }
                Outcome::Success => {
                    let mut successes = self.half_open_successes.lock();
                    *successes += 1;
                    if *successes >= config.success_threshold {
                        *state = CircuitState::Closed;
                        self.window.lock().consecutive_failures = 0;
                        tracing::info!(name = %self.name, "breaker.state_change half_open->closed");
                    }
                }
            },
            CircuitState::Closed => {
                drop(state);
                self.maybe_trip(&config).await;
            }
            CircuitState::Open => {}
        }
    }

    async fn maybe_trip(&self, config: &CircuitConfig) {
        let (total, consecutive_failures, error_rate, slow_rate) = {
            let window = self.window.lock();
            (
                window.total() as u32,
                window.consecutive_failures,
                window.error_rate(),
                window.slow_call_rate(),
            )
        };

        if total < config.volume_threshold {
            return;
        }

        let tripped = consecutive_failures >= config.failure_threshold
            || error_rate >= config.error_rate_threshold
            || slow_rate >= config.slow_call_rate_threshold;

        if tripped {
            let mut state = self.state.lock();
            if *state == CircuitState::Closed {
                *state = CircuitState::Open;
                *self.opened_at.lock() = Some(Instant::now());
                tracing::warn!(name = %self.name, "breaker.state_change closed->open");
            }
        }

        if config.adaptive {
            self.maybe_adapt(config).await;
        }
    }

    /// Widen or tighten `failure_threshold`/`error_rate_threshold` by at
    /// most 25% of the baseline, once per window close.
    async fn maybe_adapt(&self, baseline: &CircuitConfig) {
        let should_check = {
            let mut window = self.window.lock();
            if window.calls_since_adaptive_check >= baseline.adaptive_min_window {
                window.calls_since_adaptive_check = 0;
                true
            } else {
                false
            }
        };
        if !should_check {
            return;
        }

        let error_rate = self.window.lock().error_rate();
        let mut config = self.config.write().await;

        let step_failure = (baseline.failure_threshold as f64 * 0.25).max(1.0);
        let step_rate = baseline.error_rate_threshold * 0.25;

        if error_rate > baseline.error_rate_threshold {
            // System is unhealthier than baseline: tighten (lower bound).
            config.failure_threshold = ((config.failure_threshold as f64 - step_failure) as u32)
                .max((baseline.failure_threshold as f64 * 0.75) as u32)
                .max(1);
            config.error_rate_threshold = (config.error_rate_threshold - step_rate)
                .max(baseline.error_rate_threshold * 0.75);
        } else {
            // System healthier than baseline: widen (raise bound).
            config.failure_threshold = ((config.failure_threshold as f64 + step_failure) as u32)
                .min((baseline.failure_threshold as f64 * 1.25) as u32);
            config.error_rate_threshold = (config.error_rate_threshold + step_rate)
                .min(baseline.error_rate_threshold * 1.25);
        }

        tracing::info!(
            name = %self.name,
            failure_threshold = config.failure_threshold,
            error_rate_threshold = config.error_rate_threshold,
            "breaker.adaptive_threshold_updated"
        );
    }

    pub fn force(&self, state: CircuitState, reason: &str) {
        *self.state.lock() = state;
        if state == CircuitState::Open {
            *self.opened_at.lock() = Some(Instant::now());
        }
        tracing::info!(name = %self.name, ?state, reason, "breaker.forced");
    }

    pub fn reset(&self) {
        *self.state.lock() = CircuitState::Closed;
        *self.opened_at.lock() = None;
        *self.half_open_successes.lock() = 0;
        *self.half_open_permits.lock() = Arc::new(Semaphore::new(self.half_open_max_calls));
        let mut window = self.window.lock();
        window.samples.clear();
        window.consecutive_failures = 0;
    }

    pub async fn metrics(&self) -> CircuitMetrics {
        let window = self.window.lock();
        CircuitMetrics {
            total_calls: window.total() as u64,
            failures: window.failures() as u64,
            successes: (window.total() - window.failures()) as u64,
            slow_calls: window.slow_calls() as u64,
            error_rate: window.error_rate(),
            slow_call_rate: window.slow_call_rate(),
            state: Some(*self.state.lock()),
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.lock()
    }
}

/// Per-name registry with lazy creation and an `execute` wrapper that
/// turns an open circuit into a typed error distinct from whatever the
/// wrapped operation itself might return.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitConfig,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    pub async fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(name) {
            return existing.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config.clone())))
            .clone()
    }

    /// Run `op` through the named breaker, recording its outcome and
    /// timing. Returns `Err(CircuitError::Open)` without running `op`
    /// when the breaker denies admission.
    pub async fn execute<F, Fut, T, E>(&self, name: &str, op: F) -> Result<T, CircuitExecError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.get_or_create(name).await;
        let decision = breaker.admit().await;
        if !decision.allow {
            return Err(CircuitExecError::Open(CircuitError::Open(name.to_string())));
        }

        let start = Instant::now();
        let result = op().await;
        let elapsed = start.elapsed();

        match &result {
            Ok(_) => breaker.record(Outcome::Success, elapsed).await,
            Err(_) => breaker.record(Outcome::Failure, elapsed).await,
        }

        result.map_err(CircuitExecError::Operation)
    }
}

/// Distinguishes a breaker-level rejection from the wrapped operation's
/// own error type.
#[derive(Debug)]
pub enum CircuitExecError<E> {
    Open(CircuitError),
    Operation(E),
}
