#![allow(clippy::collapsible_if)]
//! AgentKern-Arbiter: Operation Resilience & Adaptive Selection Kernel
//!
//! A reusable resilience and adaptive-selection kernel for an agent
//! orchestration platform: an idempotency ledger, a retry engine, a
//! circuit breaker, a contextual bandit selector, a declarative policy
//! engine that orchestrates the three, and a recovery actions runner.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    agentkern-arbiter                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  caller                                                       │
//! │    │                                                          │
//! │    ▼                                                          │
//! │  Bandit::select ──▶ Breaker::admit ──▶ Ledger::begin           │
//! │                                            │                  │
//! │                                            ▼                  │
//! │                                      invoke operation          │
//! │                                            │                  │
//! │                      ┌─────────────────────┼─────────────┐    │
//! │                      ▼                      ▼             ▼    │
//! │               Ledger::complete/fail   Breaker::record  Bandit::reward
//! │                      │                                        │
//! │                      ▼                                        │
//! │               Retry::next_delay ──▶ sleep or give up           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! `PolicyEngine` sits above the ledger/breaker/retry triple, mapping
//! an operation context to the retry and recovery configuration that
//! should govern it. `RecoveryRunner` executes the recovery actions a
//! policy names once an operation is exhausted. `ResilientExecutor`
//! (see [`facade`]) wires all of the above into one call for a caller
//! that doesn't want to hand-assemble the pieces itself.

pub mod bandit;
pub mod breaker;
pub mod config;
pub mod errors;
pub mod facade;
pub mod fingerprint;
pub mod ledger;
pub mod policy;
pub mod recovery;
pub mod retry;

// Re-exports
pub use bandit::{
    Arm, ArmStats, Bandit, BanditAlgorithm, BanditConfig, ContextKey, ExportedModel,
};
pub use breaker::{
    AdmitDecision, CircuitBreaker, CircuitBreakerRegistry, CircuitConfig, CircuitExecError,
    CircuitMetrics, CircuitState, Outcome, StateTransition,
};
pub use config::{ArbiterConfig, BanditSection, BreakerSection, LedgerSection};
pub use errors::{ArbiterError, BanditError, CircuitError, LedgerError, PolicyError, RecoveryError, RetryError, Result};
pub use facade::{ExecuteOutcome, OperationHandle, ResilientExecutor};
pub use fingerprint::generate_key;
pub use ledger::{Ledger, LedgerConfig, LedgerRecord, LedgerStats, LedgerStatus, LedgerToken, ShouldExecute};
pub use policy::{
    Condition, ConditionField, ConditionOperator, ErrorField, ErrorInfo, Policy, PolicyContext,
    PolicyDecision, PolicyEngine, PolicyEngineConfig,
};
pub use recovery::{
    ActionDescriptor, ActionResult, AgentStateResetAction, ApiRateLimitWaitAction,
    FilePermissionsFixAction, GitCleanupAction, NetworkConnectivityProbeAction,
    RecoveryActionConfig, RecoveryActionHandler, RecoveryContext, RecoveryPlanResult,
    RecoveryRunner, RiskLevel, ServiceHealthCheckAction,
};
pub use retry::{
    JitterKind, OperationKind, RetryConfig, RetryEngine, RetryOutcome, RetryStrategyKind,
};
