//! AgentKern-Arbiter: Error Taxonomy
//!
//! Every component error converges here so callers can match on one
//! enum regardless of which internal component raised it. Component
//! error enums (`LedgerError`, `RetryError`, `CircuitError`,
//! `PolicyError`, `BanditError`, `RecoveryError`) follow the same
//! `thiserror` pattern as `locks.rs::LockError` and convert into
//! `ArbiterError` via `From` at the facade boundary.

use thiserror::Error;

/// Top-level error type returned by every public entry point in the crate.
#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("circuit {name} is open, rejecting call")]
    CircuitOpen { name: String },

    #[error("max attempts reached for {operation} after {attempts} tries")]
    MaxAttemptsReached { operation: String, attempts: u32 },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("operation failed: {0}")]
    OperationFailure(String),

    #[error("recovery failed: {0}")]
    RecoveryFailed(String),
}

pub type Result<T> = std::result::Result<T, ArbiterError>;

/// Ledger-specific failures, see `ledger.rs`.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no ledger record for key {0}")]
    NotFound(String),

    #[error("ledger storage failure: {0}")]
    StorageFailure(String),

    #[error("token does not match the record's current state")]
    StaleToken,
}

impl From<LedgerError> for ArbiterError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(k) => ArbiterError::NotFound(k),
            LedgerError::StorageFailure(m) => ArbiterError::StorageFailure(m),
            LedgerError::StaleToken => ArbiterError::InvalidInput("stale ledger token".into()),
        }
    }
}

/// Retry-config validation failures, see `retry.rs`.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("max_attempts must be >= 1")]
    InvalidMaxAttempts,

    #[error("delays must be non-negative")]
    NegativeDelay,

    #[error("max_delay must be >= initial_delay")]
    MaxBelowInitial,

    #[error("multiplier must be > 0")]
    InvalidMultiplier,

    #[error("custom strategy {0} not registered")]
    UnregisteredCustomStrategy(String),

    #[error("max attempts ({0}) reached")]
    MaxAttemptsReached(u32),
}

impl From<RetryError> for ArbiterError {
    fn from(e: RetryError) -> Self {
        match e {
            RetryError::MaxAttemptsReached(n) => ArbiterError::MaxAttemptsReached {
                operation: "unknown".into(),
                attempts: n,
            },
            other => ArbiterError::InvalidInput(other.to_string()),
        }
    }
}

/// Circuit breaker failures, see `breaker.rs`.
#[derive(Debug, Error)]
pub enum CircuitError {
    #[error("circuit {0} is open")]
    Open(String),

    #[error("circuit {0} half-open probe budget exceeded")]
    HalfOpenSaturated(String),
}

impl From<CircuitError> for ArbiterError {
    fn from(e: CircuitError) -> Self {
        match e {
            CircuitError::Open(name) => ArbiterError::CircuitOpen { name },
            CircuitError::HalfOpenSaturated(name) => ArbiterError::CircuitOpen { name },
        }
    }
}

/// Policy engine failures, see `policy.rs`.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("no policy matched and no default policy is configured")]
    NoMatch,

    #[error("policy {policy_id} denied action {action}: {message}")]
    Denied {
        policy_id: String,
        action: String,
        message: String,
    },

    #[error("invalid policy config: {0}")]
    InvalidConfig(String),
}

impl From<PolicyError> for ArbiterError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::NoMatch => ArbiterError::InvalidInput("no policy matched".into()),
            PolicyError::Denied {
                policy_id,
                action,
                message,
            } => ArbiterError::OperationFailure(format!(
                "policy {policy_id} denied {action}: {message}"
            )),
            PolicyError::InvalidConfig(m) => ArbiterError::InvalidInput(m),
        }
    }
}

/// Bandit failures, see `bandit.rs`.
#[derive(Debug, Error)]
pub enum BanditError {
    #[error("no arms registered")]
    NoArms,

    #[error("reward {0} outside valid range [0.0, 1.0]")]
    RewardOutOfRange(f64),

    #[error("unknown arm {0}")]
    UnknownArm(String),

    #[error("imported model algorithm does not match configured algorithm")]
    AlgorithmMismatch,
}

impl From<BanditError> for ArbiterError {
    fn from(e: BanditError) -> Self {
        ArbiterError::InvalidInput(e.to_string())
    }
}

/// Recovery runner failures, see `recovery.rs`.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("prerequisite cycle detected at action {0}")]
    Cycle(String),

    #[error("no handler registered for action type {0}")]
    NoHandler(String),

    #[error("action {action_id} timed out after {elapsed_ms}ms")]
    Timeout { action_id: String, elapsed_ms: u64 },
}

impl From<RecoveryError> for ArbiterError {
    fn from(e: RecoveryError) -> Self {
        match e {
            RecoveryError::Cycle(id) => {
                ArbiterError::InvalidInput(format!("prerequisite cycle at {id}"))
            }
            RecoveryError::NoHandler(id) => {
                ArbiterError::RecoveryFailed(format!("no handler for {id}"))
            }
            RecoveryError::Timeout {
                action_id,
                elapsed_ms,
            } => ArbiterError::RecoveryFailed(format!(
                "action {action_id} timed out after {elapsed_ms}ms"
            )),
        }
    }
}

impl From<std::io::Error> for ArbiterError {
    fn from(e: std::io::Error) -> Self {
        ArbiterError::StorageFailure(e.to_string())
    }
}

impl From<serde_json::Error> for ArbiterError {
    fn from(e: serde_json::Error) -> Self {
        ArbiterError::StorageFailure(e.to_string())
    }
}
