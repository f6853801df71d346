//! AgentKern-Arbiter: Adaptive Strategy Selector
//!
//! Contextual multi-armed bandit choosing among retrieval strategies.
//! Epsilon-greedy (with geometric epsilon decay) and UCB1 are both
//! supported; the module shape (named arms, a `*Bandit` struct holding
//! per-arm stats, a `select`/`reward` cycle) follows `StrategyBandit`
//! in the swarm convergence-strategy module, though the selection math
//! itself is this module's own (epsilon-greedy / UCB1, not Thompson
//! sampling over Beta priors).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::errors::BanditError;

/// A named retrieval strategy the bandit can select among.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Arm(pub String);

impl Arm {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }
}

impl std::fmt::Display for Arm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The seven default retrieval arms this kernel ships with.
pub fn default_arms() -> Vec<Arm> {
    [
        "fts-heavy",
        "vector-heavy",
        "balanced",
        "recency-focused",
        "effectiveness-focused",
        "popularity-focused",
        "semantic-focused",
    ]
    .into_iter()
    .map(Arm::new)
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanditAlgorithm {
    EpsilonGreedy,
    Ucb1,
}

#[derive(Debug, Clone)]
pub struct BanditConfig {
    pub algorithm: BanditAlgorithm,
    pub initial_epsilon: f64,
    pub epsilon_decay: f64,
    pub epsilon_floor: f64,
    pub ucb1_exploration: f64,
    pub window_size: usize,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            algorithm: BanditAlgorithm::EpsilonGreedy,
            initial_epsilon: 0.3,
            epsilon_decay: 0.99,
            epsilon_floor: 0.02,
            ucb1_exploration: std::f64::consts::SQRT_2,
            window_size: 200,
        }
    }
}

/// Per-arm reward statistics over a bounded sliding window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArmStats {
    pub trials: u64,
    pub sum_reward: f64,
    #[serde(skip)]
    window: VecDeque<f64>,
}

impl ArmStats {
    fn mean(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.sum_reward / self.trials as f64
        }
    }

    fn record(&mut self, reward: f64, window_size: usize) {
        if self.window.len() >= window_size {
            if let Some(evicted) = self.window.pop_front() {
                self.sum_reward -= evicted;
                self.trials -= 1;
            }
        }
        self.window.push_back(reward);
        self.sum_reward += reward;
        self.trials += 1;
    }
}

/// A condition under which arm selection is biased, keyed by project +
/// sorted agent types + working-hours bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextKey {
    pub project_id: String,
    pub agent_types: Vec<String>,
    pub working_hours_bucket: u8,
}

impl ContextKey {
    pub fn new(project_id: impl Into<String>, mut agent_types: Vec<String>, hour: u8) -> Self {
        agent_types.sort();
        Self {
            project_id: project_id.into(),
            agent_types,
            working_hours_bucket: hour / 4,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ContextualStats {
    per_arm: HashMap<Arm, ArmStats>,
}

/// Serializable snapshot of a bandit's learned state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedModel {
    pub algorithm: BanditAlgorithm,
    pub total_trials: u64,
    pub arms: HashMap<Arm, ArmStats>,
}

pub struct Bandit {
    config: BanditConfig,
    arms: Vec<Arm>,
    stats: Mutex<HashMap<Arm, ArmStats>>,
    contextual: Mutex<HashMap<ContextKey, ContextualStats>>,
    total_trials: Mutex<u64>,
}

impl Bandit {
    pub fn new(arms: Vec<Arm>, config: BanditConfig) -> Self {
        let stats = arms.iter().cloned().map(|a| (a, ArmStats::default())).collect();
        Self {
            config,
            arms,
            stats: Mutex::new(stats),
            contextual: Mutex::new(HashMap::new()),
            total_trials: Mutex::new(0),
        }
    }

    pub fn with_default_arms(config: BanditConfig) -> Self {
        Self::new(default_arms(), config)
    }

    fn current_epsilon(&self) -> f64 {
        let total = *self.total_trials.lock().unwrap() as f64;
        let decayed = self.config.initial_epsilon * self.config.epsilon_decay.powf(total);
        decayed.max(self.config.epsilon_floor)
    }

    pub fn select(&self, context: Option<&ContextKey>) -> Result<Arm, BanditError> {
        if self.arms.is_empty() {
            return Err(BanditError::NoArms);
        }

        let stats = self.stats.lock().unwrap();

        let chosen = match self.config.algorithm {
            BanditAlgorithm::EpsilonGreedy => {
                let mut rng = rand::thread_rng();
                if rng.gen::<f64>() < self.current_epsilon() {
                    self.arms[rng.gen_range(0..self.arms.len())].clone()
                } else {
                    self.best_arm(&stats)
                }
            }
            BanditAlgorithm::Ucb1 => self.ucb1_arm(&stats),
        };

        drop(stats);
        let chosen = self.apply_contextual_bias(chosen, context);
        tracing::info!(arm = %chosen, "bandit.selected");
        Ok(chosen)
    }

    fn best_arm(&self, stats: &HashMap<Arm, ArmStats>) -> Arm {
        self.arms
            .iter()
            .max_by(|a, b| {
                stats[*a]
                    .mean()
                    .partial_cmp(&stats[*b].mean())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
            .unwrap_or_else(|| self.arms[0].clone())
    }

    fn ucb1_arm(&self, stats: &HashMap<Arm, ArmStats>) -> Arm {
        if let Some(untried) = self.arms.iter().find(|a| stats[*a].trials == 0) {
            return untried.clone();
        }

        let total: u64 = stats.values().map(|s| s.trials).sum();
        self.arms
            .iter()
            .max_by(|a, b| {
                let score_a = ucb1_score(&stats[*a], total, self.config.ucb1_exploration);
                let score_b = ucb1_score(&stats[*b], total, self.config.ucb1_exploration);
                score_a.partial_cmp(&score_b).unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
            .unwrap_or_else(|| self.arms[0].clone())
    }

    /// If `context` has accumulated >= 10 samples for a dominant arm
    /// whose share exceeds 0.6 and mean reward exceeds 0.7, bias the
    /// selection toward it.
    fn apply_contextual_bias(&self, chosen: Arm, context: Option<&ContextKey>) -> Arm {
        let Some(context) = context else { return chosen };
        let contextual = self.contextual.lock().unwrap();
        let Some(ctx_stats) = contextual.get(context) else {
            return chosen;
        };

        let total: u64 = ctx_stats.per_arm.values().map(|s| s.trials).sum();
        if total < 10 {
            return chosen;
        }

        if let Some((dominant_arm, dominant_stats)) = ctx_stats
            .per_arm
            .iter()
            .max_by_key(|(_, s)| s.trials)
        {
            let share = dominant_stats.trials as f64 / total as f64;
            if share > 0.6 && dominant_stats.mean() > 0.7 {
                return dominant_arm.clone();
            }
        }

        chosen
    }

    pub fn reward(
        &self,
        arm: &Arm,
        reward: f64,
        context: Option<&ContextKey>,
    ) -> Result<(), BanditError> {
        if !(0.0..=1.0).contains(&reward) {
            return Err(BanditError::RewardOutOfRange(reward));
        }
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.get_mut(arm).ok_or_else(|| BanditError::UnknownArm(arm.0.clone()))?;
        entry.record(reward, self.config.window_size);
        drop(stats);

        *self.total_trials.lock().unwrap() += 1;

        if let Some(context) = context {
            let mut contextual = self.contextual.lock().unwrap();
            let ctx_entry = contextual.entry(context.clone()).or_default();
            ctx_entry
                .per_arm
                .entry(arm.clone())
                .or_default()
                .record(reward, self.config.window_size);
        }

        tracing::info!(arm = %arm, reward, "bandit.rewarded");
        Ok(())
    }

    /// Wilson score interval at 95% confidence, treating accumulated
    /// reward as a Bernoulli success proportion.
    pub fn confidence_interval(&self, arm: &Arm) -> (f64, f64) {
        let stats = self.stats.lock().unwrap();
        let Some(entry) = stats.get(arm) else {
            return (0.0, 0.0);
        };
        wilson_interval(entry.mean(), entry.trials)
    }

    pub fn export_model(&self) -> ExportedModel {
        let stats = self.stats.lock().unwrap();
        ExportedModel {
            algorithm: self.config.algorithm,
            total_trials: *self.total_trials.lock().unwrap(),
            arms: stats.clone(),
        }
    }

    pub fn import_model(&self, model: ExportedModel) -> Result<(), BanditError> {
        if model.algorithm != self.config.algorithm {
            return Err(BanditError::AlgorithmMismatch);
        }
        let mut stats = self.stats.lock().unwrap();
        for (arm, arm_stats) in model.arms {
            stats.insert(arm, arm_stats);
        }
        *self.total_trials.lock().unwrap() = model.total_trials;
        Ok(())
    }

    pub fn reset(&self) {
        let mut stats = self.stats.lock().unwrap();
        for entry in stats.values_mut() {
            *entry = ArmStats::default();
        }
        *self.total_trials.lock().unwrap() = 0;
        self.contextual.lock().unwrap().clear();
    }
}

fn ucb1_score(stats: &ArmStats, total: u64, exploration: f64) -> f64 {
    if stats.trials == 0 {
        return f64::INFINITY;
    }
    stats.mean() + exploration * ((total as f64).ln() / stats.trials as f64).sqrt()
}

fn wilson_interval(p_hat: f64, n: u64) -> (f64, f64) {
    if n == 0 {
        return (0.0, 0.0);
    }
    let z = 1.96_f64;
    let n = n as f64;
    let denom = 1.0 + z * z / n;
    let center = p_hat + z * z / (2.0 * n);
    let margin = z * ((p_hat * (1.0 - p_hat) / n) + z * z / (4.0 * n * n)).sqrt();
    let lower = ((center - margin) / denom).max(0.0);
    let upper = ((center + margin) / denom).min(1.0);
    (lower, upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_with_no_arms_errors() {
        let bandit = Bandit::new(vec![], BanditConfig::default());
        assert!(matches!(bandit.select(None), Err(BanditError::NoArms)));
    }

    #[test]
    fn reward_outside_unit_interval_is_rejected() {
        let bandit = Bandit::with_default_arms(BanditConfig::default());
        let arm = default_arms().remove(0);
        assert!(matches!(
            bandit.reward(&arm, 1.5, None),
            Err(BanditError::RewardOutOfRange(_))
        ));
    }

    #[test]
    fn reward_for_unknown_arm_errors() {
        let bandit = Bandit::with_default_arms(BanditConfig::default());
        let ghost = Arm::new("nonexistent");
        assert!(matches!(
            bandit.reward(&ghost, 0.5, None),
            Err(BanditError::UnknownArm(_))
        ));
    }

    #[test]
    fn epsilon_greedy_converges_to_best_arm_with_floor_epsilon() {
        let config = BanditConfig {
            initial_epsilon: 0.0,
            epsilon_floor: 0.0,
            ..BanditConfig::default()
        };
        let arms = vec![Arm::new("bad"), Arm::new("good")];
        let bandit = Bandit::new(arms.clone(), config);

        for _ in 0..20 {
            bandit.reward(&arms[0], 0.1, None).unwrap();
            bandit.reward(&arms[1], 0.9, None).unwrap();
        }

        let selected = bandit.select(None).unwrap();
        assert_eq!(selected, arms[1]);
    }

    #[test]
    fn ucb1_tries_every_arm_at_least_once_before_exploiting() {
        let arms = vec![Arm::new("a"), Arm::new("b"), Arm::new("c")];
        let config = BanditConfig {
            algorithm: BanditAlgorithm::Ucb1,
            ..BanditConfig::default()
        };
        let bandit = Bandit::new(arms.clone(), config);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let selected = bandit.select(None).unwrap();
            bandit.reward(&selected, 0.5, None).unwrap();
            seen.insert(selected);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn confidence_interval_widens_with_fewer_trials() {
        let bandit = Bandit::with_default_arms(BanditConfig::default());
        let arm = default_arms().remove(0);
        bandit.reward(&arm, 1.0, None).unwrap();
        let (lower_1, upper_1) = bandit.confidence_interval(&arm);

        for _ in 0..50 {
            bandit.reward(&arm, 1.0, None).unwrap();
        }
        let (lower_50, upper_50) = bandit.confidence_interval(&arm);

        assert!(upper_1 - lower_1 > upper_50 - lower_50);
    }

    #[test]
    fn export_then_import_restores_state_exactly() {
        let bandit = Bandit::with_default_arms(BanditConfig::default());
        let arm = default_arms().remove(0);
        bandit.reward(&arm, 0.7, None).unwrap();
        bandit.reward(&arm, 0.3, None).unwrap();

        let exported = bandit.export_model();

        let fresh = Bandit::with_default_arms(BanditConfig::default());
        fresh.import_model(exported.clone()).unwrap();

        assert_eq!(fresh.export_model().total_trials, exported.total_trials);
    }

    #[test]
    fn import_rejects_mismatched_algorithm() {
        let bandit = Bandit::with_default_arms(BanditConfig {
            algorithm: BanditAlgorithm::Ucb1,
            ..BanditConfig::default()
        });
        let model = ExportedModel {
            algorithm: BanditAlgorithm::EpsilonGreedy,
            total_trials: 0,
            arms: HashMap::new(),
        };
        assert!(matches!(
            bandit.import_model(model),
            Err(BanditError::AlgorithmMismatch)
        ));
    }

    #[test]
    fn reset_clears_all_accumulated_stats() {
        let bandit = Bandit::with_default_arms(BanditConfig::default());
        let arm = default_arms().remove(0);
        bandit.reward(&arm, 1.0, None).unwrap();
        bandit.reset();
        assert_eq!(bandit.export_model().total_trials, 0);
    }

    #[test]
    fn default_arms_has_seven_entries() {
        assert_eq!(default_arms().len(), 7);
    }
}
