//! AgentKern-Arbiter: Policy Engine
//!
//! Declarative, condition-driven selection of a retry/recovery policy
//! for an incoming operation context. Conditions are a structured
//! `{field, operator, value, negate}` record rather than a free-form
//! expression string, but the operand-resolve-then-compare evaluation
//! shape follows `gate`'s expression evaluator.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[cfg(feature = "policy-yaml")]
use crate::errors::PolicyError;
use crate::retry::{RetryConfig, RetryStrategyKind};

fn default_priority() -> i32 {
    0
}

fn default_enabled() -> bool {
    true
}

/// What a condition's left-hand side resolves against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    Action,
    AgentId,
    Context(String),
    Error(ErrorField),
}

/// Metadata a failing error exposes to the policy engine, so conditions
/// can match on it (e.g. `category = "github"`, `severity = "high"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorField {
    Message,
    Code,
    Category,
    Severity,
}

/// Structured description of the error that triggered this evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub severity: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    In,
    Matches,
    Lt,
    Gt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: ConditionField,
    pub operator: ConditionOperator,
    pub value: Value,
    #[serde(default)]
    pub negate: bool,
}

/// Evaluation context a policy's conditions are matched against.
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    pub action: String,
    pub agent_id: String,
    pub context: HashMap<String, Value>,
    pub error: Option<ErrorInfo>,
}

impl Condition {
    pub fn evaluate(&self, ctx: &PolicyContext) -> bool {
        let lhs = self.resolve(ctx);
        let result = match self.operator {
            ConditionOperator::Equals => values_equal(&lhs, &self.value),
            ConditionOperator::Contains => contains(&lhs, &self.value),
            ConditionOperator::In => contains(&self.value, &lhs),
            ConditionOperator::Matches => matches_regex(&lhs, &self.value),
            ConditionOperator::Lt => compare(&lhs, &self.value) == Some(std::cmp::Ordering::Less),
            ConditionOperator::Gt => {
                compare(&lhs, &self.value) == Some(std::cmp::Ordering::Greater)
            }
        };
        if self.negate {
            !result
        } else {
            result
        }
    }

    fn resolve(&self, ctx: &PolicyContext) -> Value {
        match &self.field {
            ConditionField::Action => Value::String(ctx.action.clone()),
            ConditionField::AgentId => Value::String(ctx.agent_id.clone()),
            ConditionField::Context(key) => ctx.context.get(key).cloned().unwrap_or(Value::Null),
            ConditionField::Error(field) => {
                let Some(error) = &ctx.error else {
                    return Value::Null;
                };
                let s = match field {
                    ErrorField::Message => &error.message,
                    ErrorField::Code => &error.code,
                    ErrorField::Category => &error.category,
                    ErrorField::Severity => &error.severity,
                };
                Value::String(s.clone())
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.contains(needle),
        _ => false,
    }
}

fn matches_regex(value: &Value, pattern: &Value) -> bool {
    let (Some(s), Some(p)) = (value.as_str(), pattern.as_str()) else {
        return false;
    };
    regex::Regex::new(p).map(|re| re.is_match(s)).unwrap_or(false)
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// A named retry/recovery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub retry_strategy: Option<RetryStrategyKind>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub initial_delay_ms: Option<u64>,
    #[serde(default)]
    pub recovery_actions: Vec<String>,
    #[serde(default)]
    pub inherit_from: Option<String>,
}

impl Policy {
    fn matches(&self, ctx: &PolicyContext) -> bool {
        self.enabled && self.conditions.iter().all(|c| c.evaluate(ctx))
    }

    /// Resolve this policy's retry config into a full `RetryConfig`,
    /// falling back to `optimized_defaults` for any field left unset.
    fn to_retry_config(&self) -> RetryConfig {
        let mut config = crate::retry::optimized_defaults(crate::retry::OperationKind::Api);
        if let Some(strategy) = self.retry_strategy {
            config.strategy = strategy;
        }
        if let Some(max) = self.max_attempts {
            config.max_attempts = max;
        }
        if let Some(ms) = self.initial_delay_ms {
            config.initial_delay = std::time::Duration::from_millis(ms);
        }
        config
    }

    /// Merge a parent policy's conditions/recovery_actions ahead of this
    /// policy's own (parent first), with scalar retry fields overridden
    /// by this policy when present.
    fn inherit(mut self, parent: &Policy) -> Policy {
        let mut conditions = parent.conditions.clone();
        conditions.extend(self.conditions);
        self.conditions = conditions;

        let mut actions = parent.recovery_actions.clone();
        actions.extend(self.recovery_actions);
        self.recovery_actions = actions;

        if self.retry_strategy.is_none() {
            self.retry_strategy = parent.retry_strategy;
        }
        if self.max_attempts.is_none() {
            self.max_attempts = parent.max_attempts;
        }
        if self.initial_delay_ms.is_none() {
            self.initial_delay_ms = parent.initial_delay_ms;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyEngineConfig {
    #[serde(default)]
    pub policies: Vec<Policy>,
}

#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub policy_id: String,
    pub retry_config: RetryConfig,
    pub recovery_actions: Vec<String>,
    pub reason: String,
    /// Whether the matched policy's retry config allows any attempts at all.
    pub should_retry: bool,
    /// First-attempt delay in milliseconds, for callers that want a
    /// quick answer without re-deriving it from `retry_config`.
    pub delay_ms: u64,
}

const DEFAULT_POLICY_ID: &str = "__default__";

pub struct PolicyEngine {
    policies: Vec<Policy>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self { policies: Vec::new() }
    }

    pub fn load(config: PolicyEngineConfig) -> Self {
        let mut engine = Self::new();
        for policy in config.policies {
            engine.add(policy);
        }
        engine
    }

    #[cfg(feature = "policy-yaml")]
    pub fn load_yaml(yaml: &str) -> Result<Self, PolicyError> {
        let config: PolicyEngineConfig =
            serde_yaml::from_str(yaml).map_err(|e| PolicyError::InvalidConfig(e.to_string()))?;
        Ok(Self::load(config))
    }

    pub fn add(&mut self, policy: Policy) {
        let resolved = if let Some(parent_id) = policy.inherit_from.clone() {
            match self.policies.iter().find(|p| p.id == parent_id).cloned() {
                Some(parent) => policy.inherit(&parent),
                None => {
                    tracing::warn!(parent_id, "policy inherit_from target not found, skipping inheritance");
                    policy
                }
            }
        } else {
            policy
        };
        self.policies.push(resolved);
    }

    pub fn remove(&mut self, id: &str) {
        self.policies.retain(|p| p.id != id);
    }

    pub fn toggle(&mut self, id: &str, enabled: bool) {
        if let Some(policy) = self.policies.iter_mut().find(|p| p.id == id) {
            policy.enabled = enabled;
        }
    }

    /// Highest-priority enabled policy whose conditions all match wins;
    /// ties broken by insertion order. Falls back to a built-in default
    /// when nothing matches.
    pub fn execute(&self, ctx: &PolicyContext) -> PolicyDecision {
        let winner = self
            .policies
            .iter()
            .enumerate()
            .filter(|(_, p)| p.matches(ctx))
            .max_by_key(|(idx, p)| (p.priority, -(*idx as i64)))
            .map(|(_, p)| p);

        match winner {
            Some(policy) => {
                tracing::info!(policy_id = %policy.id, action = %ctx.action, "policy.matched");
                let retry_config = policy.to_retry_config();
                PolicyDecision {
                    policy_id: policy.id.clone(),
                    should_retry: retry_config.max_attempts > 0,
                    delay_ms: retry_config.delay(1).as_millis() as u64,
                    retry_config,
                    recovery_actions: policy.recovery_actions.clone(),
                    reason: format!("matched policy {}", policy.id),
                }
            }
            None => {
                let retry_config =
                    crate::retry::optimized_defaults(crate::retry::OperationKind::Api);
                PolicyDecision {
                    policy_id: DEFAULT_POLICY_ID.to_string(),
                    should_retry: retry_config.max_attempts > 0,
                    delay_ms: retry_config.delay(1).as_millis() as u64,
                    retry_config,
                    recovery_actions: Vec::new(),
                    reason: "no policy matched, using built-in default".into(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(action: &str, amount: i64) -> PolicyContext {
        let mut context = HashMap::new();
        context.insert("amount".into(), Value::from(amount));
        PolicyContext {
            action: action.into(),
            agent_id: "agent-1".into(),
            context,
            error: None,
        }
    }

    #[test]
    fn equals_operator_matches_action() {
        let condition = Condition {
            field: ConditionField::Action,
            operator: ConditionOperator::Equals,
            value: Value::String("transfer_funds".into()),
            negate: false,
        };
        assert!(condition.evaluate(&ctx("transfer_funds", 0)));
        assert!(!condition.evaluate(&ctx("send_email", 0)));
    }

    #[test]
    fn gt_operator_compares_numeric_context_field() {
        let condition = Condition {
            field: ConditionField::Context("amount".into()),
            operator: ConditionOperator::Gt,
            value: Value::from(10000),
            negate: false,
        };
        assert!(condition.evaluate(&ctx("x", 15000)));
        assert!(!condition.evaluate(&ctx("x", 5000)));
    }

    #[test]
    fn negate_flips_the_result() {
        let condition = Condition {
            field: ConditionField::Action,
            operator: ConditionOperator::Equals,
            value: Value::String("transfer_funds".into()),
            negate: true,
        };
        assert!(!condition.evaluate(&ctx("transfer_funds", 0)));
    }

    #[test]
    fn in_operator_checks_membership() {
        let condition = Condition {
            field: ConditionField::Action,
            operator: ConditionOperator::In,
            value: Value::Array(vec![Value::String("a".into()), Value::String("b".into())]),
            negate: false,
        };
        assert!(condition.evaluate(&ctx("a", 0)));
        assert!(!condition.evaluate(&ctx("c", 0)));
    }

    #[test]
    fn matches_operator_applies_regex() {
        let condition = Condition {
            field: ConditionField::Action,
            operator: ConditionOperator::Matches,
            value: Value::String("^transfer_.*".into()),
            negate: false,
        };
        assert!(condition.evaluate(&ctx("transfer_funds", 0)));
        assert!(!condition.evaluate(&ctx("send_email", 0)));
    }

    fn sample_policy(id: &str, priority: i32) -> Policy {
        Policy {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            priority,
            enabled: true,
            conditions: vec![Condition {
                field: ConditionField::Action,
                operator: ConditionOperator::Equals,
                value: Value::String("transfer_funds".into()),
                negate: false,
            }],
            retry_strategy: Some(RetryStrategyKind::Fixed),
            max_attempts: Some(2),
            initial_delay_ms: Some(10),
            recovery_actions: vec![],
            inherit_from: None,
        }
    }

    #[test]
    fn highest_priority_matching_policy_wins() {
        let mut engine = PolicyEngine::new();
        engine.add(sample_policy("low", 1));
        engine.add(sample_policy("high", 10));

        let decision = engine.execute(&ctx("transfer_funds", 0));
        assert_eq!(decision.policy_id, "high");
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let mut engine = PolicyEngine::new();
        engine.add(sample_policy("first", 5));
        engine.add(sample_policy("second", 5));

        let decision = engine.execute(&ctx("transfer_funds", 0));
        assert_eq!(decision.policy_id, "second");
    }

    #[test]
    fn no_match_falls_back_to_default_policy() {
        let engine = PolicyEngine::new();
        let decision = engine.execute(&ctx("unrelated_action", 0));
        assert_eq!(decision.policy_id, DEFAULT_POLICY_ID);
        assert_eq!(decision.retry_config.max_attempts, 4);
    }

    #[test]
    fn disabled_policy_is_not_matched() {
        let mut engine = PolicyEngine::new();
        let mut policy = sample_policy("disabled", 10);
        policy.enabled = false;
        engine.add(policy);

        let decision = engine.execute(&ctx("transfer_funds", 0));
        assert_eq!(decision.policy_id, DEFAULT_POLICY_ID);
    }

    #[test]
    fn inherit_from_concatenates_parent_conditions_first() {
        let mut engine = PolicyEngine::new();
        let parent = Policy {
            conditions: vec![Condition {
                field: ConditionField::AgentId,
                operator: ConditionOperator::Equals,
                value: Value::String("agent-1".into()),
                negate: false,
            }],
            ..sample_policy("parent", 1)
        };
        engine.add(parent);

        let child = Policy {
            inherit_from: Some("parent".into()),
            ..sample_policy("child", 5)
        };
        engine.add(child);

        let found = engine.policies.iter().find(|p| p.id == "child").unwrap();
        assert_eq!(found.conditions.len(), 2);
        assert!(matches!(found.conditions[0].field, ConditionField::AgentId));
    }

    #[test]
    fn error_category_and_severity_conditions_compose_via_inheritance() {
        let mut engine = PolicyEngine::new();
        let parent = Policy {
            conditions: vec![Condition {
                field: ConditionField::Error(ErrorField::Category),
                operator: ConditionOperator::Equals,
                value: Value::String("github".into()),
                negate: false,
            }],
            ..sample_policy("github-errors", 1)
        };
        engine.add(parent);

        let child = Policy {
            inherit_from: Some("github-errors".into()),
            conditions: vec![Condition {
                field: ConditionField::Error(ErrorField::Severity),
                operator: ConditionOperator::Equals,
                value: Value::String("high".into()),
                negate: false,
            }],
            ..sample_policy("github-high-severity", 5)
        };
        engine.add(child);

        let mut ctx = ctx("transfer_funds", 0);
        ctx.error = Some(ErrorInfo {
            category: "github".into(),
            severity: "high".into(),
            ..ErrorInfo::default()
        });
        let decision = engine.execute(&ctx);
        assert_eq!(decision.policy_id, "github-high-severity");

        ctx.error = Some(ErrorInfo {
            category: "github".into(),
            severity: "low".into(),
            ..ErrorInfo::default()
        });
        let decision = engine.execute(&ctx);
        assert_eq!(decision.policy_id, DEFAULT_POLICY_ID);
    }

    #[test]
    fn decision_reports_should_retry_and_a_bounded_delay() {
        let mut engine = PolicyEngine::new();
        engine.add(sample_policy("p1", 5));

        let decision = engine.execute(&ctx("transfer_funds", 0));
        assert!(decision.should_retry);
        // jitter keeps the first-attempt delay within 3x the configured
        // initial delay (decorrelated jitter's upper bound).
        assert!(decision.delay_ms <= 30);
    }

    #[test]
    fn toggle_disables_and_reenables_a_policy() {
        let mut engine = PolicyEngine::new();
        engine.add(sample_policy("p1", 5));
        engine.toggle("p1", false);
        assert_eq!(engine.execute(&ctx("transfer_funds", 0)).policy_id, DEFAULT_POLICY_ID);

        engine.toggle("p1", true);
        assert_eq!(engine.execute(&ctx("transfer_funds", 0)).policy_id, "p1");
    }

    #[test]
    fn remove_deletes_a_policy() {
        let mut engine = PolicyEngine::new();
        engine.add(sample_policy("p1", 5));
        engine.remove("p1");
        assert!(engine.policies.is_empty());
    }
}
