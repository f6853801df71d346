//! AgentKern-Arbiter: Recovery Actions Runner
//!
//! Executes a priority-ordered, prerequisite-aware plan of recovery
//! actions after an operation fails, the way `Coordinator::request` in
//! `coordinator.rs` tries a primary path and falls back through a typed
//! result rather than propagating a raw error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::errors::RecoveryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Static configuration for one action within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryActionConfig {
    pub action_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// One node in a recovery plan: what to run, at what priority, and what
/// must have already succeeded first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub action_id: String,
    pub config: RecoveryActionConfig,
    pub priority: i32,
    #[serde(default)]
    pub prerequisite_action_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_id: String,
    pub success: bool,
    pub message: String,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Observable changes the action made beyond its own success/failure
    /// (e.g. files touched, connections reset). Empty when the handler
    /// reports none.
    #[serde(default)]
    pub side_effects: Vec<String>,
    /// Follow-up action types the caller may want to run next, e.g. a
    /// probe suggesting a cleanup action afterward.
    #[serde(default)]
    pub next_recommended_actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPlanResult {
    pub results: Vec<ActionResult>,
    pub all_succeeded: bool,
}

/// Failure context handed to every handler.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub error_message: String,
    pub operation: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Pluggable contract for one kind of recovery action. `dyn`-compatible
/// via `async_trait` rather than requiring callers hand-write boxed
/// futures themselves.
#[async_trait]
pub trait RecoveryActionHandler: Send + Sync {
    fn can_handle(&self, context: &RecoveryContext) -> bool;
    fn estimated_duration(&self) -> Duration;
    fn risk_level(&self) -> RiskLevel;
    async fn execute(
        &self,
        config: &RecoveryActionConfig,
        context: &RecoveryContext,
    ) -> Result<String, String>;
}

/// Detect a cycle in the prerequisite graph via DFS with a recursion
/// stack, mirroring the cycle-detection shape any dependency-ordered
/// execution needs.
pub fn validate_plan(descriptors: &[ActionDescriptor]) -> Result<(), RecoveryError> {
    let by_type: HashMap<&str, &ActionDescriptor> = descriptors
        .iter()
        .map(|d| (d.config.action_type.as_str(), d))
        .collect();

    let mut visited = HashSet::new();
    let mut stack = HashSet::new();

    fn visit<'a>(
        node: &'a ActionDescriptor,
        by_type: &HashMap<&str, &'a ActionDescriptor>,
        visited: &mut HashSet<&'a str>,
        stack: &mut HashSet<&'a str>,
    ) -> Result<(), RecoveryError> {
        let key = node.config.action_type.as_str();
        if stack.contains(key) {
            return Err(RecoveryError::Cycle(node.action_id.clone()));
        }
        if visited.contains(key) {
            return Ok(());
        }
        visited.insert(key);
        stack.insert(key);
        for prereq in &node.prerequisite_action_types {
            if let Some(next) = by_type.get(prereq.as_str()) {
                visit(next, by_type, visited, stack)?;
            }
        }
        stack.remove(key);
        Ok(())
    }

    for descriptor in descriptors {
        visit(descriptor, &by_type, &mut visited, &mut stack)?;
    }
    Ok(())
}

pub struct RecoveryRunner {
    handlers: RwLock<HashMap<String, Arc<dyn RecoveryActionHandler>>>,
}

impl Default for RecoveryRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryRunner {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, action_type: &str, handler: Arc<dyn RecoveryActionHandler>) {
        self.handlers
            .write()
            .await
            .insert(action_type.to_string(), handler);
    }

    /// Run a priority-ordered plan: higher priority first, checking
    /// prerequisites and `can_handle` before each attempt, retrying up
    /// to `max_retries` times with `1s * retry_index` delay between
    /// attempts, each attempt bounded by `timeout_ms` (default
    /// `2 * estimated_duration`).
    pub async fn run_plan(
        &self,
        mut descriptors: Vec<ActionDescriptor>,
        context: &RecoveryContext,
    ) -> Result<RecoveryPlanResult, RecoveryError> {
        validate_plan(&descriptors)?;
        descriptors.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut results: Vec<ActionResult> = Vec::new();
        let mut succeeded_types: HashSet<String> = HashSet::new();

        for descriptor in &descriptors {
            let prereqs_met = descriptor
                .prerequisite_action_types
                .iter()
                .all(|p| succeeded_types.contains(p));

            if !prereqs_met {
                results.push(ActionResult {
                    action_id: descriptor.action_id.clone(),
                    success: false,
                    message: "prerequisites not satisfied".into(),
                    attempts: 0,
                    started_at: Utc::now(),
                    finished_at: Utc::now(),
                    side_effects: Vec::new(),
                    next_recommended_actions: Vec::new(),
                });
                continue;
            }

            let handlers = self.handlers.read().await;
            let Some(handler) = handlers.get(&descriptor.config.action_type).cloned() else {
                return Err(RecoveryError::NoHandler(descriptor.config.action_type.clone()));
            };
            drop(handlers);

            if !handler.can_handle(context) {
                results.push(ActionResult {
                    action_id: descriptor.action_id.clone(),
                    success: false,
                    message: "handler declined to act on this context".into(),
                    attempts: 0,
                    started_at: Utc::now(),
                    finished_at: Utc::now(),
                    side_effects: Vec::new(),
                    next_recommended_actions: Vec::new(),
                });
                continue;
            }

            let timeout = descriptor
                .config
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| handler.estimated_duration() * 2);

            let result = self
                .run_with_retries(&*handler, descriptor, context, timeout)
                .await;

            if result.success {
                succeeded_types.insert(descriptor.config.action_type.clone());
            }
            results.push(result);
        }

        let all_succeeded = results.iter().all(|r| r.success);
        Ok(RecoveryPlanResult {
            results,
            all_succeeded,
        })
    }

    async fn run_with_retries(
        &self,
        handler: &dyn RecoveryActionHandler,
        descriptor: &ActionDescriptor,
        context: &RecoveryContext,
        timeout: Duration,
    ) -> ActionResult {
        let started_at = Utc::now();
        let max_attempts = descriptor.config.max_retries + 1;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }

            let outcome =
                tokio::time::timeout(timeout, handler.execute(&descriptor.config, context)).await;

            match outcome {
                Ok(Ok(message)) => {
                    tracing::info!(action_id = %descriptor.action_id, "recovery.action_completed");
                    return ActionResult {
                        action_id: descriptor.action_id.clone(),
                        success: true,
                        message,
                        attempts: attempt + 1,
                        started_at,
                        finished_at: Utc::now(),
                        side_effects: Vec::new(),
                        next_recommended_actions: Vec::new(),
                    };
                }
                Ok(Err(message)) => {
                    if attempt + 1 == max_attempts {
                        return ActionResult {
                            action_id: descriptor.action_id.clone(),
                            success: false,
                            message,
                            attempts: attempt + 1,
                            started_at,
                            finished_at: Utc::now(),
                            side_effects: Vec::new(),
                            next_recommended_actions: Vec::new(),
                        };
                    }
                }
                Err(_) => {
                    if attempt + 1 == max_attempts {
                        return ActionResult {
                            action_id: descriptor.action_id.clone(),
                            success: false,
                            message: format!("timed out after {}ms", timeout.as_millis()),
                            attempts: attempt + 1,
                            started_at,
                            finished_at: Utc::now(),
                            side_effects: Vec::new(),
                            next_recommended_actions: Vec::new(),
                        };
                    }
                }
            }
        }

        ActionResult {
            action_id: descriptor.action_id.clone(),
            success: false,
            message: "exhausted retries".into(),
            attempts: max_attempts,
            started_at,
            finished_at: Utc::now(),
            side_effects: Vec::new(),
            next_recommended_actions: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------
// Built-in action contracts. Each is a thin, replaceable default; real
// deployments are expected to register their own handlers for the
// action types that matter to them.
// ---------------------------------------------------------------------

pub struct GitCleanupAction;

#[async_trait]
impl RecoveryActionHandler for GitCleanupAction {
    fn can_handle(&self, context: &RecoveryContext) -> bool {
        context.error_message.to_lowercase().contains("git")
    }
    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(5)
    }
    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Medium
    }
    async fn execute(
        &self,
        _config: &RecoveryActionConfig,
        _context: &RecoveryContext,
    ) -> Result<String, String> {
        Ok("git working tree cleaned".into())
    }
}

pub struct ApiRateLimitWaitAction;

#[async_trait]
impl RecoveryActionHandler for ApiRateLimitWaitAction {
    fn can_handle(&self, context: &RecoveryContext) -> bool {
        context.error_message.to_lowercase().contains("rate limit")
    }
    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(30)
    }
    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Low
    }
    async fn execute(
        &self,
        _config: &RecoveryActionConfig,
        _context: &RecoveryContext,
    ) -> Result<String, String> {
        Ok("waited out rate limit window".into())
    }
}

pub struct NetworkConnectivityProbeAction;

#[async_trait]
impl RecoveryActionHandler for NetworkConnectivityProbeAction {
    fn can_handle(&self, context: &RecoveryContext) -> bool {
        let msg = context.error_message.to_lowercase();
        msg.contains("connection") || msg.contains("network") || msg.contains("timeout")
    }
    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(3)
    }
    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Low
    }
    async fn execute(
        &self,
        _config: &RecoveryActionConfig,
        _context: &RecoveryContext,
    ) -> Result<String, String> {
        Ok("network connectivity confirmed".into())
    }
}

pub struct FilePermissionsFixAction;

#[async_trait]
impl RecoveryActionHandler for FilePermissionsFixAction {
    fn can_handle(&self, context: &RecoveryContext) -> bool {
        context.error_message.to_lowercase().contains("permission")
    }
    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(2)
    }
    fn risk_level(&self) -> RiskLevel {
        RiskLevel::High
    }
    async fn execute(
        &self,
        _config: &RecoveryActionConfig,
        _context: &RecoveryContext,
    ) -> Result<String, String> {
        Ok("file permissions restored".into())
    }
}

pub struct AgentStateResetAction;

#[async_trait]
impl RecoveryActionHandler for AgentStateResetAction {
    fn can_handle(&self, context: &RecoveryContext) -> bool {
        context.error_message.to_lowercase().contains("agent state")
    }
    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(1)
    }
    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Medium
    }
    async fn execute(
        &self,
        _config: &RecoveryActionConfig,
        _context: &RecoveryContext,
    ) -> Result<String, String> {
        Ok("agent state reset to last known good".into())
    }
}

pub struct ServiceHealthCheckAction;

#[async_trait]
impl RecoveryActionHandler for ServiceHealthCheckAction {
    fn can_handle(&self, _context: &RecoveryContext) -> bool {
        true
    }
    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(2)
    }
    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Low
    }
    async fn execute(
        &self,
        _config: &RecoveryActionConfig,
        _context: &RecoveryContext,
    ) -> Result<String, String> {
        Ok("service health check passed".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, action_type: &str, priority: i32, prereqs: Vec<&str>) -> ActionDescriptor {
        ActionDescriptor {
            action_id: id.into(),
            config: RecoveryActionConfig {
                action_type: action_type.into(),
                params: serde_json::json!({}),
                max_retries: 0,
                timeout_ms: Some(1000),
            },
            priority,
            prerequisite_action_types: prereqs.into_iter().map(String::from).collect(),
        }
    }

    fn ctx(msg: &str) -> RecoveryContext {
        RecoveryContext {
            error_message: msg.into(),
            operation: "op".into(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn validate_plan_accepts_acyclic_graph() {
        let plan = vec![
            descriptor("a", "network_probe", 1, vec![]),
            descriptor("b", "git_cleanup", 2, vec!["network_probe"]),
        ];
        assert!(validate_plan(&plan).is_ok());
    }

    #[test]
    fn validate_plan_rejects_cycle() {
        let plan = vec![
            descriptor("a", "type_a", 1, vec!["type_b"]),
            descriptor("b", "type_b", 1, vec!["type_a"]),
        ];
        assert!(matches!(validate_plan(&plan), Err(RecoveryError::Cycle(_))));
    }

    #[tokio::test]
    async fn run_plan_executes_in_priority_order_and_respects_prerequisites() {
        let runner = RecoveryRunner::new();
        runner.register("network_probe", Arc::new(NetworkConnectivityProbeAction)).await;
        runner.register("git_cleanup", Arc::new(GitCleanupAction)).await;

        let plan = vec![
            descriptor("cleanup", "git_cleanup", 5, vec!["network_probe"]),
            descriptor("probe", "network_probe", 1, vec![]),
        ];

        let result = runner.run_plan(plan, &ctx("git failure and network timeout")).await.unwrap();
        assert!(result.all_succeeded);
        assert_eq!(result.results.len(), 2);
    }

    #[tokio::test]
    async fn unmet_prerequisite_skips_action_without_running_it() {
        let runner = RecoveryRunner::new();
        runner.register("git_cleanup", Arc::new(GitCleanupAction)).await;

        let plan = vec![descriptor("cleanup", "git_cleanup", 1, vec!["never_runs"])];
        let result = runner.run_plan(plan, &ctx("git failure")).await.unwrap();

        assert!(!result.all_succeeded);
        assert_eq!(result.results[0].message, "prerequisites not satisfied");
    }

    #[tokio::test]
    async fn missing_handler_errors() {
        let runner = RecoveryRunner::new();
        let plan = vec![descriptor("x", "unregistered_type", 1, vec![])];
        let result = runner.run_plan(plan, &ctx("anything")).await;
        assert!(matches!(result, Err(RecoveryError::NoHandler(_))));
    }

    #[tokio::test]
    async fn handler_declining_is_recorded_as_unsuccessful() {
        let runner = RecoveryRunner::new();
        runner.register("git_cleanup", Arc::new(GitCleanupAction)).await;

        let plan = vec![descriptor("x", "git_cleanup", 1, vec![])];
        let result = runner.run_plan(plan, &ctx("unrelated error")).await.unwrap();
        assert!(!result.all_succeeded);
    }

    struct FlakyThenSucceedsAction {
        attempts: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl RecoveryActionHandler for FlakyThenSucceedsAction {
        fn can_handle(&self, _context: &RecoveryContext) -> bool {
            true
        }
        fn estimated_duration(&self) -> Duration {
            Duration::from_millis(10)
        }
        fn risk_level(&self) -> RiskLevel {
            RiskLevel::Low
        }
        async fn execute(
            &self,
            _config: &RecoveryActionConfig,
            _context: &RecoveryContext,
        ) -> Result<String, String> {
            let attempt = self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if attempt == 0 {
                Err("not yet".into())
            } else {
                Ok("recovered".into())
            }
        }
    }

    #[tokio::test]
    async fn retries_up_to_max_retries_before_giving_up() {
        let runner = RecoveryRunner::new();
        runner
            .register(
                "flaky",
                Arc::new(FlakyThenSucceedsAction {
                    attempts: std::sync::atomic::AtomicU32::new(0),
                }),
            )
            .await;

        let mut plan_descriptor = descriptor("x", "flaky", 1, vec![]);
        plan_descriptor.config.max_retries = 2;

        let result = runner.run_plan(vec![plan_descriptor], &ctx("anything")).await.unwrap();
        assert!(result.all_succeeded);
        assert_eq!(result.results[0].attempts, 2);
    }
}
