//! AgentKern-Arbiter: Orchestrating Facade
//!
//! `ResilientExecutor` wires the ledger, breaker, retry engine, and
//! bandit together for a caller the way `Coordinator` in
//! `coordinator.rs` wires the lock manager and queue together behind
//! one `request` entry point, instead of leaving four components for
//! every call site to hand-assemble.

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bandit::{Arm, Bandit, ContextKey};
use crate::breaker::{CircuitBreakerRegistry, Outcome};
use crate::errors::ArbiterError;
use crate::ledger::Ledger;
use crate::policy::{ErrorInfo, PolicyContext, PolicyEngine};
use crate::recovery::{ActionDescriptor, RecoveryContext, RecoveryRunner};
use crate::retry::RetryEngine;

/// What the caller hands the executor to actually perform the
/// operation, along with how to undo it if a later step fails.
pub trait OperationHandle: Send + Sync {
    fn invoke(&self) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send + '_>>;
}

impl<F, Fut> OperationHandle for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    fn invoke(&self) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send + '_>> {
        Box::pin((self)())
    }
}

pub struct ResilientExecutor {
    pub ledger: Arc<Ledger>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub retry: Arc<RetryEngine>,
    pub bandit: Option<Arc<Bandit>>,
    pub policy: Option<Arc<PolicyEngine>>,
    pub recovery: Option<Arc<RecoveryRunner>>,
}

/// Build the condition-matching context for a failed attempt: the
/// operation's own JSON `context` flattened into the policy's context
/// map, plus the error message the failing attempt produced.
fn build_policy_context(operation: &str, context: &Value, error_message: &str) -> PolicyContext {
    let mut fields = HashMap::new();
    if let Value::Object(map) = context {
        for (key, value) in map {
            fields.insert(key.clone(), value.clone());
        }
    }
    PolicyContext {
        action: operation.to_string(),
        agent_id: String::new(),
        context: fields,
        error: Some(ErrorInfo {
            message: error_message.to_string(),
            ..ErrorInfo::default()
        }),
    }
}

pub struct ExecuteOutcome {
    pub result: Value,
    pub arm: Option<Arm>,
    pub attempts: u32,
}

impl ResilientExecutor {
    pub fn new(
        ledger: Arc<Ledger>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: Arc<RetryEngine>,
    ) -> Self {
        Self {
            ledger,
            breakers,
            retry,
            bandit: None,
            policy: None,
            recovery: None,
        }
    }

    pub fn with_bandit(mut self, bandit: Arc<Bandit>) -> Self {
        self.bandit = Some(bandit);
        self
    }

    /// Wire a policy engine in to drive retry decisions from declarative
    /// conditions instead of the bare retry engine's fixed config.
    pub fn with_policy(mut self, policy: Arc<PolicyEngine>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Wire a recovery runner in; its plan is run best-effort once a
    /// matched policy's `recovery_actions` are exhausted by retries.
    pub fn with_recovery(mut self, recovery: Arc<RecoveryRunner>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// select -> admit -> begin -> invoke -> record, retrying through
    /// the retry engine until the operation succeeds, the breaker
    /// denies admission, or attempts are exhausted. `cancel` lets a
    /// caller abandon a retry loop between attempts.
    pub async fn execute(
        &self,
        operation: &str,
        parameters: Value,
        context: Value,
        context_key: Option<&ContextKey>,
        handle: &dyn OperationHandle,
        cancel: CancellationToken,
    ) -> Result<ExecuteOutcome, ArbiterError> {
        let selected_arm = match &self.bandit {
            Some(bandit) => Some(
                bandit
                    .select(context_key)
                    .map_err(|e| ArbiterError::InvalidInput(e.to_string()))?,
            ),
            None => None,
        };

        let key = self.ledger.generate_key(operation, &parameters, &context);
        let decision = self.ledger.should_execute(&key).await;
        if !decision.execute {
            if let Some(record) = decision.record {
                if record.status == crate::ledger::LedgerStatus::Completed {
                    return Ok(ExecuteOutcome {
                        result: record.result.unwrap_or(Value::Null),
                        arm: selected_arm,
                        attempts: 0,
                    });
                }
            }
            return Err(ArbiterError::OperationFailure(decision.reason));
        }

        let mut attempt: u32 = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(ArbiterError::Cancelled(operation.to_string()));
            }

            let admit = self.breakers.get_or_create(operation).await.admit().await;
            if !admit.allow {
                return Err(ArbiterError::CircuitOpen {
                    name: operation.to_string(),
                });
            }

            let token = self
                .ledger
                .begin(&key, operation, None)
                .await
                .map_err(ArbiterError::from)?;

            let start = Instant::now();
            let outcome = handle.invoke().await;
            let elapsed = start.elapsed();

            let breaker = self.breakers.get_or_create(operation).await;

            match outcome {
                Ok(value) => {
                    breaker.record(Outcome::Success, elapsed).await;
                    self.ledger
                        .complete(&token, value.clone())
                        .await
                        .map_err(ArbiterError::from)?;
                    self.retry.record_outcome(
                        operation,
                        crate::retry::RetryOutcome {
                            success: true,
                            observed_delay: elapsed,
                        },
                    );
                    if let (Some(bandit), Some(arm)) = (&self.bandit, &selected_arm) {
                        let _ = bandit.reward(arm, 1.0, context_key);
                    }
                    return Ok(ExecuteOutcome {
                        result: value,
                        arm: selected_arm,
                        attempts: attempt,
                    });
                }
                Err(message) => {
                    breaker.record(Outcome::Failure, elapsed).await;
                    self.ledger
                        .fail(&token, message.clone())
                        .await
                        .map_err(ArbiterError::from)?;
                    self.retry.record_outcome(
                        operation,
                        crate::retry::RetryOutcome {
                            success: false,
                            observed_delay: elapsed,
                        },
                    );
                    if let (Some(bandit), Some(arm)) = (&self.bandit, &selected_arm) {
                        let _ = bandit.reward(arm, 0.0, context_key);
                    }

                    let policy_decision = self.policy.as_ref().map(|engine| {
                        let policy_ctx = build_policy_context(operation, &context, &message);
                        engine.execute(&policy_ctx)
                    });

                    let next_delay = match &policy_decision {
                        Some(decision) => {
                            if decision.should_retry
                                && attempt + 1 <= decision.retry_config.max_attempts
                            {
                                Some(decision.retry_config.delay(attempt + 1))
                            } else {
                                None
                            }
                        }
                        None => self.retry.next_delay(operation, attempt + 1),
                    };

                    match next_delay {
                        Some(delay) => {
                            tracing::info!(operation, attempt, "retry.sleep");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = cancel.cancelled() => {
                                    return Err(ArbiterError::Cancelled(operation.to_string()));
                                }
                            }
                            attempt += 1;
                        }
                        None => {
                            tracing::warn!(operation, attempt, "retry.give_up");
                            if let (Some(decision), Some(recovery)) =
                                (&policy_decision, &self.recovery)
                            {
                                self.run_recovery_best_effort(operation, &message, decision, recovery)
                                    .await;
                            }
                            return Err(ArbiterError::MaxAttemptsReached {
                                operation: operation.to_string(),
                                attempts: attempt,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Run the matched policy's named recovery actions once retries are
    /// exhausted. Best-effort: logs the outcome but never changes the
    /// `MaxAttemptsReached` error the caller sees.
    async fn run_recovery_best_effort(
        &self,
        operation: &str,
        error_message: &str,
        decision: &crate::policy::PolicyDecision,
        recovery: &RecoveryRunner,
    ) {
        if decision.recovery_actions.is_empty() {
            return;
        }

        let descriptors: Vec<ActionDescriptor> = decision
            .recovery_actions
            .iter()
            .enumerate()
            .map(|(idx, action_type)| ActionDescriptor {
                action_id: format!("{operation}-recovery-{idx}"),
                config: crate::recovery::RecoveryActionConfig {
                    action_type: action_type.clone(),
                    params: Value::Null,
                    max_retries: 0,
                    timeout_ms: None,
                },
                priority: 0,
                prerequisite_action_types: Vec::new(),
            })
            .collect();

        let recovery_ctx = RecoveryContext {
            error_message: error_message.to_string(),
            operation: operation.to_string(),
            metadata: HashMap::new(),
        };

        match recovery.run_plan(descriptors, &recovery_ctx).await {
            Ok(result) => {
                tracing::info!(
                    operation,
                    policy_id = %decision.policy_id,
                    all_succeeded = result.all_succeeded,
                    "recovery.plan_executed"
                );
            }
            Err(e) => {
                tracing::warn!(operation, policy_id = %decision.policy_id, error = %e, "recovery.plan_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitConfig;
    use crate::policy::{Condition, ConditionField, ConditionOperator, ErrorField, Policy, PolicyEngine};
    use crate::recovery::{RecoveryActionHandler, RiskLevel};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor() -> ResilientExecutor {
        ResilientExecutor::new(
            Arc::new(Ledger::new(crate::ledger::default_directory())),
            Arc::new(CircuitBreakerRegistry::new(CircuitConfig::default())),
            Arc::new(RetryEngine::new()),
        )
    }

    #[tokio::test]
    async fn successful_invocation_completes_the_ledger_record() {
        let executor = executor();
        let result = executor
            .execute(
                "fetch",
                Value::from(1),
                Value::Null,
                None,
                &(|| async { Ok(Value::from(42)) }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.result, Value::from(42));
    }

    #[tokio::test]
    async fn repeated_call_with_same_fingerprint_returns_cached_result() {
        let executor = executor();
        let params = Value::from(7);

        executor
            .execute(
                "fetch",
                params.clone(),
                Value::Null,
                None,
                &(|| async { Ok(Value::from("first")) }),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let second = executor
            .execute(
                "fetch",
                params,
                Value::Null,
                None,
                &(|| async { Ok(Value::from("second")) }),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(second.result, Value::from("first"));
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_max_attempts_reached() {
        let executor = ResilientExecutor::new(
            Arc::new(Ledger::new(crate::ledger::default_directory())),
            Arc::new(CircuitBreakerRegistry::new(CircuitConfig::default())),
            Arc::new(RetryEngine::new().with_config(
                "always_fails",
                crate::retry::RetryConfig {
                    strategy: crate::retry::RetryStrategyKind::Fixed,
                    max_attempts: 2,
                    initial_delay: std::time::Duration::from_millis(1),
                    max_delay: std::time::Duration::from_millis(1),
                    multiplier: 1.0,
                    jitter: crate::retry::JitterKind::None,
                },
            )),
        );

        let result = executor
            .execute(
                "always_fails",
                Value::from(1),
                Value::Null,
                None,
                &(|| async { Err("boom".to_string()) }),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(ArbiterError::MaxAttemptsReached { .. })));
    }

    #[tokio::test]
    async fn cancellation_token_aborts_the_retry_loop() {
        let executor = executor();
        let token = CancellationToken::new();
        token.cancel();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = executor
            .execute(
                "cancel-me",
                Value::from(1),
                Value::Null,
                None,
                &(move || {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    async { Err("never gets here".to_string()) }
                }),
                token,
            )
            .await;

        assert!(matches!(result, Err(ArbiterError::Cancelled(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn policy_forbidding_retry_gives_up_after_one_attempt() {
        let mut engine = PolicyEngine::new();
        engine.add(Policy {
            id: "no-retry".into(),
            name: "no-retry".into(),
            description: String::new(),
            priority: 10,
            enabled: true,
            conditions: vec![Condition {
                field: ConditionField::Error(ErrorField::Message),
                operator: ConditionOperator::Contains,
                value: Value::String("boom".into()),
                negate: false,
            }],
            retry_strategy: Some(crate::retry::RetryStrategyKind::Fixed),
            max_attempts: Some(0),
            initial_delay_ms: Some(1),
            recovery_actions: vec![],
            inherit_from: None,
        });

        let executor = ResilientExecutor::new(
            Arc::new(Ledger::new(crate::ledger::default_directory())),
            Arc::new(CircuitBreakerRegistry::new(CircuitConfig::default())),
            Arc::new(RetryEngine::new()),
        )
        .with_policy(Arc::new(engine));

        let result = executor
            .execute(
                "policy-gated",
                Value::from(1),
                Value::Null,
                None,
                &(|| async { Err("boom".to_string()) }),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(ArbiterError::MaxAttemptsReached { attempts: 1, .. })
        ));
    }

    struct RecordingAction {
        ran: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl RecoveryActionHandler for RecordingAction {
        fn can_handle(&self, _context: &crate::recovery::RecoveryContext) -> bool {
            true
        }
        fn estimated_duration(&self) -> std::time::Duration {
            std::time::Duration::from_millis(10)
        }
        fn risk_level(&self) -> RiskLevel {
            RiskLevel::Low
        }
        async fn execute(
            &self,
            _config: &crate::recovery::RecoveryActionConfig,
            _context: &crate::recovery::RecoveryContext,
        ) -> Result<String, String> {
            self.ran.fetch_add(1, Ordering::SeqCst);
            Ok("recovered".into())
        }
    }

    #[tokio::test]
    async fn exhausted_retries_runs_the_matched_policys_recovery_plan() {
        let mut engine = PolicyEngine::new();
        engine.add(Policy {
            id: "recover-me".into(),
            name: "recover-me".into(),
            description: String::new(),
            priority: 10,
            enabled: true,
            conditions: vec![Condition {
                field: ConditionField::Error(ErrorField::Message),
                operator: ConditionOperator::Contains,
                value: Value::String("boom".into()),
                negate: false,
            }],
            retry_strategy: Some(crate::retry::RetryStrategyKind::Fixed),
            max_attempts: Some(1),
            initial_delay_ms: Some(1),
            recovery_actions: vec!["recording_action".into()],
            inherit_from: None,
        });

        let ran = Arc::new(AtomicU32::new(0));
        let recovery = RecoveryRunner::new();
        recovery
            .register("recording_action", Arc::new(RecordingAction { ran: ran.clone() }))
            .await;

        let executor = ResilientExecutor::new(
            Arc::new(Ledger::new(crate::ledger::default_directory())),
            Arc::new(CircuitBreakerRegistry::new(CircuitConfig::default())),
            Arc::new(RetryEngine::new()),
        )
        .with_policy(Arc::new(engine))
        .with_recovery(Arc::new(recovery));

        let result = executor
            .execute(
                "policy-recovered",
                Value::from(1),
                Value::Null,
                None,
                &(|| async { Err("boom".to_string()) }),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(ArbiterError::MaxAttemptsReached { .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
