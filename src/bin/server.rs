//! AgentKern-Arbiter Server
//!
//! Thin demonstration surface over the resilience kernel: health,
//! ledger stats, breaker metrics, and bandit arm status as read-only
//! JSON, plus an `/execute` endpoint showing the facade end to end.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agentkern_arbiter::{
    AgentStateResetAction, ApiRateLimitWaitAction, ArbiterConfig, Bandit, BanditConfig,
    CircuitBreakerRegistry, ExecuteOutcome, FilePermissionsFixAction,
    GitCleanupAction, Ledger, LedgerStats, NetworkConnectivityProbeAction, OperationHandle,
    PolicyEngine, PolicyEngineConfig, RecoveryRunner, ResilientExecutor, RetryEngine,
    ServiceHealthCheckAction,
};

struct AppState {
    executor: ResilientExecutor,
    breakers: Arc<CircuitBreakerRegistry>,
    bandit: Arc<Bandit>,
    ledger: Arc<Ledger>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    operation: String,
    #[serde(default)]
    parameters: serde_json::Value,
    #[serde(default)]
    context: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ExecuteResponse {
    result: serde_json::Value,
    arm: Option<String>,
    attempts: u32,
}

impl From<ExecuteOutcome> for ExecuteResponse {
    fn from(outcome: ExecuteOutcome) -> Self {
        Self {
            result: outcome.result,
            arm: outcome.arm.map(|a| a.to_string()),
            attempts: outcome.attempts,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ArbiterConfig::default();
    let ledger = Arc::new(Ledger::with_config(
        config.ledger_directory.clone(),
        config.ledger.to_ledger_config(),
    ));
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.to_circuit_config()));
    let bandit = Arc::new(Bandit::with_default_arms(BanditConfig::default()));
    let retry = Arc::new(RetryEngine::new());

    let recovery = RecoveryRunner::new();
    recovery.register("git_cleanup", Arc::new(GitCleanupAction)).await;
    recovery.register("api_rate_limit_wait", Arc::new(ApiRateLimitWaitAction)).await;
    recovery.register("network_probe", Arc::new(NetworkConnectivityProbeAction)).await;
    recovery.register("file_permissions_fix", Arc::new(FilePermissionsFixAction)).await;
    recovery.register("agent_state_reset", Arc::new(AgentStateResetAction)).await;
    recovery.register("service_health_check", Arc::new(ServiceHealthCheckAction)).await;

    let policy = PolicyEngine::load(PolicyEngineConfig::default());

    let executor = ResilientExecutor::new(ledger.clone(), breakers.clone(), retry)
        .with_bandit(bandit.clone())
        .with_policy(Arc::new(policy))
        .with_recovery(Arc::new(recovery));

    let state = Arc::new(AppState {
        executor,
        breakers,
        bandit,
        ledger,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/execute", post(execute))
        .route("/ledger/stats", get(ledger_stats))
        .route("/breaker/:name", get(breaker_metrics))
        .route("/bandit/select", get(bandit_select))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3003".to_string());
    let addr = format!("0.0.0.0:{}", port);

    tracing::info!("arbiter server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn execute(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, StatusCode> {
    let handle: &dyn OperationHandle = &(|| {
        let params = req.parameters.clone();
        async move { Ok(params) }
    });

    state
        .executor
        .execute(
            &req.operation,
            req.parameters.clone(),
            req.context.clone(),
            None,
            handle,
            tokio_util::sync::CancellationToken::new(),
        )
        .await
        .map(|outcome| Json(outcome.into()))
        .map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)
}

async fn ledger_stats(State(state): State<Arc<AppState>>) -> Json<LedgerStats> {
    Json(state.ledger.stats().await)
}

async fn breaker_metrics(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Json<serde_json::Value> {
    let breaker = state.breakers.get_or_create(&name).await;
    let metrics = breaker.metrics().await;
    Json(serde_json::json!({
        "name": name,
        "state": format!("{:?}", breaker.state()),
        "total_calls": metrics.total_calls,
        "error_rate": metrics.error_rate,
    }))
}

async fn bandit_select(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, StatusCode> {
    state
        .bandit
        .select(None)
        .map(|arm| Json(serde_json::json!({"arm": arm.to_string()})))
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}
