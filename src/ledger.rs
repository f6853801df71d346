//! AgentKern-Arbiter: Idempotency Ledger
//!
//! Tracks the execution state of fingerprinted operations so that a
//! retried call can recognize "this already happened" instead of
//! re-running a side effect. Records are durable: one JSON file per
//! record, written atomically (temp file + rename) so a crash mid-write
//! never leaves a half-written record behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::errors::LedgerError;

/// Lifecycle state of a ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Completed,
    Failed,
    RolledBack,
}

/// A single durable record of an operation's execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub key: String,
    pub operation: String,
    pub status: LedgerStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub rollback_data: Option<serde_json::Value>,
}

impl LedgerRecord {
    fn new(key: &str, operation: &str, rollback_data: Option<serde_json::Value>) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            operation: operation.to_string(),
            status: LedgerStatus::Pending,
            attempts: 1,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
            rollback_data,
        }
    }

    fn age(&self) -> chrono::Duration {
        Utc::now() - self.updated_at
    }
}

/// Opaque handle returned by `begin`, required by `complete`/`fail`/`rollback`.
#[derive(Debug, Clone)]
pub struct LedgerToken {
    pub key: String,
}

/// Result of asking whether an operation should run.
#[derive(Debug, Clone)]
pub struct ShouldExecute {
    pub execute: bool,
    pub record: Option<LedgerRecord>,
    pub reason: String,
}

/// Aggregate counts across all known records.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerStats {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub rolled_back: usize,
}

/// Tunable thresholds governing ledger record lifecycle. Defaults match
/// the kernel's stated defaults; callers needing different tuning pass
/// a `LedgerConfig` to `Ledger::with_config`.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// A non-pending record (completed/failed/rolled_back) older than
    /// this is treated as expired and discarded regardless of status.
    pub max_age: chrono::Duration,
    /// How long a `Pending` record may sit before it's considered stuck
    /// (crashed mid-flight) rather than genuinely in progress.
    pub stuck_threshold: chrono::Duration,
    /// Failed records become eligible for retry after this much
    /// backoff, doubling with each attempt, capped at `max_backoff`.
    pub base_backoff: chrono::Duration,
    pub max_backoff: chrono::Duration,
    pub max_retry_attempts: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_age: chrono::Duration::hours(24),
            stuck_threshold: chrono::Duration::minutes(10),
            base_backoff: chrono::Duration::seconds(2),
            max_backoff: chrono::Duration::minutes(10),
            max_retry_attempts: 5,
        }
    }
}

/// File-backed idempotency ledger.
///
/// Each key maps to one JSON file under `directory`. A per-key async
/// mutex serializes concurrent access to a single key within this
/// process, standing in for the cross-process file lock a multi-host
/// deployment would need.
pub struct Ledger {
    directory: PathBuf,
    cache: RwLock<HashMap<String, LedgerRecord>>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    config: LedgerConfig,
}

impl Ledger {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self::with_config(directory, LedgerConfig::default())
    }

    pub fn with_config(directory: impl Into<PathBuf>, config: LedgerConfig) -> Self {
        Self {
            directory: directory.into(),
            cache: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn generate_key(
        &self,
        operation: &str,
        parameters: &serde_json::Value,
        context: &serde_json::Value,
    ) -> String {
        crate::fingerprint::generate_key(operation, parameters, context)
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{key}.json"))
    }

    async fn ensure_directory(&self) -> Result<(), LedgerError> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| LedgerError::StorageFailure(e.to_string()))
    }

    /// Write a record atomically: serialize to a temp file in the same
    /// directory, then rename over the final path. Rename is atomic on
    /// the same filesystem, so a reader never observes a partial file.
    async fn persist(&self, record: &LedgerRecord) -> Result<(), LedgerError> {
        self.ensure_directory().await?;
        let final_path = self.record_path(&record.key);
        let tmp_path = self.directory.join(format!("{}.json.tmp", record.key));

        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| LedgerError::StorageFailure(e.to_string()))?;
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| LedgerError::StorageFailure(e.to_string()))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| LedgerError::StorageFailure(e.to_string()))?;

        self.cache
            .write()
            .await
            .insert(record.key.clone(), record.clone());
        Ok(())
    }

    /// Load a record, preferring the in-memory cache; falls back to
    /// disk, treating a corrupt file as "no record" per the module
    /// contract rather than surfacing a parse error.
    async fn load(&self, key: &str) -> Option<LedgerRecord> {
        if let Some(record) = self.cache.read().await.get(key).cloned() {
            return Some(record);
        }

        let path = self.record_path(key);
        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice::<LedgerRecord>(&bytes) {
            Ok(record) => {
                self.cache
                    .write()
                    .await
                    .insert(key.to_string(), record.clone());
                Some(record)
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "corrupt ledger record, treating as absent");
                None
            }
        }
    }

    fn backoff_for(&self, attempts: u32) -> chrono::Duration {
        let scaled = self.config.base_backoff * 2i32.saturating_pow(attempts.saturating_sub(1));
        scaled.min(self.config.max_backoff)
    }

    /// Remove a record from both cache and disk, e.g. once it's expired.
    async fn forget(&self, key: &str) {
        let _ = tokio::fs::remove_file(self.record_path(key)).await;
        self.cache.write().await.remove(key);
    }

    /// Decide whether an operation keyed by `key` should run.
    pub async fn should_execute(&self, key: &str) -> ShouldExecute {
        let Some(record) = self.load(key).await else {
            return ShouldExecute {
                execute: true,
                record: None,
                reason: "no prior record".into(),
            };
        };

        // A non-pending record older than max_age is expired regardless
        // of status: its outcome is no longer trustworthy, so it's
        // discarded and treated as if no record existed at all.
        if record.status != LedgerStatus::Pending && record.age() > self.config.max_age {
            self.forget(key).await;
            return ShouldExecute {
                execute: true,
                record: None,
                reason: "expired".into(),
            };
        }

        match record.status {
            LedgerStatus::Completed => ShouldExecute {
                execute: false,
                record: Some(record),
                reason: "already completed".into(),
            },
            LedgerStatus::RolledBack => ShouldExecute {
                execute: true,
                record: Some(record),
                reason: "previously rolled back, safe to retry".into(),
            },
            LedgerStatus::Pending => {
                if record.age() > self.config.stuck_threshold {
                    ShouldExecute {
                        execute: true,
                        record: Some(record),
                        reason: "stale pending record, treating as stuck".into(),
                    }
                } else {
                    ShouldExecute {
                        execute: false,
                        record: Some(record),
                        reason: "in progress".into(),
                    }
                }
            }
            LedgerStatus::Failed => {
                if record.attempts >= self.config.max_retry_attempts {
                    ShouldExecute {
                        execute: false,
                        record: Some(record),
                        reason: "max retry attempts reached".into(),
                    }
                } else {
                    let wait = self.backoff_for(record.attempts);
                    if record.age() >= wait {
                        ShouldExecute {
                            execute: true,
                            record: Some(record),
                            reason: "failed, backoff elapsed".into(),
                        }
                    } else {
                        ShouldExecute {
                            execute: false,
                            record: Some(record),
                            reason: "failed, backoff not yet elapsed".into(),
                        }
                    }
                }
            }
        }
    }

    /// Begin (or resume) an operation, returning a token for the
    /// matching `complete`/`fail`/`rollback` call.
    pub async fn begin(
        &self,
        key: &str,
        operation: &str,
        rollback_data: Option<serde_json::Value>,
    ) -> Result<LedgerToken, LedgerError> {
        let _guard = self.lock_for(key).await.lock_owned().await;

        let record = match self.load(key).await {
            Some(mut existing) => {
                existing.attempts += 1;
                existing.status = LedgerStatus::Pending;
                existing.updated_at = Utc::now();
                if rollback_data.is_some() {
                    existing.rollback_data = rollback_data;
                }
                existing
            }
            None => LedgerRecord::new(key, operation, rollback_data),
        };

        self.persist(&record).await?;
        tracing::info!(key, operation, attempts = record.attempts, "ledger.transition pending");

        Ok(LedgerToken {
            key: key.to_string(),
        })
    }

    async fn transition(
        &self,
        token: &LedgerToken,
        status: LedgerStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), LedgerError> {
        let guard = self.lock_for(&token.key).await;
        let _lock = guard.lock_owned().await;

        let mut record = self
            .load(&token.key)
            .await
            .ok_or_else(|| LedgerError::NotFound(token.key.clone()))?;

        record.status = status;
        record.updated_at = Utc::now();
        record.result = result;
        record.error = error;

        self.persist(&record).await?;
        tracing::info!(key = %token.key, status = ?status, "ledger.transition");
        Ok(())
    }

    pub async fn complete(
        &self,
        token: &LedgerToken,
        result: serde_json::Value,
    ) -> Result<(), LedgerError> {
        self.transition(token, LedgerStatus::Completed, Some(result), None)
            .await
    }

    pub async fn fail(&self, token: &LedgerToken, error: String) -> Result<(), LedgerError> {
        self.transition(token, LedgerStatus::Failed, None, Some(error))
            .await
    }

    /// Mark a record rolled back after running `undo_fn` to reverse
    /// whatever side effect `begin`'s `rollback_data` described.
    pub async fn rollback<F, Fut>(&self, token: &LedgerToken, undo_fn: F) -> Result<(), LedgerError>
    where
        F: FnOnce(Option<serde_json::Value>) -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        let rollback_data = self
            .load(&token.key)
            .await
            .and_then(|r| r.rollback_data.clone());

        undo_fn(rollback_data)
            .await
            .map_err(LedgerError::StorageFailure)?;

        self.transition(token, LedgerStatus::RolledBack, None, None)
            .await
    }

    /// Load every `*.json` record file under `directory` into the cache,
    /// including ones this process has never touched via `get`/`begin`.
    /// Aggregate operations (`cleanup`, `stats`, `records_for`) call this
    /// first so they reflect what's actually durable, not just what
    /// happens to already be warm in memory — otherwise a fresh `Ledger`
    /// opened over an existing directory would report an empty ledger.
    async fn load_all(&self) {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(_) => return,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(key) = name.strip_suffix(".json") else {
                continue;
            };
            if self.cache.read().await.contains_key(key) {
                continue;
            }
            self.load(key).await;
        }
    }

    /// Remove records whose last transition is older than `max_age`.
    /// Returns the number of records removed, both on disk and cache.
    pub async fn cleanup(&self, max_age: chrono::Duration) -> usize {
        self.load_all().await;
        let keys: Vec<String> = self.cache.read().await.keys().cloned().collect();
        let mut removed = 0;
        for key in keys {
            if let Some(record) = self.load(&key).await {
                if record.age() > max_age {
                    self.forget(&key).await;
                    removed += 1;
                }
            }
        }
        removed
    }

    pub async fn get(&self, key: &str) -> Option<LedgerRecord> {
        self.load(key).await
    }

    pub async fn records_for(&self, operation: &str) -> Vec<LedgerRecord> {
        self.load_all().await;
        self.cache
            .read()
            .await
            .values()
            .filter(|r| r.operation == operation)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> LedgerStats {
        self.load_all().await;
        let cache = self.cache.read().await;
        let mut stats = LedgerStats::default();
        for record in cache.values() {
            stats.total += 1;
            match record.status {
                LedgerStatus::Pending => stats.pending += 1,
                LedgerStatus::Completed => stats.completed += 1,
                LedgerStatus::Failed => stats.failed += 1,
                LedgerStatus::RolledBack => stats.rolled_back += 1,
            }
        }
        stats
    }
}

/// Generate a fresh ledger-scratch directory under the OS temp dir, used
/// by tests and by `ArbiterConfig::default()`.
pub fn default_directory() -> PathBuf {
    std::env::temp_dir().join(format!("agentkern-arbiter-ledger-{}", Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_ledger() -> Ledger {
        Ledger::new(default_directory())
    }

    #[tokio::test]
    async fn no_prior_record_allows_execution() {
        let ledger = temp_ledger();
        let decision = ledger.should_execute("fresh-key").await;
        assert!(decision.execute);
        assert!(decision.record.is_none());
    }

    #[tokio::test]
    async fn completed_record_blocks_re_execution() {
        let ledger = temp_ledger();
        let token = ledger.begin("k1", "fetch", None).await.unwrap();
        ledger.complete(&token, json!({"ok": true})).await.unwrap();

        let decision = ledger.should_execute("k1").await;
        assert!(!decision.execute);
        assert_eq!(decision.record.unwrap().status, LedgerStatus::Completed);
    }

    #[tokio::test]
    async fn pending_record_blocks_concurrent_retry() {
        let ledger = temp_ledger();
        ledger.begin("k2", "fetch", None).await.unwrap();

        let decision = ledger.should_execute("k2").await;
        assert!(!decision.execute);
        assert_eq!(decision.reason, "in progress");
    }

    #[tokio::test]
    async fn failed_record_blocked_until_backoff_elapses() {
        let ledger = temp_ledger();
        let token = ledger.begin("k3", "fetch", None).await.unwrap();
        ledger.fail(&token, "boom".into()).await.unwrap();

        let decision = ledger.should_execute("k3").await;
        assert!(!decision.execute);
        assert_eq!(decision.reason, "failed, backoff not yet elapsed");
    }

    #[tokio::test]
    async fn failed_record_exceeding_max_attempts_is_not_eligible() {
        let ledger = temp_ledger();
        let mut token = ledger.begin("k4", "fetch", None).await.unwrap();
        for _ in 0..LedgerConfig::default().max_retry_attempts {
            ledger.fail(&token, "boom".into()).await.unwrap();
            token = ledger.begin("k4", "fetch", None).await.unwrap();
        }
        ledger.fail(&token, "boom".into()).await.unwrap();

        let decision = ledger.should_execute("k4").await;
        assert!(!decision.execute);
        assert_eq!(decision.reason, "max retry attempts reached");
    }

    #[tokio::test]
    async fn stale_non_pending_record_is_expired_regardless_of_status() {
        let ledger = Ledger::with_config(
            default_directory(),
            LedgerConfig {
                max_age: chrono::Duration::milliseconds(10),
                ..LedgerConfig::default()
            },
        );
        let token = ledger.begin("k7", "fetch", None).await.unwrap();
        ledger.complete(&token, json!({"ok": true})).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let decision = ledger.should_execute("k7").await;
        assert!(decision.execute);
        assert_eq!(decision.reason, "expired");
        assert!(decision.record.is_none());
        assert!(ledger.get("k7").await.is_none());
    }

    #[tokio::test]
    async fn stuck_pending_record_uses_stuck_threshold_not_max_age() {
        let ledger = Ledger::with_config(
            default_directory(),
            LedgerConfig {
                stuck_threshold: chrono::Duration::milliseconds(10),
                ..LedgerConfig::default()
            },
        );
        ledger.begin("k8", "fetch", None).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let decision = ledger.should_execute("k8").await;
        assert!(decision.execute);
        assert_eq!(decision.reason, "stale pending record, treating as stuck");
    }

    #[tokio::test]
    async fn rolled_back_record_is_safe_to_retry() {
        let ledger = temp_ledger();
        let token = ledger
            .begin("k5", "fetch", Some(json!({"undo": "me"})))
            .await
            .unwrap();
        ledger
            .rollback(&token, |_data| async move { Ok(()) })
            .await
            .unwrap();

        let decision = ledger.should_execute("k5").await;
        assert!(decision.execute);
    }

    #[tokio::test]
    async fn records_survive_a_fresh_ledger_instance_over_the_same_directory() {
        let dir = default_directory();
        let ledger = Ledger::new(dir.clone());
        let token = ledger.begin("k6", "fetch", None).await.unwrap();
        ledger.complete(&token, json!({"ok": true})).await.unwrap();

        let reopened = Ledger::new(dir);
        let record = reopened.get("k6").await.unwrap();
        assert_eq!(record.status, LedgerStatus::Completed);
    }

    #[tokio::test]
    async fn stats_reflect_disk_contents_after_a_fresh_ledger_instance() {
        let dir = default_directory();
        let ledger = Ledger::new(dir.clone());
        let t1 = ledger.begin("r1", "op", None).await.unwrap();
        ledger.complete(&t1, json!({})).await.unwrap();
        let t2 = ledger.begin("r2", "op", None).await.unwrap();
        ledger.fail(&t2, "e".into()).await.unwrap();

        let reopened = Ledger::new(dir);
        let stats = reopened.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);

        let records = reopened.records_for("op").await;
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_removes_stale_disk_records_never_loaded_this_process() {
        let dir = default_directory();
        let ledger = Ledger::new(dir.clone());
        let token = ledger.begin("c1", "op", None).await.unwrap();
        ledger.complete(&token, json!({})).await.unwrap();

        let reopened = Ledger::new(dir);
        let removed = reopened.cleanup(chrono::Duration::zero()).await;
        assert_eq!(removed, 1);
        assert!(reopened.get("c1").await.is_none());
    }

    #[tokio::test]
    async fn stats_tally_by_status() {
        let ledger = temp_ledger();
        let t1 = ledger.begin("s1", "op", None).await.unwrap();
        ledger.complete(&t1, json!({})).await.unwrap();
        let t2 = ledger.begin("s2", "op", None).await.unwrap();
        ledger.fail(&t2, "e".into()).await.unwrap();
        ledger.begin("s3", "op", None).await.unwrap();

        let stats = ledger.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn complete_on_unknown_token_returns_not_found() {
        let ledger = temp_ledger();
        let token = LedgerToken {
            key: "ghost".into(),
        };
        let result = ledger.complete(&token, json!({})).await;
        assert!(matches!(result, Err(LedgerError::NotFound(_))));
    }
}
