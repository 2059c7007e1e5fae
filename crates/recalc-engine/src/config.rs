//! Engine configuration.
//!
//! Every section has working defaults. [`EngineConfig::from_env`] overrides them from
//! `RECALC_*` environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `RECALC_GRAPH_BATCH_SIZE` | `graph.batch_size` |
//! | `RECALC_GRAPH_MAX_ITERATIONS` | `graph.max_iterations` |
//! | `RECALC_GRAPH_MAX_VISITED` | `graph.max_visited` |
//! | `RECALC_CYCLE_POLICY` | `planner.cycle_policy` (`error` or `skip`) |
//! | `RECALC_LOCKS_ENABLED` | `locks.enabled` |
//! | `RECALC_MAX_RECORD_LOCKS` | `locks.max_record_locks` |
//! | `RECALC_BATCH_SHARD_COUNT` | `locks.batch_shard_count` |
//! | `RECALC_SEED_BATCH_SIZE` | `executor.seed_batch_size` |
//! | `RECALC_MAX_PROPAGATION_ITERATIONS` | `executor.max_propagation_iterations` |
//! | `RECALC_COLLECT_CHANGES` | `executor.collect_changes` |
//! | `RECALC_OUTBOX_MAX_ATTEMPTS` | `outbox.max_attempts` |
//! | `RECALC_OUTBOX_BACKOFF_BASE_MS` | `outbox.backoff_base_ms` |
//! | `RECALC_OUTBOX_BACKOFF_MAX_MS` | `outbox.backoff_max_ms` |
//! | `RECALC_OUTBOX_JITTER_PERCENT` | `outbox.jitter_percent` |
//! | `RECALC_OUTBOX_INLINE_SEED_LIMIT` | `outbox.inline_seed_limit` |
//! | `RECALC_WORKER_ID` | `worker.worker_id` |
//! | `RECALC_WORKER_BATCH_SIZE` | `worker.batch_size` |
//! | `RECALC_WORKER_POLL_INTERVAL_MS` | `worker.poll_interval_ms` |
//! | `RECALC_WORKER_MAX_LEVELS_PER_STAGE` | `worker.max_levels_per_stage` |
//! | `RECALC_MAX_STAGE_DEPTH` | `worker.max_stage_depth` |
//! | `RECALC_MAX_SYNC_LEVELS` | `sync.max_sync_levels` |
//! | `RECALC_MAX_SYNC_COMPLEXITY` | `sync.max_sync_complexity` |
//! | `RECALC_INLINE_DISPATCH_DELAY_MS` | `sync.inline_dispatch_delay_ms` |
//! | `RECALC_RETRY_MAX_ATTEMPTS` | `retry.max_attempts` |
//! | `RECALC_RETRY_BASE_DELAY_MS` | `retry.base_delay_ms` |
//! | `RECALC_RETRY_MAX_DELAY_MS` | `retry.max_delay_ms` |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::executor::ExecutorConfig;
use crate::graph::GraphLoadConfig;
use crate::lock::LockConfig;
use crate::outbox::OutboxConfig;
use crate::plan::CyclePolicy;
use crate::planner::PlannerConfig;
use crate::retry::RetryPolicy;
use crate::worker::WorkerConfig;

/// How much of a change the service executes before deferring to the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Plan levels executed in the caller's request; 0 runs the whole plan.
    pub max_sync_levels: usize,
    /// Plans whose estimated complexity exceeds this are deferred entirely.
    pub max_sync_complexity: usize,
    /// Delay before the inline dispatcher drains deferred work, in milliseconds.
    pub inline_dispatch_delay_ms: u64,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_sync_levels: 4,
            max_sync_complexity: 10_000,
            inline_dispatch_delay_ms: 50,
        }
    }
}

impl SyncPolicy {
    /// Inline dispatch delay as a duration.
    #[must_use]
    pub const fn inline_dispatch_delay(&self) -> Duration {
        Duration::from_millis(self.inline_dispatch_delay_ms)
    }
}

/// All engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Graph loading bounds.
    pub graph: GraphLoadConfig,
    /// Planner settings.
    pub planner: PlannerConfig,
    /// Lock coordinator settings.
    pub locks: LockConfig,
    /// Executor settings.
    pub executor: ExecutorConfig,
    /// Outbox settings.
    pub outbox: OutboxConfig,
    /// Worker settings.
    pub worker: WorkerConfig,
    /// Synchronous execution policy.
    pub sync: SyncPolicy,
    /// Retry policy for transient store failures.
    pub retry: RetryPolicy,
}

impl EngineConfig {
    /// Loads defaults overridden by `RECALC_*` environment variables, then validates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if a variable cannot be parsed or the result is
    /// inconsistent.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Like [`Self::from_env`], reading variables through `vars`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if a variable cannot be parsed or the result is
    /// inconsistent.
    #[allow(clippy::too_many_lines)]
    pub fn from_vars(vars: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = &vars;
        let mut config = Self::default();

        if let Some(v) = env_usize(vars, "RECALC_GRAPH_BATCH_SIZE")? {
            config.graph.batch_size = v;
        }
        if let Some(v) = env_usize(vars, "RECALC_GRAPH_MAX_ITERATIONS")? {
            config.graph.max_iterations = v;
        }
        if let Some(v) = env_usize(vars, "RECALC_GRAPH_MAX_VISITED")? {
            config.graph.max_visited = v;
        }
        if let Some(v) = env_string(vars, "RECALC_CYCLE_POLICY") {
            config.planner.cycle_policy = parse_cycle_policy("RECALC_CYCLE_POLICY", &v)?;
        }

        if let Some(v) = env_bool(vars, "RECALC_LOCKS_ENABLED")? {
            config.locks.enabled = v;
        }
        if let Some(v) = env_usize(vars, "RECALC_MAX_RECORD_LOCKS")? {
            config.locks.max_record_locks = v;
        }
        if let Some(v) = env_u32(vars, "RECALC_BATCH_SHARD_COUNT")? {
            config.locks.batch_shard_count = v;
        }

        if let Some(v) = env_usize(vars, "RECALC_SEED_BATCH_SIZE")? {
            config.executor.seed_batch_size = v;
        }
        if let Some(v) = env_usize(vars, "RECALC_MAX_PROPAGATION_ITERATIONS")? {
            config.executor.max_propagation_iterations = v;
        }
        if let Some(v) = env_bool(vars, "RECALC_COLLECT_CHANGES")? {
            config.executor.collect_changes = v;
        }

        if let Some(v) = env_u32(vars, "RECALC_OUTBOX_MAX_ATTEMPTS")? {
            config.outbox.max_attempts = v;
        }
        if let Some(v) = env_u64(vars, "RECALC_OUTBOX_BACKOFF_BASE_MS")? {
            config.outbox.backoff_base_ms = v;
        }
        if let Some(v) = env_u64(vars, "RECALC_OUTBOX_BACKOFF_MAX_MS")? {
            config.outbox.backoff_max_ms = v;
        }
        if let Some(v) = env_u32(vars, "RECALC_OUTBOX_JITTER_PERCENT")? {
            config.outbox.jitter_percent = v;
        }
        if let Some(v) = env_usize(vars, "RECALC_OUTBOX_INLINE_SEED_LIMIT")? {
            config.outbox.inline_seed_limit = v;
        }

        if let Some(v) = env_string(vars, "RECALC_WORKER_ID") {
            config.worker.worker_id = v;
        }
        if let Some(v) = env_usize(vars, "RECALC_WORKER_BATCH_SIZE")? {
            config.worker.batch_size = v;
        }
        if let Some(v) = env_u64(vars, "RECALC_WORKER_POLL_INTERVAL_MS")? {
            config.worker.poll_interval_ms = v;
        }
        if let Some(v) = env_usize(vars, "RECALC_WORKER_MAX_LEVELS_PER_STAGE")? {
            config.worker.max_levels_per_stage = v;
        }
        if let Some(v) = env_u32(vars, "RECALC_MAX_STAGE_DEPTH")? {
            config.worker.max_stage_depth = v;
        }

        if let Some(v) = env_usize(vars, "RECALC_MAX_SYNC_LEVELS")? {
            config.sync.max_sync_levels = v;
        }
        if let Some(v) = env_usize(vars, "RECALC_MAX_SYNC_COMPLEXITY")? {
            config.sync.max_sync_complexity = v;
        }
        if let Some(v) = env_u64(vars, "RECALC_INLINE_DISPATCH_DELAY_MS")? {
            config.sync.inline_dispatch_delay_ms = v;
        }

        if let Some(v) = env_u32(vars, "RECALC_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = env_u64(vars, "RECALC_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay_ms = v;
        }
        if let Some(v) = env_u64(vars, "RECALC_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects inconsistent settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("graph.batch_size", self.graph.batch_size),
            ("graph.max_iterations", self.graph.max_iterations),
            ("executor.seed_batch_size", self.executor.seed_batch_size),
            ("executor.max_propagation_iterations", self.executor.max_propagation_iterations),
            ("worker.batch_size", self.worker.batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::validation(format!("{name} must be greater than 0")));
            }
        }
        if self.locks.batch_shard_count == 0 {
            return Err(Error::validation("locks.batch_shard_count must be greater than 0"));
        }
        if self.outbox.max_attempts == 0 {
            return Err(Error::validation("outbox.max_attempts must be greater than 0"));
        }
        if self.outbox.backoff_base_ms > self.outbox.backoff_max_ms {
            return Err(Error::validation(format!(
                "outbox.backoff_base_ms ({}) exceeds outbox.backoff_max_ms ({})",
                self.outbox.backoff_base_ms, self.outbox.backoff_max_ms
            )));
        }
        if self.outbox.jitter_percent > 100 {
            return Err(Error::validation("outbox.jitter_percent must be at most 100"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::validation("retry.max_attempts must be greater than 0"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::validation(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.worker.worker_id.trim().is_empty() {
            return Err(Error::validation("worker.worker_id must not be empty"));
        }
        Ok(())
    }
}

type Vars<'a> = &'a dyn Fn(&str) -> Option<String>;

fn env_string(vars: Vars<'_>, name: &str) -> Option<String> {
    vars(name).and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u32(vars: Vars<'_>, name: &str) -> Result<Option<u32>> {
    let Some(v) = env_string(vars, name) else {
        return Ok(None);
    };
    v.parse::<u32>()
        .map(Some)
        .map_err(|e| Error::validation(format!("{name} must be a u32: {e}")))
}

fn env_u64(vars: Vars<'_>, name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(vars, name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::validation(format!("{name} must be a u64: {e}")))
}

fn env_usize(vars: Vars<'_>, name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(vars, name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| Error::validation(format!("{name} must be a usize: {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::validation(format!("{name} must be a boolean (true/false/1/0)"))),
    }
}

fn env_bool(vars: Vars<'_>, name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(vars, name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

fn parse_cycle_policy(name: &str, value: &str) -> Result<CyclePolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "error" => Ok(CyclePolicy::Error),
        "skip" => Ok(CyclePolicy::Skip),
        _ => Err(Error::validation(format!("{name} must be one of: error, skip (got {value})"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<EngineConfig> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        EngineConfig::from_vars(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
        assert_eq!(from_pairs(&[]).unwrap(), EngineConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = from_pairs(&[
            ("RECALC_CYCLE_POLICY", "error"),
            ("RECALC_LOCKS_ENABLED", "no"),
            ("RECALC_BATCH_SHARD_COUNT", "16"),
            ("RECALC_OUTBOX_MAX_ATTEMPTS", "3"),
            ("RECALC_WORKER_ID", "  worker-7 "),
            ("RECALC_MAX_STAGE_DEPTH", "4"),
            ("RECALC_MAX_SYNC_LEVELS", "0"),
            ("RECALC_GRAPH_BATCH_SIZE", ""),
        ])
        .unwrap();
        assert_eq!(config.planner.cycle_policy, CyclePolicy::Error);
        assert!(!config.locks.enabled);
        assert_eq!(config.locks.batch_shard_count, 16);
        assert_eq!(config.outbox.max_attempts, 3);
        assert_eq!(config.worker.worker_id, "worker-7");
        assert_eq!(config.worker.max_stage_depth, 4);
        assert_eq!(config.sync.max_sync_levels, 0);
        assert_eq!(config.graph.batch_size, GraphLoadConfig::default().batch_size);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = from_pairs(&[("RECALC_OUTBOX_MAX_ATTEMPTS", "many")]).unwrap_err();
        assert!(err.to_string().contains("RECALC_OUTBOX_MAX_ATTEMPTS"));
        assert!(from_pairs(&[("RECALC_COLLECT_CHANGES", "maybe")]).is_err());
        assert!(from_pairs(&[("RECALC_CYCLE_POLICY", "ignore")]).is_err());
    }

    #[test]
    fn inconsistent_settings_are_rejected() {
        assert!(from_pairs(&[("RECALC_SEED_BATCH_SIZE", "0")]).is_err());
        assert!(from_pairs(&[("RECALC_OUTBOX_MAX_ATTEMPTS", "0")]).is_err());
        assert!(
            from_pairs(&[
                ("RECALC_OUTBOX_BACKOFF_BASE_MS", "10000"),
                ("RECALC_OUTBOX_BACKOFF_MAX_MS", "500"),
            ])
            .is_err()
        );
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"worker": {"max_stage_depth": 2}, "sync": {"max_sync_levels": 1}}"#).unwrap();
        assert_eq!(config.worker.max_stage_depth, 2);
        assert_eq!(config.worker.batch_size, WorkerConfig::default().batch_size);
        assert_eq!(config.sync.max_sync_levels, 1);
        assert_eq!(config.outbox, OutboxConfig::default());
    }
}
