//! Lock coordinator: serializes overlapping propagation runs.
//!
//! A [`LockPlan`] is derived from a plan's seed groups and taken through the compute
//! transaction's advisory-lock primitive before any dirty state is touched. Locks are
//! transaction scoped, so they release on commit or rollback.
//!
//! # Granularity
//!
//! Per table group, in order of preference:
//!
//! 1. one **record** lock per seed record, while the group has at most
//!    `max_record_locks` records
//! 2. one **batch** lock per non-empty shard, `hash(record) mod batch_shard_count`
//! 3. a single **table** lock, when sharding is disabled (`batch_shard_count == 0`)
//!
//! Two runs touching the same record share a key only when both pick the same
//! granularity for that table under the same configuration. A run taking record locks
//! does not exclude one taking batch locks on the same rows. Keys are sorted before
//! acquisition so concurrent runs take them in the same order.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use recalc_core::{RecordId, TableId, WorkspaceId};

use crate::error::Result;
use crate::metrics::EngineMetrics;
use crate::plan::SeedGroup;
use crate::store::ComputeTransaction;

/// Lock coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Whether to take any locks.
    pub enabled: bool,
    /// Largest group locked record by record.
    pub max_record_locks: usize,
    /// Shards per table for oversized groups; 0 falls back to a table lock.
    pub batch_shard_count: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_record_locks: 100,
            batch_shard_count: 64,
        }
    }
}

/// Granularity of one lock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockScope {
    /// One record.
    Record,
    /// One shard of a table.
    Batch,
    /// A whole table.
    Table,
}

/// Overall granularity of a lock plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Locking is turned off.
    Disabled,
    /// Nothing to lock.
    None,
    /// Record locks only.
    Record,
    /// Batch locks only.
    Batch,
    /// Table locks only.
    Table,
    /// Groups chose different granularities.
    Mixed,
}

impl LockMode {
    /// Stable name used in metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::None => "none",
            Self::Record => "record",
            Self::Batch => "batch",
            Self::Table => "table",
            Self::Mixed => "mixed",
        }
    }

    const fn from_scope(scope: LockScope) -> Self {
        match scope {
            LockScope::Record => Self::Record,
            LockScope::Batch => Self::Batch,
            LockScope::Table => Self::Table,
        }
    }
}

/// One advisory lock key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockKey {
    /// Key passed to the advisory-lock primitive.
    pub key: String,
    /// Granularity.
    pub scope: LockScope,
}

/// Locks to take before executing a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPlan {
    /// Overall granularity.
    pub mode: LockMode,
    /// Keys, sorted and deduplicated.
    pub keys: Vec<LockKey>,
}

impl LockPlan {
    /// A plan that takes nothing.
    #[must_use]
    pub const fn empty(mode: LockMode) -> Self {
        Self {
            mode,
            keys: Vec::new(),
        }
    }

    /// Returns true if there is nothing to acquire.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Lock key of one record.
#[must_use]
pub fn record_lock_key(workspace_id: &WorkspaceId, table_id: &TableId, record_id: &RecordId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workspace_id.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(table_id.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(record_id.as_str().as_bytes());
    format!("recalc:record:{}", hex::encode(hasher.finalize()))
}

/// Shard of a record, stable across processes.
#[must_use]
pub fn record_shard(record_id: &RecordId, shard_count: u32) -> u32 {
    if shard_count == 0 {
        return 0;
    }
    let digest = Sha256::digest(record_id.as_str().as_bytes());
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let shard = u64::from_be_bytes(prefix) % u64::from(shard_count);
    u32::try_from(shard).unwrap_or(0)
}

/// Lock key of one shard.
#[must_use]
pub fn batch_lock_key(workspace_id: &WorkspaceId, table_id: &TableId, shard: u32) -> String {
    format!("recalc:batch:{workspace_id}:{table_id}:{shard}")
}

/// Lock key of a table.
#[must_use]
pub fn table_lock_key(workspace_id: &WorkspaceId, table_id: &TableId) -> String {
    format!("recalc:table:{workspace_id}:{table_id}")
}

/// Derives the locks for a set of seed groups.
#[must_use]
pub fn build_lock_plan(workspace_id: &WorkspaceId, groups: &[SeedGroup], config: &LockConfig) -> LockPlan {
    if !config.enabled {
        return LockPlan::empty(LockMode::Disabled);
    }

    let mut keys: BTreeSet<LockKey> = BTreeSet::new();
    let mut scopes: BTreeSet<LockScope> = BTreeSet::new();
    for group in groups.iter().filter(|g| !g.record_ids.is_empty()) {
        let table_id = &group.table_id;
        if group.record_ids.len() <= config.max_record_locks {
            scopes.insert(LockScope::Record);
            keys.extend(group.record_ids.iter().map(|record_id| LockKey {
                key: record_lock_key(workspace_id, table_id, record_id),
                scope: LockScope::Record,
            }));
        } else if config.batch_shard_count > 0 {
            scopes.insert(LockScope::Batch);
            let shards: BTreeSet<u32> = group
                .record_ids
                .iter()
                .map(|record_id| record_shard(record_id, config.batch_shard_count))
                .collect();
            keys.extend(shards.into_iter().map(|shard| LockKey {
                key: batch_lock_key(workspace_id, table_id, shard),
                scope: LockScope::Batch,
            }));
        } else {
            scopes.insert(LockScope::Table);
            keys.insert(LockKey {
                key: table_lock_key(workspace_id, table_id),
                scope: LockScope::Table,
            });
        }
    }

    let mode = match scopes.len() {
        0 => LockMode::None,
        1 => scopes.first().map_or(LockMode::None, |s| LockMode::from_scope(*s)),
        _ => LockMode::Mixed,
    };
    let mut keys: Vec<LockKey> = keys.into_iter().collect();
    keys.sort_by(|a, b| a.key.cmp(&b.key));
    keys.dedup_by(|a, b| a.key == b.key);
    LockPlan { mode, keys }
}

/// Takes every key of `plan` in order.
///
/// # Errors
///
/// Returns an error if the store fails to take a lock.
#[tracing::instrument(skip(tx, plan, metrics), fields(mode = plan.mode.as_str(), keys = plan.keys.len()))]
pub async fn acquire_lock_plan(
    tx: &mut dyn ComputeTransaction,
    plan: &LockPlan,
    metrics: &EngineMetrics,
) -> Result<()> {
    for key in &plan.keys {
        tx.advisory_lock(&key.key).await?;
    }
    metrics.observe_lock_keys(plan.mode.as_str(), plan.keys.len());
    tracing::debug!("acquired propagation locks");
    Ok(())
}
