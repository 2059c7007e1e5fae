//! In-memory outbox implementation for testing.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - Merge serialization uses a per-key `tokio::sync::Mutex` in place of an advisory lock

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use recalc_core::OutboxTaskId;

use super::{
    DeadLetter, EnqueueResult, FailureOutcome, NewOutboxTask, Outbox, OutboxConfig, OutboxTask,
    TaskStatus, backoff_delay,
};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::plan::{SeedGroup, merge_seed_groups};

#[derive(Debug, Default)]
struct OutboxState {
    tasks: BTreeMap<OutboxTaskId, OutboxTask>,
    overflow: HashMap<OutboxTaskId, Vec<SeedGroup>>,
    dead: Vec<DeadLetter>,
}

impl OutboxState {
    /// Moves oversized seed sets to the overflow table.
    fn spill(&mut self, task_id: OutboxTaskId, inline_limit: usize) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if task.seed_record_count() > inline_limit {
            let seeds = std::mem::take(&mut task.seed_groups);
            self.overflow.insert(task_id, seeds);
        }
    }

    /// Keeps one pending task per merge key: a pending task sharing `key` with the
    /// rescheduled `task_id` is folded into it and removed.
    fn fold_pending_sibling(&mut self, task_id: OutboxTaskId, key: &str, inline_limit: usize) {
        let sibling_id = self
            .tasks
            .values()
            .find(|t| t.id != task_id && t.status == TaskStatus::Pending && t.merge_key() == key)
            .map(|t| t.id);
        let Some(sibling) = sibling_id.and_then(|id| self.hydrated(&id)) else {
            return;
        };
        self.tasks.remove(&sibling.id);
        self.overflow.remove(&sibling.id);
        let overflow = self.overflow.remove(&task_id).unwrap_or_default();
        if let Some(stored) = self.tasks.get_mut(&task_id) {
            stored.seed_groups.extend(overflow);
            stored.absorb_sibling(sibling);
        }
        self.spill(task_id, inline_limit);
    }

    /// Returns a copy of the task with overflow seeds folded back in.
    fn hydrated(&self, task_id: &OutboxTaskId) -> Option<OutboxTask> {
        let mut task = self.tasks.get(task_id)?.clone();
        if let Some(extra) = self.overflow.get(task_id) {
            task.seed_groups = merge_seed_groups(task.seed_groups.drain(..).chain(extra.iter().cloned()));
        }
        Some(task)
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// In-memory outbox.
#[derive(Debug)]
pub struct InMemoryOutbox {
    config: OutboxConfig,
    state: Mutex<OutboxState>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    metrics: EngineMetrics,
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::new(OutboxConfig::default())
    }
}

impl InMemoryOutbox {
    /// Creates an empty outbox.
    #[must_use]
    pub fn new(config: OutboxConfig) -> Self {
        Self {
            config,
            state: Mutex::new(OutboxState::default()),
            key_locks: Mutex::new(HashMap::new()),
            metrics: EngineMetrics::new(),
        }
    }

    fn key_lock(&self, key: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self.key_locks.lock().map_err(poison_err)?;
        Ok(Arc::clone(locks.entry(key.to_string()).or_default()))
    }

    /// Drops the per-key lock once no other enqueue holds or awaits it.
    fn release_key_lock(&self, key: &str, key_lock: &Arc<tokio::sync::Mutex<()>>) -> Result<()> {
        let mut locks = self.key_locks.lock().map_err(poison_err)?;
        // The map and `key_lock` are the only owners.
        if Arc::strong_count(key_lock) == 2 {
            locks.remove(key);
        }
        Ok(())
    }

    /// Number of merge keys with a live lock entry.
    #[cfg(test)]
    fn key_lock_count(&self) -> usize {
        self.key_locks.lock().map_or(0, |locks| locks.len())
    }

    /// Merges `task` into the pending task for `key`, or stores it. Callers hold the
    /// key lock.
    fn merge_or_insert(&self, task: NewOutboxTask, key: &str) -> Result<EnqueueResult> {
        let now = Utc::now();
        let mut state = self.state.lock().map_err(poison_err)?;
        let existing = state
            .tasks
            .values()
            .find(|t| t.status == TaskStatus::Pending && t.merge_key() == key)
            .map(|t| t.id);
        let result = match existing {
            Some(task_id) => {
                let overflow = state.overflow.remove(&task_id).unwrap_or_default();
                if let Some(stored) = state.tasks.get_mut(&task_id) {
                    stored.seed_groups.extend(overflow);
                    stored.absorb(task, now);
                }
                state.spill(task_id, self.config.inline_seed_limit);
                EnqueueResult { task_id, merged: true }
            }
            None => {
                let stored = task.into_task(self.config.max_attempts, now);
                let task_id = stored.id;
                state.tasks.insert(task_id, stored);
                state.spill(task_id, self.config.inline_seed_limit);
                EnqueueResult { task_id, merged: false }
            }
        };
        Ok(result)
    }

    /// Returns a task with its seeds rehydrated.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn get(&self, task_id: &OutboxTaskId) -> Result<Option<OutboxTask>> {
        Ok(self.state.lock().map_err(poison_err)?.hydrated(task_id))
    }

    /// Returns every live task, oldest id first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn tasks(&self) -> Result<Vec<OutboxTask>> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state.tasks.keys().filter_map(|id| state.hydrated(id)).collect())
    }

    /// Returns true if the task's seeds are stored in the overflow table.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn has_overflow(&self, task_id: &OutboxTaskId) -> Result<bool> {
        Ok(self.state.lock().map_err(poison_err)?.overflow.contains_key(task_id))
    }

    /// Makes a pending task due now, skipping its backoff.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] if the task does not exist.
    pub fn force_due(&self, task_id: &OutboxTaskId) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or(Error::TaskNotFound { task_id: *task_id })?;
        task.next_run_at = Utc::now();
        Ok(())
    }

    fn claim_due(&self, worker_id: &str, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboxTask>> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let mut due: Vec<(DateTime<Utc>, OutboxTaskId)> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.next_run_at <= now)
            .map(|t| (t.next_run_at, t.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(task) = state.tasks.get_mut(&id) {
                task.status = TaskStatus::Processing;
                task.locked_at = Some(now);
                task.locked_by = Some(worker_id.to_string());
                task.updated_at = now;
            }
            if let Some(task) = state.hydrated(&id) {
                claimed.push(task);
            }
        }
        Ok(claimed)
    }
}

#[async_trait]
impl Outbox for InMemoryOutbox {
    #[tracing::instrument(skip(self, task), fields(kind = task.payload.kind().as_str(), table = %task.table_id))]
    async fn enqueue_or_merge(&self, task: NewOutboxTask) -> Result<EnqueueResult> {
        let key = task.merge_key();
        let kind = task.payload.kind();
        let key_lock = self.key_lock(&key)?;
        let result = {
            let _guard = key_lock.lock().await;
            self.merge_or_insert(task, &key)
        };
        self.release_key_lock(&key, &key_lock)?;
        let result = result?;

        self.metrics.record_enqueue(kind.as_str(), result.merged);
        tracing::debug!(task = %result.task_id, merged = result.merged, "enqueued outbox task");
        Ok(result)
    }

    async fn claim_batch(&self, worker_id: &str, limit: usize) -> Result<Vec<OutboxTask>> {
        self.claim_due(worker_id, limit, Utc::now())
    }

    async fn mark_done(&self, task_id: &OutboxTaskId) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.overflow.remove(task_id);
        state
            .tasks
            .remove(task_id)
            .map(|_| ())
            .ok_or(Error::TaskNotFound { task_id: *task_id })
    }

    async fn mark_failed(&self, task: &OutboxTask, error: &str) -> Result<FailureOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock().map_err(poison_err)?;
        let stored = state
            .tasks
            .get_mut(&task.id)
            .ok_or(Error::TaskNotFound { task_id: task.id })?;

        let previous = stored.attempts;
        let attempts = previous + 1;
        stored.attempts = attempts;
        stored.last_error = Some(error.to_string());
        stored.locked_at = None;
        stored.locked_by = None;
        stored.updated_at = now;

        if attempts < stored.max_attempts {
            let delay = backoff_delay(&self.config, previous);
            let next_run_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            stored.status = TaskStatus::Pending;
            stored.next_run_at = next_run_at;
            let key = stored.merge_key();
            state.fold_pending_sibling(task.id, &key, self.config.inline_seed_limit);
            return Ok(FailureOutcome::Rescheduled { attempts, next_run_at });
        }

        stored.status = TaskStatus::Dead;
        let dead = state.hydrated(&task.id);
        state.tasks.remove(&task.id);
        state.overflow.remove(&task.id);
        if let Some(dead) = dead {
            state.dead.push(DeadLetter {
                task: dead,
                error: error.to_string(),
                failed_at: now,
            });
        }
        Ok(FailureOutcome::DeadLettered { attempts })
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state.dead.iter().rev().take(limit).cloned().collect())
    }

    async fn pending_count(&self) -> Result<u64> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recalc_core::{FieldId, RecordId, TableId, WorkspaceId};

    use crate::plan::ChangeType;

    fn seed(records: &[&str]) -> NewOutboxTask {
        NewOutboxTask::seed(
            WorkspaceId::new("bse1"),
            TableId::new("tblA"),
            vec![FieldId::new("fldA")],
            vec![SeedGroup::new(TableId::new("tblA"), records.iter().map(|r| RecordId::new(*r)))],
            ChangeType::Update,
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn rescheduled_task_absorbs_newer_pending_work() -> Result<()> {
        let outbox = InMemoryOutbox::new(OutboxConfig {
            backoff_base_ms: 0,
            jitter_percent: 0,
            ..OutboxConfig::default()
        });
        let first = outbox.enqueue_or_merge(seed(&["rec1"])).await?;
        let claimed = outbox.claim_batch("worker-1", 10).await?;
        let newer = outbox.enqueue_or_merge(seed(&["rec2"])).await?;
        assert!(!newer.merged);

        let outcome = outbox.mark_failed(&claimed[0], "boom").await?;
        assert!(matches!(outcome, FailureOutcome::Rescheduled { attempts: 1, .. }));

        let tasks = outbox.tasks()?;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, first.task_id);
        assert_eq!(tasks[0].attempts, 1);
        assert_eq!(tasks[0].seed_record_count(), 2);
        assert_eq!(outbox.pending_count().await?, 1);

        let merged = outbox.enqueue_or_merge(seed(&["rec3"])).await?;
        assert_eq!(merged.task_id, first.task_id);
        assert!(merged.merged);
        Ok(())
    }

    #[tokio::test]
    async fn merge_key_locks_are_released_after_enqueue() -> Result<()> {
        let outbox = InMemoryOutbox::default();
        let (a, b) = tokio::join!(
            outbox.enqueue_or_merge(seed(&["rec1"])),
            outbox.enqueue_or_merge(seed(&["rec2"]))
        );
        assert_eq!(a?.task_id, b?.task_id);
        assert_eq!(outbox.key_lock_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn pending_tasks_merge_and_claimed_tasks_do_not() -> Result<()> {
        let outbox = InMemoryOutbox::default();
        let first = outbox.enqueue_or_merge(seed(&["rec1"])).await?;
        let second = outbox.enqueue_or_merge(seed(&["rec2", "rec1"])).await?;
        assert!(!first.merged);
        assert!(second.merged);
        assert_eq!(first.task_id, second.task_id);
        assert_eq!(outbox.pending_count().await?, 1);

        let claimed = outbox.claim_batch("worker-1", 10).await?;
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].seed_record_count(), 2);
        assert_eq!(claimed[0].locked_by.as_deref(), Some("worker-1"));

        let third = outbox.enqueue_or_merge(seed(&["rec3"])).await?;
        assert!(!third.merged);
        assert_eq!(outbox.pending_count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn failures_back_off_then_dead_letter() -> Result<()> {
        let outbox = InMemoryOutbox::new(OutboxConfig {
            max_attempts: 2,
            jitter_percent: 0,
            ..OutboxConfig::default()
        });
        let id = outbox.enqueue_or_merge(seed(&["rec1"])).await?.task_id;

        let task = outbox.claim_batch("w", 1).await?.remove(0);
        let outcome = outbox.mark_failed(&task, "boom").await?;
        assert!(matches!(outcome, FailureOutcome::Rescheduled { attempts: 1, .. }));
        assert!(outbox.claim_batch("w", 1).await?.is_empty());

        outbox.force_due(&id)?;
        let task = outbox.claim_batch("w", 1).await?.remove(0);
        let outcome = outbox.mark_failed(&task, "boom again").await?;
        assert_eq!(outcome, FailureOutcome::DeadLettered { attempts: 2 });
        assert!(outbox.get(&id)?.is_none());

        let dead = outbox.list_dead_letters(10).await?;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error, "boom again");
        assert_eq!(dead[0].task.status, TaskStatus::Dead);
        Ok(())
    }

    #[tokio::test]
    async fn large_seed_sets_overflow_and_rehydrate() -> Result<()> {
        let outbox = InMemoryOutbox::new(OutboxConfig {
            inline_seed_limit: 2,
            ..OutboxConfig::default()
        });
        let id = outbox.enqueue_or_merge(seed(&["rec1", "rec2"])).await?.task_id;
        assert!(!outbox.has_overflow(&id)?);
        outbox.enqueue_or_merge(seed(&["rec3"])).await?;
        assert!(outbox.has_overflow(&id)?);

        let claimed = outbox.claim_batch("w", 1).await?;
        assert_eq!(claimed[0].seed_record_count(), 3);

        outbox.mark_done(&id).await?;
        assert!(!outbox.has_overflow(&id)?);
        assert!(matches!(outbox.mark_done(&id).await, Err(Error::TaskNotFound { .. })));
        Ok(())
    }
}
