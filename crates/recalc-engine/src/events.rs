//! Record-change notifications.
//!
//! Executors collect before/after values for updated rows; the service hands them to a
//! [`RecordChangeSink`]. Publishing is best effort: failures are logged, never retried.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use recalc_core::{FieldId, RecordId, TableId};

use crate::error::{Error, Result};

/// Old and new value of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    /// Field that changed.
    pub field_id: FieldId,
    /// Value before the update.
    pub old_value: Value,
    /// Value after the update.
    pub new_value: Value,
}

/// Changes applied to one row by one update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordChange {
    /// Table of the row.
    pub table_id: TableId,
    /// Row id.
    pub record_id: RecordId,
    /// Row version before the update.
    pub old_version: u64,
    /// Row version after the update.
    pub new_version: u64,
    /// Fields whose value differs.
    pub fields: Vec<FieldChange>,
}

/// Receives batches of record changes.
#[async_trait]
pub trait RecordChangeSink: Send + Sync {
    /// Publishes one batch.
    async fn publish(&self, changes: &[RecordChange]) -> Result<()>;
}

/// Publishes and logs (rather than returns) any failure.
pub async fn publish_best_effort(sink: &dyn RecordChangeSink, changes: &[RecordChange]) {
    if changes.is_empty() {
        return;
    }
    if let Err(error) = sink.publish(changes).await {
        tracing::warn!(%error, count = changes.len(), "failed to publish record changes");
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopChangeSink;

#[async_trait]
impl RecordChangeSink for NoopChangeSink {
    async fn publish(&self, _changes: &[RecordChange]) -> Result<()> {
        Ok(())
    }
}

/// Sink that keeps every batch in memory, for tests.
#[derive(Debug, Default)]
pub struct InMemoryChangeSink {
    batches: Mutex<Vec<Vec<RecordChange>>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("change sink lock poisoned")
}

impl InMemoryChangeSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every published batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn batches(&self) -> Result<Vec<Vec<RecordChange>>> {
        Ok(self.batches.lock().map_err(poison_err)?.clone())
    }

    /// Returns every published change, flattened.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn changes(&self) -> Result<Vec<RecordChange>> {
        Ok(self.batches()?.into_iter().flatten().collect())
    }
}

#[async_trait]
impl RecordChangeSink for InMemoryChangeSink {
    async fn publish(&self, changes: &[RecordChange]) -> Result<()> {
        self.batches.lock().map_err(poison_err)?.push(changes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingSink;

    #[async_trait]
    impl RecordChangeSink for FailingSink {
        async fn publish(&self, _changes: &[RecordChange]) -> Result<()> {
            Err(Error::storage("broker unavailable"))
        }
    }

    fn change() -> RecordChange {
        RecordChange {
            table_id: TableId::new("tblBugs"),
            record_id: RecordId::new("rec1"),
            old_version: 1,
            new_version: 2,
            fields: vec![FieldChange {
                field_id: FieldId::new("fldComponentName"),
                old_value: json!(["core"]),
                new_value: json!(["engine"]),
            }],
        }
    }

    #[tokio::test]
    async fn in_memory_sink_keeps_batches() -> Result<()> {
        let sink = InMemoryChangeSink::new();
        publish_best_effort(&sink, &[change()]).await;
        publish_best_effort(&sink, &[]).await;
        assert_eq!(sink.batches()?.len(), 1);
        assert_eq!(sink.changes()?[0].new_version, 2);
        Ok(())
    }

    #[tokio::test]
    async fn publish_failures_are_swallowed() {
        publish_best_effort(&FailingSink, &[change()]).await;
    }
}
