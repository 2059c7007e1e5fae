//! # recalc-engine
//!
//! Incremental propagation of computed-field values across linked tables.
//!
//! When a record changes, only the computed fields that depend on the change, and
//! only the rows those fields live on, are recomputed:
//!
//! - **Graph**: Field-level dependency graph loaded through a
//!   [`recalc_core::catalog::FieldCatalog`]
//! - **Planning**: Leveled update steps, cross-table propagation edges, same-table
//!   batches and cycle diagnostics, identified by a deterministic plan hash
//! - **Locking**: Per-record, per-shard or per-table advisory locks derived from the
//!   seed records
//! - **Execution**: Transaction-scoped dirty sets propagated to a fixed point, then
//!   bulk updates level by level
//! - **Outbox**: Durable, mergeable continuations with backoff, dead-lettering and a
//!   polling worker that runs multi-stage cascades
//!
//! ## Guarantees
//!
//! - **Deterministic**: The same schema and change always produce the same plan hash
//! - **Ordered**: Steps run in non-decreasing level order, after propagation settles
//! - **Terminating**: Propagation and cascades are bounded by iteration and depth caps
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use recalc_core::catalog::InMemoryCatalog;
//! use recalc_engine::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let catalog = Arc::new(InMemoryCatalog::new());
//! let service = ComputedUpdateService::builder(
//!     catalog,
//!     Arc::new(InMemoryRecordStore::new()),
//!     Arc::new(InMemoryOutbox::default()),
//! )
//! .build()?;
//!
//! let worker = service.worker();
//! let report = worker.run_once().await?;
//! assert_eq!(report.claimed, 0);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

// Internal modules - not exposed in public API.
pub(crate) mod cascade;
pub(crate) mod dag;

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod lock;
pub mod metrics;
pub mod outbox;
pub mod plan;
pub mod planner;
pub mod retry;
pub mod service;
pub mod store;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{EngineConfig, SyncPolicy};
    pub use crate::dispatch::InlineDispatcher;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::events::{InMemoryChangeSink, NoopChangeSink, RecordChange, RecordChangeSink};
    pub use crate::executor::{DirtyStats, ExecutionOutcome, Executor, ExecutorConfig};
    pub use crate::graph::{DependencyGraph, GraphBuilder, GraphLoadConfig};
    pub use crate::lock::{LockConfig, LockMode, LockPlan, build_lock_plan};
    pub use crate::metrics::EngineMetrics;
    pub use crate::outbox::memory::InMemoryOutbox;
    pub use crate::outbox::{
        EnqueueResult, FailureOutcome, NewOutboxTask, Outbox, OutboxConfig, OutboxTask, TaskPayload, TaskStatus,
    };
    pub use crate::plan::{ChangeType, CyclePolicy, PropagationMode, SeedGroup, UpdatePlan, UpdateStep};
    pub use crate::planner::{ImpactHint, PlanRequest, Planner, PlannerConfig};
    pub use crate::retry::{RetryPolicy, with_retry};
    pub use crate::service::{ComputedUpdateService, ExecutionReport};
    pub use crate::store::memory::InMemoryRecordStore;
    pub use crate::store::{ComputeTransaction, RecordStore};
    pub use crate::worker::{BatchReport, OutboxWorker, WorkerConfig};
}

pub use error::{Error, Result};
pub use service::ComputedUpdateService;
