//! Observability metrics for propagation.
//!
//! Metrics go through the `metrics` crate facade; install any recorder (for example a
//! Prometheus exporter) in the embedding binary to export them.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `recalc_plans_total` | Counter | `change_type` | Plans built |
//! | `recalc_plan_cycles_total` | Counter | - | Plans that dropped cyclic fields |
//! | `recalc_steps_executed_total` | Counter | `mode` | Steps executed (single or batched) |
//! | `recalc_step_duration_seconds` | Histogram | `mode` | Step execution time |
//! | `recalc_dirty_records` | Histogram | - | Dirty rows after propagation |
//! | `recalc_lock_keys` | Histogram | `mode` | Lock keys acquired per plan |
//! | `recalc_outbox_enqueued_total` | Counter | `kind`, `result` | Outbox enqueues (inserted or merged) |
//! | `recalc_outbox_tasks_total` | Counter | `outcome` | Outbox task outcomes |
//! | `recalc_stage_depth_truncated_total` | Counter | - | Cascades stopped at the depth cap |

use std::time::{Duration, Instant};

use metrics::{counter, histogram};

use crate::plan::ChangeType;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Plans built.
    pub const PLANS_TOTAL: &str = "recalc_plans_total";
    /// Counter: Plans that dropped cyclic fields.
    pub const PLAN_CYCLES_TOTAL: &str = "recalc_plan_cycles_total";
    /// Counter: Steps executed.
    pub const STEPS_EXECUTED_TOTAL: &str = "recalc_steps_executed_total";
    /// Histogram: Step execution time in seconds.
    pub const STEP_DURATION_SECONDS: &str = "recalc_step_duration_seconds";
    /// Histogram: Dirty rows after propagation.
    pub const DIRTY_RECORDS: &str = "recalc_dirty_records";
    /// Histogram: Lock keys acquired per plan.
    pub const LOCK_KEYS: &str = "recalc_lock_keys";
    /// Counter: Outbox enqueues.
    pub const OUTBOX_ENQUEUED_TOTAL: &str = "recalc_outbox_enqueued_total";
    /// Counter: Outbox task outcomes.
    pub const OUTBOX_TASKS_TOTAL: &str = "recalc_outbox_tasks_total";
    /// Counter: Cascades stopped at the depth cap.
    pub const STAGE_DEPTH_TRUNCATED_TOTAL: &str = "recalc_stage_depth_truncated_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Change type (insert, update, delete).
    pub const CHANGE_TYPE: &str = "change_type";
    /// Execution or lock mode.
    pub const MODE: &str = "mode";
    /// Outbox task kind.
    pub const KIND: &str = "kind";
    /// Result (inserted, merged).
    pub const RESULT: &str = "result";
    /// Task outcome (done, rescheduled, dead).
    pub const OUTCOME: &str = "outcome";
}

/// High-level interface for recording propagation metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    _private: (),
}

impl EngineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a built plan.
    pub fn record_plan(&self, change_type: ChangeType, had_cycle: bool) {
        counter!(names::PLANS_TOTAL, labels::CHANGE_TYPE => change_type.as_str()).increment(1);
        if had_cycle {
            counter!(names::PLAN_CYCLES_TOTAL).increment(1);
        }
    }

    /// Records one executed step.
    pub fn record_step(&self, batched: bool, duration: Duration) {
        let mode = if batched { "batched" } else { "single" };
        counter!(names::STEPS_EXECUTED_TOTAL, labels::MODE => mode).increment(1);
        histogram!(names::STEP_DURATION_SECONDS, labels::MODE => mode).record(duration.as_secs_f64());
    }

    /// Records the dirty-set size after propagation.
    #[allow(clippy::cast_precision_loss)]
    pub fn observe_dirty_records(&self, count: u64) {
        histogram!(names::DIRTY_RECORDS).record(count as f64);
    }

    /// Records the number of lock keys acquired for one plan.
    #[allow(clippy::cast_precision_loss)]
    pub fn observe_lock_keys(&self, mode: &'static str, count: usize) {
        histogram!(names::LOCK_KEYS, labels::MODE => mode).record(count as f64);
    }

    /// Records an outbox enqueue.
    pub fn record_enqueue(&self, kind: &'static str, merged: bool) {
        let result = if merged { "merged" } else { "inserted" };
        counter!(
            names::OUTBOX_ENQUEUED_TOTAL,
            labels::KIND => kind,
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records an outbox task outcome.
    pub fn record_task_outcome(&self, outcome: &'static str) {
        counter!(names::OUTBOX_TASKS_TOTAL, labels::OUTCOME => outcome).increment(1);
    }

    /// Records a cascade stopped at the stage-depth cap.
    pub fn record_depth_truncated(&self) {
        counter!(names::STAGE_DEPTH_TRUNCATED_TOTAL).increment(1);
    }
}

/// Measures elapsed time and hands it to a callback on drop.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
