//! Inline dispatcher: drains the outbox shortly after work is deferred.
//!
//! The dispatcher is a handle owned by the service. At most one drain runs at a time.
//! Scheduling while a drain is pending or running spawns nothing, but asks the running
//! drain for one more pass, so work enqueued during its final pass is not stranded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::worker::OutboxWorker;

/// Schedules background outbox drains through a worker.
#[derive(Debug, Clone)]
pub struct InlineDispatcher {
    worker: OutboxWorker,
    in_flight: Arc<AtomicBool>,
    rerun: Arc<AtomicBool>,
}

impl InlineDispatcher {
    /// Creates a dispatcher draining through `worker`.
    #[must_use]
    pub fn new(worker: OutboxWorker) -> Self {
        Self {
            worker,
            in_flight: Arc::new(AtomicBool::new(false)),
            rerun: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns true while a scheduled drain has not finished.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Spawns a drain that starts after `delay`.
    ///
    /// Returns false if a drain is already in flight (it will make another pass) or
    /// there is no tokio runtime to spawn on.
    pub fn schedule(&self, delay: Duration) -> bool {
        self.rerun.store(true, Ordering::Release);
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.in_flight.store(false, Ordering::Release);
            tracing::warn!("no tokio runtime; inline drain not scheduled");
            return false;
        };

        let worker = self.worker.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let rerun = Arc::clone(&self.rerun);
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            loop {
                rerun.store(false, Ordering::Release);
                drain_once(&worker).await;
                in_flight.store(false, Ordering::Release);
                // A schedule that lost the race against this drain left `rerun` set.
                // Take the slot back unless a fresh schedule already did.
                if !rerun.load(Ordering::Acquire)
                    || in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                {
                    break;
                }
            }
        });
        true
    }
}

async fn drain_once(worker: &OutboxWorker) {
    match worker.drain().await {
        Ok(report) => tracing::debug!(
            claimed = report.claimed,
            succeeded = report.succeeded,
            failed = report.failed,
            "inline drain finished"
        ),
        Err(error) => tracing::error!(error = %error, "inline drain failed"),
    }
}
