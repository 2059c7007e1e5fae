//! Multi-stage cascades through the outbox worker.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::watch;

use recalc_core::OutboxTaskId;
use recalc_engine::Result;
use recalc_engine::dispatch::InlineDispatcher;
use recalc_engine::outbox::memory::InMemoryOutbox;
use recalc_engine::outbox::{
    DeadLetter, EnqueueResult, FailureOutcome, NewOutboxTask, Outbox, OutboxTask, TaskPayload,
};
use recalc_engine::plan::{ChangeType, SeedGroup};
use recalc_engine::planner::PlanRequest;
use recalc_engine::service::ComputedUpdateService;
use recalc_test_utils::chain::*;
use recalc_test_utils::{Scenario, fid, formula_chain, init_test_logging, rid, staged_config, tid};

fn change_a(scenario: &Scenario, record: &str, value: i64) -> PlanRequest {
    scenario.set(ITEMS, record, &[(A, json!(value))]);
    PlanRequest::new(
        scenario.workspace_id.clone(),
        tid(ITEMS),
        vec![fid(A)],
        vec![rid(record)],
        ChangeType::Update,
    )
}

fn values(scenario: &Scenario, record: &str) -> Vec<Value> {
    [B, C, D].iter().map(|f| scenario.cell(ITEMS, record, f)).collect()
}

async fn wait_until_empty(outbox: &InMemoryOutbox) {
    for _ in 0..500 {
        if outbox.tasks().unwrap().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("outbox never drained: {:?}", outbox.tasks().unwrap());
}

#[tokio::test]
async fn sync_window_executes_first_level_and_defers_the_rest() {
    init_test_logging();
    let scenario = formula_chain();
    let (service, outbox) = scenario.service(staged_config(1, 1));

    let report = service.submit_change(change_a(&scenario, "item1", 5)).await.unwrap();

    assert_eq!(report.executed_levels, vec![1]);
    assert_eq!(report.follow_ons.len(), 1);
    assert!(report.has_pending_work());
    assert_eq!(values(&scenario, "item1"), vec![json!(10), json!(3), json!(30)]);

    let tasks = outbox.tasks().unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.stage_depth, 1);
    assert_eq!(task.origin_run_ids, vec![report.run_id]);
    assert_eq!(task.change_type, ChangeType::Update);
    let TaskPayload::ComputedUpdate { plan } = &task.payload else {
        panic!("expected a computed update, got {:?}", task.payload);
    };
    assert!(!plan.step_field_ids().contains(&fid(B)));
    assert_eq!(task.seed_groups[0].record_ids, vec![rid("item1")]);
}

#[tokio::test]
async fn worker_stages_converge_to_full_propagation() {
    let scenario = formula_chain();
    let (service, outbox) = scenario.service(staged_config(1, 1));
    service.submit_change(change_a(&scenario, "item1", 5)).await.unwrap();

    let report = service.worker().drain().await.unwrap();

    assert_eq!(report.claimed, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(values(&scenario, "item1"), vec![json!(10), json!(11), json!(110)]);
    assert_eq!(values(&scenario, "item2"), vec![json!(4), json!(5), json!(50)]);
    assert!(outbox.tasks().unwrap().is_empty());
}

#[tokio::test]
async fn stage_depth_cap_stops_the_cascade() {
    let scenario = formula_chain();
    let mut config = staged_config(1, 1);
    config.worker.max_stage_depth = 1;
    let (service, outbox) = scenario.service(config);
    service.submit_change(change_a(&scenario, "item1", 5)).await.unwrap();

    let report = service.worker().drain().await.unwrap();

    // The depth-1 stage runs; its continuation would be depth 2 and is dropped.
    assert_eq!(report.claimed, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(values(&scenario, "item1"), vec![json!(10), json!(11), json!(30)]);
    assert!(outbox.tasks().unwrap().is_empty());
}

#[tokio::test]
async fn complex_plans_are_deferred_whole() {
    let scenario = formula_chain();
    let mut config = staged_config(0, 0);
    config.sync.max_sync_complexity = 0;
    let (service, outbox) = scenario.service(config);

    let report = service.submit_change(change_a(&scenario, "item2", 7)).await.unwrap();

    let deferred = report.deferred.expect("plan deferred");
    assert!(!deferred.merged);
    assert!(report.executed_levels.is_empty());
    assert_eq!(values(&scenario, "item2"), vec![json!(4), json!(5), json!(50)]);
    let task = outbox.get(&deferred.task_id).unwrap().expect("task stored");
    assert_eq!(task.run_id, report.run_id);
    assert_eq!(task.stage_depth, 0);

    service.worker().drain().await.unwrap();
    assert_eq!(values(&scenario, "item2"), vec![json!(14), json!(15), json!(150)]);
}

#[tokio::test]
async fn repeated_deferrals_merge_into_one_task() {
    let scenario = formula_chain();
    let mut config = staged_config(0, 0);
    config.sync.max_sync_complexity = 0;
    let (service, outbox) = scenario.service(config);

    let first = service.submit_change(change_a(&scenario, "item1", 3)).await.unwrap();
    let second = service.submit_change(change_a(&scenario, "item2", 4)).await.unwrap();

    let first = first.deferred.unwrap();
    let second = second.deferred.unwrap();
    assert!(second.merged);
    assert_eq!(first.task_id, second.task_id);
    let task = outbox.get(&first.task_id).unwrap().unwrap();
    assert_eq!(task.seed_groups[0].record_ids, vec![rid("item1"), rid("item2")]);

    service.worker().drain().await.unwrap();
    assert_eq!(values(&scenario, "item1"), vec![json!(6), json!(7), json!(70)]);
    assert_eq!(values(&scenario, "item2"), vec![json!(8), json!(9), json!(90)]);
}

#[tokio::test(start_paused = true)]
async fn inline_dispatcher_drains_deferred_work() {
    let scenario = formula_chain();
    let mut config = staged_config(1, 0);
    config.sync.inline_dispatch_delay_ms = 20;
    let outbox = Arc::new(InMemoryOutbox::new(config.outbox.clone()));
    let service = ComputedUpdateService::builder(
        scenario.catalog.clone(),
        Arc::new(scenario.store.clone()),
        outbox.clone(),
    )
    .config(config)
    .inline_dispatch(true)
    .build()
    .unwrap();
    let dispatcher = service.dispatcher().expect("inline dispatch enabled").clone();

    service.submit_change(change_a(&scenario, "item1", 5)).await.unwrap();

    // A drain is pending; scheduling again is a no-op until it finishes.
    assert!(dispatcher.is_in_flight());
    assert!(!dispatcher.schedule(Duration::ZERO));

    while dispatcher.is_in_flight() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(outbox.tasks().unwrap().is_empty());
    assert_eq!(values(&scenario, "item1"), vec![json!(10), json!(11), json!(110)]);
    assert!(dispatcher.schedule(Duration::ZERO));
}

/// Outbox that receives one more task, and a schedule request, the first time a
/// claim comes back empty: the moment a drain is about to finish.
struct LateArrival {
    inner: Arc<InMemoryOutbox>,
    late: Mutex<Option<NewOutboxTask>>,
    dispatcher: OnceLock<InlineDispatcher>,
    scheduled: Mutex<Option<bool>>,
}

#[async_trait]
impl Outbox for LateArrival {
    async fn enqueue_or_merge(&self, task: NewOutboxTask) -> Result<EnqueueResult> {
        self.inner.enqueue_or_merge(task).await
    }

    async fn claim_batch(&self, worker_id: &str, limit: usize) -> Result<Vec<OutboxTask>> {
        let claimed = self.inner.claim_batch(worker_id, limit).await?;
        if claimed.is_empty() {
            let late = self.late.lock().unwrap().take();
            if let Some(task) = late {
                self.inner.enqueue_or_merge(task).await?;
                let dispatcher = self.dispatcher.get().expect("dispatcher installed");
                *self.scheduled.lock().unwrap() = Some(dispatcher.schedule(Duration::ZERO));
            }
        }
        Ok(claimed)
    }

    async fn mark_done(&self, task_id: &OutboxTaskId) -> Result<()> {
        self.inner.mark_done(task_id).await
    }

    async fn mark_failed(&self, task: &OutboxTask, error: &str) -> Result<FailureOutcome> {
        self.inner.mark_failed(task, error).await
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.inner.list_dead_letters(limit).await
    }

    async fn pending_count(&self) -> Result<u64> {
        self.inner.pending_count().await
    }
}

#[tokio::test(start_paused = true)]
async fn work_scheduled_during_the_final_pass_is_drained() {
    let scenario = formula_chain();
    let config = staged_config(1, 0);
    scenario.set(ITEMS, "item2", &[(A, json!(3))]);
    let late = NewOutboxTask::seed(
        scenario.workspace_id.clone(),
        tid(ITEMS),
        vec![fid(A)],
        vec![SeedGroup::new(tid(ITEMS), [rid("item2")])],
        ChangeType::Update,
        None,
    )
    .unwrap();
    let inner = Arc::new(InMemoryOutbox::new(config.outbox.clone()));
    let outbox = Arc::new(LateArrival {
        inner: inner.clone(),
        late: Mutex::new(Some(late)),
        dispatcher: OnceLock::new(),
        scheduled: Mutex::new(None),
    });
    let service = ComputedUpdateService::builder(
        scenario.catalog.clone(),
        Arc::new(scenario.store.clone()),
        outbox.clone(),
    )
    .config(config)
    .inline_dispatch(true)
    .build()
    .unwrap();
    let dispatcher = service.dispatcher().unwrap().clone();
    outbox.dispatcher.set(dispatcher.clone()).unwrap();

    assert!(dispatcher.schedule(Duration::ZERO));
    while dispatcher.is_in_flight() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The late schedule found a drain in flight; that drain made another pass.
    assert_eq!(*outbox.scheduled.lock().unwrap(), Some(false));
    assert!(inner.tasks().unwrap().is_empty());
    assert_eq!(values(&scenario, "item2"), vec![json!(6), json!(7), json!(70)]);
}

#[test]
fn dispatcher_needs_a_runtime() {
    let scenario = formula_chain();
    let service = ComputedUpdateService::builder(
        scenario.catalog.clone(),
        Arc::new(scenario.store.clone()),
        Arc::new(InMemoryOutbox::default()),
    )
    .inline_dispatch(true)
    .build()
    .unwrap();
    let dispatcher = service.dispatcher().unwrap();

    assert!(!dispatcher.schedule(Duration::ZERO));
    assert!(!dispatcher.is_in_flight());
}

#[tokio::test]
async fn polling_worker_processes_until_shutdown() {
    let scenario = formula_chain();
    let mut config = staged_config(1, 1);
    config.worker.poll_interval_ms = 10;
    let (service, outbox) = scenario.service(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = service.worker();
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    service.submit_change(change_a(&scenario, "item2", 1)).await.unwrap();
    wait_until_empty(&outbox).await;
    assert_eq!(values(&scenario, "item2"), vec![json!(2), json!(3), json!(30)]);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker stops")
        .unwrap();
}
