//! Property-based tests for planner invariants.
//!
//! Random acyclic formula schemas are planned from a change to their root field and
//! the plans are checked against the dependency graph.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;
use tokio_test::block_on;

use recalc_core::catalog::{InMemoryCatalog, Table};
use recalc_core::field::FormulaOptions;
use recalc_core::{Field, FieldId, FieldKind, RecordId, TableId, WorkspaceId};
use recalc_engine::config::EngineConfig;
use recalc_engine::error::Error;
use recalc_engine::graph::{DependencyGraph, GraphBuilder, GraphLoadConfig};
use recalc_engine::lock::{LockConfig, LockMode, build_lock_plan};
use recalc_engine::plan::{ChangeType, CyclePolicy, SeedGroup, UpdatePlan};
use recalc_engine::planner::{PlanRequest, Planner, PlannerConfig};
use recalc_test_utils::cycle::*;
use recalc_test_utils::{
    WORKSPACE, assert_fields_unique, assert_levels_non_decreasing, assert_plan_respects_dependencies, cyclic, fid,
    rid, tid,
};

const MAX_FIELDS: usize = 12;

fn field_id(index: usize) -> FieldId {
    FieldId::new(format!("fld{index:02}"))
}

/// `references[i]` masks which earlier fields field `i + 1` reads.
fn arb_schema() -> impl Strategy<Value = Vec<Vec<bool>>> {
    prop::collection::vec(prop::collection::vec(any::<bool>(), MAX_FIELDS), 1..MAX_FIELDS)
}

fn build_catalog(references: &[Vec<bool>]) -> Arc<InMemoryCatalog> {
    let catalog = Arc::new(InMemoryCatalog::new());
    let table = TableId::new("tblRandom");
    catalog
        .put_table(Table {
            id: table.clone(),
            workspace_id: WorkspaceId::new("bseProp"),
            name: "Random".into(),
            db_table_name: "random".into(),
        })
        .unwrap();
    catalog
        .put_field(Field::new(field_id(0), table.clone(), "root", FieldKind::Plain).primary())
        .unwrap();
    for (offset, mask) in references.iter().enumerate() {
        let index = offset + 1;
        let refs: Vec<FieldId> = (0..index).filter(|j| mask[*j]).map(field_id).collect();
        catalog
            .put_field(Field::new(
                field_id(index),
                table.clone(),
                format!("f{index}"),
                FieldKind::Formula(FormulaOptions {
                    expression: format!("f{index}"),
                    references: refs,
                }),
            ))
            .unwrap();
    }
    catalog
}

/// Fields transitively reading the root.
fn reachable(references: &[Vec<bool>]) -> BTreeSet<FieldId> {
    let mut reached = BTreeSet::from([0_usize]);
    for (offset, mask) in references.iter().enumerate() {
        if reached.iter().any(|j| mask[*j]) {
            reached.insert(offset + 1);
        }
    }
    reached.remove(&0);
    reached.into_iter().map(field_id).collect()
}

fn plan_root_change(catalog: Arc<InMemoryCatalog>, policy: CyclePolicy) -> (DependencyGraph, UpdatePlan) {
    block_on(async {
        let root = field_id(0);
        let builder = GraphBuilder::new(catalog, GraphLoadConfig::default());
        let graph = builder
            .load(&WorkspaceId::new("bseProp"), Some(std::slice::from_ref(&root)))
            .await
            .unwrap();
        let planner = Planner::new(PlannerConfig { cycle_policy: policy });
        let request = PlanRequest::new(
            WorkspaceId::new("bseProp"),
            TableId::new("tblRandom"),
            vec![root],
            vec![RecordId::new("rec1")],
            ChangeType::Update,
        );
        let plan = planner.plan(&graph, &request).unwrap();
        (graph, plan)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn plans_respect_dependency_order(references in arb_schema()) {
        let (graph, plan) = plan_root_change(build_catalog(&references), CyclePolicy::Error);

        assert_levels_non_decreasing(&plan);
        assert_fields_unique(&plan);
        assert_plan_respects_dependencies(&plan, &graph);
        prop_assert!(plan.cycle_info.is_none());
    }

    #[test]
    fn plans_cover_exactly_the_dependents(references in arb_schema()) {
        let (_, plan) = plan_root_change(build_catalog(&references), CyclePolicy::Error);

        prop_assert_eq!(plan.step_field_ids(), reachable(&references));
        prop_assert!(plan.steps.iter().all(|s| s.level >= 1));
        prop_assert!(plan.edges.is_empty());
    }

    #[test]
    fn plan_hash_is_stable(references in arb_schema()) {
        let catalog = build_catalog(&references);
        let (_, first) = plan_root_change(Arc::clone(&catalog), CyclePolicy::Skip);
        let (_, second) = plan_root_change(catalog, CyclePolicy::Skip);

        prop_assert_eq!(&first.plan_hash, &second.plan_hash);
        prop_assert_eq!(first.steps, second.steps);
    }
}

fn record_set() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set("rec[0-9]{1,4}", 5..40)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn overlapping_sharded_runs_share_a_lock(
        first in record_set(),
        second in record_set(),
        shards in 1_u32..128,
    ) {
        let config = LockConfig {
            enabled: true,
            max_record_locks: 3,
            batch_shard_count: shards,
        };
        let common = RecordId::new("recShared");
        let table = TableId::new("tblRandom");
        let seeds = |ids: &BTreeSet<String>| {
            let records = ids.iter().map(RecordId::new).chain([common.clone()]);
            vec![SeedGroup::new(table.clone(), records)]
        };
        let workspace = WorkspaceId::new("bseProp");

        let a = build_lock_plan(&workspace, &seeds(&first), &config);
        let b = build_lock_plan(&workspace, &seeds(&second), &config);

        prop_assert_eq!(a.mode, LockMode::Batch);
        prop_assert_eq!(b.mode, LockMode::Batch);
        let a_keys: BTreeSet<&str> = a.keys.iter().map(|k| k.key.as_str()).collect();
        prop_assert!(b.keys.iter().any(|k| a_keys.contains(k.key.as_str())));
    }
}

fn cycle_request() -> PlanRequest {
    PlanRequest::new(
        WorkspaceId::new(WORKSPACE),
        tid(NODES),
        vec![fid(A)],
        vec![rid("node1")],
        ChangeType::Update,
    )
}

#[tokio::test]
async fn cycles_are_skipped_and_reported() {
    let scenario = cyclic();
    let (service, _outbox) = scenario.service(EngineConfig::default());

    let plan = service.plan(&cycle_request()).await.unwrap();

    let info = plan.cycle_info.clone().expect("cycle diagnostics");
    assert_eq!(info.unsorted_field_ids, vec![fid(B), fid(C), fid(D)]);
    assert!(info.example_cycle.len() >= 4);
    assert_eq!(info.example_cycle.first(), info.example_cycle.last());
    assert_eq!(plan.step_field_ids(), BTreeSet::from([fid(E)]));

    scenario.set(NODES, "node1", &[(A, json!(5))]);
    service.execute(&plan).await.unwrap();
    assert_eq!(scenario.cell(NODES, "node1", E), json!(105));
}

#[tokio::test]
async fn cycles_fail_under_the_error_policy() {
    let scenario = cyclic();
    let mut config = EngineConfig::default();
    config.planner.cycle_policy = CyclePolicy::Error;
    let (service, _outbox) = scenario.service(config);

    let err = service.plan(&cycle_request()).await.unwrap_err();
    assert!(matches!(err, Error::CycleDetected { .. }), "unexpected error: {err}");
}
