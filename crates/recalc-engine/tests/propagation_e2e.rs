//! End-to-end propagation over linked tables.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use serde_json::json;

use recalc_engine::config::EngineConfig;
use recalc_engine::events::InMemoryChangeSink;
use recalc_engine::lock::record_lock_key;
use recalc_engine::outbox::memory::InMemoryOutbox;
use recalc_engine::plan::{ChangeType, PropagationMode};
use recalc_engine::planner::PlanRequest;
use recalc_engine::service::ComputedUpdateService;
use recalc_test_utils::bugs::*;
use recalc_test_utils::{
    Scenario, assert_fields_unique, assert_levels_non_decreasing, bugs_and_components, fid, init_test_logging,
    links, rid, step_shape, tid,
};

fn rename_component(scenario: &Scenario, record: &str, name: &str) -> PlanRequest {
    scenario.set(COMPONENTS, record, &[(COMPONENT_NAME, json!(name))]);
    PlanRequest::new(
        scenario.workspace_id.clone(),
        tid(COMPONENTS),
        vec![fid(COMPONENT_NAME)],
        vec![rid(record)],
        ChangeType::Update,
    )
}

#[tokio::test]
async fn renaming_a_component_plans_one_step_on_bugs() {
    init_test_logging();
    let scenario = bugs_and_components();
    let (service, _outbox) = scenario.service(EngineConfig::default());

    let plan = service.plan(&rename_component(&scenario, "comp1", "Lexer")).await.unwrap();

    assert_eq!(
        step_shape(&plan),
        vec![(
            BUGS.to_string(),
            1,
            vec![BUG_COMPONENT.to_string(), BUG_COMPONENT_NAME.to_string()]
        )]
    );
    assert_eq!(plan.edges.len(), 1);
    let edge = &plan.edges[0];
    assert_eq!(edge.mode, PropagationMode::LinkTraversal);
    assert_eq!(edge.from_table_id, tid(COMPONENTS));
    assert_eq!(edge.to_table_id, tid(BUGS));
    assert_eq!(edge.link_field_id, Some(fid(BUG_COMPONENT)));
    assert!(plan.cycle_info.is_none());
    assert!(plan.plan_hash.starts_with("sha256:"));
    assert_levels_non_decreasing(&plan);
    assert_fields_unique(&plan);
}

#[tokio::test]
async fn same_change_produces_same_plan_hash() {
    let scenario = bugs_and_components();
    let (service, _outbox) = scenario.service(EngineConfig::default());

    let first = service.plan(&rename_component(&scenario, "comp1", "Lexer")).await.unwrap();
    let second = service.plan(&rename_component(&scenario, "comp2", "Compositor")).await.unwrap();

    // Seed records do not take part in the hash.
    assert_eq!(first.plan_hash, second.plan_hash);
    assert_ne!(first.seed_record_ids, second.seed_record_ids);
}

#[tokio::test]
async fn renaming_a_component_updates_only_linking_bugs() {
    init_test_logging();
    let scenario = bugs_and_components();
    let (service, _outbox) = scenario.service(EngineConfig::default());

    let report = service
        .submit_change(rename_component(&scenario, "comp1", "Lexer"))
        .await
        .unwrap();

    assert!(report.deferred.is_none());
    assert!(report.follow_ons.is_empty());
    assert!(!report.has_pending_work());
    assert_eq!(report.executed_levels, vec![1]);
    assert_eq!(report.dirty_stats.per_table.get(&tid(COMPONENTS)), Some(&1));
    assert_eq!(report.dirty_stats.per_table.get(&tid(BUGS)), Some(&2));

    for bug in ["bug1", "bug2"] {
        assert_eq!(scenario.cell(BUGS, bug, BUG_COMPONENT_NAME), json!(["Lexer"]));
        assert_eq!(
            scenario.cell(BUGS, bug, BUG_COMPONENT),
            json!([{ "id": "comp1", "title": "Lexer" }])
        );
    }
    assert_eq!(scenario.cell(BUGS, "bug3", BUG_COMPONENT_NAME), json!(["Renderer"]));

    assert_eq!(service.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn stage_locks_the_seed_records() {
    let scenario = bugs_and_components();
    let (service, _outbox) = scenario.service(EngineConfig::default());

    service
        .submit_change(rename_component(&scenario, "comp2", "Compositor"))
        .await
        .unwrap();

    assert_eq!(
        scenario.store.advisory_locks().unwrap(),
        vec![record_lock_key(&scenario.workspace_id, &tid(COMPONENTS), &rid("comp2"))]
    );
}

#[tokio::test]
async fn record_changes_reach_the_sink() {
    let scenario = bugs_and_components();
    let sink = Arc::new(InMemoryChangeSink::new());
    let service = ComputedUpdateService::builder(
        scenario.catalog.clone(),
        Arc::new(scenario.store.clone()),
        Arc::new(InMemoryOutbox::default()),
    )
    .change_sink(sink.clone())
    .build()
    .unwrap();

    service
        .submit_change(rename_component(&scenario, "comp2", "Compositor"))
        .await
        .unwrap();

    let changes = sink.changes().unwrap();
    assert_eq!(changes.len(), 1);
    let change = &changes[0];
    assert_eq!(change.table_id, tid(BUGS));
    assert_eq!(change.record_id, rid("bug3"));
    assert_eq!(change.new_version, change.old_version + 1);
    let lookup = change
        .fields
        .iter()
        .find(|f| f.field_id == fid(BUG_COMPONENT_NAME))
        .expect("lookup change");
    assert_eq!(lookup.old_value, json!(["Renderer"]));
    assert_eq!(lookup.new_value, json!(["Compositor"]));
}

#[tokio::test]
async fn inserted_bug_gets_its_lookup_filled() {
    let scenario = bugs_and_components();
    let (service, _outbox) = scenario.service(EngineConfig::default());
    scenario.insert(
        BUGS,
        "bug4",
        &[(BUG_NAME, json!("Tearing")), (BUG_COMPONENT, links(&["comp2"]))],
    );

    service
        .submit_change(PlanRequest::new(
            scenario.workspace_id.clone(),
            tid(BUGS),
            vec![fid(BUG_NAME), fid(BUG_COMPONENT)],
            vec![rid("bug4")],
            ChangeType::Insert,
        ))
        .await
        .unwrap();

    assert_eq!(scenario.cell(BUGS, "bug4", BUG_COMPONENT_NAME), json!(["Renderer"]));
    assert_eq!(
        scenario.cell(BUGS, "bug4", BUG_COMPONENT),
        json!([{ "id": "comp2", "title": "Renderer" }])
    );
    assert_eq!(scenario.cell(BUGS, "bug1", BUG_COMPONENT_NAME), json!(["Parser"]));
}

#[tokio::test]
async fn deleting_a_component_clears_links_that_pointed_at_it() {
    let scenario = bugs_and_components();
    let (service, _outbox) = scenario.service(EngineConfig::default());
    assert!(scenario.store.delete_row(&tid(COMPONENTS), &rid("comp1")).unwrap());

    let request = PlanRequest::new(
        scenario.workspace_id.clone(),
        tid(COMPONENTS),
        vec![fid(COMPONENT_NAME)],
        vec![rid("comp1")],
        ChangeType::Delete,
    );
    let plan = service.plan(&request).await.unwrap();
    assert!(plan.steps.iter().all(|s| s.table_id == tid(BUGS)));

    service.execute(&plan).await.unwrap();

    for bug in ["bug1", "bug2"] {
        assert_eq!(scenario.cell(BUGS, bug, BUG_COMPONENT), json!([]));
        assert_eq!(scenario.cell(BUGS, bug, BUG_COMPONENT_NAME), json!([]));
    }
    assert_eq!(scenario.cell(BUGS, "bug3", BUG_COMPONENT_NAME), json!(["Renderer"]));
}

#[tokio::test]
async fn changing_an_unreferenced_field_plans_nothing() {
    let scenario = bugs_and_components();
    let (service, _outbox) = scenario.service(EngineConfig::default());
    scenario.set(BUGS, "bug1", &[(BUG_NAME, json!("Renamed"))]);

    let report = service
        .submit_change(PlanRequest::new(
            scenario.workspace_id.clone(),
            tid(BUGS),
            vec![fid(BUG_NAME)],
            vec![rid("bug1")],
            ChangeType::Update,
        ))
        .await
        .unwrap();

    assert!(report.executed_levels.is_empty());
    assert!(report.outcome.updated.is_empty());
    assert_eq!(service.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_fields_and_foreign_fields_are_rejected() {
    let scenario = bugs_and_components();
    let (service, _outbox) = scenario.service(EngineConfig::default());

    let unknown = PlanRequest::new(
        scenario.workspace_id.clone(),
        tid(BUGS),
        vec![fid("fldMissing")],
        vec![rid("bug1")],
        ChangeType::Update,
    );
    let err = service.plan(&unknown).await.unwrap_err();
    assert!(err.to_string().contains("fldMissing"));

    let foreign = PlanRequest::new(
        scenario.workspace_id.clone(),
        tid(BUGS),
        vec![fid(COMPONENT_NAME)],
        vec![rid("bug1")],
        ChangeType::Update,
    );
    assert!(service.plan(&foreign).await.is_err());
}
