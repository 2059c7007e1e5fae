//! Propagation into conditional rollups.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use serde_json::json;

use recalc_engine::config::EngineConfig;
use recalc_engine::plan::{ChangeType, PropagationEdge, PropagationMode, UpdatePlan};
use recalc_engine::planner::PlanRequest;
use recalc_engine::service::ComputedUpdateService;
use recalc_test_utils::pricing::*;
use recalc_test_utils::{Scenario, category_filter, fid, price_by_category, price_by_derived_category, rid, tid};

fn request(scenario: &Scenario, fields: &[&str], records: &[&str], change_type: ChangeType) -> PlanRequest {
    PlanRequest::new(
        scenario.workspace_id.clone(),
        tid(PRODUCTS),
        fields.iter().map(|f| fid(f)).collect(),
        records.iter().map(|r| rid(r)).collect(),
        change_type,
    )
}

fn single_edge(plan: &UpdatePlan) -> &PropagationEdge {
    assert_eq!(plan.edges.len(), 1, "expected one propagation edge: {:?}", plan.edges);
    &plan.edges[0]
}

fn total(scenario: &Scenario, summary: &str) -> f64 {
    scenario.cell(SUMMARY, summary, TOTAL).as_f64().unwrap_or(0.0)
}

async fn run(service: &ComputedUpdateService, request: PlanRequest) -> UpdatePlan {
    let plan = service.plan(&request).await.unwrap();
    service.execute(&plan).await.unwrap();
    plan
}

#[tokio::test]
async fn price_change_joins_through_the_condition() {
    let scenario = price_by_category();
    let (service, _outbox) = scenario.service(EngineConfig::default());
    scenario.set(PRODUCTS, "p1", &[(PRICE, json!(20))]);

    let plan = service
        .plan(&request(&scenario, &[PRICE], &["p1"], ChangeType::Update))
        .await
        .unwrap();
    let edge = single_edge(&plan);
    assert_eq!(edge.mode, PropagationMode::ConditionalFiltered);
    assert_eq!(edge.filter_condition, Some(category_filter()));
    assert_eq!(edge.conditional_field_id, Some(fid(TOTAL)));
    assert_eq!(edge.link_field_id, None);

    let report = service.execute(&plan).await.unwrap();

    // Only the summary row whose category matches a dirty product is recomputed.
    assert_eq!(report.dirty_stats.per_table.get(&tid(SUMMARY)), Some(&1));
    assert_eq!(scenario.cell(SUMMARY, "hw", TOTAL), json!(25));
    assert_eq!(scenario.cell(SUMMARY, "sw", TOTAL), json!(7));
}

#[tokio::test]
async fn category_change_recomputes_every_summary() {
    let scenario = price_by_category();
    let (service, _outbox) = scenario.service(EngineConfig::default());
    scenario.set(PRODUCTS, "p3", &[(CATEGORY, json!("hardware"))]);

    let plan = run(&service, request(&scenario, &[CATEGORY], &["p3"], ChangeType::Update)).await;

    let edge = single_edge(&plan);
    assert_eq!(edge.mode, PropagationMode::AllTargetRecords);
    assert_eq!(edge.filter_condition, None);

    // Old and new categories both need recomputing, which a join on the new values
    // alone would miss.
    assert!((total(&scenario, "hw") - 22.0).abs() < f64::EPSILON);
    assert!(total(&scenario, "sw").abs() < f64::EPSILON);
}

#[tokio::test]
async fn recomputed_filter_field_recomputes_every_summary() {
    let scenario = price_by_derived_category();
    let (service, _outbox) = scenario.service(EngineConfig::default());
    scenario.set(PRODUCTS, "p3", &[(RAW_CATEGORY, json!("hardware"))]);

    let plan = run(
        &service,
        request(&scenario, &[RAW_CATEGORY], &["p3"], ChangeType::Update),
    )
    .await;

    // Dirty propagation runs before the category is recomputed, so a join on the
    // filter would only reach the old category's summary.
    assert_eq!(single_edge(&plan).mode, PropagationMode::AllTargetRecords);
    assert_eq!(scenario.cell(PRODUCTS, "p3", CATEGORY), json!("hardware"));
    assert_eq!(scenario.cell(SUMMARY, "hw", TOTAL), json!(22));
    assert_eq!(scenario.cell(SUMMARY, "sw", TOTAL), json!(0));
}

#[tokio::test]
async fn price_and_category_change_together_are_conservative() {
    let scenario = price_by_category();
    let (service, _outbox) = scenario.service(EngineConfig::default());
    scenario.set(PRODUCTS, "p2", &[(PRICE, json!(1)), (CATEGORY, json!("software"))]);

    let plan = run(
        &service,
        request(&scenario, &[PRICE, CATEGORY], &["p2"], ChangeType::Update),
    )
    .await;

    assert_eq!(single_edge(&plan).mode, PropagationMode::AllTargetRecords);
    assert_eq!(scenario.cell(SUMMARY, "hw", TOTAL), json!(10));
    assert_eq!(scenario.cell(SUMMARY, "sw", TOTAL), json!(8));
}

#[tokio::test]
async fn deleted_product_leaves_its_summary() {
    let scenario = price_by_category();
    let (service, _outbox) = scenario.service(EngineConfig::default());
    assert!(scenario.store.delete_row(&tid(PRODUCTS), &rid("p2")).unwrap());

    // The deleted row cannot be joined any more, so every summary is a target.
    let plan = run(&service, request(&scenario, &[PRICE], &["p2"], ChangeType::Delete)).await;

    assert_eq!(single_edge(&plan).mode, PropagationMode::AllTargetRecords);
    assert!(plan.steps.iter().all(|s| s.table_id == tid(SUMMARY)));
    assert_eq!(scenario.cell(SUMMARY, "hw", TOTAL), json!(10));
    assert_eq!(scenario.cell(SUMMARY, "sw", TOTAL), json!(7));
}

#[tokio::test]
async fn deleting_without_naming_the_condition_still_reaches_the_rollup() {
    let scenario = price_by_category();
    let (service, _outbox) = scenario.service(EngineConfig::default());
    assert!(scenario.store.delete_row(&tid(PRODUCTS), &rid("p3")).unwrap());

    // A delete names the primary field only; conditional sources on the table are
    // added by the planner.
    let plan = run(
        &service,
        request(&scenario, &[PRODUCT_NAME], &["p3"], ChangeType::Delete),
    )
    .await;

    assert!(plan.seed_field_ids.contains(&fid(PRICE)));
    assert!(plan.seed_field_ids.contains(&fid(CATEGORY)));
    assert_eq!(scenario.cell(SUMMARY, "sw", TOTAL), json!(0));
    assert_eq!(scenario.cell(SUMMARY, "hw", TOTAL), json!(15));
}

#[tokio::test]
async fn inserted_product_is_joined_by_its_category() {
    let scenario = price_by_category();
    let (service, _outbox) = scenario.service(EngineConfig::default());
    scenario.insert(
        PRODUCTS,
        "p4",
        &[(PRODUCT_NAME, json!("p4")), (CATEGORY, json!("software")), (PRICE, json!(3))],
    );

    run(
        &service,
        request(&scenario, &[PRODUCT_NAME, PRICE, CATEGORY], &["p4"], ChangeType::Insert),
    )
    .await;

    assert_eq!(scenario.cell(SUMMARY, "sw", TOTAL), json!(10));
    assert_eq!(scenario.cell(SUMMARY, "hw", TOTAL), json!(15));
}
