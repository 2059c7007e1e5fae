//! Custom assertion helpers for plans.

use std::collections::HashMap;

use recalc_core::FieldId;
use recalc_engine::graph::{DependencyGraph, EdgeSemantic};
use recalc_engine::plan::UpdatePlan;

/// `(table, level, fields)` of every step, for compact comparisons.
pub fn step_shape(plan: &UpdatePlan) -> Vec<(String, u32, Vec<String>)> {
    plan.steps
        .iter()
        .map(|s| {
            (
                s.table_id.to_string(),
                s.level,
                s.field_ids.iter().map(ToString::to_string).collect(),
            )
        })
        .collect()
}

/// Asserts that steps appear in non-decreasing level order.
///
/// # Panics
///
/// Panics if a step has a lower level than the step before it.
pub fn assert_levels_non_decreasing(plan: &UpdatePlan) {
    for pair in plan.steps.windows(2) {
        assert!(
            pair[0].level <= pair[1].level,
            "Step {:?} at level {} precedes step {:?} at level {}",
            pair[0].field_ids,
            pair[0].level,
            pair[1].field_ids,
            pair[1].level
        );
    }
}

/// Asserts that every graph edge between two planned fields goes from a lower level
/// to a higher one.
///
/// Link-to-lookup edges are ignored: a lookup only waits for its link when the link's
/// ids changed, which the planner decides per change.
///
/// # Panics
///
/// Panics if a field is planned at or before a field it depends on.
pub fn assert_plan_respects_dependencies(plan: &UpdatePlan, graph: &DependencyGraph) {
    let levels: HashMap<&FieldId, u32> = plan
        .steps
        .iter()
        .flat_map(|s| s.field_ids.iter().map(move |f| (f, s.level)))
        .collect();
    for edge in graph.edges().iter().filter(|e| e.semantic != EdgeSemantic::LookupLink) {
        let (Some(from), Some(to)) = (levels.get(&edge.from_field_id), levels.get(&edge.to_field_id)) else {
            continue;
        };
        assert!(
            from < to,
            "Field {} (level {from}) must be planned before its dependent {} (level {to})",
            edge.from_field_id,
            edge.to_field_id
        );
    }
}

/// Asserts that no field is planned twice.
///
/// # Panics
///
/// Panics on the first duplicated field.
pub fn assert_fields_unique(plan: &UpdatePlan) {
    let mut seen = HashMap::new();
    for step in &plan.steps {
        for field in &step.field_ids {
            if let Some(level) = seen.insert(field.clone(), step.level) {
                panic!("Field {field} planned at level {level} and again at {}", step.level);
            }
        }
    }
}
