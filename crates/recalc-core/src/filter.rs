//! Filter expressions used by filtered lookups and conditional fields.
//!
//! A filter is a tree of `and`/`or` groups over single-field conditions. Conditions
//! always test a field of the *foreign* table (the table the lookup reads from). The
//! right-hand side is either a literal JSON value or a reference to a field of the
//! *host* record (the record that owns the conditional field), which is what lets a
//! conditional rollup say "sum `Orders.Amount` where `Orders.Customer` is this row's
//! `Name`".
//!
//! Wire format (camelCase JSON):
//!
//! ```json
//! {
//!   "conjunction": "and",
//!   "filterSet": [
//!     { "fieldId": "fldCategory", "operator": "is", "value": "hardware" },
//!     { "fieldId": "fldOwner", "operator": "is", "valueFieldId": "fldName" }
//!   ]
//! }
//! ```

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::id::FieldId;

/// How the items of a group are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conjunction {
    /// Every item must match.
    And,
    /// At least one item must match.
    Or,
}

/// Comparison operator of a single condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    /// Equal (or, for array cells, contains the value as an element).
    Is,
    /// Negation of [`FilterOperator::Is`].
    IsNot,
    /// Case-insensitive substring / element-substring match.
    Contains,
    /// Negation of [`FilterOperator::Contains`].
    DoesNotContain,
    /// Strictly greater than.
    IsGreater,
    /// Greater than or equal.
    IsGreaterEqual,
    /// Strictly less than.
    IsLess,
    /// Less than or equal.
    IsLessEqual,
    /// Null, empty string, or empty array.
    IsEmpty,
    /// Negation of [`FilterOperator::IsEmpty`].
    IsNotEmpty,
}

impl FilterOperator {
    /// Returns true if the operator compares against a right-hand value.
    #[must_use]
    pub const fn is_binary(self) -> bool {
        !matches!(self, Self::IsEmpty | Self::IsNotEmpty)
    }
}

/// A single field test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCondition {
    /// Foreign-table field under test.
    pub field_id: FieldId,
    /// Comparison operator.
    pub operator: FilterOperator,
    /// Literal right-hand side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Host-record field used as the right-hand side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_field_id: Option<FieldId>,
}

/// One entry of a filter group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterItem {
    /// Nested group.
    Group(FilterExpr),
    /// Leaf condition.
    Condition(FilterCondition),
}

/// A filter group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterExpr {
    /// How `filter_set` items combine.
    pub conjunction: Conjunction,
    /// Group members.
    pub filter_set: Vec<FilterItem>,
}

/// Read access to one row's cell values.
pub trait RowView {
    /// Returns the value stored for `field_id`, if any.
    fn cell(&self, field_id: &FieldId) -> Option<&Value>;
}

impl RowView for HashMap<FieldId, Value> {
    fn cell(&self, field_id: &FieldId) -> Option<&Value> {
        self.get(field_id)
    }
}

impl FilterExpr {
    /// Builds an `and` group from conditions.
    #[must_use]
    pub fn all(conditions: impl IntoIterator<Item = FilterCondition>) -> Self {
        Self {
            conjunction: Conjunction::And,
            filter_set: conditions.into_iter().map(FilterItem::Condition).collect(),
        }
    }

    /// Parses and validates a filter from its JSON payload.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the payload is malformed.
    pub fn parse(payload: &Value) -> Result<Self> {
        let expr: Self = serde_json::from_value(payload.clone())
            .map_err(|e| Error::validation(format!("malformed filter payload: {e}")))?;
        expr.validate()?;
        Ok(expr)
    }

    /// Validates structural rules serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns a validation error for empty groups, binary operators without a
    /// right-hand side, or conditions that set both a literal and a field reference.
    pub fn validate(&self) -> Result<()> {
        if self.filter_set.is_empty() {
            return Err(Error::validation("filter group must not be empty"));
        }
        for item in &self.filter_set {
            match item {
                FilterItem::Group(group) => group.validate()?,
                FilterItem::Condition(condition) => condition.validate()?,
            }
        }
        Ok(())
    }

    /// Foreign-table fields referenced by any condition, sorted.
    #[must_use]
    pub fn field_ids(&self) -> Vec<FieldId> {
        let mut out = BTreeSet::new();
        self.walk(&mut |c| {
            out.insert(c.field_id.clone());
        });
        out.into_iter().collect()
    }

    /// Host-record fields referenced as right-hand values, sorted.
    #[must_use]
    pub fn host_field_ids(&self) -> Vec<FieldId> {
        let mut out = BTreeSet::new();
        self.walk(&mut |c| {
            if let Some(id) = &c.value_field_id {
                out.insert(id.clone());
            }
        });
        out.into_iter().collect()
    }

    fn walk(&self, visit: &mut impl FnMut(&FilterCondition)) {
        for item in &self.filter_set {
            match item {
                FilterItem::Group(group) => group.walk(visit),
                FilterItem::Condition(condition) => visit(condition),
            }
        }
    }

    /// Evaluates the filter for one foreign row, resolving host references against
    /// `host` (a missing host row makes every host reference compare against null).
    #[must_use]
    pub fn matches(&self, foreign: &dyn RowView, host: Option<&dyn RowView>) -> bool {
        let mut results = self.filter_set.iter().map(|item| match item {
            FilterItem::Group(group) => group.matches(foreign, host),
            FilterItem::Condition(condition) => condition.matches(foreign, host),
        });
        match self.conjunction {
            Conjunction::And => results.all(|r| r),
            Conjunction::Or => results.any(|r| r),
        }
    }
}

impl FilterCondition {
    /// Creates a condition against a literal value.
    #[must_use]
    pub fn literal(field_id: FieldId, operator: FilterOperator, value: Value) -> Self {
        Self {
            field_id,
            operator,
            value: Some(value),
            value_field_id: None,
        }
    }

    /// Creates a condition against a host-record field.
    #[must_use]
    pub fn host_field(field_id: FieldId, operator: FilterOperator, host: FieldId) -> Self {
        Self {
            field_id,
            operator,
            value: None,
            value_field_id: Some(host),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.value.is_some() && self.value_field_id.is_some() {
            return Err(Error::validation(format!(
                "condition on {} sets both value and valueFieldId",
                self.field_id
            )));
        }
        if self.operator.is_binary() && self.value.is_none() && self.value_field_id.is_none() {
            return Err(Error::validation(format!(
                "operator {:?} on {} requires a value",
                self.operator, self.field_id
            )));
        }
        Ok(())
    }

    fn matches(&self, foreign: &dyn RowView, host: Option<&dyn RowView>) -> bool {
        let left = foreign.cell(&self.field_id).unwrap_or(&Value::Null);
        let right = match (&self.value_field_id, &self.value) {
            (Some(id), _) => host.and_then(|h| h.cell(id)).unwrap_or(&Value::Null),
            (None, Some(value)) => value,
            (None, None) => &Value::Null,
        };

        match self.operator {
            FilterOperator::Is => values_equal(left, right),
            FilterOperator::IsNot => !values_equal(left, right),
            FilterOperator::Contains => value_contains(left, right),
            FilterOperator::DoesNotContain => !value_contains(left, right),
            FilterOperator::IsGreater => compare(left, right) == Some(Ordering::Greater),
            FilterOperator::IsGreaterEqual => {
                matches!(compare(left, right), Some(Ordering::Greater | Ordering::Equal))
            }
            FilterOperator::IsLess => compare(left, right) == Some(Ordering::Less),
            FilterOperator::IsLessEqual => {
                matches!(compare(left, right), Some(Ordering::Less | Ordering::Equal))
            }
            FilterOperator::IsEmpty => is_empty(left),
            FilterOperator::IsNotEmpty => !is_empty(left),
        }
    }
}

/// Returns true for null, empty strings, and empty arrays.
#[must_use]
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn scalar_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => (l - r).abs() < f64::EPSILON,
        _ => left == right,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Array(items), Value::Array(_)) => left == right || items.iter().any(|i| values_equal(i, right)),
        (Value::Array(items), _) => items.iter().any(|i| scalar_equal(i, right)),
        (_, Value::Array(items)) => items.iter().any(|i| scalar_equal(left, i)),
        _ => scalar_equal(left, right),
    }
}

fn value_contains(left: &Value, right: &Value) -> bool {
    let Some(needle) = display_string(right) else {
        return false;
    };
    let needle = needle.to_lowercase();
    match left {
        Value::Array(items) => items.iter().any(|i| value_contains(i, right)),
        other => display_string(other).is_some_and(|s| s.to_lowercase().contains(&needle)),
    }
}

fn display_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("title").and_then(display_string),
        other => Some(other.to_string()),
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => left.as_f64()?.partial_cmp(&right.as_f64()?),
    }
}
