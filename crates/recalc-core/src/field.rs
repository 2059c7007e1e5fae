//! Field model: the closed set of field kinds recalc understands.
//!
//! Fields are owned by the external catalog; recalc only reads them. Each computed kind
//! carries the configuration the graph builder needs to derive dependency edges.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filter::FilterExpr;
use crate::id::{FieldId, TableId};

/// Cardinality of a link between two tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Relationship {
    /// Each host row links at most one foreign row and vice versa.
    OneOne,
    /// Many host rows may link the same foreign row.
    ManyOne,
    /// One host row links many foreign rows (the pointer lives on the foreign side).
    OneMany,
    /// Join-table relationship.
    ManyMany,
}

impl Relationship {
    /// Returns true if a host row may link several foreign rows.
    #[must_use]
    pub const fn is_multiple(self) -> bool {
        matches!(self, Self::OneMany | Self::ManyMany)
    }
}

/// Aggregation applied by rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RollupFunction {
    /// Number of non-empty values.
    Count,
    /// Numeric sum.
    Sum,
    /// Numeric minimum.
    Min,
    /// Numeric maximum.
    Max,
    /// Comma-joined display values.
    ArrayJoin,
}

/// Formula configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormulaOptions {
    /// Source expression (opaque to recalc).
    pub expression: String,
    /// Same-table fields the expression reads.
    #[serde(default)]
    pub references: Vec<FieldId>,
}

/// Lookup configuration, also embedded in rollups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupOptions {
    /// Link field on the host table the lookup reads through.
    pub link_field_id: FieldId,
    /// Table the link points at.
    pub foreign_table_id: TableId,
    /// Field of the foreign table whose values are read.
    pub lookup_field_id: FieldId,
    /// Optional filter restricting which linked rows contribute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterExpr>,
}

/// Rollup configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupOptions {
    /// Which values are aggregated.
    pub lookup: LookupOptions,
    /// How they are aggregated.
    pub function: RollupFunction,
}

/// Link configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkOptions {
    /// Table the link points at.
    pub foreign_table_id: TableId,
    /// Foreign field mirrored as the link's display title (usually the primary field).
    pub lookup_field_id: FieldId,
    /// Link cardinality.
    pub relationship: Relationship,
    /// Counterpart link on the foreign table, for two-way links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symmetric_field_id: Option<FieldId>,
}

/// Conditional lookup configuration: rows of the foreign table are selected by a
/// filter instead of a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalOptions {
    /// Table rows are selected from.
    pub foreign_table_id: TableId,
    /// Field of the foreign table whose values are read.
    pub lookup_field_id: FieldId,
    /// Selection condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterExpr>,
}

/// Conditional rollup configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalRollupOptions {
    /// Which values are aggregated.
    pub condition: ConditionalOptions,
    /// How they are aggregated.
    pub function: RollupFunction,
}

/// Kind of a field along with its kind-specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "options", rename_all = "camelCase")]
pub enum FieldKind {
    /// User-written value.
    Plain,
    /// Same-row expression.
    Formula(FormulaOptions),
    /// Values read through a link.
    Lookup(LookupOptions),
    /// Aggregate of values read through a link.
    Rollup(RollupOptions),
    /// Link to rows of another table.
    Link(LinkOptions),
    /// Values read from rows matching a condition.
    ConditionalLookup(ConditionalOptions),
    /// Aggregate of values read from rows matching a condition.
    ConditionalRollup(ConditionalRollupOptions),
}

impl FieldKind {
    /// Short kind name used in logs and diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Formula(_) => "formula",
            Self::Lookup(_) => "lookup",
            Self::Rollup(_) => "rollup",
            Self::Link(_) => "link",
            Self::ConditionalLookup(_) => "conditionalLookup",
            Self::ConditionalRollup(_) => "conditionalRollup",
        }
    }

    /// Returns true for every kind whose value is derived.
    #[must_use]
    pub const fn is_computed(&self) -> bool {
        !matches!(self, Self::Plain)
    }

    /// Returns true for condition-selected kinds.
    #[must_use]
    pub const fn is_conditional(&self) -> bool {
        matches!(self, Self::ConditionalLookup(_) | Self::ConditionalRollup(_))
    }

    /// Link-based lookup configuration, for lookups and rollups.
    #[must_use]
    pub const fn lookup_options(&self) -> Option<&LookupOptions> {
        match self {
            Self::Lookup(options) => Some(options),
            Self::Rollup(options) => Some(&options.lookup),
            _ => None,
        }
    }

    /// Condition-based configuration, for conditional lookups and rollups.
    #[must_use]
    pub const fn conditional_options(&self) -> Option<&ConditionalOptions> {
        match self {
            Self::ConditionalLookup(options) => Some(options),
            Self::ConditionalRollup(options) => Some(&options.condition),
            _ => None,
        }
    }

    /// Link configuration, for link fields.
    #[must_use]
    pub const fn link_options(&self) -> Option<&LinkOptions> {
        match self {
            Self::Link(options) => Some(options),
            _ => None,
        }
    }
}

/// Field metadata as read from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    /// Field identifier.
    pub id: FieldId,
    /// Owning table.
    pub table_id: TableId,
    /// Display name.
    pub name: String,
    /// Physical column name.
    pub db_field_name: String,
    /// Whether this is the table's primary (title) field.
    #[serde(default)]
    pub is_primary: bool,
    /// Soft-deleted fields are ignored by the graph builder.
    #[serde(default)]
    pub is_deleted: bool,
    /// Column is computed natively by the store; executors skip it.
    #[serde(default)]
    pub db_generated: bool,
    /// Kind and configuration.
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl Field {
    /// Creates a field with a column name derived from `name`.
    #[must_use]
    pub fn new(id: FieldId, table_id: TableId, name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        let db_field_name = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        Self {
            id,
            table_id,
            name,
            db_field_name,
            is_primary: false,
            is_deleted: false,
            db_generated: false,
            kind,
        }
    }

    /// Marks the field as the table's primary field.
    #[must_use]
    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    /// Returns true if the field's value is derived.
    #[must_use]
    pub const fn is_computed(&self) -> bool {
        self.kind.is_computed()
    }

    /// Fields this field's value is read from, as implied by its configuration.
    ///
    /// Catalogs record these as generic references when a field is saved.
    #[must_use]
    pub fn dependencies(&self) -> Vec<FieldId> {
        let mut out = Vec::new();
        match &self.kind {
            FieldKind::Plain => {}
            FieldKind::Formula(options) => out.extend(options.references.iter().cloned()),
            FieldKind::Lookup(options) | FieldKind::Rollup(RollupOptions { lookup: options, .. }) => {
                out.push(options.link_field_id.clone());
                out.push(options.lookup_field_id.clone());
                if let Some(filter) = &options.filter {
                    out.extend(filter.field_ids());
                    out.extend(filter.host_field_ids());
                }
            }
            FieldKind::Link(options) => out.push(options.lookup_field_id.clone()),
            FieldKind::ConditionalLookup(options)
            | FieldKind::ConditionalRollup(ConditionalRollupOptions {
                condition: options, ..
            }) => {
                out.push(options.lookup_field_id.clone());
                if let Some(filter) = &options.filter {
                    out.extend(filter.field_ids());
                    out.extend(filter.host_field_ids());
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Checks that the configuration is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns a validation error when required configuration is missing or a
    /// filter is malformed.
    pub fn validate(&self) -> Result<()> {
        let missing = |what: &str| {
            Err(Error::validation(format!(
                "{} field {} is missing {what}",
                self.kind.name(),
                self.id
            )))
        };
        match &self.kind {
            FieldKind::Plain | FieldKind::Formula(_) => Ok(()),
            FieldKind::Lookup(options) | FieldKind::Rollup(RollupOptions { lookup: options, .. }) => {
                if options.link_field_id.as_str().is_empty() {
                    return missing("a link field");
                }
                if options.lookup_field_id.as_str().is_empty() {
                    return missing("a lookup field");
                }
                options.filter.as_ref().map_or(Ok(()), FilterExpr::validate)
            }
            FieldKind::Link(options) => {
                if options.foreign_table_id.as_str().is_empty() {
                    return missing("a foreign table");
                }
                Ok(())
            }
            FieldKind::ConditionalLookup(options)
            | FieldKind::ConditionalRollup(ConditionalRollupOptions {
                condition: options, ..
            }) => {
                if options.lookup_field_id.as_str().is_empty() {
                    return missing("a lookup field");
                }
                options.filter.as_ref().map_or(Ok(()), FilterExpr::validate)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup() -> Field {
        Field::new(
            FieldId::new("fldComponentName"),
            TableId::new("tblBugs"),
            "Component Name",
            FieldKind::Lookup(LookupOptions {
                link_field_id: FieldId::new("fldComponent"),
                foreign_table_id: TableId::new("tblComponents"),
                lookup_field_id: FieldId::new("fldName"),
                filter: None,
            }),
        )
    }

    #[test]
    fn computed_kinds_are_classified() {
        assert!(lookup().is_computed());
        assert!(!FieldKind::Plain.is_computed());
        let conditional = FieldKind::ConditionalLookup(ConditionalOptions {
            foreign_table_id: TableId::new("tblOrders"),
            lookup_field_id: FieldId::new("fldAmount"),
            filter: None,
        });
        assert!(conditional.is_conditional());
        assert!(conditional.conditional_options().is_some());
        assert!(conditional.lookup_options().is_none());
    }

    #[test]
    fn db_field_name_is_derived_from_name() {
        assert_eq!(lookup().db_field_name, "component_name");
    }

    #[test]
    fn field_serializes_with_kind_tag() {
        let value = serde_json::to_value(lookup()).unwrap();
        assert_eq!(value["type"], json!("lookup"));
        assert_eq!(value["options"]["linkFieldId"], json!("fldComponent"));

        let back: Field = serde_json::from_value(value).unwrap();
        assert_eq!(back, lookup());
    }

    #[test]
    fn validate_rejects_lookup_without_link() {
        let mut field = lookup();
        if let FieldKind::Lookup(options) = &mut field.kind {
            options.link_field_id = FieldId::new("");
        }
        let err = field.validate().unwrap_err();
        assert!(err.to_string().contains("missing a link field"));
    }

    #[test]
    fn dependencies_cover_link_and_source() {
        assert_eq!(
            lookup().dependencies(),
            vec![FieldId::new("fldComponent"), FieldId::new("fldName")]
        );
        assert!(Field::new(FieldId::new("fldA"), TableId::new("tblA"), "A", FieldKind::Plain)
            .dependencies()
            .is_empty());
    }

    #[test]
    fn multiple_relationships() {
        assert!(Relationship::OneMany.is_multiple());
        assert!(Relationship::ManyMany.is_multiple());
        assert!(!Relationship::ManyOne.is_multiple());
    }
}
