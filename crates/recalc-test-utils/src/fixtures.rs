//! Pre-built schemas and rows for common propagation scenarios.
//!
//! Every fixture returns a [`Scenario`]: a catalog with the schema registered and an
//! in-memory record store holding sample rows, with formula evaluators registered.

use std::sync::Arc;

use recalc_core::catalog::{InMemoryCatalog, Table};
use recalc_core::field::{
    ConditionalOptions, ConditionalRollupOptions, FormulaOptions, LinkOptions, LookupOptions,
    Relationship, RollupFunction,
};
use recalc_core::filter::{FilterCondition, FilterExpr, FilterOperator};
use recalc_core::{Field, FieldId, FieldKind, RecordId, TableId, WorkspaceId};
use recalc_engine::config::EngineConfig;
use recalc_engine::outbox::OutboxConfig;
use recalc_engine::outbox::memory::InMemoryOutbox;
use recalc_engine::service::ComputedUpdateService;
use recalc_engine::store::memory::{InMemoryRecordStore, Row, link_value};
use serde_json::{Value, json};

/// Workspace every fixture lives in.
pub const WORKSPACE: &str = "bseTest";

/// Ids of the `Bugs`/`Components` schema.
pub mod bugs {
    /// `Bugs` table.
    pub const BUGS: &str = "tblBugs";
    /// `Components` table.
    pub const COMPONENTS: &str = "tblComponents";
    /// `Bugs.Name` (primary, plain).
    pub const BUG_NAME: &str = "fldBugName";
    /// `Bugs.Component`: many-to-one link to `Components`, titled by `Components.Name`.
    pub const BUG_COMPONENT: &str = "fldBugComponent";
    /// `Bugs.ComponentName`: lookup of `Components.Name` through `Bugs.Component`.
    pub const BUG_COMPONENT_NAME: &str = "fldBugComponentName";
    /// `Components.Name` (primary, plain).
    pub const COMPONENT_NAME: &str = "fldComponentName";
}

/// Ids of the `Products`/`Summary` conditional schema.
pub mod pricing {
    /// `Products` table.
    pub const PRODUCTS: &str = "tblProducts";
    /// `Summary` table.
    pub const SUMMARY: &str = "tblSummary";
    /// `Products.Name` (primary, plain).
    pub const PRODUCT_NAME: &str = "fldProductName";
    /// `Products.Price` (plain number).
    pub const PRICE: &str = "fldPrice";
    /// `Products.Category` (plain text, or a formula of `RAW_CATEGORY` in
    /// [`price_by_derived_category`](super::price_by_derived_category)).
    pub const CATEGORY: &str = "fldCategory";
    /// `Products.RawCategory` (plain text).
    pub const RAW_CATEGORY: &str = "fldRawCategory";
    /// `Summary.Category` (primary, plain text).
    pub const SUMMARY_CATEGORY: &str = "fldSummaryCategory";
    /// `Summary.Total`: sum of `Products.Price` where `Products.Category` is this row's
    /// `Summary.Category`.
    pub const TOTAL: &str = "fldTotal";
}

/// Ids of the single-table formula chain schema.
pub mod chain {
    /// `Items` table.
    pub const ITEMS: &str = "tblItems";
    /// `Items.A` (plain number).
    pub const A: &str = "fldA";
    /// `Items.B = A * 2`.
    pub const B: &str = "fldB";
    /// `Items.C = B + 1`.
    pub const C: &str = "fldC";
    /// `Items.D = C * 10`.
    pub const D: &str = "fldD";
}

/// Ids of the cyclic schema.
pub mod cycle {
    /// `Nodes` table.
    pub const NODES: &str = "tblNodes";
    /// `Nodes.A` (plain).
    pub const A: &str = "fldA";
    /// `Nodes.B = f(A, D)`.
    pub const B: &str = "fldB";
    /// `Nodes.C = f(B)`.
    pub const C: &str = "fldC";
    /// `Nodes.D = f(C)`.
    pub const D: &str = "fldD";
    /// `Nodes.E = f(A)`, outside the cycle.
    pub const E: &str = "fldE";
}

/// A schema with sample rows.
#[derive(Debug, Clone)]
pub struct Scenario {
    /// Workspace of every table.
    pub workspace_id: WorkspaceId,
    /// Catalog holding the schema.
    pub catalog: Arc<InMemoryCatalog>,
    /// Store holding the rows.
    pub store: InMemoryRecordStore,
}

impl Scenario {
    fn empty() -> Self {
        Self {
            workspace_id: WorkspaceId::new(WORKSPACE),
            catalog: Arc::new(InMemoryCatalog::new()),
            store: InMemoryRecordStore::new(),
        }
    }

    fn table(&self, id: &str, name: &str) {
        self.catalog
            .put_table(Table {
                id: TableId::new(id),
                workspace_id: self.workspace_id.clone(),
                name: name.to_string(),
                db_table_name: name.to_ascii_lowercase(),
            })
            .unwrap();
    }

    fn field(&self, field: Field) {
        self.catalog.put_field(field).unwrap();
    }

    /// Reads one cell.
    pub fn cell(&self, table: &str, record: &str, field: &str) -> Value {
        self.store
            .cell(&TableId::new(table), &RecordId::new(record), &FieldId::new(field))
            .unwrap()
    }

    /// Writes user cells of an existing row.
    pub fn set(&self, table: &str, record: &str, cells: &[(&str, Value)]) {
        self.store
            .set_cells(
                &TableId::new(table),
                &RecordId::new(record),
                cells.iter().map(|(f, v)| (FieldId::new(*f), v.clone())),
            )
            .unwrap();
    }

    /// Inserts a row.
    pub fn insert(&self, table: &str, record: &str, cells: &[(&str, Value)]) {
        self.store
            .insert_row(
                &TableId::new(table),
                &RecordId::new(record),
                cells.iter().map(|(f, v)| (FieldId::new(*f), v.clone())),
            )
            .unwrap();
    }

    /// A service over this scenario with an in-memory outbox.
    pub fn service(&self, config: EngineConfig) -> (ComputedUpdateService, Arc<InMemoryOutbox>) {
        let outbox = Arc::new(InMemoryOutbox::new(config.outbox.clone()));
        let service = ComputedUpdateService::builder(
            self.catalog.clone(),
            Arc::new(self.store.clone()),
            outbox.clone(),
        )
        .config(config)
        .build()
        .unwrap();
        (service, outbox)
    }
}

/// Shorthand for a field id.
pub fn fid(id: &str) -> FieldId {
    FieldId::new(id)
}

/// Shorthand for a table id.
pub fn tid(id: &str) -> TableId {
    TableId::new(id)
}

/// Shorthand for a record id.
pub fn rid(id: &str) -> RecordId {
    RecordId::new(id)
}

fn formula(id: &str, table: &str, refs: &[&str]) -> Field {
    Field::new(
        fid(id),
        tid(table),
        id,
        FieldKind::Formula(FormulaOptions {
            expression: id.to_string(),
            references: refs.iter().map(|r| fid(r)).collect(),
        }),
    )
}

/// `Bugs` links `Components`; `Bugs.ComponentName` looks up `Components.Name`.
///
/// Rows: components `comp1` ("Parser"), `comp2` ("Renderer"); bugs `bug1` and `bug2`
/// link `comp1`, `bug3` links `comp2`. Computed cells start in sync.
pub fn bugs_and_components() -> Scenario {
    use bugs::*;
    let s = Scenario::empty();
    s.table(BUGS, "Bugs");
    s.table(COMPONENTS, "Components");
    s.field(Field::new(fid(COMPONENT_NAME), tid(COMPONENTS), "Name", FieldKind::Plain).primary());
    s.field(Field::new(fid(BUG_NAME), tid(BUGS), "Name", FieldKind::Plain).primary());
    s.field(Field::new(
        fid(BUG_COMPONENT),
        tid(BUGS),
        "Component",
        FieldKind::Link(LinkOptions {
            foreign_table_id: tid(COMPONENTS),
            lookup_field_id: fid(COMPONENT_NAME),
            relationship: Relationship::ManyOne,
            symmetric_field_id: None,
        }),
    ));
    s.field(Field::new(
        fid(BUG_COMPONENT_NAME),
        tid(BUGS),
        "Component Name",
        FieldKind::Lookup(LookupOptions {
            link_field_id: fid(BUG_COMPONENT),
            foreign_table_id: tid(COMPONENTS),
            lookup_field_id: fid(COMPONENT_NAME),
            filter: None,
        }),
    ));

    for (id, name) in [("comp1", "Parser"), ("comp2", "Renderer")] {
        s.insert(COMPONENTS, id, &[(COMPONENT_NAME, json!(name))]);
    }
    for (id, name, comp, comp_name) in [
        ("bug1", "Crash on empty input", "comp1", "Parser"),
        ("bug2", "Slow tokenizer", "comp1", "Parser"),
        ("bug3", "Flicker", "comp2", "Renderer"),
    ] {
        s.insert(
            BUGS,
            id,
            &[
                (BUG_NAME, json!(name)),
                (BUG_COMPONENT, json!([{ "id": comp, "title": comp_name }])),
                (BUG_COMPONENT_NAME, json!([comp_name])),
            ],
        );
    }
    s
}

/// The filter of `Summary.Total`.
pub fn category_filter() -> FilterExpr {
    FilterExpr::all([FilterCondition::host_field(
        fid(pricing::CATEGORY),
        FilterOperator::Is,
        fid(pricing::SUMMARY_CATEGORY),
    )])
}

/// `Summary.Total` sums `Products.Price` for products of the summary row's category.
///
/// Rows: products `p1` (hardware, 10), `p2` (hardware, 5), `p3` (software, 7);
/// summaries `hw` (hardware, total 15) and `sw` (software, total 7).
pub fn price_by_category() -> Scenario {
    use pricing::*;
    let s = Scenario::empty();
    s.table(PRODUCTS, "Products");
    s.table(SUMMARY, "Summary");
    s.field(Field::new(fid(PRODUCT_NAME), tid(PRODUCTS), "Name", FieldKind::Plain).primary());
    s.field(Field::new(fid(PRICE), tid(PRODUCTS), "Price", FieldKind::Plain));
    s.field(Field::new(fid(CATEGORY), tid(PRODUCTS), "Category", FieldKind::Plain));
    s.field(Field::new(fid(SUMMARY_CATEGORY), tid(SUMMARY), "Category", FieldKind::Plain).primary());
    s.field(Field::new(
        fid(TOTAL),
        tid(SUMMARY),
        "Total",
        FieldKind::ConditionalRollup(ConditionalRollupOptions {
            condition: ConditionalOptions {
                foreign_table_id: tid(PRODUCTS),
                lookup_field_id: fid(PRICE),
                filter: Some(category_filter()),
            },
            function: RollupFunction::Sum,
        }),
    ));

    for (id, category, price) in [("p1", "hardware", 10), ("p2", "hardware", 5), ("p3", "software", 7)] {
        s.insert(
            PRODUCTS,
            id,
            &[(PRODUCT_NAME, json!(id)), (CATEGORY, json!(category)), (PRICE, json!(price))],
        );
    }
    for (id, category, total) in [("hw", "hardware", 15), ("sw", "software", 7)] {
        s.insert(SUMMARY, id, &[(SUMMARY_CATEGORY, json!(category)), (TOTAL, json!(total))]);
    }
    s
}

/// [`price_by_category`] with `Products.Category` computed as a copy of
/// `Products.RawCategory`, so the rollup's filter field is itself recomputed.
pub fn price_by_derived_category() -> Scenario {
    use pricing::*;
    let s = price_by_category();
    s.field(Field::new(fid(RAW_CATEGORY), tid(PRODUCTS), "Raw Category", FieldKind::Plain));
    s.field(formula(CATEGORY, PRODUCTS, &[RAW_CATEGORY]));
    s.store
        .register_formula(fid(CATEGORY), |row| row.get(&fid(RAW_CATEGORY)))
        .unwrap();
    for (id, category) in [("p1", "hardware"), ("p2", "hardware"), ("p3", "software")] {
        s.set(PRODUCTS, id, &[(RAW_CATEGORY, json!(category))]);
    }
    s
}

/// `Items`: `B = A * 2`, `C = B + 1`, `D = C * 10`, giving a plan of three levels.
///
/// Rows: `item1` (A = 1) and `item2` (A = 2), computed cells in sync.
pub fn formula_chain() -> Scenario {
    use chain::*;
    let s = Scenario::empty();
    s.table(ITEMS, "Items");
    s.field(Field::new(fid(A), tid(ITEMS), "A", FieldKind::Plain).primary());
    s.field(formula(B, ITEMS, &[A]));
    s.field(formula(C, ITEMS, &[B]));
    s.field(formula(D, ITEMS, &[C]));

    let int = |row: &Row, id: &str| row.get(&fid(id)).as_i64().unwrap_or(0);
    s.store.register_formula(fid(B), move |row| json!(int(row, A) * 2)).unwrap();
    s.store.register_formula(fid(C), move |row| json!(int(row, B) + 1)).unwrap();
    s.store.register_formula(fid(D), move |row| json!(int(row, C) * 10)).unwrap();

    for (id, a) in [("item1", 1), ("item2", 2)] {
        let b = a * 2;
        let c = b + 1;
        s.insert(ITEMS, id, &[(A, json!(a)), (B, json!(b)), (C, json!(c)), (D, json!(c * 10))]);
    }
    s
}

/// `Nodes`: `B`, `C` and `D` form a cycle reachable from `A`; `E` depends on `A` only.
pub fn cyclic() -> Scenario {
    use cycle::*;
    let s = Scenario::empty();
    s.table(NODES, "Nodes");
    s.field(Field::new(fid(A), tid(NODES), "A", FieldKind::Plain).primary());
    s.field(formula(B, NODES, &[A, D]));
    s.field(formula(C, NODES, &[B]));
    s.field(formula(D, NODES, &[C]));
    s.field(formula(E, NODES, &[A]));
    s.store
        .register_formula(fid(E), |row| json!(row.get(&fid(A)).as_i64().unwrap_or(0) + 100))
        .unwrap();
    s.insert(NODES, "node1", &[(A, json!(1))]);
    s
}

/// Config with the given sync window and worker stage window, other settings default.
pub fn staged_config(max_sync_levels: usize, max_levels_per_stage: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.sync.max_sync_levels = max_sync_levels;
    config.worker.max_levels_per_stage = max_levels_per_stage;
    config.outbox = OutboxConfig {
        backoff_base_ms: 0,
        jitter_percent: 0,
        ..OutboxConfig::default()
    };
    config
}

/// A link cell pointing at `ids`.
pub fn links(ids: &[&str]) -> Value {
    link_value(ids.iter().copied())
}
