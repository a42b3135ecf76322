#![allow(dead_code)]

use rusty_tablet::schema::{SqlValue, Table};
use rusty_tablet::TableGetter;
use std::collections::HashMap;
use std::sync::Arc;

/// `t(pk, a, b)` with a single-column `PRIMARY` on `pk`.
pub fn spec_table(name: &str) -> Table {
    let mut table = Table::new(name);
    table.add_column("pk", "bigint(20)", SqlValue::Null, "");
    table.add_column("a", "varchar(128)", SqlValue::Null, "");
    table.add_column("b", "varchar(128)", SqlValue::Null, "");
    table.add_index("PRIMARY").add_column("pk", 1);
    table.pk_columns = vec![0];
    cover(&mut table);
    table
}

/// `spec_table` plus an `idx_col` column carrying a secondary index `idx`.
pub fn indexed_table(name: &str) -> Table {
    let mut table = Table::new(name);
    table.add_column("pk", "bigint(20)", SqlValue::Null, "");
    table.add_column("a", "varchar(128)", SqlValue::Null, "");
    table.add_column("b", "varchar(128)", SqlValue::Null, "");
    table.add_column("idx_col", "bigint(20)", SqlValue::Null, "");
    table.add_index("PRIMARY").add_column("pk", 1);
    table.add_index("idx").add_column("idx_col", 10);
    table.pk_columns = vec![0];
    cover(&mut table);
    table
}

/// A table with a two-column primary key `(k1, k2)` and a payload column.
pub fn composite_pk_table(name: &str) -> Table {
    let mut table = Table::new(name);
    table.add_column("k1", "int(11)", SqlValue::Null, "");
    table.add_column("k2", "varchar(64)", SqlValue::Null, "");
    table.add_column("val", "varchar(128)", SqlValue::Null, "");
    let primary = table.add_index("PRIMARY");
    primary.add_column("k1", 1);
    primary.add_column("k2", 1);
    table.pk_columns = vec![0, 1];
    cover(&mut table);
    table
}

/// A table with no primary key at all.
pub fn heap_table(name: &str) -> Table {
    let mut table = Table::new(name);
    table.add_column("a", "int(11)", SqlValue::Null, "");
    table.add_column("b", "varchar(64)", SqlValue::Null, "");
    table
}

fn cover(table: &mut Table) {
    let pk_columns: Vec<String> = table.indexes[0].columns.clone();
    table.indexes[0].data_columns = table.columns.iter().map(|c| c.name.clone()).collect();
    for index in table.indexes.iter_mut().skip(1) {
        index.data_columns = index.columns.clone();
        for pk in &pk_columns {
            if index.find_data_column(pk).is_none() {
                index.data_columns.push(pk.clone());
            }
        }
    }
}

pub struct SchemaFixture {
    tables: HashMap<String, Arc<Table>>,
}

impl SchemaFixture {
    pub fn new(tables: Vec<Table>) -> SchemaFixture {
        SchemaFixture {
            tables: tables
                .into_iter()
                .map(|t| (t.name.clone(), Arc::new(t)))
                .collect(),
        }
    }
}

/// Plans `sql` against the fixture.
pub fn plan(fixture: &SchemaFixture, sql: &str) -> rusty_tablet::Result<rusty_tablet::ExecPlan> {
    let getter = |name: &str| fixture.tables.get(name).cloned();
    let getter: &TableGetter = &getter;
    rusty_tablet::get_exec_plan(sql, getter)
}
