use rusty_tablet::schema::{CacheType, Category, SqlValue};
use rusty_tablet::table_info::{BackendConn, BackendRow, QueryResult, TableInfo};
use rusty_tablet::{CachePool, Error, Result, RowCacheConfig};
use std::sync::Arc;
use std::time::Duration;

struct FakeConn {
    describe: Vec<BackendRow>,
    indexes: Vec<BackendRow>,
}

impl BackendConn for FakeConn {
    fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        if sql.starts_with("describe") {
            Ok(QueryResult {
                rows: self.describe.clone(),
            })
        } else if sql.starts_with("show index") {
            Ok(QueryResult {
                rows: self.indexes.clone(),
            })
        } else {
            Err(Error::Backend(format!("unexpected query: {sql}")))
        }
    }
}

struct FailingConn;

impl BackendConn for FailingConn {
    fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        Err(Error::Backend(format!("connection lost during: {sql}")))
    }
}

fn cells(values: &[Option<&str>]) -> BackendRow {
    values
        .iter()
        .map(|v| v.map(|s| s.as_bytes().to_vec()))
        .collect()
}

// describe: Field, Type, Null, Key, Default, Extra
fn describe_row(name: &str, ty: &str, default: Option<&str>, extra: &str) -> BackendRow {
    cells(&[
        Some(name),
        Some(ty),
        Some("NO"),
        Some(""),
        default,
        Some(extra),
    ])
}

// show index: Table, Non_unique, Key_name, Seq_in_index, Column_name,
// Collation, Cardinality
fn index_row(key_name: &str, seq: &str, column: &str, cardinality: Option<&str>) -> BackendRow {
    cells(&[
        Some("users"),
        Some("0"),
        Some(key_name),
        Some(seq),
        Some(column),
        Some("A"),
        cardinality,
    ])
}

fn users_conn() -> FakeConn {
    FakeConn {
        describe: vec![
            describe_row("id", "bigint(20)", None, "auto_increment"),
            describe_row("name", "varchar(128)", Some("guest"), ""),
            describe_row("score", "int(11)", Some("0"), ""),
            describe_row("joined", "datetime", None, ""),
        ],
        indexes: vec![
            index_row("PRIMARY", "1", "id", Some("100")),
            index_row("by_name", "1", "name", Some("50")),
            index_row("by_name", "2", "id", Some("100")),
            index_row("by_score", "1", "score", Some("oops")),
        ],
    }
}

fn closed_pool() -> Arc<CachePool> {
    Arc::new(
        CachePool::new(
            "test",
            RowCacheConfig::default(),
            Duration::ZERO,
            Duration::ZERO,
        )
        .unwrap(),
    )
}

#[test]
fn load_parses_columns_and_categories() -> anyhow::Result<()> {
    let info = TableInfo::load(&mut users_conn(), "users")?;
    let table = &info.table;
    assert_eq!(table.columns.len(), 4);
    assert_eq!(table.columns[0].category, Category::Number);
    assert_eq!(table.columns[0].extra, "auto_increment");
    assert_eq!(table.columns[1].category, Category::Varbinary);
    assert_eq!(table.columns[1].default, SqlValue::Text("guest".into()));
    assert_eq!(table.columns[2].default, SqlValue::Number("0".into()));
    assert_eq!(table.columns[3].category, Category::Other);
    assert_eq!(table.columns[3].default, SqlValue::Null);
    Ok(())
}

#[test]
fn load_derives_pk_and_covering() -> anyhow::Result<()> {
    let info = TableInfo::load(&mut users_conn(), "users")?;
    let table = &info.table;
    assert_eq!(table.pk_columns, vec![0]);
    assert_eq!(table.indexes.len(), 3);

    // The primary index covers every column.
    assert_eq!(
        table.indexes[0].data_columns,
        vec!["id", "name", "score", "joined"]
    );
    // by_name already lists id, so nothing is appended twice.
    assert_eq!(table.indexes[1].columns, vec!["name", "id"]);
    assert_eq!(table.indexes[1].data_columns, vec!["name", "id"]);
    // by_score gains the pk column.
    assert_eq!(table.indexes[2].data_columns, vec!["score", "id"]);
    // Unparseable cardinality degrades to zero.
    assert_eq!(table.indexes[2].cardinality, vec![0]);
    Ok(())
}

#[test]
fn load_without_primary_leaves_pk_empty() -> anyhow::Result<()> {
    let mut conn = users_conn();
    conn.indexes = vec![index_row("by_name", "1", "name", Some("50"))];
    let info = TableInfo::load(&mut conn, "users")?;
    assert!(info.table.pk_columns.is_empty());
    assert!(info.table.indexes[0].data_columns.is_empty());
    Ok(())
}

#[test]
fn load_propagates_backend_errors() {
    let err = TableInfo::load(&mut FailingConn, "users").unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
}

#[test]
fn set_pk_overrides_primary() -> anyhow::Result<()> {
    let mut info = TableInfo::load(&mut users_conn(), "users")?;
    info.set_pk(&["name", "score"])?;
    let table = &info.table;
    assert_eq!(table.indexes[0].name, "PRIMARY");
    assert_eq!(table.indexes[0].columns, vec!["name", "score"]);
    assert_eq!(table.pk_columns, vec![1, 2]);
    assert_eq!(
        table.indexes[0].data_columns,
        vec!["id", "name", "score", "joined"]
    );
    // Secondary covering is rederived against the new pk.
    assert_eq!(table.indexes[2].data_columns, vec!["score", "name"]);
    Ok(())
}

#[test]
fn set_pk_inserts_when_no_primary() -> anyhow::Result<()> {
    let mut conn = users_conn();
    conn.indexes = vec![index_row("by_name", "1", "name", Some("50"))];
    let mut info = TableInfo::load(&mut conn, "users")?;
    info.set_pk(&["id"])?;
    assert_eq!(info.table.indexes[0].name, "PRIMARY");
    assert_eq!(info.table.indexes[1].name, "by_name");
    assert_eq!(info.table.pk_columns, vec![0]);
    Ok(())
}

#[test]
fn set_pk_unknown_column_errors() -> anyhow::Result<()> {
    let mut info = TableInfo::load(&mut users_conn(), "users")?;
    let err = info.set_pk(&["nope"]).unwrap_err();
    assert!(matches!(err, Error::Schema(_)));
    Ok(())
}

#[test]
fn closed_pool_disables_caching() -> anyhow::Result<()> {
    let info = TableInfo::new(&mut users_conn(), "users", "BASE TABLE", "", &closed_pool())?;
    assert_eq!(info.table.cache_type, CacheType::None);
    assert!(info.cache.is_none());
    assert_eq!(info.stats_json(), "null");
    Ok(())
}

#[test]
fn counters_accumulate() -> anyhow::Result<()> {
    let info = TableInfo::load(&mut users_conn(), "users")?;
    info.add_hits(3);
    info.add_absent(1);
    info.add_misses(2);
    info.add_invalidations(5);
    info.add_hits(1);
    assert_eq!(info.stats(), (4, 1, 2, 5));
    Ok(())
}
