use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache_pool::{CachePool, RowCache};
use crate::error::{Error, Result};
use crate::schema::{CacheType, Category, Index, SqlValue, Table};

pub type BackendRow = Vec<Option<Vec<u8>>>;

#[derive(Debug, Default)]
pub struct QueryResult {
    pub rows: Vec<BackendRow>,
}

/// Request/response transport to the backing MySQL server.
pub trait BackendConn {
    fn execute(&mut self, sql: &str) -> Result<QueryResult>;
}

/// A loaded table plus its row-cache binding and usage counters.
///
/// Counters are bumped concurrently by the execution layer and read
/// atomically by the stats view.
#[derive(Debug)]
pub struct TableInfo {
    pub table: Table,
    pub cache: Option<RowCache>,
    hits: AtomicU64,
    absent: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl TableInfo {
    pub fn new(
        conn: &mut dyn BackendConn,
        table_name: &str,
        table_type: &str,
        comment: &str,
        cache_pool: &Arc<CachePool>,
    ) -> Result<TableInfo> {
        let mut info = TableInfo::load(conn, table_name)?;
        info.init_row_cache(table_type, comment, cache_pool);
        Ok(info)
    }

    /// Loads column and index metadata. Errors propagate; partial state is
    /// never returned.
    pub fn load(conn: &mut dyn BackendConn, table_name: &str) -> Result<TableInfo> {
        let mut table = Table::new(table_name);
        fetch_columns(conn, &mut table)?;
        fetch_indexes(conn, &mut table)?;
        Ok(TableInfo {
            table,
            cache: None,
            hits: AtomicU64::new(0),
            absent: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        })
    }

    /// Replaces the primary key with a synthetic `PRIMARY` index over the
    /// named columns and rederives the covering sets.
    pub fn set_pk(&mut self, col_names: &[&str]) -> Result<()> {
        let mut pk_index = Index::new("PRIMARY");
        let mut pk_columns = Vec::with_capacity(col_names.len());
        for name in col_names {
            let Some(idx) = self.table.find_column(name) else {
                return Err(Error::Schema(format!("column {name} not found")));
            };
            pk_columns.push(idx);
            pk_index.add_column(*name, 1);
        }
        if self.table.has_primary() {
            self.table.indexes[0] = pk_index;
        } else {
            self.table.indexes.insert(0, pk_index);
        }
        self.table.pk_columns = pk_columns;
        apply_pk_covering(&mut self.table);
        Ok(())
    }

    fn init_row_cache(&mut self, table_type: &str, comment: &str, cache_pool: &Arc<CachePool>) {
        if cache_pool.is_closed() {
            return;
        }
        let name = &self.table.name;
        if comment.contains("vtocc_nocache") {
            info!("{name} commented as vtocc_nocache. Will not be cached.");
            return;
        }
        if table_type == "VIEW" {
            info!("{name} is a view. Will not be cached.");
            return;
        }
        if self.table.pk_columns.is_empty() {
            info!("Table {name} has no primary key. Will not be cached.");
            return;
        }
        for &col in &self.table.pk_columns {
            if self.table.columns[col].category == Category::Other {
                info!("Table {name} pk has unsupported column types. Will not be cached.");
                return;
            }
        }
        self.table.cache_type = CacheType::ReadWrite;
        self.cache = Some(RowCache::new(cache_pool.clone()));
    }

    pub fn add_hits(&self, n: u64) {
        self.hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_absent(&self, n: u64) {
        self.absent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_misses(&self, n: u64) {
        self.misses.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_invalidations(&self, n: u64) {
        self.invalidations.fetch_add(n, Ordering::Relaxed);
    }

    pub fn stats(&self) -> (u64, u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.absent.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.invalidations.load(Ordering::Relaxed),
        )
    }

    pub fn stats_json(&self) -> String {
        if self.cache.is_none() {
            return "null".into();
        }
        let (hits, absent, misses, invalidations) = self.stats();
        serde_json::json!({
            "Hits": hits,
            "Absent": absent,
            "Misses": misses,
            "Invalidations": invalidations,
        })
        .to_string()
    }
}

fn fetch_columns(conn: &mut dyn BackendConn, table: &mut Table) -> Result<()> {
    let result = conn.execute(&format!("describe `{}`", table.name))?;
    // describe: Field, Type, Null, Key, Default, Extra
    for row in &result.rows {
        let name = cell_str(row, 0);
        let column_type = cell_str(row, 1);
        let default = SqlValue::from_bytes(cell(row, 4));
        let extra = cell_str(row, 5);
        table.add_column(name, &column_type, default, extra);
    }
    Ok(())
}

fn fetch_indexes(conn: &mut dyn BackendConn, table: &mut Table) -> Result<()> {
    let result = conn.execute(&format!("show index from `{}`", table.name))?;
    // show index rows arrive grouped by Key_name (col 2), ordered by
    // Seq_in_index; Column_name is col 4, Cardinality col 6.
    let mut current_name = String::new();
    for row in &result.rows {
        let index_name = cell_str(row, 2);
        if current_name != index_name {
            table.add_index(index_name.clone());
            current_name = index_name;
        }
        let cardinality = match cell(row, 6) {
            None => 0,
            Some(raw) => {
                let s = String::from_utf8_lossy(raw);
                s.parse::<u64>().unwrap_or_else(|e| {
                    warn!("bad cardinality {s:?}: {e}");
                    0
                })
            }
        };
        let column = cell_str(row, 4);
        if let Some(index) = table.indexes.last_mut() {
            index.add_column(column, cardinality);
        }
    }

    if !table.has_primary() {
        return Ok(());
    }
    let mut pk_columns = Vec::with_capacity(table.indexes[0].columns.len());
    for pk_col in &table.indexes[0].columns {
        let Some(idx) = table.find_column(pk_col) else {
            return Err(Error::Schema(format!(
                "primary key column {pk_col} not found in table {}",
                table.name
            )));
        };
        pk_columns.push(idx);
    }
    table.pk_columns = pk_columns;
    apply_pk_covering(table);
    Ok(())
}

/// The primary index covers every table column; every secondary index covers
/// its own columns plus all PK columns.
fn apply_pk_covering(table: &mut Table) {
    if table.indexes.is_empty() {
        return;
    }
    let pk_columns: Vec<String> = table.indexes[0].columns.clone();
    table.indexes[0].data_columns = table.columns.iter().map(|c| c.name.clone()).collect();
    for index in table.indexes.iter_mut().skip(1) {
        index.data_columns = index.columns.clone();
        for pk_col in &pk_columns {
            if index.find_data_column(pk_col).is_none() {
                index.data_columns.push(pk_col.clone());
            }
        }
    }
}

fn cell<'a>(row: &'a BackendRow, i: usize) -> Option<&'a [u8]> {
    row.get(i).and_then(|c| c.as_deref())
}

fn cell_str(row: &BackendRow, i: usize) -> String {
    cell(row, i)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default()
}
