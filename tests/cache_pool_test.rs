use rusty_tablet::schema::CacheType;
use rusty_tablet::table_info::{BackendConn, BackendRow, QueryResult, TableInfo};
use rusty_tablet::{CachePool, Error, Result, RowCache, RowCacheConfig};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A minimal memcached stand-in: accepts connections and answers the text
/// protocol well enough for the probe and the row operations.
fn fake_memcached() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            thread::spawn(move || serve(stream));
        }
    });
    port
}

fn serve(stream: TcpStream) {
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    while reader.read_line(&mut line).map(|n| n > 0).unwrap_or(false) {
        let reply: &[u8] = if line.starts_with("set") {
            let mut data = String::new();
            let _ = reader.read_line(&mut data);
            b"STORED\r\n"
        } else if line.starts_with("get") {
            b"END\r\n"
        } else if line.starts_with("delete") {
            b"DELETED\r\n"
        } else {
            b"ERROR\r\n"
        };
        if writer.write_all(reply).is_err() {
            return;
        }
        line.clear();
    }
}

fn pool_config(port: u16, connections: i32) -> RowCacheConfig {
    RowCacheConfig {
        // The probe only needs something spawnable; the listener above
        // stands in for the real process.
        binary: "/bin/true".into(),
        tcp_port: port as i32,
        connections,
        ..RowCacheConfig::default()
    }
}

fn open_pool(connections: i32) -> Arc<CachePool> {
    let port = fake_memcached();
    let pool = Arc::new(
        CachePool::new(
            "test",
            pool_config(port, connections),
            Duration::from_secs(30),
            Duration::ZERO,
        )
        .unwrap(),
    );
    pool.open().unwrap();
    pool
}

#[test]
fn insufficient_connections_fail_construction() {
    let err = CachePool::new(
        "test",
        pool_config(11211, 50),
        Duration::ZERO,
        Duration::ZERO,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Pool(_)));
}

#[test]
fn disabled_pool_stays_closed() {
    let pool = CachePool::new(
        "test",
        RowCacheConfig::default(),
        Duration::ZERO,
        Duration::ZERO,
    )
    .unwrap();
    assert!(pool.is_closed());
    assert!(matches!(pool.open(), Err(Error::Pool(_))));
    assert!(matches!(
        pool.get(Duration::from_millis(10)),
        Err(Error::PoolClosed)
    ));
    assert_eq!(pool.capacity(), 0);
    assert_eq!(pool.stats_json(), "{}");
}

#[test]
fn open_get_put_close_reopen() {
    let pool = open_pool(52);
    assert!(!pool.is_closed());
    assert_eq!(pool.capacity(), 2);
    assert!(matches!(pool.open(), Err(Error::Pool(_))));

    let mut conn = pool.get(Duration::from_secs(1)).unwrap();
    assert!(conn.set("k", 0, 0, b"v").unwrap());
    assert_eq!(conn.get("k").unwrap(), None);
    pool.put(Some(conn));

    pool.close();
    assert!(pool.is_closed());
    assert!(matches!(
        pool.get(Duration::from_millis(10)),
        Err(Error::PoolClosed)
    ));
    // Close is idempotent and the pool is reusable after reopening.
    pool.close();
    pool.open().unwrap();
    assert!(!pool.is_closed());
    let conn = pool.get(Duration::from_secs(1)).unwrap();
    pool.put(Some(conn));
    pool.close();
}

#[test]
fn exhausted_pool_blocks_and_broken_conns_refill() {
    let pool = open_pool(51);
    assert_eq!(pool.capacity(), 1);

    let conn = pool.get(Duration::from_secs(1)).unwrap();
    assert!(matches!(
        pool.get(Duration::from_millis(30)),
        Err(Error::PoolTimeout)
    ));
    assert!(pool.wait_count() >= 1);

    // Reporting the connection broken frees the slot for a fresh one.
    drop(conn);
    pool.put(None);
    let conn = pool.get(Duration::from_secs(1)).unwrap();
    pool.put(Some(conn));
    assert_eq!(pool.available(), 1);
    pool.close();
}

#[test]
fn row_cache_prefixes_are_unique() {
    let pool = open_pool(54);
    let a = RowCache::new(pool.clone());
    let b = RowCache::new(pool.clone());
    assert_ne!(a.key("row"), b.key("row"));
    assert!(a.key("row").ends_with("row"));

    a.put("row", b"serialized").unwrap();
    assert_eq!(a.get("row").unwrap(), None);
    a.delete("row").unwrap();
    pool.close();
}

fn cells(values: &[&str]) -> BackendRow {
    values.iter().map(|s| Some(s.as_bytes().to_vec())).collect()
}

struct UsersConn;

impl BackendConn for UsersConn {
    fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        if sql.starts_with("describe") {
            Ok(QueryResult {
                rows: vec![
                    cells(&["id", "bigint(20)", "NO", "PRI", "", ""]),
                    cells(&["name", "varchar(128)", "YES", "", "", ""]),
                ],
            })
        } else {
            Ok(QueryResult {
                rows: vec![cells(&["users", "0", "PRIMARY", "1", "id", "A", "2"])],
            })
        }
    }
}

/// Same columns as `UsersConn` but no index at all, so PKColumns stays empty.
struct NoPkConn;

impl BackendConn for NoPkConn {
    fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        if sql.starts_with("describe") {
            Ok(QueryResult {
                rows: vec![
                    cells(&["id", "bigint(20)", "NO", "", "", ""]),
                    cells(&["name", "varchar(128)", "YES", "", "", ""]),
                ],
            })
        } else {
            Ok(QueryResult { rows: vec![] })
        }
    }
}

/// A table keyed on a datetime column, whose category is neither number
/// nor varbinary.
struct DatetimePkConn;

impl BackendConn for DatetimePkConn {
    fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        if sql.starts_with("describe") {
            Ok(QueryResult {
                rows: vec![
                    cells(&["at", "datetime", "NO", "PRI", "", ""]),
                    cells(&["payload", "varchar(128)", "YES", "", "", ""]),
                ],
            })
        } else {
            Ok(QueryResult {
                rows: vec![cells(&["events", "0", "PRIMARY", "1", "at", "A", "2"])],
            })
        }
    }
}

#[test]
fn eligible_table_gets_row_cache() {
    let pool = open_pool(53);
    let info = TableInfo::new(&mut UsersConn, "users", "BASE TABLE", "", &pool).unwrap();
    assert_eq!(info.table.cache_type, CacheType::ReadWrite);
    assert!(info.cache.is_some());

    // Each refusal leaves the cache detached even though the pool is open.
    let nocache =
        TableInfo::new(&mut UsersConn, "users", "BASE TABLE", "vtocc_nocache", &pool).unwrap();
    assert_eq!(nocache.table.cache_type, CacheType::None);
    assert!(nocache.cache.is_none());

    let view = TableInfo::new(&mut UsersConn, "users", "VIEW", "", &pool).unwrap();
    assert_eq!(view.table.cache_type, CacheType::None);
    assert!(view.cache.is_none());

    let no_pk = TableInfo::new(&mut NoPkConn, "users", "BASE TABLE", "", &pool).unwrap();
    assert!(no_pk.table.pk_columns.is_empty());
    assert_eq!(no_pk.table.cache_type, CacheType::None);
    assert!(no_pk.cache.is_none());

    let datetime_pk =
        TableInfo::new(&mut DatetimePkConn, "events", "BASE TABLE", "", &pool).unwrap();
    assert_eq!(datetime_pk.table.cache_type, CacheType::None);
    assert!(datetime_pk.cache.is_none());
    pool.close();
}
