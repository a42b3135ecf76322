use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};
use crate::memcache::CacheConn;
use crate::pool::ResourcePool;

/// Connections held back for operational traffic against the cache process.
const RESERVED_CONNECTIONS: usize = 50;
const DEFAULT_CONNECTIONS: usize = 1024;
const DEFAULT_TCP_PORT: &str = "11211";

const PROBE_ATTEMPTS: u32 = 50;
const PROBE_SLEEP: Duration = Duration::from_millis(100);
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(30);
const POOL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowCacheConfig {
    /// Path to the rowcache binary; empty disables caching.
    pub binary: String,
    /// Memory limit in MB.
    pub memory: i64,
    pub socket: String,
    pub tcp_port: i32,
    pub connections: i32,
    pub threads: i32,
    pub lock_paged: bool,
}

impl RowCacheConfig {
    /// The subprocess command line, binary first. Empty when disabled.
    pub fn subprocess_args(&self) -> Vec<String> {
        let mut cmd = Vec::new();
        if self.binary.is_empty() {
            return cmd;
        }
        cmd.push(self.binary.clone());
        if self.memory > 0 {
            cmd.push("-m".into());
            cmd.push(self.memory.to_string());
        }
        if !self.socket.is_empty() {
            cmd.push("-s".into());
            cmd.push(self.socket.clone());
        }
        if self.tcp_port > 0 {
            cmd.push("-p".into());
            cmd.push(self.tcp_port.to_string());
        }
        if self.connections > 0 {
            cmd.push("-c".into());
            cmd.push(self.connections.to_string());
        }
        if self.threads > 0 {
            cmd.push("-t".into());
            cmd.push(self.threads.to_string());
        }
        if self.lock_paged {
            cmd.push("-k".into());
        }
        cmd
    }
}

static MAX_PREFIX: AtomicU64 = AtomicU64::new(0);

fn next_prefix() -> u64 {
    MAX_PREFIX.fetch_add(1, Ordering::SeqCst) + 1
}

/// Supervises the child rowcache process and a bounded pool of connections
/// to it.
///
/// The mutex guards the handle pointers only; callers snapshot the pool
/// handle and operate on the snapshot lock-free, so a blocked `put` can
/// never deadlock against `close`.
#[derive(Debug)]
pub struct CachePool {
    name: String,
    config: RowCacheConfig,
    capacity: usize,
    endpoint: String,
    idle_timeout: Duration,
    /// Grace window for tombstoning deleted rows; zero when no query
    /// timeout is configured.
    pub delete_expiry: u64,
    state: Mutex<PoolHandle>,
}

#[derive(Debug, Default)]
struct PoolHandle {
    pool: Option<Arc<ResourcePool<CacheConn>>>,
    child: Option<Child>,
}

impl CachePool {
    pub fn new(
        name: impl Into<String>,
        config: RowCacheConfig,
        query_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<CachePool> {
        let mut cp = CachePool {
            name: name.into(),
            config: RowCacheConfig::default(),
            capacity: 0,
            endpoint: String::new(),
            idle_timeout,
            delete_expiry: 0,
            state: Mutex::new(PoolHandle::default()),
        };
        if config.binary.is_empty() {
            return Ok(cp);
        }

        cp.capacity = DEFAULT_CONNECTIONS - RESERVED_CONNECTIONS;
        cp.endpoint = DEFAULT_TCP_PORT.into();
        if !config.socket.is_empty() {
            cp.endpoint = config.socket.clone();
        }
        if config.tcp_port > 0 {
            cp.endpoint = format!(":{}", config.tcp_port);
        }
        if config.connections > 0 {
            if config.connections <= RESERVED_CONNECTIONS as i32 {
                return Err(Error::Pool(format!(
                    "insufficient capacity: {}",
                    config.connections
                )));
            }
            cp.capacity = config.connections as usize - RESERVED_CONNECTIONS;
        }

        // Grace period for memcache expiry of deleted items.
        let seconds = query_timeout.as_secs();
        if seconds != 0 {
            cp.delete_expiry = 2 * seconds + 15;
        }
        cp.config = config;
        Ok(cp)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.pool.is_some() {
            return Err(Error::Pool("rowcache is already open".into()));
        }
        if self.config.binary.is_empty() {
            return Err(Error::Pool("rowcache binary not specified".into()));
        }
        state.child = Some(self.start_memcache()?);
        info!("rowcache is enabled on {}", self.endpoint);
        let endpoint = self.endpoint.clone();
        let factory = Box::new(move || CacheConn::connect(&endpoint, POOL_CONNECT_TIMEOUT));
        state.pool = Some(Arc::new(ResourcePool::new(
            factory,
            self.capacity,
            self.idle_timeout,
        )));
        Ok(())
    }

    fn start_memcache(&self) -> Result<Child> {
        if self.endpoint.contains('/') {
            // Stale socket from an earlier run.
            let _ = std::fs::remove_file(&self.endpoint);
        }
        let args = self.config.subprocess_args();
        let mut child = Command::new(&args[0])
            .args(&args[1..])
            .spawn()
            .map_err(|e| Error::Subprocess(format!("can't start rowcache: {e}")))?;

        let mut attempts = 0;
        loop {
            thread::sleep(PROBE_SLEEP);
            let mut conn = match CacheConn::connect(&self.endpoint, PROBE_CONNECT_TIMEOUT) {
                Ok(conn) => conn,
                Err(_) => {
                    attempts += 1;
                    if attempts >= PROBE_ATTEMPTS {
                        reap(child);
                        return Err(Error::Subprocess("can't connect to rowcache".into()));
                    }
                    continue;
                }
            };
            if let Err(e) = conn.set("health", 0, 0, b"ok") {
                reap(child);
                return Err(Error::Subprocess(format!(
                    "can't communicate with rowcache: {e}"
                )));
            }
            return Ok(child);
        }
    }

    /// Two-phase close: drain the pool outside the lock so in-flight puts
    /// can complete, then reap the child under the lock.
    pub fn close(&self) {
        let Some(pool) = self.pool() else {
            return;
        };
        pool.close();

        let mut state = self.state.lock();
        if state.pool.is_none() {
            return;
        }
        if let Some(child) = state.child.take() {
            reap(child);
        }
        if self.endpoint.contains('/') {
            let _ = std::fs::remove_file(&self.endpoint);
        }
        state.pool = None;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().pool.is_none()
    }

    fn pool(&self) -> Option<Arc<ResourcePool<CacheConn>>> {
        self.state.lock().pool.clone()
    }

    /// Takes a connection. A zero timeout waits without bound. You must
    /// `put` after `get`.
    pub fn get(&self, timeout: Duration) -> Result<CacheConn> {
        let Some(pool) = self.pool() else {
            return Err(Error::PoolClosed);
        };
        pool.get(timeout)
    }

    /// Returns a connection, or `None` to report it broken.
    pub fn put(&self, conn: Option<CacheConn>) {
        let Some(pool) = self.pool() else {
            return;
        };
        pool.put(conn);
    }

    pub fn capacity(&self) -> usize {
        self.pool().map_or(0, |p| p.capacity())
    }

    pub fn available(&self) -> usize {
        self.pool().map_or(0, |p| p.available())
    }

    pub fn max_cap(&self) -> usize {
        self.pool().map_or(0, |p| p.max_cap())
    }

    pub fn wait_count(&self) -> u64 {
        self.pool().map_or(0, |p| p.wait_count())
    }

    pub fn wait_time(&self) -> Duration {
        self.pool().map_or(Duration::ZERO, |p| p.wait_time())
    }

    pub fn idle_timeout(&self) -> Duration {
        self.pool().map_or(Duration::ZERO, |p| p.idle_timeout())
    }

    pub fn stats_json(&self) -> String {
        self.pool().map_or_else(|| "{}".into(), |p| p.stats_json())
    }
}

/// Kill then wait on a separate thread so callers return promptly and the
/// child never lingers as a zombie.
fn reap(mut child: Child) {
    let _ = child.kill();
    thread::spawn(move || {
        let _ = child.wait();
    });
}

/// Per-table cache handle. Every instance draws a unique prefix from a
/// process-wide counter and prepends it to each key, isolating tables
/// without tearing the cache down on schema changes.
#[derive(Debug)]
pub struct RowCache {
    prefix: String,
    cache_pool: Arc<CachePool>,
}

impl RowCache {
    pub fn new(cache_pool: Arc<CachePool>) -> RowCache {
        RowCache {
            prefix: format!("{:010}.", next_prefix()),
            cache_pool,
        }
    }

    pub fn key(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.prefix)
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.cache_pool.get(Duration::ZERO)?;
        match conn.get(&self.key(key)) {
            Ok(value) => {
                self.cache_pool.put(Some(conn));
                Ok(value)
            }
            Err(e) => {
                self.cache_pool.put(None);
                Err(e)
            }
        }
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.cache_pool.get(Duration::ZERO)?;
        match conn.set(&self.key(key), 0, 0, value) {
            Ok(_) => {
                self.cache_pool.put(Some(conn));
                Ok(())
            }
            Err(e) => {
                self.cache_pool.put(None);
                Err(e)
            }
        }
    }

    /// Tombstones the row for the delete-expiry grace window, or removes it
    /// outright when no window is configured.
    pub fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.cache_pool.get(Duration::ZERO)?;
        let result = if self.cache_pool.delete_expiry > 0 {
            conn.set(&self.key(key), 0, self.cache_pool.delete_expiry, b"")
                .map(|_| ())
        } else {
            conn.delete(&self.key(key)).map(|_| ())
        };
        match result {
            Ok(()) => {
                self.cache_pool.put(Some(conn));
                Ok(())
            }
            Err(e) => {
                self.cache_pool.put(None);
                Err(e)
            }
        }
    }
}
