pub mod cache_pool;
pub mod error;
pub mod memcache;
pub mod plan;
pub mod pool;
pub mod rewrite;
pub mod schema;
pub mod table_info;

pub use cache_pool::{CachePool, RowCache, RowCacheConfig};
pub use error::{Error, Result};
pub use memcache::CacheConn;
pub use plan::{get_exec_plan, ExecPlan, PkValue, PkValues, PlanType, ReasonType, TableGetter};
pub use pool::ResourcePool;
pub use rewrite::{BindLocation, ParsedQuery};
pub use schema::{CacheType, Category, Index, SqlValue, Table, TableColumn};
pub use table_info::{BackendConn, BackendRow, QueryResult, TableInfo};
