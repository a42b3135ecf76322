use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] sqlparser::parser::ParserError),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Timed out waiting for a cache connection")]
    PoolTimeout,

    #[error("Rowcache process error: {0}")]
    Subprocess(String),

    #[error("Cache protocol error: {0}")]
    CacheProtocol(String),

    #[error("Not supported: {0}")]
    NotSupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;
