//! Error types for the migration engine.
//!
//! The variants that automation needs to distinguish (`MismatchedAlter`,
//! `BinlogNotFound`, `ChecksumMismatch`) are first-class so callers can
//! match on them instead of scraping log output.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("alter statement in checkpoint table does not match the alter statement specified here")]
    MismatchedAlter,

    #[error("binlog file {file} is no longer available on the server")]
    BinlogNotFound { file: String },

    #[error("checksum mismatch: {differences} chunk(s) differ between the source and new table")]
    ChecksumMismatch { differences: usize },

    #[error("table definition changed during migration")]
    TableChangedDuringMigration,

    #[error("cutover failed and retries exhausted")]
    CutoverRetriesExhausted,

    #[error("ALTER contains unsupported clause(s): {0}")]
    UnsupportedAlter(String),

    #[error("invalid migration request: {0}")]
    InvalidConfig(String),

    #[error("replication client error: {0}")]
    Replication(String),

    #[error("unsafe warning applying chunk: {message}, query: {query}")]
    UnsafeWarning { message: String, query: String },

    #[error("MySQL error: {0}")]
    Mysql(#[from] mysql_async::Error),

    #[error("SQL parse error: {0}")]
    SqlParse(#[from] sqlparser::parser::ParserError),

    #[error("watermark serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Exit code for the binary. Distinguishable errors get their own
    /// codes so wrapper automation can branch without parsing messages.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::MismatchedAlter => 2,
            Error::BinlogNotFound { .. } => 3,
            Error::ChecksumMismatch { .. } => 4,
            _ => 1,
        }
    }
}
