//! Error types for metadata sources.

use thiserror::Error;

/// Result type alias for metadata source operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors raised while reading (or, for snapshots, seeding) metadata.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open source: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("query failed: {0}")]
    Query(String),
}
