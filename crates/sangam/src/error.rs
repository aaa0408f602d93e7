use thiserror::Error;

/// Crate-wide error type.
///
/// The variants map onto the HTTP statuses an embedding service would
/// typically return: `Validation` → 422, `NotFound` → 404, `Query` → 400,
/// everything else → 5xx.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Query-time failure, usually a missing or empty index.
    #[error("query error: {0}")]
    Query(String),

    /// A produced chunk could not be mapped back onto its source blocks.
    #[error("chunking consistency error: {0}")]
    Chunking(String),

    #[error("metadata store error: {0}")]
    Metadata(#[from] rusqlite::Error),

    #[error("sparse index error: {0}")]
    Sparse(#[from] tantivy::TantivyError),

    #[error("dense index error: {0}")]
    Dense(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<lancedb::Error> for Error {
    fn from(e: lancedb::Error) -> Self {
        Error::Dense(e.to_string())
    }
}

impl From<arrow_schema::ArrowError> for Error {
    fn from(e: arrow_schema::ArrowError) -> Self {
        Error::Dense(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("background task failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
