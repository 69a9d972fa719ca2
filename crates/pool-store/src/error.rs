//! Error types for document persistence

/// Errors from reading or writing pool documents.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("document parse error: {0}")]
    Parse(String),

    #[error("invalid pool config: {0}")]
    InvalidConfig(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
