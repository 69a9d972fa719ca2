//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("member '{0}' not found")]
    NotFound(String),

    #[error("member '{0}' already exists")]
    AlreadyExists(String),

    #[error("cannot remove the last member, at least one member must remain")]
    LastMember,

    #[error("cannot disable the last enabled member, at least one member must remain enabled")]
    LastEnabledMember,

    #[error("invalid member: {0}")]
    InvalidMember(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("no tokens found in import payload")]
    EmptyImport,

    #[error("store error: {0}")]
    Store(#[from] pool_store::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
