//! Error types for session calls

/// How the pool should treat a failed call.
///
/// - `LimitLike` means the member hit a quota or rate limit. The pool moves on
///   to the next member and, for metered modes, records a limit failure that
///   does not touch backoff.
/// - `Transient` covers everything else. The member enters exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    LimitLike,
    Transient,
}

/// Errors from upstream session calls.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Upstream(String),
}

impl SessionError {
    /// Error-kind tag surfaced in failure envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::RateLimited(_) => "RateLimited",
            SessionError::Unauthorized(_) => "Unauthorized",
            SessionError::Http(_) => "HttpError",
            SessionError::InvalidResponse(_) => "InvalidResponse",
            SessionError::Upstream(_) => "UpstreamError",
        }
    }

    /// Classification carried by the error itself, if the transport knew it.
    ///
    /// `None` means only the message text is available and callers fall back
    /// to matching it against the limit vocabulary.
    pub fn structured_classification(&self) -> Option<ErrorClassification> {
        match self {
            SessionError::RateLimited(_) => Some(ErrorClassification::LimitLike),
            _ => None,
        }
    }
}

/// Result alias for session calls.
pub type Result<T> = std::result::Result<T, SessionError>;
