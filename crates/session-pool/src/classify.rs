//! Limit-like error detection
//!
//! Sessions report rate limiting structurally (`SessionError::RateLimited`)
//! when the transport can tell. Otherwise the message text is the only signal,
//! and it is matched against a fixed vocabulary of quota and rate-limit
//! wording. A limit-like error is this member's problem: the cascade moves on
//! to the next member.

use session::{ErrorClassification, SessionError};

/// Phrases that mark an error message as limit-like. Matched case-insensitively.
pub const LIMIT_PATTERNS: &[&str] = &[
    "pro limit",
    "pro queries",
    "pro search",
    "rate limit",
    "rate-limit",
    "ratelimit",
    "quota",
    "remaining",
    "file upload",
];

/// Whether a message matches the limit vocabulary.
pub fn is_limit_like(message: &str) -> bool {
    let lower = message.to_lowercase();
    LIMIT_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

/// Classify a session error, preferring the structured classification.
pub fn classify(error: &SessionError) -> ErrorClassification {
    error.structured_classification().unwrap_or_else(|| {
        if is_limit_like(&error.to_string()) {
            ErrorClassification::LimitLike
        } else {
            ErrorClassification::Transient
        }
    })
}
