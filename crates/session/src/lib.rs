//! Session abstraction for the rate-limited upstream
//!
//! Defines the `Session` trait that decouples pool logic from the upstream
//! transport. A session is bound to one credential set (or none, for the
//! anonymous fallback) and exposes three calls:
//! - `search` issues a query and returns the raw JSON payload
//! - `user_info` reports whether the credentials map to a signed-in identity
//! - `rate_limits` fetches the quota snapshot without consuming quota
//!
//! `HttpSession` is the reqwest-backed implementation used by the gateway.
//! Tests provide scripted in-memory sessions through the same trait.

pub mod error;
pub mod http;
pub mod mode;
pub mod quota;
pub mod request;

pub use error::{ErrorClassification, Result, SessionError};
pub use http::{Endpoints, HttpSession, HttpSessionFactory};
pub use mode::{Mode, UnknownMode};
pub use quota::{ModeQuota, PRO_SEARCH, QuotaSnapshot, RESEARCH};
pub use request::{Attachment, Credentials, SearchRequest, UserInfo};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by `Session` methods.
///
/// Uses `Pin<Box<dyn Future>>` so sessions stay dyn-compatible (`Arc<dyn Session>`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One authenticated (or anonymous) connection to the upstream.
pub trait Session: Send + Sync {
    /// Whether this session carries account credentials.
    ///
    /// Anonymous sessions have no metered queries and no file uploads, and
    /// cannot pick a model.
    fn owns_account(&self) -> bool;

    /// Execute a query. Returns the upstream JSON payload.
    fn search<'a>(&'a self, request: &'a SearchRequest)
    -> BoxFuture<'a, Result<serde_json::Value>>;

    /// Identity check. An empty `UserInfo` means the credentials are not signed in.
    fn user_info(&self) -> BoxFuture<'_, Result<UserInfo>>;

    /// Quota snapshot. Never consumes a unit of metered quota.
    fn rate_limits(&self) -> BoxFuture<'_, Result<QuotaSnapshot>>;
}

/// Builds sessions for pool members and for the anonymous fallback tier.
pub trait SessionFactory: Send + Sync {
    /// Session bound to the given credentials.
    fn connect(&self, credentials: &Credentials) -> Arc<dyn Session>;

    /// Fresh session with no credentials.
    fn anonymous(&self) -> Arc<dyn Session>;
}
