//! Shared building blocks for the session pool workspace
//!
//! Holds the credential `Secret` wrapper, the configuration error type used by
//! the gateway's TOML loader, and the wall-clock helpers used for timestamps
//! that are written into the shared state documents.

mod error;
mod secret;
mod time;

pub use error::{Error, Result};
pub use secret::Secret;
pub use time::unix_seconds;
