//! Durable documents shared by pool processes
//!
//! Two JSON files live side by side:
//! - the credential document (`token_pool_config.json` by default) holding
//!   member credentials plus monitor and fallback settings
//! - the runtime state document (`pool_state.json`) holding per-member health
//!   and cached quota, written by whichever process last probed
//!
//! Neither file is ever edited in place. Writes go to a temp file in the same
//! directory and are renamed over the target, so a reader sees either the old
//! or the new document. Reads compare the file mtime against the last value
//! seen and skip re-parsing when nothing changed.

mod atomic;
pub mod config;
pub mod error;
pub mod state;

pub use config::{
    ConfigStore, DEFAULT_CONFIG_FILE, DEFAULT_INTERVAL_HOURS, FallbackConfig, MonitorConfig,
    PoolConfig, TokenEntry,
};
pub use error::{Error, Result};
pub use state::{LoadOutcome, MemberState, RuntimeState, STATE_FILE_NAME, STATE_VERSION, StateStore};
