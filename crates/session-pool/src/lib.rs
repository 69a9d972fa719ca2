//! Session pool for a rate-limited upstream
//!
//! Multiplexes several upstream accounts behind one logical client:
//! - round-robin selection under availability and quota constraints
//! - exponential backoff after member failures (60s doubling, 1h ceiling)
//! - quota-aware mode gating from cached rate-limit snapshots
//! - health probes and a periodic monitor with bounded concurrency
//! - a failover cascade for queries: pool members, then degraded members in
//!   auto mode, then a fresh anonymous session
//!
//! The pool is an explicit instance, built once by the composition root and
//! shared as `Arc<Pool>`. Credentials live in the credential document and
//! health in the runtime state document (see the `pool-store` crate), so a
//! read-only process can observe health written by the monitoring process.

pub mod admin;
pub mod answer;
pub mod classify;
pub mod error;
pub mod member;
mod monitor;
pub mod notify;
pub mod orchestrator;
pub mod pool;
mod probe;
pub mod validate;

#[cfg(test)]
mod testing;

pub use admin::{AdminCommand, AdminFailure, Envelope};
pub use answer::{Answer, FallbackInfo, Source};
pub use classify::{LIMIT_PATTERNS, classify, is_limit_like};
pub use error::{Error, Result};
pub use member::{HealthState, MemberStatus, PoolMember, backoff_for};
pub use monitor::PROBE_BATCH_TIMEOUT;
pub use notify::{LogNotifier, Notifier, Transition};
pub use orchestrator::{QueryOutcome, QueryRequest};
pub use pool::{
    FallbackUpdate, ImportPayload, ImportReport, MemberSummary, MonitorUpdate, Pool, PoolBuilder,
    PoolOptions, PoolSource, PoolStatus, Selection, SourceChoice, StateLoad, resolve_source,
};
pub use probe::{ProbeReport, TestAllReport};
pub use validate::ValidationError;
