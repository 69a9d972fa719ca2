//! One pooled credential set with its health, quota and backoff state
//!
//! Health is never stored. `state()` derives it on every read from the
//! session validity flag and the cached quota snapshot:
//!
//! | session_valid | pro_remaining | state       |
//! |---------------|---------------|-------------|
//! | false         | any           | `Offline`   |
//! | unknown       | any           | `Unknown`   |
//! | true          | `<= 0`        | `Exhausted` |
//! | true          | absent / `> 0`| `Normal`    |

use std::sync::Arc;
use std::time::Duration;

use pool_store::MemberState;
use serde::Serialize;
use session::{Credentials, Mode, PRO_SEARCH, QuotaSnapshot, RESEARCH, Session};
use tokio::time::Instant;

/// Backoff after the first consecutive failure.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(60);

/// Backoff ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// Backoff window after `fail_count` consecutive failures.
///
/// 60s, 120s, 240s, ... doubling from `INITIAL_BACKOFF`, clamped at `MAX_BACKOFF`.
pub fn backoff_for(fail_count: u32) -> Duration {
    if fail_count == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(fail_count - 1).unwrap_or(u32::MAX);
    INITIAL_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Derived health of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Offline,
    Unknown,
    Exhausted,
    Normal,
}

impl HealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Offline => "offline",
            HealthState::Unknown => "unknown",
            HealthState::Exhausted => "exhausted",
            HealthState::Normal => "normal",
        }
    }
}

pub struct PoolMember {
    pub(crate) id: String,
    pub(crate) session: Arc<dyn Session>,
    /// `None` for the anonymous member.
    pub(crate) credentials: Option<Credentials>,
    pub(crate) enabled: bool,
    pub(crate) fail_count: u32,
    /// Metered-limit failures. Observability only, never affects backoff.
    pub(crate) limit_failures: u32,
    pub(crate) available_after: Option<Instant>,
    pub(crate) request_count: u64,
    pub(crate) session_valid: Option<bool>,
    /// Unix epoch seconds of the last probe.
    pub(crate) last_check: Option<f64>,
    pub(crate) quota: QuotaSnapshot,
}

impl PoolMember {
    pub fn new(
        id: impl Into<String>,
        session: Arc<dyn Session>,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            id: id.into(),
            session,
            credentials,
            enabled: true,
            fail_count: 0,
            limit_failures: 0,
            available_after: None,
            request_count: 0,
            session_valid: None,
            last_check: None,
            quota: QuotaSnapshot::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> HealthState {
        match self.session_valid {
            Some(false) => HealthState::Offline,
            None => HealthState::Unknown,
            Some(true) => match self.quota.pro_remaining {
                Some(remaining) if remaining <= 0 => HealthState::Exhausted,
                _ => HealthState::Normal,
            },
        }
    }

    pub fn mark_failure(&mut self) {
        self.fail_count = self.fail_count.saturating_add(1);
        self.available_after = Some(Instant::now() + backoff_for(self.fail_count));
    }

    pub fn mark_success(&mut self) {
        self.fail_count = 0;
        self.available_after = None;
        self.request_count += 1;
    }

    /// Clear backoff without counting a request.
    pub fn reset(&mut self) {
        self.fail_count = 0;
        self.available_after = None;
    }

    pub fn is_available(&self) -> bool {
        self.enabled && self.available_after.is_none_or(|at| Instant::now() >= at)
    }

    /// Time left in backoff, if any.
    pub fn retry_in(&self) -> Option<Duration> {
        let at = self.available_after?;
        let now = Instant::now();
        (at > now).then(|| at - now)
    }

    /// Whether cached quota allows a request in `mode`. Unknown counts as available.
    pub fn has_quota(&self, mode: Mode) -> bool {
        if self.session_valid == Some(false) {
            return false;
        }
        match mode {
            Mode::Auto => true,
            Mode::Pro | Mode::Reasoning => self.quota.pro_remaining.is_none_or(|r| r > 0),
            Mode::DeepResearch => !self.research_exhausted(),
        }
    }

    /// Research entry explicitly unavailable or known to be at zero.
    pub fn research_exhausted(&self) -> bool {
        self.quota
            .mode(RESEARCH)
            .is_some_and(|r| !r.available || r.remaining == Some(0))
    }

    /// Decrement cached counters for a metered request.
    ///
    /// Only counters that are present and positive are touched. Returns true
    /// when any of them just reached zero.
    pub fn decrement_quota(&mut self, mode: Mode) -> bool {
        let mut hit_zero = false;
        let mut take = |counter: &mut Option<i64>| {
            if let Some(remaining) = counter.as_mut().filter(|r| **r > 0) {
                *remaining -= 1;
                hit_zero |= *remaining == 0;
            }
        };
        match mode {
            Mode::Pro | Mode::Reasoning => {
                take(&mut self.quota.pro_remaining);
                if let Some(pro_search) = self.quota.mode_mut(PRO_SEARCH) {
                    take(&mut pro_search.remaining);
                }
            }
            Mode::DeepResearch => {
                if let Some(research) = self.quota.mode_mut(RESEARCH) {
                    take(&mut research.remaining);
                }
            }
            Mode::Auto => {}
        }
        hit_zero
    }

    pub fn owns_account(&self) -> bool {
        self.session.owns_account()
    }

    pub fn status(&self) -> MemberStatus {
        MemberStatus {
            id: self.id.clone(),
            available: self.is_available(),
            enabled: self.enabled,
            state: self.state(),
            fail_count: self.fail_count,
            limit_failures: self.limit_failures,
            request_count: self.request_count,
            retry_after_secs: self.retry_in().map(|d| d.as_secs_f64().ceil() as u64),
            last_check: self.last_check,
            rate_limits: self.quota.clone(),
        }
    }

    /// Shareable view for the runtime state document.
    pub fn to_state(&self) -> MemberState {
        MemberState {
            session_valid: self.session_valid,
            state: Some(self.state().as_str().to_string()),
            last_check: self.last_check,
            rate_limits: Some(self.quota.clone()),
        }
    }

    /// Take health observed by another process.
    ///
    /// Absent fields leave the local value alone; an empty snapshot does not
    /// overwrite a populated one. Backoff is never shared.
    pub fn apply_state(&mut self, state: &MemberState) {
        if let Some(last_check) = state.last_check {
            self.last_check = Some(last_check);
        }
        if let Some(valid) = state.session_valid {
            self.session_valid = Some(valid);
        }
        if let Some(snapshot) = state.rate_limits.as_ref().filter(|s| !s.is_empty()) {
            self.quota = snapshot.clone();
        }
    }
}

/// Admin/status view of a member. Never carries credentials.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberStatus {
    pub id: String,
    pub available: bool,
    pub enabled: bool,
    pub state: HealthState,
    pub fail_count: u32,
    pub limit_failures: u32,
    pub request_count: u64,
    pub retry_after_secs: Option<u64>,
    pub last_check: Option<f64>,
    pub rate_limits: QuotaSnapshot,
}
