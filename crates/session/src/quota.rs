//! Quota snapshot returned by the rate-limit endpoints

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Named mode entry for the pro search counter.
pub const PRO_SEARCH: &str = "pro_search";

/// Named mode entry for the deep research counter.
pub const RESEARCH: &str = "research";

/// Cached quota for one account.
///
/// Absent counters mean "not reported"; the pool treats them as available.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    /// Remaining pro queries across pro-like modes.
    #[serde(default)]
    pub pro_remaining: Option<i64>,
    /// Per-mode availability keyed by upstream mode name.
    #[serde(default)]
    pub modes: BTreeMap<String, ModeQuota>,
}

/// Availability of one named upstream mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeQuota {
    #[serde(default = "default_available")]
    pub available: bool,
    #[serde(default)]
    pub remaining: Option<i64>,
    /// How precise `remaining` is, as reported upstream (e.g. "exact").
    #[serde(default)]
    pub kind: Option<String>,
}

fn default_available() -> bool {
    true
}

impl QuotaSnapshot {
    /// True when nothing has been reported yet.
    pub fn is_empty(&self) -> bool {
        self.pro_remaining.is_none() && self.modes.is_empty()
    }

    pub fn mode(&self, name: &str) -> Option<&ModeQuota> {
        self.modes.get(name)
    }

    pub fn mode_mut(&mut self, name: &str) -> Option<&mut ModeQuota> {
        self.modes.get_mut(name)
    }
}
