//! Request modes

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Upstream request mode.
///
/// `Auto` is unmetered. `Pro` and `Reasoning` draw on the pro query counter;
/// `DeepResearch` draws on the separate research counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "pro")]
    Pro,
    #[serde(rename = "reasoning")]
    Reasoning,
    #[serde(rename = "deep research")]
    DeepResearch,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Auto, Mode::Pro, Mode::Reasoning, Mode::DeepResearch];

    /// Wire name of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Pro => "pro",
            Mode::Reasoning => "reasoning",
            Mode::DeepResearch => "deep research",
        }
    }

    /// Whether requests in this mode count against a finite quota.
    pub fn is_metered(self) -> bool {
        !matches!(self, Mode::Auto)
    }

    /// Modes metered by the shared pro counter.
    pub fn is_pro_like(self) -> bool {
        matches!(self, Mode::Pro | Mode::Reasoning)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a mode name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid mode '{0}'. Must be one of: auto, pro, reasoning, deep research")]
pub struct UnknownMode(pub String);

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}
