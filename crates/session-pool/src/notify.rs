//! Health transition notifications
//!
//! Probes compare a member's derived state before and after the check and
//! report edges, never levels: a member that stays offline is reported once.

use pool_store::MonitorConfig;
use session::BoxFuture;
use tracing::info;

use crate::member::HealthState;

/// A health edge worth telling an operator about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Session stopped authenticating.
    Offline,
    /// Pro quota ran out.
    Exhausted,
    /// Back to normal from offline or exhausted.
    Recovered,
}

impl Transition {
    pub fn between(before: HealthState, after: HealthState) -> Option<Self> {
        use HealthState::*;
        match (before, after) {
            (b, Offline) if b != Offline => Some(Transition::Offline),
            (b, Exhausted) if b != Exhausted => Some(Transition::Exhausted),
            (Offline | Exhausted, Normal) => Some(Transition::Recovered),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Transition::Offline => "offline",
            Transition::Exhausted => "exhausted",
            Transition::Recovered => "recovered",
        }
    }

    /// Operator-facing message. HTML, for chat transports that render it.
    pub fn message(self, member_id: &str) -> String {
        match self {
            Transition::Offline => {
                format!("<b>Member offline</b>\nMember <code>{member_id}</code> failed its session check.")
            }
            Transition::Exhausted => format!(
                "<b>Member exhausted</b>\nMember <code>{member_id}</code> has no pro queries left."
            ),
            Transition::Recovered => {
                format!("<b>Member recovered</b>\nMember <code>{member_id}</code> is back to normal.")
            }
        }
    }
}

/// Delivers transition notifications. Failures are the sink's problem and
/// never reach the probe.
pub trait Notifier: Send + Sync {
    fn notify<'a>(
        &'a self,
        monitor: &'a MonitorConfig,
        member_id: &'a str,
        transition: Transition,
    ) -> BoxFuture<'a, ()>;
}

/// Logs transitions only.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify<'a>(
        &'a self,
        _monitor: &'a MonitorConfig,
        member_id: &'a str,
        transition: Transition,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            info!(member_id, transition = transition.as_str(), "member health changed");
        })
    }
}
