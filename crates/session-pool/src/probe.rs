//! Member health probes
//!
//! A probe checks identity first, then (for signed-in members) refreshes the
//! quota snapshot. Neither call consumes quota. The derived state before and
//! after the probe decides whether an operator is notified.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use session::{QuotaSnapshot, Session};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::member::HealthState;
use crate::notify::Transition;
use crate::pool::Pool;

/// Probes in flight at once during `test_all`.
pub const PROBE_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub member_id: String,
    pub ok: bool,
    pub state: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<QuotaSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TestAllReport {
    pub results: BTreeMap<String, ProbeReport>,
    pub succeeded: usize,
    pub failed: usize,
}

enum ProbeOutcome {
    Valid(QuotaSnapshot),
    Invalid(String),
    /// No account to check.
    Skipped,
}

async fn probe_session(session: &dyn Session) -> ProbeOutcome {
    if !session.owns_account() {
        return ProbeOutcome::Skipped;
    }
    match session.user_info().await {
        Ok(info) if info.is_authenticated() => {}
        Ok(_) => return ProbeOutcome::Invalid("session is not signed in".into()),
        Err(e) => return ProbeOutcome::Invalid(e.to_string()),
    }
    match session.rate_limits().await {
        Ok(snapshot) => ProbeOutcome::Valid(snapshot),
        Err(e) => {
            warn!(error = %e, "rate limit fetch failed during probe");
            ProbeOutcome::Invalid(format!("rate limit fetch failed: {e}"))
        }
    }
}

impl Pool {
    /// Probe one member and record the result.
    ///
    /// Any failure marks the member offline, including transport errors and a
    /// failed quota fetch after a good identity check. The cached snapshot is
    /// kept in that case. Members without an account are reported but left
    /// unchanged.
    pub async fn test_member(&self, id: &str) -> Result<ProbeReport> {
        let (session, before) = {
            let inner = self.inner.lock().await;
            let member = inner
                .find(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            (member.session.clone(), member.state())
        };

        let outcome = probe_session(session.as_ref()).await;

        let report = {
            let mut inner = self.inner.lock().await;
            // Removed while the probe was in flight
            let member = inner
                .find_mut(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            let error = match outcome {
                ProbeOutcome::Skipped => None,
                ProbeOutcome::Valid(snapshot) => {
                    member.session_valid = Some(true);
                    member.quota = snapshot;
                    member.last_check = Some(common::unix_seconds());
                    None
                }
                ProbeOutcome::Invalid(reason) => {
                    member.session_valid = Some(false);
                    member.last_check = Some(common::unix_seconds());
                    Some(reason)
                }
            };
            ProbeReport {
                member_id: id.to_string(),
                ok: error.is_none(),
                state: member.state(),
                rate_limits: (!member.quota.is_empty()).then(|| member.quota.clone()),
                error,
            }
        };

        metrics::counter!("pool_probes_total", "state" => report.state.as_str()).increment(1);
        debug!(member_id = id, state = report.state.as_str(), ok = report.ok, "probed member");

        if let Some(transition) = Transition::between(before, report.state) {
            let monitor = self.monitor_config().await;
            self.notifier.notify(&monitor, id, transition).await;
        }
        Ok(report)
    }

    /// Probe every member with bounded concurrency, then persist state.
    pub async fn test_all(self: &Arc<Self>) -> TestAllReport {
        let ids: Vec<String> = {
            let inner = self.inner.lock().await;
            inner.members.iter().map(|m| m.id.clone()).collect()
        };

        // Detached tasks: an interrupted batch lets in-flight probes finish
        let semaphore = Arc::new(Semaphore::new(PROBE_CONCURRENCY));
        let tasks: Vec<JoinHandle<_>> = ids
            .into_iter()
            .map(|id| {
                let pool = Arc::clone(self);
                let semaphore = Arc::clone(&semaphore);
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let result = pool.test_member(&id).await;
                    tokio::time::sleep(pool.probe_delay).await;
                    (id, result)
                })
            })
            .collect();

        let mut report = TestAllReport::default();
        for task in tasks {
            match task.await {
                Ok((_, Ok(probe))) => {
                    if probe.ok {
                        report.succeeded += 1;
                    } else {
                        report.failed += 1;
                    }
                    report.results.insert(probe.member_id.clone(), probe);
                }
                Ok((id, Err(e))) => debug!(member_id = %id, error = %e, "member vanished during probe"),
                Err(e) => warn!(error = %e, "probe task failed"),
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "probe cycle finished"
        );
        self.save_state("monitor").await;
        report
    }
}
