//! Query failover cascade
//!
//! 1. Pool members in rotation. Metered requests skip exhausted members but
//!    remember them as degraded.
//! 2. The first degraded member, retried in auto mode without attachments.
//! 3. A fresh anonymous session in auto mode.
//!
//! Tiers 2 and 3 run only when fallback is enabled both for the request and
//! for the pool. The first success wins.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use session::{Attachment, ErrorClassification, Mode, SearchRequest, Session};
use tracing::{debug, info, warn};

use crate::answer::{Answer, FallbackInfo, extract_answer, has_answer};
use crate::classify::{classify, is_limit_like};
use crate::member::HealthState;
use crate::pool::{Pool, Selection};
use crate::validate::{
    self, DEFAULT_LANGUAGE, DEFAULT_SOURCE, ValidationError, validate_limits, validate_model,
};

const VALIDATION_ERROR: &str = "ValidationError";

/// One query as submitted by a caller.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default)]
    pub model: Option<String>,
    /// Empty means `["web"]`.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub incognito: bool,
    #[serde(skip)]
    pub attachments: Vec<Attachment>,
    #[serde(default = "default_true")]
    pub fallback_to_auto: bool,
}

fn default_mode() -> Mode {
    Mode::Auto
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

fn default_true() -> bool {
    true
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, mode: Mode) -> Self {
        Self {
            query: query.into(),
            mode,
            model: None,
            sources: Vec::new(),
            language: default_language(),
            incognito: false,
            attachments: Vec::new(),
            fallback_to_auto: true,
        }
    }
}

/// Result envelope of `run_query`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum QueryOutcome {
    Ok {
        data: Answer,
    },
    Error {
        error_type: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        attempted: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        skipped: Option<usize>,
    },
}

impl QueryOutcome {
    fn validation(error: ValidationError) -> Self {
        QueryOutcome::Error {
            error_type: VALIDATION_ERROR.to_string(),
            message: error.0,
            attempted: None,
            skipped: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, QueryOutcome::Ok { .. })
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &str {
        match self {
            QueryOutcome::Ok { .. } => "ok",
            QueryOutcome::Error { error_type, .. } => error_type,
        }
    }
}

/// Last error seen by the cascade: kind tag and message.
struct Failure {
    kind: String,
    message: String,
}

impl Failure {
    fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl Pool {
    /// Execute a query through the failover cascade.
    pub async fn run_query(self: &Arc<Self>, request: QueryRequest) -> QueryOutcome {
        let search = match prepare(request.clone()) {
            Ok(search) => search,
            Err(e) => return QueryOutcome::validation(e),
        };
        let mode = search.mode;
        let fallback_enabled =
            request.fallback_to_auto && self.fallback_config().await.fallback_to_auto;
        debug!(mode = %mode, model = ?search.model, fallback_enabled, "starting query");

        let total = self.inner.lock().await.members.len();
        let mut visited: HashSet<String> = HashSet::new();
        let mut attempted = 0usize;
        let mut degraded: Vec<(String, Arc<dyn Session>)> = Vec::new();
        let mut last_error: Option<Failure> = None;

        for _ in 0..total * 2 {
            let (id, session) = match self.select(Mode::Auto).await {
                Selection::Member { id, session } => (id, session),
                Selection::Blocked { id, retry_in } => {
                    if attempted == 0 {
                        last_error = Some(Failure::new(
                            "PoolUnavailable",
                            format!(
                                "All members are currently unavailable. Earliest available: '{id}' in {}s",
                                retry_in.as_secs()
                            ),
                        ));
                    }
                    break;
                }
                Selection::NoQuota => {
                    if attempted == 0 {
                        last_error = Some(Failure::new(
                            "PoolUnavailable",
                            "No member is able to serve this request",
                        ));
                    }
                    break;
                }
            };

            if !visited.insert(id.clone()) {
                if visited.len() >= total {
                    break;
                }
                continue;
            }

            let Some((state, research_exhausted)) = self.member_view(&id).await else {
                continue;
            };
            if mode.is_metered() && state == HealthState::Exhausted {
                debug!(member_id = %id, "member exhausted, holding it for degraded fallback");
                degraded.push((id, session));
                continue;
            }

            attempted += 1;
            if mode == Mode::DeepResearch && research_exhausted {
                debug!(member_id = %id, "no research quota, skipping");
                self.record_limit_failure(&id).await;
                continue;
            }

            let owns = session.owns_account();
            let checked = validate_model(mode, search.model.as_deref(), owns)
                .and_then(|()| validate_limits(owns, mode, search.attachments.len()));
            if let Err(e) = checked {
                if !is_limit_like(&e.0) {
                    return QueryOutcome::validation(e);
                }
                debug!(member_id = %id, error = %e, "member cannot serve this request");
                self.record_failure(&id).await;
                last_error = Some(Failure::new(VALIDATION_ERROR, e.0));
                continue;
            }

            match session.search(&search).await {
                Ok(payload) if !payload.is_null() => {
                    self.record_success(&id, mode).await;
                    metrics::counter!("pool_queries_total", "outcome" => "member").increment(1);
                    debug!(member_id = %id, "query succeeded");
                    return QueryOutcome::Ok {
                        data: extract_answer(&payload),
                    };
                }
                Ok(_) => {
                    self.record_failure(&id).await;
                    last_error = Some(Failure::new(
                        "InvalidResponse",
                        "Empty response from upstream (connection may have dropped)",
                    ));
                }
                Err(e) => {
                    debug!(member_id = %id, error = %e, "query failed on member");
                    if mode.is_metered() && classify(&e) == ErrorClassification::LimitLike {
                        self.record_limit_failure(&id).await;
                    } else {
                        self.record_failure(&id).await;
                    }
                    last_error = Some(Failure::new(e.kind(), e.to_string()));
                }
            }
        }

        if fallback_enabled && mode.is_metered() {
            if let Some((id, session)) = degraded.first() {
                warn!(
                    member_id = %id,
                    degraded = degraded.len(),
                    from_mode = %mode,
                    "metered members exhausted, falling back to auto mode"
                );
                let auto = auto_request(&search, search.incognito);
                match session.search(&auto).await {
                    Ok(payload) if has_answer(&payload) => {
                        self.record_success(id, Mode::Auto).await;
                        metrics::counter!("pool_fallbacks_total", "tier" => "degraded")
                            .increment(1);
                        info!(member_id = %id, from_mode = %mode, "degraded fallback succeeded");
                        return fallback_answer(&payload, &search, Some(id.clone()));
                    }
                    Ok(_) => {
                        warn!(member_id = %id, "degraded fallback returned no answer");
                        last_error = Some(Failure::new(
                            "InvalidResponse",
                            "Fallback search returned no answer",
                        ));
                    }
                    Err(e) => {
                        warn!(member_id = %id, error = %e, "degraded fallback failed");
                        last_error = Some(Failure::new(e.kind(), e.to_string()));
                    }
                }
            }
        }

        if fallback_enabled && mode != Mode::Auto {
            info!(from_mode = %mode, "pool exhausted, trying an anonymous session");
            let anonymous = self.factory.anonymous();
            let auto = auto_request(&search, true);
            match anonymous.search(&auto).await {
                Ok(payload) if has_answer(&payload) => {
                    metrics::counter!("pool_fallbacks_total", "tier" => "anonymous").increment(1);
                    info!(from_mode = %mode, "anonymous fallback succeeded");
                    return fallback_answer(&payload, &search, None);
                }
                Ok(_) => {
                    warn!("anonymous fallback returned no answer");
                    last_error.get_or_insert_with(|| {
                        Failure::new("InvalidResponse", "Anonymous fallback returned no answer")
                    });
                }
                Err(e) => {
                    warn!(error = %e, "anonymous fallback failed");
                    last_error.get_or_insert_with(|| Failure::new(e.kind(), e.to_string()));
                }
            }
        }

        let failure = last_error.unwrap_or_else(|| {
            Failure::new("RequestFailed", "Request failed after multiple attempts.")
        });
        metrics::counter!("pool_queries_total", "outcome" => "failed").increment(1);
        warn!(
            attempted,
            skipped = degraded.len(),
            error_type = %failure.kind,
            error = %failure.message,
            "query failed on every tier"
        );
        QueryOutcome::Error {
            error_type: failure.kind,
            message: failure.message,
            attempted: Some(attempted),
            skipped: Some(degraded.len()),
        }
    }

    async fn member_view(&self, id: &str) -> Option<(HealthState, bool)> {
        let inner = self.inner.lock().await;
        inner
            .find(id)
            .map(|m| (m.state(), m.research_exhausted()))
    }
}

/// Stateless checks, then the upstream request.
fn prepare(request: QueryRequest) -> Result<SearchRequest, ValidationError> {
    let query = validate::sanitize_query(&request.query)?;
    let sources = if request.sources.is_empty() {
        vec![DEFAULT_SOURCE.to_string()]
    } else {
        request.sources
    };
    validate::validate_language(&request.language)?;
    validate::validate_sources(&sources)?;
    validate::validate_attachments(&request.attachments)?;

    Ok(SearchRequest {
        query,
        mode: request.mode,
        model: request.model.filter(|m| !m.trim().is_empty()),
        sources,
        attachments: request.attachments,
        language: request.language,
        incognito: request.incognito,
        follow_up: None,
    })
}

/// Same query in auto mode: no model, no attachments.
fn auto_request(original: &SearchRequest, incognito: bool) -> SearchRequest {
    SearchRequest {
        mode: Mode::Auto,
        model: None,
        attachments: Vec::new(),
        incognito,
        ..original.clone()
    }
}

fn fallback_answer(
    payload: &Value,
    original: &SearchRequest,
    member: Option<String>,
) -> QueryOutcome {
    let mut data = extract_answer(payload);
    data.fallback = Some(FallbackInfo {
        fallback: true,
        fallback_mode: Mode::Auto,
        original_mode: original.mode,
        original_model: original.model.clone(),
        fallback_member: member,
    });
    QueryOutcome::Ok { data }
}
