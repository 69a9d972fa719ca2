//! reqwest-backed session
//!
//! Identity and quota come from the upstream's JSON endpoints:
//! - `GET /api/auth/session` returns `{"user": {...}}` when signed in, `{}` otherwise
//! - `GET /rest/rate-limit` returns `{"remaining": N}` (pro queries)
//! - `GET /rest/rate-limit/status` returns per-mode availability
//!
//! Queries are posted as JSON to the configured search path and the JSON
//! payload is returned untouched. Response parsing of answers happens in the
//! pool crate.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use common::Secret;
use reqwest::header::{COOKIE, HeaderValue};
use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::quota::{ModeQuota, QuotaSnapshot};
use crate::request::{Credentials, SearchRequest, UserInfo};
use crate::{BoxFuture, Session, SessionFactory};

/// API version query parameter sent with rate-limit calls.
const API_VERSION: &str = "2.18";

/// Cookie names carrying the credential pair.
const CSRF_COOKIE: &str = "next-auth.csrf-token";
const SESSION_COOKIE: &str = "__Secure-next-auth.session-token";

/// Upstream locations shared by every session.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub base_url: String,
    pub search_path: String,
}

impl Endpoints {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Session over HTTP with an optional cookie credential.
pub struct HttpSession {
    client: reqwest::Client,
    endpoints: Arc<Endpoints>,
    cookie: Option<Secret<String>>,
}

impl HttpSession {
    pub fn new(
        client: reqwest::Client,
        endpoints: Arc<Endpoints>,
        credentials: Option<&Credentials>,
    ) -> Self {
        Self {
            client,
            endpoints,
            cookie: credentials.map(cookie_header),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.with_cookie(self.client.get(self.endpoints.url(path)))
    }

    fn with_cookie(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.cookie {
            Some(cookie) => match HeaderValue::from_str(cookie.expose()) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    builder.header(COOKIE, value)
                }
                Err(e) => {
                    warn!(error = %e, "credential cookie is not a valid header value, sending without it");
                    builder
                }
            },
            None => builder,
        }
    }

    async fn fetch_pro_remaining(&self) -> Result<Option<i64>> {
        let resp = self
            .get("/rest/rate-limit")
            .query(&[("version", API_VERSION), ("source", "default")])
            .send()
            .await
            .map_err(|e| SessionError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SessionError::Http(format!(
                "rate-limit returned {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SessionError::InvalidResponse(e.to_string()))?;
        Ok(body.get("remaining").and_then(|v| v.as_i64()))
    }

    async fn fetch_mode_status(&self) -> Result<serde_json::Value> {
        let resp = self
            .get("/rest/rate-limit/status")
            .query(&[("version", API_VERSION), ("source", "default")])
            .send()
            .await
            .map_err(|e| SessionError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SessionError::Http(format!(
                "rate-limit status returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| SessionError::InvalidResponse(e.to_string()))
    }
}

impl Session for HttpSession {
    fn owns_account(&self) -> bool {
        self.cookie.is_some()
    }

    fn search<'a>(
        &'a self,
        request: &'a SearchRequest,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            let payload = search_payload(request);
            let resp = self
                .with_cookie(self.client.post(self.endpoints.url(&self.endpoints.search_path)))
                .json(&payload)
                .send()
                .await
                .map_err(|e| SessionError::Http(e.to_string()))?;

            let status = resp.status().as_u16();
            if !resp.status().is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, body));
            }

            resp.json()
                .await
                .map_err(|e| SessionError::InvalidResponse(e.to_string()))
        })
    }

    fn user_info(&self) -> BoxFuture<'_, Result<UserInfo>> {
        Box::pin(async move {
            let resp = self
                .get("/api/auth/session")
                .send()
                .await
                .map_err(|e| SessionError::Http(e.to_string()))?;
            if !resp.status().is_success() {
                debug!(status = %resp.status(), "auth session endpoint rejected the request");
                return Ok(UserInfo::default());
            }
            // Anonymous sessions get `{}` back, which parses to an empty UserInfo
            resp.json()
                .await
                .map_err(|e| SessionError::InvalidResponse(e.to_string()))
        })
    }

    fn rate_limits(&self) -> BoxFuture<'_, Result<QuotaSnapshot>> {
        Box::pin(async move {
            let pro = self.fetch_pro_remaining().await;
            let status = self.fetch_mode_status().await;

            let mut snapshot = QuotaSnapshot::default();
            if let (Err(pro_err), Err(status_err)) = (&pro, &status) {
                return Err(SessionError::Http(format!(
                    "rate-limit endpoints unavailable: {pro_err}; {status_err}"
                )));
            }
            match pro {
                Ok(remaining) => snapshot.pro_remaining = remaining,
                Err(e) => debug!(error = %e, "pro remaining unavailable, leaving unset"),
            }
            match status {
                Ok(body) => snapshot.modes = parse_mode_status(&body).modes,
                Err(e) => debug!(error = %e, "mode status unavailable, leaving unset"),
            }
            Ok(snapshot)
        })
    }
}

/// Builds `HttpSession`s sharing one connection pool.
pub struct HttpSessionFactory {
    client: reqwest::Client,
    endpoints: Arc<Endpoints>,
}

impl HttpSessionFactory {
    pub fn new(endpoints: Endpoints, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SessionError::Http(format!("building HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoints: Arc::new(endpoints),
        })
    }
}

impl SessionFactory for HttpSessionFactory {
    fn connect(&self, credentials: &Credentials) -> Arc<dyn Session> {
        Arc::new(HttpSession::new(
            self.client.clone(),
            self.endpoints.clone(),
            Some(credentials),
        ))
    }

    fn anonymous(&self) -> Arc<dyn Session> {
        Arc::new(HttpSession::new(
            self.client.clone(),
            self.endpoints.clone(),
            None,
        ))
    }
}

/// Cookie header value for a credential pair.
fn cookie_header(credentials: &Credentials) -> Secret<String> {
    Secret::new(format!(
        "{CSRF_COOKIE}={}; {SESSION_COOKIE}={}",
        credentials.csrf_token.expose(),
        credentials.session_token.expose()
    ))
}

/// JSON body for a search call. Attachments travel base64-encoded.
fn search_payload(request: &SearchRequest) -> serde_json::Value {
    let attachments: Vec<serde_json::Value> = request
        .attachments
        .iter()
        .map(|a| {
            serde_json::json!({
                "filename": a.filename,
                "data": BASE64.encode(&a.data),
            })
        })
        .collect();

    serde_json::json!({
        "query": request.query,
        "mode": request.mode,
        "model": request.model,
        "sources": request.sources,
        "attachments": attachments,
        "language": request.language,
        "incognito": request.incognito,
        "follow_up": request.follow_up,
    })
}

/// Map a non-success search status to a session error.
fn classify_status(status: u16, body: String) -> SessionError {
    match status {
        429 => SessionError::RateLimited(body),
        401 | 403 => SessionError::Unauthorized(body),
        _ => SessionError::Upstream(format!("upstream returned {status}: {body}")),
    }
}

/// Parse `/rest/rate-limit/status` into per-mode entries.
///
/// Shape: `{"modes": {"research": {"available": true, "remaining_detail":
/// {"remaining": 1, "kind": "exact"}}}}`. A mode without `available` is
/// treated as unavailable.
fn parse_mode_status(body: &serde_json::Value) -> QuotaSnapshot {
    let mut snapshot = QuotaSnapshot::default();
    let Some(modes) = body.get("modes").and_then(|m| m.as_object()) else {
        return snapshot;
    };
    for (name, data) in modes {
        let detail = data.get("remaining_detail");
        snapshot.modes.insert(
            name.clone(),
            ModeQuota {
                available: data
                    .get("available")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                remaining: detail.and_then(|d| d.get("remaining")).and_then(|v| v.as_i64()),
                kind: detail
                    .and_then(|d| d.get("kind"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            },
        );
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Attachment, Mode};

    fn endpoints() -> Arc<Endpoints> {
        Arc::new(Endpoints {
            base_url: "https://upstream.example/".into(),
            search_path: "/rest/query".into(),
        })
    }

    #[test]
    fn url_joins_without_double_slash() {
        assert_eq!(
            endpoints().url("/api/auth/session"),
            "https://upstream.example/api/auth/session"
        );
    }

    #[test]
    fn cookie_header_carries_both_tokens() {
        let cookie = cookie_header(&Credentials::new("csrf-1", "sess-1"));
        assert_eq!(
            cookie.expose(),
            "next-auth.csrf-token=csrf-1; __Secure-next-auth.session-token=sess-1"
        );
    }

    #[test]
    fn anonymous_session_owns_no_account() {
        let anon = HttpSession::new(reqwest::Client::new(), endpoints(), None);
        assert!(!anon.owns_account());
        let owned = HttpSession::new(
            reqwest::Client::new(),
            endpoints(),
            Some(&Credentials::new("a", "b")),
        );
        assert!(owned.owns_account());
    }

    #[test]
    fn parse_mode_status_reads_remaining_detail() {
        let body = serde_json::json!({
            "modes": {
                "pro_search": {"available": true, "remaining_detail": {"remaining": null, "kind": "not_provided"}},
                "research": {"available": true, "remaining_detail": {"remaining": 1, "kind": "exact"}},
                "labs": {}
            }
        });
        let snapshot = parse_mode_status(&body);
        let research = snapshot.mode("research").unwrap();
        assert!(research.available);
        assert_eq!(research.remaining, Some(1));
        assert_eq!(research.kind.as_deref(), Some("exact"));
        let pro = snapshot.mode("pro_search").unwrap();
        assert_eq!(pro.remaining, None);
        assert!(!snapshot.mode("labs").unwrap().available);
    }

    #[test]
    fn parse_mode_status_without_modes_is_empty() {
        assert!(parse_mode_status(&serde_json::json!({"error": "x"})).is_empty());
    }

    #[test]
    fn search_status_classification() {
        assert!(matches!(
            classify_status(429, "slow down".into()),
            SessionError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(403, String::new()),
            SessionError::Unauthorized(_)
        ));
        let err = classify_status(502, "bad gateway".into());
        assert_eq!(err.to_string(), "upstream returned 502: bad gateway");
    }

    #[test]
    fn payload_encodes_attachments() {
        let request = SearchRequest {
            query: "what is rust".into(),
            mode: Mode::Pro,
            model: Some("sonar".into()),
            sources: vec!["web".into()],
            attachments: vec![Attachment {
                filename: "a.txt".into(),
                data: b"hi".to_vec(),
            }],
            language: "en-US".into(),
            incognito: false,
            follow_up: None,
        };
        let payload = search_payload(&request);
        assert_eq!(payload["mode"], "pro");
        assert_eq!(payload["attachments"][0]["data"], "aGk=");
        assert_eq!(payload["follow_up"], serde_json::Value::Null);
    }

    /// Mock upstream: a signed-in identity for the right cookie, a broken
    /// `/rest/rate-limit`, a working status endpoint and a rate-limited search.
    async fn start_mock_upstream() -> Arc<Endpoints> {
        use axum::http::{HeaderMap, StatusCode};
        use axum::routing::{get, post};

        let app = axum::Router::new()
            .route(
                "/api/auth/session",
                get(|headers: HeaderMap| async move {
                    let cookie = headers
                        .get("cookie")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    if cookie.contains("session-token=good") {
                        axum::Json(serde_json::json!({"user": {"email": "m@example.org"}}))
                    } else {
                        axum::Json(serde_json::json!({}))
                    }
                }),
            )
            .route(
                "/rest/rate-limit",
                get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
            )
            .route(
                "/rest/rate-limit/status",
                get(|| async {
                    axum::Json(serde_json::json!({
                        "modes": {"research": {"available": true, "remaining_detail": {"remaining": 2, "kind": "exact"}}}
                    }))
                }),
            )
            .route(
                "/rest/query",
                post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Arc::new(Endpoints {
            base_url: format!("http://{addr}"),
            search_path: "/rest/query".into(),
        })
    }

    #[tokio::test]
    async fn user_info_reflects_the_cookie() {
        let endpoints = start_mock_upstream().await;
        let good = HttpSession::new(
            reqwest::Client::new(),
            endpoints.clone(),
            Some(&Credentials::new("c", "good")),
        );
        let bad = HttpSession::new(
            reqwest::Client::new(),
            endpoints.clone(),
            Some(&Credentials::new("c", "stale")),
        );
        let anon = HttpSession::new(reqwest::Client::new(), endpoints, None);

        assert!(good.user_info().await.unwrap().is_authenticated());
        assert!(!bad.user_info().await.unwrap().is_authenticated());
        assert!(!anon.user_info().await.unwrap().is_authenticated());
    }

    #[tokio::test]
    async fn rate_limits_tolerate_one_failing_endpoint() {
        let session = HttpSession::new(
            reqwest::Client::new(),
            start_mock_upstream().await,
            Some(&Credentials::new("c", "good")),
        );
        let snapshot = session.rate_limits().await.unwrap();
        assert_eq!(snapshot.pro_remaining, None);
        assert_eq!(snapshot.mode("research").unwrap().remaining, Some(2));
    }

    #[tokio::test]
    async fn search_maps_429_to_rate_limited() {
        let session = HttpSession::new(reqwest::Client::new(), start_mock_upstream().await, None);
        let request = SearchRequest {
            query: "q".into(),
            mode: Mode::Auto,
            model: None,
            sources: vec!["web".into()],
            attachments: vec![],
            language: "en-US".into(),
            incognito: true,
            follow_up: None,
        };
        match session.search(&request).await {
            Err(SessionError::RateLimited(body)) => assert_eq!(body, "slow down"),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }
}
