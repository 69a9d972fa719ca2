//! In-memory sessions for router tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use session::{
    BoxFuture, Credentials, QuotaSnapshot, SearchRequest, Session, SessionError, SessionFactory,
    UserInfo,
};
use session_pool::Pool;

/// Answers every query the same way.
pub struct FakeSession {
    owns_account: bool,
    answer: Option<String>,
    pub searches: AtomicUsize,
}

impl FakeSession {
    pub fn answering(owns_account: bool, text: &str) -> Arc<Self> {
        Arc::new(Self {
            owns_account,
            answer: Some(text.to_string()),
            searches: AtomicUsize::new(0),
        })
    }

    pub fn failing(owns_account: bool) -> Arc<Self> {
        Arc::new(Self {
            owns_account,
            answer: None,
            searches: AtomicUsize::new(0),
        })
    }
}

impl Session for FakeSession {
    fn owns_account(&self) -> bool {
        self.owns_account
    }

    fn search<'a>(&'a self, _request: &'a SearchRequest) -> BoxFuture<'a, session::Result<Value>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            match &self.answer {
                Some(text) => Ok(json!({
                    "answer": text,
                    "text": [{
                        "step_type": "SEARCH_RESULTS",
                        "content": {"web_results": [{"url": "https://example.org/a", "name": "A"}]}
                    }]
                })),
                None => Err(SessionError::Upstream("upstream exploded".into())),
            }
        })
    }

    fn user_info(&self) -> BoxFuture<'_, session::Result<UserInfo>> {
        Box::pin(async move {
            Ok(UserInfo {
                user: Some(json!({"email": "member@example.org"})),
            })
        })
    }

    fn rate_limits(&self) -> BoxFuture<'_, session::Result<QuotaSnapshot>> {
        Box::pin(async move {
            Ok(QuotaSnapshot {
                pro_remaining: Some(10),
                ..Default::default()
            })
        })
    }
}

/// Connects every credential set to a fresh answering account session.
pub struct FakeFactory {
    anonymous: Arc<FakeSession>,
}

impl FakeFactory {
    pub fn new(anonymous: Arc<FakeSession>) -> Arc<Self> {
        Arc::new(Self { anonymous })
    }
}

impl SessionFactory for FakeFactory {
    fn connect(&self, _credentials: &Credentials) -> Arc<dyn Session> {
        FakeSession::answering(true, "member answer")
    }

    fn anonymous(&self) -> Arc<dyn Session> {
        self.anonymous.clone()
    }
}

/// Pool over the given sessions, with an anonymous tier that answers
/// "anonymous answer".
pub fn pool_of(sessions: Vec<(&str, Arc<FakeSession>)>) -> Arc<Pool> {
    let factory = FakeFactory::new(FakeSession::answering(false, "anonymous answer"));
    let mut builder = Pool::builder(factory).probe_delay(Duration::ZERO);
    for (id, session) in sessions {
        let credentials = Credentials::new(format!("csrf-{id}"), format!("sess-{id}"));
        builder = builder.session_member(id, session, Some(credentials));
    }
    Arc::new(builder.build().unwrap())
}
