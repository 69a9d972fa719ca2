//! Scripted in-memory sessions for pool tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use session::{
    BoxFuture, Credentials, Mode, QuotaSnapshot, SearchRequest, Session, SessionError,
    SessionFactory, UserInfo,
};

type Responder = Box<dyn Fn(&SearchRequest) -> session::Result<Value> + Send + Sync>;

/// What a scripted session saw on its last search.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SeenRequest {
    pub mode: Mode,
    pub model: Option<String>,
    pub attachments: usize,
    pub incognito: bool,
}

pub(crate) struct ScriptedSession {
    owns: bool,
    responder: Responder,
    /// `None` answers the identity check as signed out.
    user: Mutex<Option<Value>>,
    /// `None` fails the rate-limit call.
    limits: Mutex<Option<QuotaSnapshot>>,
    probe_error: Mutex<Option<String>>,
    /// How long the identity check takes.
    probe_latency: Mutex<Duration>,
    panic_on_probe: AtomicBool,
    probes_in_flight: AtomicUsize,
    peak_probes_in_flight: AtomicUsize,
    pub search_calls: AtomicUsize,
    pub probe_calls: AtomicUsize,
    pub limit_calls: AtomicUsize,
    pub last_request: Mutex<Option<SeenRequest>>,
}

impl ScriptedSession {
    pub fn with_responder(
        owns: bool,
        responder: impl Fn(&SearchRequest) -> session::Result<Value> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            owns,
            responder: Box::new(responder),
            user: Mutex::new(owns.then(|| json!({"name": "tester"}))),
            limits: Mutex::new(Some(QuotaSnapshot::default())),
            probe_error: Mutex::new(None),
            probe_latency: Mutex::new(Duration::ZERO),
            panic_on_probe: AtomicBool::new(false),
            probes_in_flight: AtomicUsize::new(0),
            peak_probes_in_flight: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            limit_calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        })
    }

    /// Signed-in account answering every query.
    pub fn account() -> Arc<Self> {
        Self::answering(true, "ok")
    }

    pub fn anonymous() -> Arc<Self> {
        Self::answering(false, "anonymous answer")
    }

    pub fn answering(owns: bool, text: &str) -> Arc<Self> {
        let text = text.to_string();
        Self::with_responder(owns, move |_| Ok(json!({"answer": text})))
    }

    /// Account whose every search fails with `Upstream(message)`.
    pub fn failing(message: &str) -> Arc<Self> {
        let message = message.to_string();
        Self::with_responder(true, move |_| Err(SessionError::Upstream(message.clone())))
    }

    pub fn set_user(&self, user: Option<Value>) {
        *self.user.lock().unwrap() = user;
    }

    pub fn set_limits(&self, limits: Option<QuotaSnapshot>) {
        *self.limits.lock().unwrap() = limits;
    }

    /// Make the identity check itself fail.
    pub fn set_probe_error(&self, message: Option<&str>) {
        *self.probe_error.lock().unwrap() = message.map(str::to_string);
    }

    pub fn set_probe_latency(&self, latency: Duration) {
        *self.probe_latency.lock().unwrap() = latency;
    }

    pub fn panic_on_probe(&self) {
        self.panic_on_probe.store(true, Ordering::SeqCst);
    }

    /// Most identity checks ever running at the same time.
    pub fn peak_probes_in_flight(&self) -> usize {
        self.peak_probes_in_flight.load(Ordering::SeqCst)
    }

    pub fn searches(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Option<SeenRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

impl Session for ScriptedSession {
    fn owns_account(&self) -> bool {
        self.owns
    }

    fn search<'a>(&'a self, request: &'a SearchRequest) -> BoxFuture<'a, session::Result<Value>> {
        Box::pin(async move {
            self.search_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(SeenRequest {
                mode: request.mode,
                model: request.model.clone(),
                attachments: request.attachments.len(),
                incognito: request.incognito,
            });
            (self.responder)(request)
        })
    }

    fn user_info(&self) -> BoxFuture<'_, session::Result<UserInfo>> {
        Box::pin(async move {
            self.probe_calls.fetch_add(1, Ordering::SeqCst);
            let in_flight = self.probes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_probes_in_flight
                .fetch_max(in_flight, Ordering::SeqCst);
            let latency = *self.probe_latency.lock().unwrap();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            self.probes_in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.panic_on_probe.load(Ordering::SeqCst) {
                panic!("identity check blew up");
            }
            if let Some(message) = self.probe_error.lock().unwrap().clone() {
                return Err(SessionError::Http(message));
            }
            Ok(UserInfo {
                user: self.user.lock().unwrap().clone(),
            })
        })
    }

    fn rate_limits(&self) -> BoxFuture<'_, session::Result<QuotaSnapshot>> {
        Box::pin(async move {
            self.limit_calls.fetch_add(1, Ordering::SeqCst);
            self.limits
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| SessionError::Http("rate limits unavailable".into()))
        })
    }
}

/// Hands out scripted sessions, keyed by csrf token.
pub(crate) struct ScriptedFactory {
    by_csrf: Mutex<HashMap<String, Arc<ScriptedSession>>>,
    anonymous: Mutex<Arc<ScriptedSession>>,
    pub anonymous_created: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            by_csrf: Mutex::new(HashMap::new()),
            anonymous: Mutex::new(ScriptedSession::anonymous()),
            anonymous_created: AtomicUsize::new(0),
        })
    }

    pub fn set_anonymous(&self, session: Arc<ScriptedSession>) {
        *self.anonymous.lock().unwrap() = session;
    }

    pub fn anonymous_session(&self) -> Arc<ScriptedSession> {
        self.anonymous.lock().unwrap().clone()
    }
}

impl SessionFactory for ScriptedFactory {
    fn connect(&self, credentials: &Credentials) -> Arc<dyn Session> {
        let mut scripted = self.by_csrf.lock().unwrap();
        let session = scripted
            .entry(credentials.csrf_token.expose().clone())
            .or_insert_with(ScriptedSession::account)
            .clone();
        session
    }

    fn anonymous(&self) -> Arc<dyn Session> {
        self.anonymous_created.fetch_add(1, Ordering::SeqCst);
        self.anonymous.lock().unwrap().clone()
    }
}
