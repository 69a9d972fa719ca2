//! Pool core: membership, selection, failure bookkeeping and persistence
//!
//! All member state sits behind one tokio mutex. Network calls (searches,
//! probes, quota refreshes) never run while it is held: callers clone the
//! member's `Arc<dyn Session>` out, release the lock, call, then re-lock to
//! record the outcome.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pool_store::{
    ConfigStore, DEFAULT_CONFIG_FILE, FallbackConfig, LoadOutcome, MonitorConfig, PoolConfig,
    RuntimeState, StateStore, TokenEntry,
};
use serde::{Deserialize, Serialize};
use session::{Credentials, Mode, Session, SessionFactory};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::member::{MemberStatus, PoolMember};
use crate::monitor::MonitorHandle;
use crate::notify::{LogNotifier, Notifier};

/// Env var naming the credential document.
pub const CONFIG_PATH_ENV: &str = "POOL_CONFIG_PATH";
/// Env vars for a single-member pool without a credential document.
pub const CSRF_TOKEN_ENV: &str = "POOL_CSRF_TOKEN";
pub const SESSION_TOKEN_ENV: &str = "POOL_SESSION_TOKEN";

pub const SINGLE_MEMBER_ID: &str = "default";
pub const ANONYMOUS_MEMBER_ID: &str = "anonymous";

/// Pause between probes inside one `test_all` worker.
pub const DEFAULT_PROBE_DELAY: Duration = Duration::from_millis(500);

/// Where the pool's membership came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolSource {
    /// Credential document on disk.
    Pool,
    /// One member from environment credentials.
    Single,
    /// One member without credentials.
    Anonymous,
}

/// Resolved membership source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceChoice {
    File(PathBuf),
    Single(Credentials),
    Anonymous,
}

/// Pick the membership source.
///
/// Order: explicit path, `POOL_CONFIG_PATH`, `token_pool_config.json` in
/// `search_dir`, environment credentials, anonymous. File candidates are
/// taken only if they exist.
pub fn resolve_source(
    explicit: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
    search_dir: &Path,
) -> SourceChoice {
    let candidates = explicit
        .map(Path::to_path_buf)
        .into_iter()
        .chain(env(CONFIG_PATH_ENV).map(PathBuf::from))
        .chain(std::iter::once(search_dir.join(DEFAULT_CONFIG_FILE)));
    for candidate in candidates {
        if candidate.is_file() {
            return SourceChoice::File(candidate);
        }
    }

    match (env(CSRF_TOKEN_ENV), env(SESSION_TOKEN_ENV)) {
        (Some(csrf), Some(session)) => {
            let credentials = Credentials::new(csrf, session);
            if credentials.is_complete() {
                return SourceChoice::Single(credentials);
            }
            SourceChoice::Anonymous
        }
        _ => SourceChoice::Anonymous,
    }
}

/// Startup options for `Pool::initialize`.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub config_path: Option<PathBuf>,
    /// Whether this process may write the credential document.
    pub config_writable: bool,
    /// Directory searched for the default credential document.
    pub search_dir: PathBuf,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            config_writable: true,
            search_dir: PathBuf::from("."),
        }
    }
}

/// Outcome of one selection.
pub enum Selection {
    Member {
        id: String,
        session: Arc<dyn Session>,
    },
    /// Some members are available, none has quota for the mode.
    NoQuota,
    /// Every member is disabled or backing off. Names the one that frees up first.
    Blocked { id: String, retry_in: Duration },
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selection::Member { id, .. } => f.debug_struct("Member").field("id", id).finish(),
            Selection::NoQuota => f.write_str("NoQuota"),
            Selection::Blocked { id, retry_in } => f
                .debug_struct("Blocked")
                .field("id", id)
                .field("retry_in", retry_in)
                .finish(),
        }
    }
}

/// Whole-pool status for admin views.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub source: PoolSource,
    pub members: Vec<MemberStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberSummary {
    pub id: String,
    pub available: bool,
    pub enabled: bool,
}

/// Partial monitor settings update. Absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorUpdate {
    pub enable: Option<bool>,
    pub interval: Option<f64>,
    pub tg_bot_token: Option<String>,
    pub tg_chat_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FallbackUpdate {
    pub fallback_to_auto: Option<bool>,
}

/// Import body: a bare list or a credential document.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ImportPayload {
    List(Vec<TokenEntry>),
    Document {
        #[serde(default)]
        tokens: Vec<TokenEntry>,
    },
}

impl ImportPayload {
    fn into_entries(self) -> Vec<TokenEntry> {
        match self {
            ImportPayload::List(entries) => entries,
            ImportPayload::Document { tokens } => tokens,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub added: Vec<String>,
    pub skipped: Vec<String>,
    pub errors: Vec<String>,
}

impl ImportReport {
    pub fn message(&self) -> String {
        let mut parts = vec![format!("Added: {} token(s)", self.added.len())];
        if !self.skipped.is_empty() {
            parts.push(format!("Skipped: {} (already exist)", self.skipped.len()));
        }
        if !self.errors.is_empty() {
            parts.push(format!("Errors: {}", self.errors.len()));
        }
        parts.join(", ")
    }
}

/// Result of `load_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateLoad {
    /// Number of members updated from the document.
    Applied(usize),
    Unchanged,
    Missing,
    Ignored,
    /// No state store attached (single or anonymous pools).
    Detached,
}

pub(crate) struct PoolInner {
    pub(crate) members: Vec<PoolMember>,
    pub(crate) cursor: usize,
    pub(crate) monitor: MonitorConfig,
    pub(crate) fallback: FallbackConfig,
    pub(crate) source: PoolSource,
}

impl PoolInner {
    pub(crate) fn find(&self, id: &str) -> Option<&PoolMember> {
        self.members.iter().find(|m| m.id == id)
    }

    pub(crate) fn find_mut(&mut self, id: &str) -> Option<&mut PoolMember> {
        self.members.iter_mut().find(|m| m.id == id)
    }

    fn snapshot_config(&self) -> PoolConfig {
        PoolConfig {
            monitor: self.monitor.clone(),
            fallback: self.fallback.clone(),
            tokens: self
                .members
                .iter()
                .filter_map(|m| {
                    m.credentials
                        .as_ref()
                        .map(|c| TokenEntry::from_credentials(m.id.clone(), c))
                })
                .collect(),
        }
    }

    fn snapshot_state(&self, writer: &str) -> RuntimeState {
        let clients: BTreeMap<_, _> = self
            .members
            .iter()
            .map(|m| (m.id.clone(), m.to_state()))
            .collect();
        RuntimeState::new(writer, clients)
    }
}

/// Builds a `Pool`. Used by `Pool::initialize` and by callers wiring a pool by hand.
pub struct PoolBuilder {
    factory: Arc<dyn SessionFactory>,
    notifier: Arc<dyn Notifier>,
    members: Vec<PoolMember>,
    monitor: MonitorConfig,
    fallback: FallbackConfig,
    source: PoolSource,
    config_store: Option<ConfigStore>,
    state_store: Option<StateStore>,
    probe_delay: Duration,
}

impl PoolBuilder {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            notifier: Arc::new(LogNotifier),
            members: Vec::new(),
            monitor: MonitorConfig::default(),
            fallback: FallbackConfig::default(),
            source: PoolSource::Pool,
            config_store: None,
            state_store: None,
            probe_delay: DEFAULT_PROBE_DELAY,
        }
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Member with a session built by the factory.
    pub fn member(mut self, id: impl Into<String>, credentials: Credentials) -> Self {
        let session = self.factory.connect(&credentials);
        self.members
            .push(PoolMember::new(id, session, Some(credentials)));
        self
    }

    /// Member with a caller-supplied session.
    pub fn session_member(
        mut self,
        id: impl Into<String>,
        session: Arc<dyn Session>,
        credentials: Option<Credentials>,
    ) -> Self {
        self.members.push(PoolMember::new(id, session, credentials));
        self
    }

    pub fn monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn fallback(mut self, fallback: FallbackConfig) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn source(mut self, source: PoolSource) -> Self {
        self.source = source;
        self
    }

    pub fn config_store(mut self, store: ConfigStore) -> Self {
        self.config_store = Some(store);
        self
    }

    pub fn state_store(mut self, store: StateStore) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    pub fn build(self) -> Result<Pool> {
        if self.members.is_empty() {
            return Err(Error::InvalidConfig("pool needs at least one member".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.members.iter().find(|m| !seen.insert(m.id.clone())) {
            return Err(Error::AlreadyExists(dup.id.clone()));
        }
        Ok(Pool {
            inner: Mutex::new(PoolInner {
                members: self.members,
                cursor: 0,
                monitor: self.monitor,
                fallback: self.fallback,
                source: self.source,
            }),
            factory: self.factory,
            notifier: self.notifier,
            config_store: self.config_store,
            state_store: self.state_store,
            monitor_task: std::sync::Mutex::new(None),
            probe_delay: self.probe_delay,
        })
    }
}

/// Credential pool shared across the process as `Arc<Pool>`.
pub struct Pool {
    pub(crate) inner: Mutex<PoolInner>,
    pub(crate) factory: Arc<dyn SessionFactory>,
    pub(crate) notifier: Arc<dyn Notifier>,
    config_store: Option<ConfigStore>,
    state_store: Option<StateStore>,
    pub(crate) monitor_task: std::sync::Mutex<Option<MonitorHandle>>,
    pub(crate) probe_delay: Duration,
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Ok(mut task) = self.monitor_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

impl Pool {
    pub fn builder(factory: Arc<dyn SessionFactory>) -> PoolBuilder {
        PoolBuilder::new(factory)
    }

    /// Resolve the membership source from options and the process environment,
    /// build the pool, and pick up any shared runtime state.
    pub async fn initialize(
        options: &PoolOptions,
        factory: Arc<dyn SessionFactory>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Pool> {
        let choice = resolve_source(
            options.config_path.as_deref(),
            |key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()),
            &options.search_dir,
        );
        Self::from_source(choice, options.config_writable, factory, notifier).await
    }

    pub async fn from_source(
        choice: SourceChoice,
        config_writable: bool,
        factory: Arc<dyn SessionFactory>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Pool> {
        let builder = PoolBuilder::new(factory.clone()).notifier(notifier);
        let pool = match choice {
            SourceChoice::File(path) => {
                let store = ConfigStore::new(path.clone(), config_writable);
                let config = store.load().await?;
                let mut builder = builder
                    .monitor(config.monitor)
                    .fallback(config.fallback)
                    .source(PoolSource::Pool)
                    .state_store(StateStore::beside(&path))
                    .config_store(store);
                for entry in &config.tokens {
                    builder = builder.member(entry.id.clone(), entry.credentials());
                }
                builder.build()?
            }
            SourceChoice::Single(credentials) => builder
                .member(SINGLE_MEMBER_ID, credentials)
                .source(PoolSource::Single)
                .build()?,
            SourceChoice::Anonymous => builder
                .session_member(ANONYMOUS_MEMBER_ID, factory.anonymous(), None)
                .source(PoolSource::Anonymous)
                .build()?,
        };

        let (members, source) = {
            let inner = pool.inner.lock().await;
            (inner.members.len(), inner.source)
        };
        info!(members, source = ?source, "session pool ready");

        pool.load_state().await;
        Ok(pool)
    }

    pub fn config_writable(&self) -> bool {
        self.config_store.as_ref().is_some_and(ConfigStore::is_writable)
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_store.as_ref().map(ConfigStore::path)
    }

    // -- selection -------------------------------------------------------

    /// Next member able to serve `mode`, rotating from the cursor.
    ///
    /// The cursor moves one step per call whatever the outcome, so repeated
    /// calls spread load across eligible members.
    pub async fn select(&self, mode: Mode) -> Selection {
        let mut inner = self.inner.lock().await;
        let n = inner.members.len();
        if n == 0 {
            return Selection::NoQuota;
        }
        let start = inner.cursor % n;
        inner.cursor = (start + 1) % n;

        let picked = (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&i| inner.members[i].is_available() && inner.members[i].has_quota(mode));
        if let Some(i) = picked {
            let member = &inner.members[i];
            metrics::counter!("pool_selections_total", "outcome" => "member").increment(1);
            return Selection::Member {
                id: member.id.clone(),
                session: member.session.clone(),
            };
        }

        if inner.members.iter().any(PoolMember::is_available) {
            metrics::counter!("pool_selections_total", "outcome" => "no_quota").increment(1);
            return Selection::NoQuota;
        }

        metrics::counter!("pool_selections_total", "outcome" => "blocked").increment(1);
        match inner
            .members
            .iter()
            .filter(|m| m.enabled)
            .min_by_key(|m| m.available_after)
        {
            Some(m) => Selection::Blocked {
                id: m.id.clone(),
                retry_in: m.retry_in().unwrap_or_default(),
            },
            None => Selection::NoQuota,
        }
    }

    /// Successful request: clear backoff, count it, decrement cached quota.
    ///
    /// Persists state so other processes see the decrement. When a counter
    /// just reached zero, a background task re-fetches the real quota.
    pub async fn record_success(self: &Arc<Self>, id: &str, mode: Mode) {
        let hit_zero = {
            let mut inner = self.inner.lock().await;
            let Some(member) = inner.find_mut(id) else {
                return;
            };
            member.mark_success();
            mode.is_metered() && member.decrement_quota(mode)
        };
        self.save_state("quota_decrement").await;
        if hit_zero {
            self.spawn_quota_verification(id);
        }
    }

    /// Transient failure: the member enters backoff.
    pub async fn record_failure(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(member) = inner.find_mut(id) {
            member.mark_failure();
            metrics::counter!("pool_member_failures_total", "kind" => "transient").increment(1);
            debug!(
                member_id = id,
                fail_count = member.fail_count,
                retry_in_secs = member.retry_in().map(|d| d.as_secs()),
                "member entered backoff"
            );
        }
    }

    /// Metered-limit failure. Counted but never affects backoff.
    pub async fn record_limit_failure(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(member) = inner.find_mut(id) {
            member.limit_failures = member.limit_failures.saturating_add(1);
            metrics::counter!("pool_member_failures_total", "kind" => "limit").increment(1);
            debug!(member_id = id, limit_failures = member.limit_failures, "member hit a limit");
        }
    }

    fn spawn_quota_verification(self: &Arc<Self>, id: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(member_id = id, "no runtime, skipping quota verification");
            return;
        };
        let pool = Arc::clone(self);
        let id = id.to_string();
        handle.spawn(async move {
            pool.verify_quota(&id).await;
        });
    }

    /// Replace the cached snapshot with a fresh one from upstream.
    pub(crate) async fn verify_quota(&self, id: &str) {
        let Some(session) = self.session_of(id).await else {
            return;
        };
        match session.rate_limits().await {
            Ok(snapshot) => {
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(member) = inner.find_mut(id) {
                        member.quota = snapshot;
                        member.last_check = Some(common::unix_seconds());
                    }
                }
                self.save_state("quota_verify").await;
            }
            Err(e) => warn!(member_id = id, error = %e, "quota verification failed"),
        }
    }

    pub(crate) async fn session_of(&self, id: &str) -> Option<Arc<dyn Session>> {
        self.inner.lock().await.find(id).map(|m| m.session.clone())
    }

    // -- membership ------------------------------------------------------

    pub async fn add_member(
        &self,
        id: &str,
        csrf_token: &str,
        session_token: &str,
    ) -> Result<()> {
        let entry = TokenEntry::new(id.trim(), csrf_token.trim(), session_token.trim());
        if !entry.is_complete() {
            return Err(Error::InvalidMember(
                "id, csrf_token and session_token are required".into(),
            ));
        }
        {
            let mut inner = self.inner.lock().await;
            if inner.find(&entry.id).is_some() {
                return Err(Error::AlreadyExists(entry.id));
            }
            let credentials = entry.credentials();
            let session = self.factory.connect(&credentials);
            inner
                .members
                .push(PoolMember::new(entry.id.clone(), session, Some(credentials)));
            if inner.source != PoolSource::Pool && inner.members.len() > 1 {
                inner.source = PoolSource::Pool;
            }
        }
        info!(member_id = %entry.id, "member added");
        self.save_config().await;
        Ok(())
    }

    pub async fn remove_member(&self, id: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            let index = inner
                .members
                .iter()
                .position(|m| m.id == id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            if inner.members.len() <= 1 {
                return Err(Error::LastMember);
            }
            inner.members.remove(index);
            if inner.cursor >= inner.members.len() {
                inner.cursor = 0;
            }
        }
        info!(member_id = id, "member removed");
        self.save_config().await;
        Ok(())
    }

    pub async fn enable_member(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let member = inner
            .find_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        member.enabled = true;
        info!(member_id = id, "member enabled");
        Ok(())
    }

    pub async fn disable_member(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let target = inner
            .find(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let other_enabled = inner.members.iter().any(|m| m.enabled && m.id != id);
        if target.enabled && !other_enabled {
            return Err(Error::LastEnabledMember);
        }
        if let Some(member) = inner.find_mut(id) {
            member.enabled = false;
        }
        info!(member_id = id, "member disabled");
        Ok(())
    }

    /// Clear a member's backoff without counting a request.
    pub async fn reset_member(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .find_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?
            .reset();
        info!(member_id = id, "member backoff cleared");
        Ok(())
    }

    pub async fn list_members(&self) -> Vec<MemberSummary> {
        let inner = self.inner.lock().await;
        inner
            .members
            .iter()
            .map(|m| MemberSummary {
                id: m.id.clone(),
                available: m.is_available(),
                enabled: m.enabled,
            })
            .collect()
    }

    pub async fn status(&self) -> PoolStatus {
        let inner = self.inner.lock().await;
        let members: Vec<MemberStatus> = inner.members.iter().map(PoolMember::status).collect();
        PoolStatus {
            total: members.len(),
            available: members.iter().filter(|m| m.available).count(),
            source: inner.source,
            members,
        }
    }

    pub async fn member_status(&self, id: &str) -> Result<MemberStatus> {
        let inner = self.inner.lock().await;
        inner
            .find(id)
            .map(PoolMember::status)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Time until the first blocked member frees up, when nothing is available.
    pub async fn earliest_available(&self) -> Option<Duration> {
        let inner = self.inner.lock().await;
        if inner.members.iter().any(PoolMember::is_available) {
            return None;
        }
        inner
            .members
            .iter()
            .filter(|m| m.enabled)
            .filter_map(PoolMember::retry_in)
            .min()
    }

    pub async fn source(&self) -> PoolSource {
        self.inner.lock().await.source
    }

    // -- import / export -------------------------------------------------

    /// Credential entries for every member that has credentials.
    pub async fn export(&self) -> Vec<TokenEntry> {
        self.inner.lock().await.snapshot_config().tokens
    }

    pub async fn export_member(&self, id: &str) -> Result<TokenEntry> {
        let inner = self.inner.lock().await;
        let member = inner
            .find(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        member
            .credentials
            .as_ref()
            .map(|c| TokenEntry::from_credentials(id, c))
            .ok_or_else(|| Error::InvalidMember(format!("member '{id}' has no credentials")))
    }

    /// Add every complete, unseen entry. Saves once if anything was added.
    pub async fn import(&self, payload: ImportPayload) -> Result<ImportReport> {
        let entries = payload.into_entries();
        if entries.is_empty() {
            return Err(Error::EmptyImport);
        }

        let mut report = ImportReport::default();
        {
            let mut inner = self.inner.lock().await;
            for entry in entries {
                if !entry.is_complete() {
                    report
                        .errors
                        .push("Invalid token entry: missing required fields".into());
                    continue;
                }
                let id = entry.id.trim().to_string();
                if inner.find(&id).is_some() {
                    report.skipped.push(id);
                    continue;
                }
                let credentials = entry.credentials();
                let session = self.factory.connect(&credentials);
                inner
                    .members
                    .push(PoolMember::new(id.clone(), session, Some(credentials)));
                report.added.push(id);
            }
            if !report.added.is_empty() && inner.members.len() > 1 {
                inner.source = PoolSource::Pool;
            }
        }

        if !report.added.is_empty() {
            self.save_config().await;
        }
        info!(
            added = report.added.len(),
            skipped = report.skipped.len(),
            errors = report.errors.len(),
            "import finished"
        );
        Ok(report)
    }

    // -- settings ----------------------------------------------------------

    pub async fn monitor_config(&self) -> MonitorConfig {
        self.inner.lock().await.monitor.clone()
    }

    /// Apply a partial monitor update, restart or stop the loop to match, persist.
    pub async fn update_monitor_config(
        self: &Arc<Self>,
        update: MonitorUpdate,
    ) -> Result<MonitorConfig> {
        if update.interval.is_some_and(|h| pool_store::config::hours(h).is_none()) {
            return Err(Error::InvalidConfig(
                "interval must be a positive number of hours".into(),
            ));
        }

        let (before, after) = {
            let mut inner = self.inner.lock().await;
            let before = inner.monitor.clone();
            let monitor = &mut inner.monitor;
            if let Some(enable) = update.enable {
                monitor.enable = enable;
            }
            if let Some(interval) = update.interval {
                monitor.interval = interval;
            }
            if let Some(token) = update.tg_bot_token {
                monitor.tg_bot_token = Some(token).filter(|t| !t.trim().is_empty());
            }
            if let Some(chat) = update.tg_chat_id {
                monitor.tg_chat_id = Some(chat).filter(|c| !c.trim().is_empty());
            }
            (before, inner.monitor.clone())
        };

        if after.enable {
            let interval_changed = before.interval != after.interval;
            if !before.enable || interval_changed || !self.is_monitor_running() {
                self.stop_monitor();
                self.start_monitor().await;
            }
        } else if before.enable {
            self.stop_monitor();
        }

        info!(enable = after.enable, interval_hours = after.interval, "monitor settings updated");
        self.save_config().await;
        Ok(after)
    }

    pub async fn fallback_config(&self) -> FallbackConfig {
        self.inner.lock().await.fallback.clone()
    }

    pub async fn update_fallback_config(&self, update: FallbackUpdate) -> FallbackConfig {
        let fallback = {
            let mut inner = self.inner.lock().await;
            if let Some(enabled) = update.fallback_to_auto {
                inner.fallback.fallback_to_auto = enabled;
            }
            inner.fallback.clone()
        };
        info!(fallback_to_auto = fallback.fallback_to_auto, "fallback settings updated");
        self.save_config().await;
        fallback
    }

    // -- persistence -------------------------------------------------------

    /// Pick up credential document edits made by another process.
    ///
    /// Adds complete new entries and drops members missing from the document
    /// (never the last one). Existing members keep their sessions. Only the
    /// fallback section is taken from the document; monitor settings belong
    /// to the process running the monitor. Returns whether the document changed.
    pub async fn reload_config(&self) -> Result<bool> {
        let Some(store) = &self.config_store else {
            return Ok(false);
        };
        let Some(document) = store.reload_if_changed().await? else {
            return Ok(false);
        };

        let mut added = 0usize;
        let mut removed = 0usize;
        {
            let mut inner = self.inner.lock().await;
            let listed: HashSet<String> = document
                .tokens
                .iter()
                .filter(|t| t.is_complete())
                .map(|t| t.id.trim().to_string())
                .collect();

            for entry in document.tokens.iter().filter(|t| t.is_complete()) {
                let id = entry.id.trim();
                if inner.find(id).is_none() {
                    let credentials = entry.credentials();
                    let session = self.factory.connect(&credentials);
                    inner
                        .members
                        .push(PoolMember::new(id, session, Some(credentials)));
                    added += 1;
                }
            }

            let stale: Vec<String> = inner
                .members
                .iter()
                .filter(|m| !listed.contains(&m.id))
                .map(|m| m.id.clone())
                .collect();
            for id in stale {
                if inner.members.len() <= 1 {
                    break;
                }
                inner.members.retain(|m| m.id != id);
                removed += 1;
            }
            if inner.cursor >= inner.members.len() {
                inner.cursor = 0;
            }
            inner.fallback = document.fallback;
        }

        info!(added, removed, "reloaded credential document");
        Ok(true)
    }

    async fn save_config(&self) {
        let Some(store) = &self.config_store else {
            return;
        };
        let document = self.inner.lock().await.snapshot_config();
        if let Err(e) = store.save(&document).await {
            warn!(error = %e, path = %store.path().display(), "failed to save credential document");
        }
    }

    /// Write the runtime state document. Errors are logged, never returned.
    pub async fn save_state(&self, writer: &str) {
        let Some(store) = &self.state_store else {
            return;
        };
        let state = self.inner.lock().await.snapshot_state(writer);
        if let Err(e) = store.save(&state).await {
            warn!(error = %e, writer, "failed to save runtime state");
        }
    }

    /// Apply health written by another process, if the document changed.
    pub async fn load_state(&self) -> StateLoad {
        let Some(store) = &self.state_store else {
            return StateLoad::Detached;
        };
        match store.load_if_changed().await {
            LoadOutcome::Unchanged => StateLoad::Unchanged,
            LoadOutcome::Missing => StateLoad::Missing,
            LoadOutcome::Ignored => StateLoad::Ignored,
            LoadOutcome::Loaded(state) => {
                let mut inner = self.inner.lock().await;
                let mut applied = 0;
                for member in inner.members.iter_mut() {
                    if let Some(shared) = state.clients.get(&member.id) {
                        member.apply_state(shared);
                        applied += 1;
                    }
                }
                debug!(applied, writer = %state.writer, "applied shared runtime state");
                StateLoad::Applied(applied)
            }
        }
    }

    /// Whether the shared state is older than `max_age` (default: the monitor
    /// interval). A pool without a state store is always stale.
    pub async fn is_state_stale(&self, max_age: Option<Duration>) -> bool {
        let Some(store) = &self.state_store else {
            return true;
        };
        let max_age = match max_age {
            Some(age) => age,
            None => self.inner.lock().await.monitor.interval_duration(),
        };
        store.is_stale(max_age).await
    }

    /// Fetch quota snapshots for every member without probing identity.
    ///
    /// Used by read-only processes when the monitor's state is stale.
    /// Members that answer are assumed signed in when their validity was
    /// unknown.
    pub async fn refresh_quotas(&self) {
        let sessions: Vec<(String, Arc<dyn Session>)> = {
            let inner = self.inner.lock().await;
            inner
                .members
                .iter()
                .filter(|m| m.owns_account())
                .map(|m| (m.id.clone(), m.session.clone()))
                .collect()
        };

        let mut refreshed = 0usize;
        for (id, session) in sessions {
            match session.rate_limits().await {
                Ok(snapshot) => {
                    let mut inner = self.inner.lock().await;
                    if let Some(member) = inner.find_mut(&id) {
                        member.quota = snapshot;
                        member.last_check = Some(common::unix_seconds());
                        if member.session_valid.is_none() {
                            member.session_valid = Some(true);
                        }
                        refreshed += 1;
                    }
                }
                Err(e) => warn!(member_id = %id, error = %e, "quota refresh failed"),
            }
        }
        info!(refreshed, "refreshed member quotas");
        self.save_state("rate_limit_check").await;
    }

    /// Read-only processes sync with the monitoring process before a query:
    /// credential edits, shared health, and a quota refresh when the shared
    /// state has gone stale.
    pub async fn sync_shared_state(&self) {
        if self.config_store.is_none() || self.config_writable() {
            return;
        }
        if let Err(e) = self.reload_config().await {
            warn!(error = %e, "credential document reload failed");
        }
        self.load_state().await;
        if self.is_state_stale(None).await {
            self.refresh_quotas().await;
        }
    }
}
