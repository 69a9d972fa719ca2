//! Runtime state document
//!
//! Written after probe cycles and successful queries so that other processes
//! (notably read-only ones serving queries without the monitor) observe the
//! same member health. Backoff never leaves the process that observed it.
//!
//! Version 2 layout:
//!
//! ```json
//! {
//!   "version": 2,
//!   "updated_at": 1735500000.5,
//!   "writer": "monitor",
//!   "clients": {
//!     "acct-1": {"session_valid": true, "state": "normal", "last_check": 1735500000.1,
//!                "rate_limits": {"pro_remaining": 3, "modes": {}}}
//!   }
//! }
//! ```
//!
//! Version 1 documents carry only the `state` string (and may spell
//! `last_check` as `last_heartbeat`); their quota data is ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use session::QuotaSnapshot;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::atomic::{modified_at, write_atomic};
use crate::error::{Error, Result};

/// Version written by this crate.
pub const STATE_VERSION: u64 = 2;

/// State file name, placed next to the credential document.
pub const STATE_FILE_NAME: &str = "pool_state.json";

/// Whole-pool snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(default = "legacy_version")]
    pub version: u64,
    /// Unix epoch seconds.
    #[serde(default)]
    pub updated_at: f64,
    #[serde(default)]
    pub writer: String,
    #[serde(default)]
    pub clients: BTreeMap<String, MemberState>,
}

fn legacy_version() -> u64 {
    1
}

impl RuntimeState {
    pub fn new(writer: impl Into<String>, clients: BTreeMap<String, MemberState>) -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: common::unix_seconds(),
            writer: writer.into(),
            clients,
        }
    }

    /// Seconds since `updated_at`.
    pub fn age_seconds(&self) -> f64 {
        common::unix_seconds() - self.updated_at
    }
}

/// Persisted view of one member.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberState {
    #[serde(default)]
    pub session_valid: Option<bool>,
    /// Derived state label, kept for older readers.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default, alias = "last_heartbeat")]
    pub last_check: Option<f64>,
    #[serde(default)]
    pub rate_limits: Option<QuotaSnapshot>,
}

impl MemberState {
    /// Validity from the explicit flag, else from the legacy state label.
    ///
    /// `offline` reads as invalid; `normal`, `downgrade` and `exhausted` read
    /// as valid; anything else stays unknown.
    pub fn effective_session_valid(&self) -> Option<bool> {
        if self.session_valid.is_some() {
            return self.session_valid;
        }
        match self.state.as_deref() {
            Some("offline") => Some(false),
            Some("normal" | "downgrade" | "exhausted") => Some(true),
            _ => None,
        }
    }
}

/// Result of a conditional read.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// File mtime matches the last read or write.
    Unchanged,
    Missing,
    Loaded(RuntimeState),
    /// Corrupt document or unknown version; logged and skipped.
    Ignored,
}

/// Reads and writes the runtime state document.
pub struct StateStore {
    path: PathBuf,
    last_mtime: Mutex<Option<SystemTime>>,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_mtime: Mutex::new(None),
        }
    }

    /// State store living next to the given credential document.
    pub fn beside(config_path: &Path) -> Self {
        let dir = config_path.parent().unwrap_or_else(|| Path::new("."));
        Self::new(dir.join(STATE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the document and remember its mtime so our own write is not
    /// re-read.
    pub async fn save(&self, state: &RuntimeState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| Error::Parse(format!("serializing runtime state: {e}")))?;
        let mut last = self.last_mtime.lock().await;
        *last = write_atomic(&self.path, &json).await?;
        debug!(path = %self.path.display(), writer = %state.writer, "saved runtime state");
        Ok(())
    }

    /// Re-read the document only when its mtime changed.
    pub async fn load_if_changed(&self) -> LoadOutcome {
        let mut last = self.last_mtime.lock().await;
        let Some(mtime) = modified_at(&self.path).await else {
            return LoadOutcome::Missing;
        };
        if *last == Some(mtime) {
            return LoadOutcome::Unchanged;
        }
        let outcome = self.read().await;
        // Remember the mtime of corrupt documents too, so they are not
        // re-parsed on every query until the next write.
        *last = Some(mtime);
        outcome
    }

    /// True when the document is missing, unreadable, or older than `max_age`.
    pub async fn is_stale(&self, max_age: Duration) -> bool {
        match self.read().await {
            LoadOutcome::Loaded(state) => state.age_seconds() > max_age.as_secs_f64(),
            _ => true,
        }
    }

    async fn read(&self) -> LoadOutcome {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LoadOutcome::Missing,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read runtime state");
                return LoadOutcome::Ignored;
            }
        };
        match parse_state(&contents) {
            Ok(Some(state)) => {
                debug!(
                    path = %self.path.display(),
                    writer = %state.writer,
                    age_secs = state.age_seconds(),
                    "loaded runtime state"
                );
                LoadOutcome::Loaded(state)
            }
            Ok(None) => LoadOutcome::Ignored,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt runtime state, ignoring");
                LoadOutcome::Ignored
            }
        }
    }
}

/// Parse a state document. `Ok(None)` for unknown versions.
fn parse_state(contents: &str) -> Result<Option<RuntimeState>> {
    let value: serde_json::Value =
        serde_json::from_str(contents).map_err(|e| Error::Parse(e.to_string()))?;
    let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(1);
    if version != 1 && version != STATE_VERSION {
        warn!(version, "unknown runtime state version, ignoring");
        return Ok(None);
    }

    let mut state: RuntimeState =
        serde_json::from_value(value).map_err(|e| Error::Parse(e.to_string()))?;
    state.version = version;
    for member in state.clients.values_mut() {
        member.session_valid = member.effective_session_valid();
        if version == 1 {
            member.rate_limits = None;
        }
    }
    Ok(Some(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use session::ModeQuota;

    fn snapshot(pro: i64) -> QuotaSnapshot {
        let mut s = QuotaSnapshot {
            pro_remaining: Some(pro),
            ..Default::default()
        };
        s.modes.insert(
            "research".into(),
            ModeQuota {
                available: true,
                remaining: Some(1),
                kind: Some("exact".into()),
            },
        );
        s
    }

    fn sample_state() -> RuntimeState {
        let mut clients = BTreeMap::new();
        clients.insert(
            "acct-1".into(),
            MemberState {
                session_valid: Some(true),
                state: Some("normal".into()),
                last_check: Some(1_735_500_000.25),
                rate_limits: Some(snapshot(3)),
            },
        );
        clients.insert(
            "acct-2".into(),
            MemberState {
                session_valid: Some(false),
                state: Some("offline".into()),
                last_check: Some(1_735_500_001.0),
                rate_limits: None,
            },
        );
        let mut state = RuntimeState::new("test", clients);
        state.updated_at = 1_735_500_002.5;
        state
    }

    #[tokio::test]
    async fn save_load_roundtrip_then_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        let writer = StateStore::new(path.clone());
        let reader = StateStore::new(path);

        let state = sample_state();
        writer.save(&state).await.unwrap();

        match reader.load_if_changed().await {
            LoadOutcome::Loaded(loaded) => assert_eq!(loaded, state),
            other => panic!("expected Loaded, got {other:?}"),
        }
        assert_eq!(reader.load_if_changed().await, LoadOutcome::Unchanged);
        // The writer already knows its own mtime
        assert_eq!(writer.load_if_changed().await, LoadOutcome::Unchanged);
    }

    #[tokio::test]
    async fn wall_clock_timestamps_survive_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        let writer = StateStore::new(path.clone());
        let reader = StateStore::new(path);

        // Sub-microsecond fractions that do not print as short decimals
        let stamps = [
            1_760_000_000.641_345_7,
            1_760_000_000.641_345_5,
            1_759_999_999.123_456_8,
            1_760_003_600.999_999_9,
        ];
        let clients = stamps
            .iter()
            .enumerate()
            .map(|(i, stamp)| {
                let member = MemberState {
                    session_valid: Some(true),
                    state: Some("normal".into()),
                    last_check: Some(*stamp),
                    rate_limits: None,
                };
                (format!("acct-{i}"), member)
            })
            .collect();
        let mut state = RuntimeState::new("test", clients);
        state.updated_at = 1_760_000_000.641_345_7;
        writer.save(&state).await.unwrap();

        let LoadOutcome::Loaded(loaded) = reader.load_if_changed().await else {
            panic!("expected Loaded");
        };
        for (i, stamp) in stamps.iter().enumerate() {
            let got = loaded.clients[&format!("acct-{i}")].last_check.unwrap();
            assert_eq!(got.to_bits(), stamp.to_bits(), "acct-{i}: {got} != {stamp}");
        }
        assert_eq!(loaded.updated_at.to_bits(), state.updated_at.to_bits());
    }

    #[tokio::test]
    async fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join(STATE_FILE_NAME));
        assert_eq!(store.load_if_changed().await, LoadOutcome::Missing);
        assert!(store.is_stale(Duration::from_secs(3600)).await);
    }

    #[tokio::test]
    async fn corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        tokio::fs::write(&path, "{not json").await.unwrap();
        let store = StateStore::new(path);
        assert_eq!(store.load_if_changed().await, LoadOutcome::Ignored);
        assert!(store.is_stale(Duration::from_secs(3600)).await);
    }

    #[test]
    fn unknown_version_is_ignored() {
        assert_eq!(parse_state(r#"{"version": 7, "clients": {}}"#).unwrap(), None);
    }

    #[test]
    fn version_one_reads_legacy_fields() {
        let state = parse_state(
            r#"{
                "clients": {
                    "a": {"state": "offline", "last_heartbeat": 100.0},
                    "b": {"state": "downgrade", "rate_limits": {"pro_remaining": 0}},
                    "c": {"state": "unknown"}
                }
            }"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.clients["a"].session_valid, Some(false));
        assert_eq!(state.clients["a"].last_check, Some(100.0));
        assert_eq!(state.clients["b"].session_valid, Some(true));
        assert_eq!(state.clients["b"].rate_limits, None);
        assert_eq!(state.clients["c"].session_valid, None);
    }

    #[test]
    fn explicit_flag_wins_over_label() {
        let member = MemberState {
            session_valid: Some(true),
            state: Some("offline".into()),
            ..Default::default()
        };
        assert_eq!(member.effective_session_valid(), Some(true));
    }

    #[tokio::test]
    async fn staleness_follows_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join(STATE_FILE_NAME));

        let mut state = sample_state();
        state.updated_at = common::unix_seconds();
        store.save(&state).await.unwrap();
        assert!(!store.is_stale(Duration::from_secs(3600)).await);

        state.updated_at -= 7200.0;
        store.save(&state).await.unwrap();
        assert!(store.is_stale(Duration::from_secs(3600)).await);
    }

    #[test]
    fn state_file_sits_beside_config() {
        let store = StateStore::beside(Path::new("/etc/pool/token_pool_config.json"));
        assert_eq!(store.path(), Path::new("/etc/pool/pool_state.json"));
    }
}
