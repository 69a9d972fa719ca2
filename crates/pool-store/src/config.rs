//! Credential document
//!
//! ```json
//! {
//!   "monitor": {"enable": false, "interval": 6, "tg_bot_token": null, "tg_chat_id": null},
//!   "fallback": {"fallback_to_auto": true},
//!   "tokens": [{"id": "acct-1", "csrf_token": "...", "session_token": "..."}]
//! }
//! ```
//!
//! Older documents name the monitor section `heart_beat`; both spellings load.
//! The strict `load` used at startup rejects a document with no tokens or with
//! incomplete entries. Hot reload is lenient: incomplete entries are skipped
//! by the caller instead of failing the whole document.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use session::Credentials;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::atomic::{modified_at, write_atomic};
use crate::error::{Error, Result};

/// File name searched for in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "token_pool_config.json";

/// Default probe interval in hours.
pub const DEFAULT_INTERVAL_HOURS: f64 = 6.0;

/// Background monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub enable: bool,
    /// Hours between probe cycles.
    #[serde(default = "default_interval")]
    pub interval: f64,
    #[serde(default)]
    pub tg_bot_token: Option<String>,
    #[serde(default)]
    pub tg_chat_id: Option<String>,
}

fn default_interval() -> f64 {
    DEFAULT_INTERVAL_HOURS
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enable: false,
            interval: DEFAULT_INTERVAL_HOURS,
            tg_bot_token: None,
            tg_chat_id: None,
        }
    }
}

impl MonitorConfig {
    /// Probe interval as a duration. Non-positive or non-finite values fall
    /// back to the default interval.
    pub fn interval_duration(&self) -> Duration {
        hours(self.interval).unwrap_or_else(|| Duration::from_secs(6 * 3600))
    }

    /// Whether both Telegram settings are present and non-empty.
    pub fn telegram_configured(&self) -> bool {
        matches!(
            (&self.tg_bot_token, &self.tg_chat_id),
            (Some(token), Some(chat)) if !token.is_empty() && !chat.is_empty()
        )
    }
}

/// Convert fractional hours into a duration, rejecting non-positive input.
pub fn hours(value: f64) -> Option<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(value * 3600.0).ok()
}

/// Fallback cascade settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_true")]
    pub fallback_to_auto: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            fallback_to_auto: true,
        }
    }
}

/// One credential entry as stored on disk.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub csrf_token: String,
    #[serde(default)]
    pub session_token: String,
}

impl TokenEntry {
    pub fn new(
        id: impl Into<String>,
        csrf_token: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            csrf_token: csrf_token.into(),
            session_token: session_token.into(),
        }
    }

    /// All three fields present and non-blank.
    pub fn is_complete(&self) -> bool {
        !self.id.trim().is_empty()
            && !self.csrf_token.trim().is_empty()
            && !self.session_token.trim().is_empty()
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.csrf_token.clone(), self.session_token.clone())
    }

    pub fn from_credentials(id: impl Into<String>, credentials: &Credentials) -> Self {
        Self::new(
            id,
            credentials.csrf_token.expose().clone(),
            credentials.session_token.expose().clone(),
        )
    }
}

// Tokens never reach logs, even at debug level.
impl fmt::Debug for TokenEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenEntry")
            .field("id", &self.id)
            .field("csrf_token", &"[REDACTED]")
            .field("session_token", &"[REDACTED]")
            .finish()
    }
}

/// Parsed credential document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default, alias = "heart_beat")]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

impl PoolConfig {
    /// Parse without validating token entries.
    pub fn parse(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).map_err(|e| Error::Parse(format!("credential document: {e}")))
    }

    /// Startup validation: at least one token, every entry complete, ids unique.
    pub fn validate(&self) -> Result<()> {
        if self.tokens.is_empty() {
            return Err(Error::InvalidConfig("no tokens in credential document".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for (index, entry) in self.tokens.iter().enumerate() {
            if !entry.is_complete() {
                return Err(Error::InvalidConfig(format!(
                    "token entry {index} is missing id, csrf_token or session_token"
                )));
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate token id '{}'",
                    entry.id
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Parse(format!("serializing credential document: {e}")))
    }
}

/// Reads and writes the credential document.
///
/// The mutex holds the mtime of the last read or write and serializes writes,
/// so a save followed by `reload_if_changed` does not re-read our own output.
pub struct ConfigStore {
    path: PathBuf,
    writable: bool,
    last_mtime: Mutex<Option<SystemTime>>,
}

impl ConfigStore {
    pub fn new(path: PathBuf, writable: bool) -> Self {
        Self {
            path,
            writable,
            last_mtime: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Strict load used at startup.
    pub async fn load(&self) -> Result<PoolConfig> {
        let mut last = self.last_mtime.lock().await;
        let mtime = modified_at(&self.path).await;
        let config = self.read().await?;
        config.validate()?;
        *last = mtime;
        info!(
            path = %self.path.display(),
            tokens = config.tokens.len(),
            "loaded credential document"
        );
        Ok(config)
    }

    /// Lenient re-read when the file changed since the last read or write.
    ///
    /// Returns `Ok(None)` when the file is missing or its mtime is unchanged.
    pub async fn reload_if_changed(&self) -> Result<Option<PoolConfig>> {
        let mut last = self.last_mtime.lock().await;
        let Some(mtime) = modified_at(&self.path).await else {
            return Ok(None);
        };
        if *last == Some(mtime) {
            return Ok(None);
        }
        let config = self.read().await?;
        *last = Some(mtime);
        debug!(path = %self.path.display(), "credential document changed on disk");
        Ok(Some(config))
    }

    /// Persist the document. Returns `false` without touching disk when the
    /// store is read-only.
    pub async fn save(&self, config: &PoolConfig) -> Result<bool> {
        if !self.writable {
            debug!("credential document is read-only, skipping save");
            return Ok(false);
        }
        let json = config.to_json()?;
        let mut last = self.last_mtime.lock().await;
        *last = write_atomic(&self.path, &json).await?;
        info!(path = %self.path.display(), tokens = config.tokens.len(), "saved credential document");
        Ok(true)
    }

    async fn read(&self) -> Result<PoolConfig> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Io(format!("reading {}: {e}", self.path.display())))?;
        PoolConfig::parse(&contents)
    }
}
