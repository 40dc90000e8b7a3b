//! Small JSON/text stores in the per-user state directory.
//!
//! These hold what the CLI keeps between invocations outside of the tunnel
//! session itself: user settings, the cached endpoint directory and the
//! session token.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::Endpoint;
use crate::config::ConfigPaths;
use crate::tunnel::{Protocol, UnsupportedProtocol};

/// Errors from the local stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    UnsupportedProtocol(#[from] UnsupportedProtocol),

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("unknown setting '{0}'")]
    UnknownKey(String),

    /// No token or user cache on disk
    #[error("you are not logged in; run `aes128-cli login` first")]
    NotLoggedIn,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Write a file readable only by its owner, replacing previous contents.
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_private(path, &json)?;
    Ok(())
}

/// User-selectable tunnel settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Settings {
    pub protocol: Protocol,
    #[serde(rename = "adblock")]
    pub ad_block: bool,
}

/// Parse a user-supplied on/off value.
pub fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" => Some(true),
        "off" | "false" => Some(false),
        _ => None,
    }
}

/// `settings.json`
#[derive(Debug, Clone)]
pub struct SettingsStore {
    paths: ConfigPaths,
}

impl SettingsStore {
    pub fn new(paths: ConfigPaths) -> Self {
        SettingsStore { paths }
    }

    /// Load settings, writing the defaults out on first use.
    pub fn load(&self) -> StoreResult<Settings> {
        let path = self.paths.settings_file();
        match read_json(&path)? {
            Some(settings) => Ok(settings),
            None => {
                let settings = Settings::default();
                debug!(path = %path.display(), "creating default settings");
                self.save(&settings)?;
                Ok(settings)
            }
        }
    }

    pub fn save(&self, settings: &Settings) -> StoreResult<()> {
        write_json(&self.paths.settings_file(), settings)
    }

    pub fn set_protocol(&self, value: &str) -> StoreResult<Settings> {
        let protocol: Protocol = value.parse()?;
        let mut settings = self.load()?;
        settings.protocol = protocol;
        self.save(&settings)?;
        Ok(settings)
    }

    pub fn set_ad_block(&self, value: &str) -> StoreResult<Settings> {
        let enabled = parse_switch(value).ok_or_else(|| StoreError::InvalidValue {
            key: "adblock".to_string(),
            value: value.to_string(),
        })?;
        let mut settings = self.load()?;
        settings.ad_block = enabled;
        self.save(&settings)?;
        Ok(settings)
    }

    /// Set a setting by its user-facing key.
    pub fn set(&self, key: &str, value: &str) -> StoreResult<Settings> {
        match key.trim().to_ascii_lowercase().as_str() {
            "protocol" => self.set_protocol(value),
            "adblock" => self.set_ad_block(value),
            _ => Err(StoreError::UnknownKey(key.to_string())),
        }
    }
}

/// Account data cached at login: the identity the tunnel authenticates
/// with and a snapshot of the endpoint directory.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserCache {
    pub user_uuid: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub session_name: String,
    #[serde(default)]
    pub locations: Vec<Endpoint>,
}

impl UserCache {
    /// Read `cache.json`; a missing file means nobody is logged in.
    pub fn load(paths: &ConfigPaths) -> StoreResult<UserCache> {
        read_json(&paths.cache_file())?.ok_or(StoreError::NotLoggedIn)
    }

    pub fn save(&self, paths: &ConfigPaths) -> StoreResult<()> {
        write_json(&paths.cache_file(), self)
    }

    /// Look a location up by 1-based index or by domain (case-insensitive).
    pub fn find_location(&self, query: &str) -> Option<&Endpoint> {
        let query = query.trim();
        if let Ok(index) = query.parse::<usize>() {
            return index
                .checked_sub(1)
                .and_then(|i| self.locations.get(i));
        }
        self.locations
            .iter()
            .find(|loc| loc.domain.eq_ignore_ascii_case(query))
    }
}

/// `session.token`
#[derive(Debug, Clone)]
pub struct TokenStore {
    paths: ConfigPaths,
}

impl TokenStore {
    pub fn new(paths: ConfigPaths) -> Self {
        TokenStore { paths }
    }

    /// The saved token, if there is a non-empty one.
    pub fn read_optional(&self) -> StoreResult<Option<String>> {
        match fs::read_to_string(self.paths.token_file()) {
            Ok(token) => {
                let token = token.trim().to_string();
                Ok((!token.is_empty()).then_some(token))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn read(&self) -> StoreResult<String> {
        self.read_optional()?.ok_or(StoreError::NotLoggedIn)
    }

    pub fn save(&self, token: &str) -> StoreResult<()> {
        write_private(&self.paths.token_file(), token.as_bytes())?;
        Ok(())
    }
}

/// Forget everything tied to the logged-in session. Missing files are fine;
/// other removal failures are logged and skipped.
pub fn clear_session_data(paths: &ConfigPaths) {
    for path in [
        paths.token_file(),
        paths.cache_file(),
        paths.status_file(),
        paths.pid_file(),
    ] {
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), "failed to remove: {err}"),
        }
    }
}
