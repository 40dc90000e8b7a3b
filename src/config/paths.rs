//! Per-user state directory.
//!
//! Commands that need root (connect, disconnect, status) run under `sudo`,
//! but their state must live next to the files the unprivileged `login`
//! wrote. When `SUDO_USER` is set the invoking user's home is used and the
//! directory is handed back to that user.

use nix::unistd::{chown, User};
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::ConfigError;

/// Directory name under `~/.config`.
pub const APP_DIR_NAME: &str = "aes128-cli";

const TOKEN_FILE_NAME: &str = "session.token";
const SETTINGS_FILE_NAME: &str = "settings.json";
const STATUS_FILE_NAME: &str = "status.json";
const PID_FILE_NAME: &str = "core.pid";
const TUNNEL_CONFIG_FILE_NAME: &str = "singbox.json";
const CACHE_FILE_NAME: &str = "cache.json";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Locations of every file the client persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    dir: PathBuf,
}

impl ConfigPaths {
    /// Use an explicit state directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        ConfigPaths { dir: dir.into() }
    }

    /// Resolve the invoking user's state directory and make sure it exists.
    pub fn resolve() -> Result<Self, ConfigError> {
        let sudo_user = std::env::var("SUDO_USER")
            .ok()
            .filter(|name| !name.is_empty())
            .map(|name| lookup_user(&name))
            .transpose()?;

        let home = match &sudo_user {
            Some(user) => user.dir.clone(),
            None => dirs::home_dir()
                .ok_or_else(|| ConfigError::NoHomeDir("no home directory for current user".into()))?,
        };

        let paths = ConfigPaths::at(home.join(".config").join(APP_DIR_NAME));
        paths.ensure_dir()?;

        if let Some(user) = sudo_user {
            if let Err(err) = chown(paths.dir(), Some(user.uid), Some(user.gid)) {
                warn!(dir = %paths.dir().display(), "could not hand state directory back to {}: {err}", user.name);
            }
        }

        debug!(dir = %paths.dir().display(), "resolved state directory");
        Ok(paths)
    }

    /// Create the state directory (mode 0750) if missing.
    pub fn ensure_dir(&self) -> Result<(), ConfigError> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(&self.dir)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn token_file(&self) -> PathBuf {
        self.dir.join(TOKEN_FILE_NAME)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.dir.join(SETTINGS_FILE_NAME)
    }

    /// Connection metadata (endpoint name + start time)
    pub fn status_file(&self) -> PathBuf {
        self.dir.join(STATUS_FILE_NAME)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join(PID_FILE_NAME)
    }

    /// Tunnel core configuration document, overwritten on every start
    pub fn tunnel_config_file(&self) -> PathBuf {
        self.dir.join(TUNNEL_CONFIG_FILE_NAME)
    }

    pub fn cache_file(&self) -> PathBuf {
        self.dir.join(CACHE_FILE_NAME)
    }

    /// Default application config, next to the state it configures
    pub fn config_file(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE_NAME)
    }
}

fn lookup_user(name: &str) -> Result<User, ConfigError> {
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(ConfigError::NoHomeDir(format!("unknown SUDO_USER '{name}'"))),
        Err(errno) => Err(ConfigError::NoHomeDir(format!(
            "lookup of SUDO_USER '{name}' failed: {errno}"
        ))),
    }
}
