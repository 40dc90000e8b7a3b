//! Configuration management module for aes128-cli.
//!
//! This module provides functionality for loading, parsing, and managing
//! the application configuration (directory service, tunnel core location,
//! probe tuning, tun inbound parameters) and for locating the per-user
//! state directory.

mod paths;

pub use paths::{ConfigPaths, APP_DIR_NAME};

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::probe::ProbeSettings;
use crate::tunnel::SynthesisOptions;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),

    /// No home directory could be determined for state files
    #[error("Could not determine home directory: {0}")]
    NoHomeDir(String),
}

/// Directory service settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// Base URL of the directory service API
    #[serde(default = "default_api_base_url")]
    pub base_url: String,

    /// Request timeout in seconds (default: 15)
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_base_url() -> String {
    "https://client.aes128.com/api".to_string()
}

fn default_api_timeout_secs() -> u64 {
    15
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: default_api_base_url(),
            timeout_secs: default_api_timeout_secs(),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Tunnel core binary settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoreConfig {
    /// Path of the tunnel core executable
    #[serde(default = "default_core_path")]
    pub path: PathBuf,

    /// Release downloaded when the executable is missing
    #[serde(default = "default_core_version")]
    pub version: String,

    /// Base URL of the release downloads
    #[serde(default = "default_core_release_url")]
    pub release_url: String,

    /// Download timeout in seconds (default: 300)
    #[serde(default = "default_core_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

fn default_core_path() -> PathBuf {
    PathBuf::from("/usr/lib/aes128-cli/core")
}

fn default_core_version() -> String {
    "1.11.15".to_string()
}

fn default_core_release_url() -> String {
    "https://github.com/SagerNet/sing-box/releases/download".to_string()
}

fn default_core_download_timeout_secs() -> u64 {
    300
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            path: default_core_path(),
            version: default_core_version(),
            release_url: default_core_release_url(),
            download_timeout_secs: default_core_download_timeout_secs(),
        }
    }
}

impl CoreConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Latency probe tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    /// Echo requests per endpoint (default: 3)
    #[serde(default = "default_probe_count")]
    pub count: u16,

    /// Delay between echo requests in milliseconds (default: 200)
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,

    /// Overall per-endpoint timeout in milliseconds (default: 2000)
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum endpoints probed at once (default: 16)
    #[serde(default = "default_probe_max_parallel")]
    pub max_parallel: usize,
}

fn default_probe_count() -> u16 {
    3
}

fn default_probe_interval_ms() -> u64 {
    200
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_probe_max_parallel() -> usize {
    16
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            count: default_probe_count(),
            interval_ms: default_probe_interval_ms(),
            timeout_ms: default_probe_timeout_ms(),
            max_parallel: default_probe_max_parallel(),
        }
    }
}

impl ProbeConfig {
    pub fn settings(&self) -> ProbeSettings {
        ProbeSettings {
            count: self.count,
            interval: Duration::from_millis(self.interval_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

/// Parameters of the local tun inbound written into every tunnel config.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    #[serde(default = "default_interface_name")]
    pub interface_name: String,

    /// Interface address in CIDR notation
    #[serde(default = "default_interface_address")]
    pub address: String,

    #[serde(default = "default_mtu")]
    pub mtu: u32,

    /// Resolver used to look up the proxied resolver itself
    #[serde(default = "default_bootstrap_dns")]
    pub bootstrap_dns: String,
}

fn default_interface_name() -> String {
    "aes128tun".to_string()
}

fn default_interface_address() -> String {
    "172.19.0.1/30".to_string()
}

fn default_mtu() -> u32 {
    1420
}

fn default_bootstrap_dns() -> String {
    "9.9.9.9".to_string()
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            interface_name: default_interface_name(),
            address: default_interface_address(),
            mtu: default_mtu(),
            bootstrap_dns: default_bootstrap_dns(),
        }
    }
}

impl TunnelConfig {
    pub fn synthesis_options(&self) -> SynthesisOptions {
        SynthesisOptions {
            interface_name: self.interface_name.clone(),
            interface_address: self.address.clone(),
            mtu: self.mtu,
            bootstrap_dns: self.bootstrap_dns.clone(),
        }
    }
}

/// Main configuration structure for aes128-cli.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Log level (default: "warn")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub core: CoreConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            log_level: default_log_level(),
            api: ApiConfig::default(),
            core: CoreConfig::default(),
            probe: ProbeConfig::default(),
            tunnel: TunnelConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: AppConfig = toml::from_str(&content)?;

        // Environment variables take precedence over the file
        Self::apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Load from `path` if it exists, otherwise start from defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(ConfigError::FileNotFound(_)) => {
                let mut config = AppConfig::default();
                Self::apply_env_overrides(&mut config);
                config.validate()?;
                Ok(config)
            }
            Err(err) => Err(err),
        }
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &str, message: &str) -> ConfigError {
            ConfigError::InvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            }
        }

        if self.api.base_url.trim().is_empty() {
            return Err(invalid("api.base_url", "cannot be empty"));
        }
        if self.api.timeout_secs == 0 {
            return Err(invalid("api.timeout_secs", "must be greater than 0"));
        }
        if self.core.path.as_os_str().is_empty() {
            return Err(invalid("core.path", "tunnel core path cannot be empty"));
        }
        if self.core.version.trim().is_empty() {
            return Err(invalid("core.version", "cannot be empty"));
        }
        if self.core.download_timeout_secs == 0 {
            return Err(invalid("core.download_timeout_secs", "must be greater than 0"));
        }
        if self.probe.count == 0 {
            return Err(invalid("probe.count", "must be greater than 0"));
        }
        if self.probe.timeout_ms == 0 {
            return Err(invalid("probe.timeout_ms", "must be greater than 0"));
        }
        if self.probe.max_parallel == 0 {
            return Err(invalid("probe.max_parallel", "must be greater than 0"));
        }
        if self.tunnel.interface_name.trim().is_empty() {
            return Err(invalid("tunnel.interface_name", "cannot be empty"));
        }
        if self.tunnel.mtu < 576 {
            return Err(invalid("tunnel.mtu", "must be at least 576"));
        }

        Ok(())
    }

    /// Apply environment variable overrides (prefix: AES128_)
    /// Example keys:
    /// - AES128_LOG_LEVEL
    /// - AES128_API_BASE_URL, AES128_API_TIMEOUT_SECS
    /// - AES128_CORE_PATH, AES128_CORE_VERSION
    /// - AES128_PROBE_COUNT, AES128_PROBE_INTERVAL_MS, AES128_PROBE_TIMEOUT_MS,
    ///   AES128_PROBE_MAX_PARALLEL
    /// - AES128_TUNNEL_INTERFACE_NAME, AES128_TUNNEL_MTU, AES128_TUNNEL_BOOTSTRAP_DNS
    fn apply_env_overrides(cfg: &mut AppConfig) {
        use std::env;

        fn non_empty(key: &str) -> Option<String> {
            env::var(key).ok().filter(|v| !v.trim().is_empty())
        }
        fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
            non_empty(key).and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = non_empty("AES128_LOG_LEVEL") {
            cfg.log_level = v;
        }

        // Directory service
        if let Some(v) = non_empty("AES128_API_BASE_URL") {
            cfg.api.base_url = v;
        }
        if let Some(n) = parsed("AES128_API_TIMEOUT_SECS") {
            cfg.api.timeout_secs = n;
        }

        // Tunnel core
        if let Some(v) = non_empty("AES128_CORE_PATH") {
            cfg.core.path = PathBuf::from(v);
        }
        if let Some(v) = non_empty("AES128_CORE_VERSION") {
            cfg.core.version = v;
        }

        // Probes
        if let Some(n) = parsed("AES128_PROBE_COUNT") {
            cfg.probe.count = n;
        }
        if let Some(n) = parsed("AES128_PROBE_INTERVAL_MS") {
            cfg.probe.interval_ms = n;
        }
        if let Some(n) = parsed("AES128_PROBE_TIMEOUT_MS") {
            cfg.probe.timeout_ms = n;
        }
        if let Some(n) = parsed("AES128_PROBE_MAX_PARALLEL") {
            cfg.probe.max_parallel = n;
        }

        // Tun inbound
        if let Some(v) = non_empty("AES128_TUNNEL_INTERFACE_NAME") {
            cfg.tunnel.interface_name = v;
        }
        if let Some(n) = parsed("AES128_TUNNEL_MTU") {
            cfg.tunnel.mtu = n;
        }
        if let Some(v) = non_empty("AES128_TUNNEL_BOOTSTRAP_DNS") {
            cfg.tunnel.bootstrap_dns = v;
        }
    }
}

/// Configuration manager for handling configuration loading and saving.
#[derive(Debug)]
pub struct ConfigManager {
    /// Current configuration
    config: AppConfig,
    /// Path to the configuration file
    config_path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from the specified path, falling back to defaults
    /// when the file does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = AppConfig::load_or_default(&path)?;

        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    /// Get a reference to the current configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Get a mutable reference to the current configuration
    pub fn config_mut(&mut self) -> &mut AppConfig {
        &mut self.config
    }

    /// Save the current configuration to the current path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.save(&self.config_path)
    }

    /// Get the current configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.probe.count, 3);
        assert_eq!(config.probe.interval_ms, 200);
        assert_eq!(config.probe.timeout_ms, 2_000);
        assert_eq!(config.tunnel.mtu, 1420);
        assert_eq!(config.core.path, PathBuf::from("/usr/lib/aes128-cli/core"));
        assert_eq!(config.core.version, "1.11.15");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_config() {
        let mut file = NamedTempFile::new().unwrap();

        let config_str = r#"
            log_level = "debug"

            [core]
            path = "/opt/core/sing-box"

            [probe]
            max_parallel = 4
        "#;

        file.write_all(config_str.as_bytes()).unwrap();

        let config = AppConfig::load(file.path()).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.core.path, PathBuf::from("/opt/core/sing-box"));
        assert_eq!(config.probe.max_parallel, 4);
        // Untouched sections keep their defaults
        assert_eq!(config.probe.count, 3);
        assert_eq!(config.tunnel.interface_name, "aes128tun");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        assert!(matches!(
            AppConfig::load(&path),
            Err(ConfigError::FileNotFound(_))
        ));
        let manager = ConfigManager::load(&path).unwrap();
        assert_eq!(manager.config().probe.count, 3);
    }

    #[test]
    fn test_validation() {
        let config = AppConfig {
            probe: ProbeConfig {
                max_parallel: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AppConfig {
            tunnel: TunnelConfig {
                mtu: 100,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AppConfig {
            core: CoreConfig {
                path: PathBuf::new(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AppConfig {
            core: CoreConfig {
                version: " ".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut manager = ConfigManager::load(&path).unwrap();
        manager.config_mut().probe.timeout_ms = 1_500;
        manager.save().unwrap();

        let manager = ConfigManager::load(&path).unwrap();
        assert_eq!(manager.config().probe.timeout_ms, 1_500);
        assert_eq!(manager.config_path(), path.as_path());
    }
}
