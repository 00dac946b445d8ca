//! Configuration management for the OMEMO session core.
//!
//! Configuration is TOML-based and layered: built-in defaults, an optional
//! file, then `OMEMO_*` environment variables. The protocol parameters that
//! differ between OMEMO variants (content key size, skip limits) live here
//! instead of being hardcoded in the ratchet.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "omemo.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "OMEMO";

/// Largest one-time prekey pool a store may be configured with
pub const MAX_PREKEY_COUNT: usize = 0x00FF_FFFF;

/// Complete configuration for the session core
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OmemoConfig {
    /// Identity and prekey store configuration
    pub store: StoreConfig,
    /// Ratchet and recovery configuration
    pub session: SessionConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Identity and prekey store configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of one-time prekeys kept in the pool
    pub prekey_count: usize,
}

/// Per-session protocol parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of message keys derived in one recovery operation
    pub max_skip: u32,
    /// Capacity of a session's own skipped-key cache
    pub max_cached_keys: usize,
    /// Size of the transported content key: 32 (legacy) or 48 bytes
    ///
    /// [`crate::encrypt_payload`] only produces 32-byte keys; 48-byte keys
    /// must come from an external body cipher.
    pub content_key_size: usize,
    /// Reject handshakes that cannot attach a one-time prekey
    pub require_one_time_prekey: bool,
    /// Receiving counter after which an empty reply is advisable
    pub heartbeat_threshold: u32,
    /// Maximum number of sessions a manager holds
    pub max_sessions: usize,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prekey_count: crate::defaults::DEFAULT_PREKEY_COUNT,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_skip: crate::defaults::DEFAULT_MAX_SKIP,
            max_cached_keys: crate::defaults::DEFAULT_MAX_CACHED_KEYS,
            content_key_size: crate::defaults::DEFAULT_CONTENT_KEY_SIZE,
            require_one_time_prekey: true,
            heartbeat_threshold: crate::defaults::DEFAULT_HEARTBEAT_THRESHOLD,
            max_sessions: crate::defaults::DEFAULT_MAX_SESSIONS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SessionConfig {
    /// Validate the session parameters
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the offending field
    pub fn validate(&self) -> Result<()> {
        if self.max_skip == 0 {
            return Err(invalid("session.max_skip", self.max_skip));
        }

        if self.max_cached_keys < self.max_skip as usize {
            return Err(invalid("session.max_cached_keys", self.max_cached_keys));
        }

        if !matches!(self.content_key_size, 32 | 48) {
            return Err(invalid("session.content_key_size", self.content_key_size));
        }

        if self.max_sessions == 0 {
            return Err(invalid("session.max_sessions", self.max_sessions));
        }

        Ok(())
    }
}

impl StoreConfig {
    /// Validate the store parameters
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the pool size is out of range
    pub fn validate(&self) -> Result<()> {
        if self.prekey_count == 0 || self.prekey_count > MAX_PREKEY_COUNT {
            return Err(invalid("store.prekey_count", self.prekey_count));
        }
        Ok(())
    }
}

impl OmemoConfig {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// # Arguments
    ///
    /// * `config_file` - Optional path to configuration file
    ///
    /// # Errors
    ///
    /// Returns error if a present file is invalid or an override fails to parse
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = Self::from_file(path)?;
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("omemo-session")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            if let Some(location) = default_locations.iter().find(|l| l.exists()) {
                config = Self::from_file(location)?;
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories
    ///
    /// # Errors
    ///
    /// Returns error if the directory or file cannot be written
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|_| ConfigError::DirectoryCreation {
                path: parent.display().to_string(),
            })?;
        }

        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Apply `OMEMO_*` environment variable overrides
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a variable does not parse
    pub fn merge_from_env(mut self) -> Result<Self> {
        if let Some(count) = env_override("PREKEY_COUNT")? {
            self.store.prekey_count = count;
        }

        if let Some(max_skip) = env_override("MAX_SKIP")? {
            self.session.max_skip = max_skip;
        }

        if let Some(cached) = env_override("MAX_CACHED_KEYS")? {
            self.session.max_cached_keys = cached;
        }

        if let Some(size) = env_override("CONTENT_KEY_SIZE")? {
            self.session.content_key_size = size;
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOG_LEVEL")) {
            self.logging.level = level;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the offending field
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.session.validate()?;

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            _ => Err(invalid("logging.level", &self.logging.level)),
        }
    }

    /// Get the configuration as a pretty-printed TOML string
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] if serialization fails
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn env_override<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    let key = format!("{ENV_PREFIX}_{name}");
    match std::env::var(&key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { field: key, value }.into()),
        Err(_) => Ok(None),
    }
}

fn invalid<V: std::fmt::Display>(field: &str, value: V) -> crate::OmemoError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_default_config() {
        let config = OmemoConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.prekey_count, 100);
        assert_eq!(config.session.content_key_size, 32);
        assert!(config.session.require_one_time_prekey);
    }

    #[test]
    fn test_config_serialization() {
        let config = OmemoConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("max_skip"));
        assert!(toml_str.contains("prekey_count"));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = OmemoConfig::default();
        config.session.max_skip = 250;
        config.session.max_cached_keys = 500;
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = OmemoConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(config, loaded);
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("omemo.toml");

        OmemoConfig::default().save(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[session]\ncontent_key_size = 48\n").unwrap();

        let config = OmemoConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.session.content_key_size, 48);
        assert_eq!(config.session.max_skip, crate::defaults::DEFAULT_MAX_SKIP);
        assert_eq!(config.store.prekey_count, 100);
    }

    #[test]
    fn test_missing_file() {
        let err = OmemoConfig::from_file("/nonexistent/omemo.toml").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }

    #[test]
    fn test_config_validation() {
        let mut config = OmemoConfig::default();
        assert!(config.validate().is_ok());

        config.store.prekey_count = 0;
        assert!(config.validate().is_err());

        config = OmemoConfig::default();
        config.session.content_key_size = 24;
        assert!(config.validate().is_err());

        config = OmemoConfig::default();
        config.session.max_cached_keys = 10;
        assert!(config.validate().is_err());

        config = OmemoConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        // Both cases share one test so parallel tests never see each other's variables
        std::env::set_var("OMEMO_MAX_SKIP", "42");
        let config = OmemoConfig::default().merge_from_env();
        std::env::remove_var("OMEMO_MAX_SKIP");
        assert_eq!(config.unwrap().session.max_skip, 42);

        std::env::set_var("OMEMO_CONTENT_KEY_SIZE", "thirty-two");
        let result = OmemoConfig::default().merge_from_env();
        std::env::remove_var("OMEMO_CONTENT_KEY_SIZE");
        assert!(result.is_err());
    }
}
