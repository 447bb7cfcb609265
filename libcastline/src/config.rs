//! Configuration management for Castline
//!
//! Configuration is a TOML file with four sections:
//!
//! ```toml
//! [database]
//! path = "~/.local/share/castline/castline.db"
//!
//! [dispatch]
//! poll_interval_secs = 60
//! max_attempts = 5
//! backoff_base_secs = 60
//! backoff_cap_secs = 21600
//! backoff_jitter_secs = 30
//! stale_after_secs = 900
//! concurrency = 10
//! execution_timeout_secs = 30
//! batch_size = 100
//!
//! [media]
//! public_base_url = "https://cdn.example.com/storage"
//!
//! [platforms.instagram]
//! endpoint = "https://bridge.internal/instagram/publish"
//! ```
//!
//! Every `[dispatch]` knob is optional and falls back to the defaults above.
//! Negative numbers parse and are rejected by [`Config::validate`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::types::PlatformKind;

pub const DEFAULT_POLL_INTERVAL_SECS: i64 = 60;
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;
pub const DEFAULT_BACKOFF_BASE_SECS: i64 = 60;
pub const DEFAULT_BACKOFF_CAP_SECS: i64 = 6 * 3600;
pub const DEFAULT_BACKOFF_JITTER_SECS: i64 = 30;
pub const DEFAULT_STALE_AFTER_SECS: i64 = 15 * 60;
pub const DEFAULT_CONCURRENCY: i64 = 10;
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: i64 = 30;
pub const DEFAULT_BATCH_SIZE: i64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub media: MediaConfig,
    /// Bridge endpoints keyed by platform name (`instagram`, `facebook`, ...)
    #[serde(default)]
    pub platforms: BTreeMap<String, BridgeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Knobs for the dispatch loop, executor and retry scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub poll_interval_secs: i64,
    pub max_attempts: i64,
    pub backoff_base_secs: i64,
    pub backoff_cap_secs: i64,
    pub backoff_jitter_secs: i64,
    pub stale_after_secs: i64,
    pub concurrency: i64,
    pub execution_timeout_secs: i64,
    pub batch_size: i64,
    /// Fixed RNG seed for backoff jitter. Leave unset in production.
    pub seed: Option<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
            backoff_cap_secs: DEFAULT_BACKOFF_CAP_SECS,
            backoff_jitter_secs: DEFAULT_BACKOFF_JITTER_SECS,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            concurrency: DEFAULT_CONCURRENCY,
            execution_timeout_secs: DEFAULT_EXECUTION_TIMEOUT_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            seed: None,
        }
    }
}

impl DispatchConfig {
    /// Check every knob. Called once at startup.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        positive("dispatch.poll_interval_secs", self.poll_interval_secs)?;
        positive("dispatch.max_attempts", self.max_attempts)?;
        positive("dispatch.backoff_base_secs", self.backoff_base_secs)?;
        positive("dispatch.backoff_cap_secs", self.backoff_cap_secs)?;
        positive("dispatch.stale_after_secs", self.stale_after_secs)?;
        positive("dispatch.concurrency", self.concurrency)?;
        positive("dispatch.execution_timeout_secs", self.execution_timeout_secs)?;
        positive("dispatch.batch_size", self.batch_size)?;

        if self.backoff_jitter_secs < 0 {
            return Err(invalid("dispatch.backoff_jitter_secs", "must not be negative"));
        }

        if self.max_attempts > i64::from(u32::MAX) {
            return Err(invalid("dispatch.max_attempts", "is unreasonably large"));
        }

        if self.backoff_cap_secs < self.backoff_base_secs {
            return Err(invalid(
                "dispatch.backoff_cap_secs",
                "must be greater than or equal to backoff_base_secs",
            ));
        }

        // A claim must outlive the execution it guards
        if self.stale_after_secs <= self.execution_timeout_secs {
            return Err(invalid(
                "dispatch.stale_after_secs",
                "must be greater than execution_timeout_secs",
            ));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        secs(self.execution_timeout_secs)
    }

    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.max_attempts).unwrap_or(1)
    }

    pub fn concurrency(&self) -> usize {
        usize::try_from(self.concurrency).unwrap_or(1)
    }

    pub fn batch_size(&self) -> i64 {
        self.batch_size.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Prefix joined with each media file path to build the public URL
    pub public_base_url: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            public_base_url: "http://localhost/storage".to_string(),
        }
    }
}

/// HTTP bridge endpoint for one platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub endpoint: String,
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/castline/castline.db".to_string(),
            },
            dispatch: DispatchConfig::default(),
            media: MediaConfig::default(),
            platforms: BTreeMap::new(),
        }
    }

    /// Validate the whole configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }

        self.dispatch.validate()?;

        for (name, bridge) in &self.platforms {
            if name.parse::<PlatformKind>().is_err() {
                return Err(invalid(
                    &format!("platforms.{}", name),
                    "unknown platform (expected instagram, facebook, tiktok or linkedin)",
                )
                .into());
            }
            if bridge.enabled && bridge.endpoint.trim().is_empty() {
                return Err(
                    ConfigError::MissingField(format!("platforms.{}.endpoint", name)).into(),
                );
            }
        }

        Ok(())
    }

    /// Database path with `~` expanded and `CASTLINE_DB_PATH` applied
    pub fn database_path(&self) -> String {
        let raw = std::env::var("CASTLINE_DB_PATH").unwrap_or_else(|_| self.database.path.clone());
        shellexpand::tilde(&raw).to_string()
    }
}

/// Resolve the configuration file path following the XDG base directory layout
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CASTLINE_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("castline").join("config.toml"))
}

fn positive(field: &str, value: i64) -> std::result::Result<(), ConfigError> {
    if value < 1 {
        return Err(invalid(field, &format!("must be at least 1 (got {})", value)));
    }
    Ok(())
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn secs(value: i64) -> Duration {
    Duration::from_secs(u64::try_from(value).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CastlineError;
    use serial_test::serial;

    const FULL_CONFIG: &str = r#"
[database]
path = "/tmp/castline-test.db"

[dispatch]
poll_interval_secs = 5
max_attempts = 3
backoff_base_secs = 10
backoff_cap_secs = 600
backoff_jitter_secs = 0
stale_after_secs = 120
concurrency = 4
execution_timeout_secs = 15
batch_size = 20
seed = 42

[media]
public_base_url = "https://cdn.example.com/storage"

[platforms.instagram]
endpoint = "http://127.0.0.1:9000/instagram"

[platforms.linkedin]
enabled = false
endpoint = ""
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(FULL_CONFIG).unwrap();

        assert_eq!(config.database.path, "/tmp/castline-test.db");
        assert_eq!(config.dispatch.max_attempts(), 3);
        assert_eq!(config.dispatch.concurrency(), 4);
        assert_eq!(config.dispatch.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.dispatch.seed, Some(42));
        assert_eq!(config.media.public_base_url, "https://cdn.example.com/storage");
        assert_eq!(config.platforms.len(), 2);
        assert!(config.platforms["instagram"].enabled);
        assert!(!config.platforms["linkedin"].enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = Config::from_toml("[database]\npath = \"/tmp/x.db\"\n").unwrap();

        assert_eq!(config.dispatch.poll_interval_secs, 60);
        assert_eq!(config.dispatch.max_attempts, 5);
        assert_eq!(config.dispatch.backoff_base_secs, 60);
        assert_eq!(config.dispatch.backoff_cap_secs, 21600);
        assert_eq!(config.dispatch.backoff_jitter_secs, 30);
        assert_eq!(config.dispatch.stale_after_secs, 900);
        assert_eq!(config.dispatch.concurrency, 10);
        assert_eq!(config.dispatch.execution_timeout_secs, 30);
        assert!(config.platforms.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_dispatch_section_keeps_other_defaults() {
        let config =
            Config::from_toml("[database]\npath = \"/tmp/x.db\"\n[dispatch]\nmax_attempts = 2\n")
                .unwrap();

        assert_eq!(config.dispatch.max_attempts, 2);
        assert_eq!(config.dispatch.backoff_cap_secs, DEFAULT_BACKOFF_CAP_SECS);
    }

    #[test]
    fn test_negative_max_attempts_rejected() {
        let config =
            Config::from_toml("[database]\npath = \"/tmp/x.db\"\n[dispatch]\nmax_attempts = -1\n")
                .unwrap();

        match config.validate() {
            Err(CastlineError::Config(ConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, "dispatch.max_attempts");
            }
            other => panic!("Expected invalid max_attempts, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default_config();
        config.dispatch.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cap_below_base_rejected() {
        let mut config = Config::default_config();
        config.dispatch.backoff_base_secs = 600;
        config.dispatch.backoff_cap_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_jitter_rejected() {
        let mut config = Config::default_config();
        config.dispatch.backoff_jitter_secs = -5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stale_threshold_must_exceed_timeout() {
        let mut config = Config::default_config();
        config.dispatch.stale_after_secs = 30;
        config.dispatch.execution_timeout_secs = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_platform_rejected() {
        let config = Config::from_toml(
            "[database]\npath = \"/tmp/x.db\"\n[platforms.myspace]\nendpoint = \"http://x\"\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enabled_platform_requires_endpoint() {
        let config = Config::from_toml(
            "[database]\npath = \"/tmp/x.db\"\n[platforms.tiktok]\nendpoint = \"  \"\n",
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(CastlineError::Config(ConfigError::MissingField(_)))
        ));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = Config::from_toml("invalid toml content [[[");
        assert!(matches!(
            result,
            Err(CastlineError::Config(ConfigError::ParseError(_)))
        ));
    }

    #[test]
    fn test_load_from_missing_file() {
        let result = Config::load_from_path(Path::new("/nonexistent/castline/config.toml"));
        assert!(matches!(
            result,
            Err(CastlineError::Config(ConfigError::ReadError(_)))
        ));
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_from_env() {
        std::env::set_var("CASTLINE_CONFIG", "/tmp/custom-castline.toml");
        let path = resolve_config_path().unwrap();
        std::env::remove_var("CASTLINE_CONFIG");

        assert_eq!(path, PathBuf::from("/tmp/custom-castline.toml"));
    }

    #[test]
    #[serial]
    fn test_database_path_env_override() {
        let config = Config::default_config();

        std::env::set_var("CASTLINE_DB_PATH", "/tmp/override.db");
        let path = config.database_path();
        std::env::remove_var("CASTLINE_DB_PATH");

        assert_eq!(path, "/tmp/override.db");
    }
}
