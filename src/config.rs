//! Configuration file parser for ~/.config/tubefeed/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as likely typos.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable that overrides `youtube_api_key`.
pub const API_KEY_ENV: &str = "YOUTUBE_API_KEY";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// The custom Debug impl masks `youtube_api_key`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How often the scheduler checks which subscriptions are due.
    pub poll_interval_secs: u64,

    /// Pause between enrichment passes.
    pub analysis_interval_secs: u64,

    /// Refresh interval given to new subscriptions.
    pub default_refresh_interval_secs: u64,

    pub fetch_timeout_secs: u64,

    /// Upper bound for a single duration lookup.
    pub lookup_timeout_secs: u64,

    pub max_concurrent_fetches: usize,

    /// Items looked up at once within one subscription.
    pub max_concurrent_lookups: usize,

    /// Data API key (alternative to the YOUTUBE_API_KEY env var).
    /// Env var takes precedence over config file.
    pub youtube_api_key: Option<String>,

    /// Database file. Defaults to `tubefeed.db` next to the config file.
    pub database_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            analysis_interval_secs: 30,
            default_refresh_interval_secs: 300,
            fetch_timeout_secs: 30,
            lookup_timeout_secs: 20,
            max_concurrent_fetches: 10,
            max_concurrent_lookups: 4,
            youtube_api_key: None,
            database_path: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("analysis_interval_secs", &self.analysis_interval_secs)
            .field(
                "default_refresh_interval_secs",
                &self.default_refresh_interval_secs,
            )
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("lookup_timeout_secs", &self.lookup_timeout_secs)
            .field("max_concurrent_fetches", &self.max_concurrent_fetches)
            .field("max_concurrent_lookups", &self.max_concurrent_lookups)
            .field(
                "youtube_api_key",
                &self.youtube_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("database_path", &self.database_path)
            .finish()
    }
}

const KNOWN_KEYS: [&str; 9] = [
    "poll_interval_secs",
    "analysis_interval_secs",
    "default_refresh_interval_secs",
    "fetch_timeout_secs",
    "lookup_timeout_secs",
    "max_concurrent_fetches",
    "max_concurrent_lookups",
    "youtube_api_key",
    "database_path",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            poll_secs = config.poll_interval_secs,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// The API key, preferring the `YOUTUBE_API_KEY` environment variable.
    pub fn api_key(&self) -> Option<SecretString> {
        resolve_api_key(
            std::env::var(API_KEY_ENV).ok(),
            self.youtube_api_key.as_deref(),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn analysis_interval(&self) -> Duration {
        Duration::from_secs(self.analysis_interval_secs.max(1))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs.max(1))
    }
}

fn resolve_api_key(from_env: Option<String>, from_file: Option<&str>) -> Option<SecretString> {
    from_env
        .filter(|key| !key.trim().is_empty())
        .or_else(|| {
            from_file
                .filter(|key| !key.trim().is_empty())
                .map(str::to_owned)
        })
        .map(|key| SecretString::from(key.trim().to_owned()))
}

// ============================================================================
// Tests
// ============================================================================
