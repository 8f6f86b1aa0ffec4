//! # Configuration
//!
//! `codap.toml` plus environment overrides.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! rate_limit = 100
//!
//! [history]
//! capacity = 100
//!
//! [logging]
//! format = "json"
//! ```
//!
//! ## Environment Overrides
//!
//! - `CODAP_RATE_LIMIT`: requests per second, 0 disables limiting
//! - `CODAP_API_KEY`: if set, requires Bearer token authentication
//! - `CODAP_CORS_ORIGINS`: comma-separated origins, or "*" for all
//! - `CODAP_LOG_FORMAT`: `text` or `json`

use codap_core::CodapError;
use codap_core::primitives::DEFAULT_UNDO_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default request body limit: 2 MiB.
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Default rate limit: 100 requests per second.
pub const DEFAULT_RATE_LIMIT: u32 = 100;

/// Largest config file we are willing to parse.
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub history: HistoryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub body_limit_bytes: usize,
    /// Requests per second; 0 disables rate limiting.
    pub rate_limit: u32,
    /// Seconds between background saves; 0 saves only at shutdown.
    pub autosave_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Comma-separated origins or "*". Localhost only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            body_limit_bytes: DEFAULT_BODY_LIMIT,
            rate_limit: DEFAULT_RATE_LIMIT,
            autosave_secs: 30,
            api_key: None,
            cors_origins: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_UNDO_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// `EnvFilter` directives, used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: "codap=info,codap_core=info,tower_http=debug".to_string(),
        }
    }
}

impl AppConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, CodapError> {
        toml::from_str(text).map_err(|e| CodapError::DeserializationError(e.to_string()))
    }

    /// Read `path` if it exists, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, CodapError> {
        let mut config = if path.exists() {
            let metadata = std::fs::metadata(path)
                .map_err(|e| CodapError::IoError(format!("Cannot read config metadata: {}", e)))?;
            if metadata.len() > MAX_CONFIG_FILE_SIZE {
                return Err(CodapError::DeserializationError(format!(
                    "Config file {} bytes exceeds maximum {} bytes",
                    metadata.len(),
                    MAX_CONFIG_FILE_SIZE
                )));
            }
            let text = std::fs::read_to_string(path)
                .map_err(|e| CodapError::IoError(format!("Read config: {}", e)))?;
            Self::from_toml_str(&text)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `CODAP_*` overrides from `lookup`.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup("CODAP_RATE_LIMIT") {
            match raw.trim().parse() {
                Ok(rps) => self.server.rate_limit = rps,
                Err(_) => tracing::warn!("ignoring invalid CODAP_RATE_LIMIT '{}'", raw),
            }
        }
        if let Some(key) = lookup("CODAP_API_KEY") {
            self.server.api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Some(origins) = lookup("CODAP_CORS_ORIGINS") {
            self.server.cors_origins = Some(origins);
        }
        if let Some(format) = lookup("CODAP_LOG_FORMAT") {
            match format.trim() {
                "json" => self.logging.format = LogFormat::Json,
                "text" => self.logging.format = LogFormat::Text,
                other => tracing::warn!("ignoring invalid CODAP_LOG_FORMAT '{}'", other),
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
