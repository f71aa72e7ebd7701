//! Configuration for the recorder and the ingest server.

use crate::collector::snapshot::BrowserVendor;
use crate::collector::url::UrlComponents;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Client configuration, persisted as JSON in the user config directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Identifier assigned by the enrollment survey
    #[serde(default)]
    pub user_id: Option<String>,

    /// Base URL of the ingest server
    pub server_url: String,

    /// Browser the capture path is chosen for
    #[serde(default)]
    pub browser: BrowserVendor,

    /// Sampling cadence and URL filtering
    #[serde(default)]
    pub collection: CollectionOptions,

    /// Path for collection counters
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("interaction-recorder");

        Self {
            user_id: None,
            server_url: "http://localhost:8080".to_string(),
            browser: BrowserVendor::default(),
            collection: CollectionOptions::default(),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if missing.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("interaction-recorder")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Enrolled user ID, if any. Blank IDs count as missing.
    pub fn enrolled_user(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|id| !id.trim().is_empty())
    }
}

/// Sampling cadence and URL filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectionOptions {
    /// Period of the sampling timer
    #[serde(with = "duration_ms")]
    pub main_interval: Duration,

    /// Target period between webcam frames
    #[serde(with = "duration_ms")]
    pub emotions_interval: Duration,

    /// Period of the batch flush timer
    #[serde(with = "duration_ms")]
    pub send_interval: Duration,

    /// URL components kept in samples
    pub url: UrlComponents,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            main_interval: Duration::from_millis(100),
            emotions_interval: Duration::from_millis(1000),
            send_interval: Duration::from_millis(5000),
            url: UrlComponents::default(),
        }
    }
}

/// Server settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// MongoDB connection string; in-memory storage when unset
    pub db_host: Option<String>,
    /// Database name
    pub db_name: String,
    /// Address to bind
    pub host: IpAddr,
    /// Port to bind (0 for random)
    pub port: u16,
    /// TLS private key, PEM
    pub tls_key: Option<PathBuf>,
    /// TLS certificate chain, PEM
    pub tls_cert: Option<PathBuf>,
    /// Emotion analysis executable; enrichment disabled when unset
    pub emotions_executable: Option<PathBuf>,
    /// Directory for analyzer scratch files
    pub scratch_dir: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            db_host: None,
            db_name: "interactions".to_string(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
            tls_key: None,
            tls_cert: None,
            emotions_executable: None,
            scratch_dir: PathBuf::from("temp"),
        }
    }
}

impl ServerSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let port = match get("PORT") {
            Some(p) => p
                .trim()
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid PORT '{p}': {e}")))?,
            None => defaults.port,
        };
        let host = match get("HOST") {
            Some(h) => h
                .trim()
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid HOST '{h}': {e}")))?,
            None => defaults.host,
        };

        Ok(Self {
            db_host: get("DB_HOST"),
            db_name: get("DB_NAME").unwrap_or(defaults.db_name),
            host,
            port,
            tls_key: get("HTTPS_CERT_KEY").map(PathBuf::from),
            tls_cert: get("HTTPS_CERT").map(PathBuf::from),
            emotions_executable: get("EMOTIONS_EXECUTABLE").map(PathBuf::from),
            scratch_dir: get("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
        })
    }

    /// Key and certificate, when both are configured.
    pub fn tls_paths(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.tls_key, &self.tls_cert) {
            (Some(key), Some(cert)) => Some((key.clone(), cert.clone())),
            _ => None,
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    EnvError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::EnvError(e) => write!(f, "Environment error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for Duration as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
