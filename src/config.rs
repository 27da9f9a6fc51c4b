//! ==============================================================================
//! config.rs - Hub Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `hub.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: where the ingest endpoint listens.
//!     - StorageConfig: which backend holds watermarks and logs, and where.
//!     - LoggingConfig: default filter level and per-reading verbosity.
//!
//! ==============================================================================

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// env var that points at an explicit config file
pub const CONFIG_ENV: &str = "TELEMETRY_HUB_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// extra route for firmware that still posts to the old script path
    pub legacy_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 3000,
            legacy_path: "/bletest.php".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Memory,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::File => "file",
            StorageBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
    /// file name prefix, e.g. `node` gives `node_12.seq` / `node_all.csv`
    pub prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            data_dir: PathBuf::from("data"),
            prefix: "node".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_readings: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_readings: true,
        }
    }
}

impl HubConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        Self::parse(&content)
    }

    /// Parse configuration from a toml string
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: HubConfig = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        Ok(config)
    }

    /// Load with default fallback.
    ///
    /// runs before the subscriber is installed, so the outcome is returned
    /// as a message for the caller to log once tracing is up.
    pub fn load_or_default() -> (Self, String) {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("config").join("hub.toml"));
        paths.push(PathBuf::from("..").join("config").join("hub.toml"));

        let mut notes = Vec::new();
        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        notes.push(format!("Loaded from {}", path.display()));
                        return (config, notes.join("; "));
                    }
                    Err(e) => {
                        notes.push(format!("Failed to load {}: {}", path.display(), e));
                    }
                }
            }
        }

        notes.push("No usable config file found - using defaults".to_string());
        (Self::default(), notes.join("; "))
    }

    /// socket address string for the listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        tracing::info!(
            listen = %self.listen_addr(),
            legacy_path = %self.server.legacy_path,
            backend = self.storage.backend.as_str(),
            data_dir = %self.storage.data_dir.display(),
            prefix = %self.storage.prefix,
            log_level = %self.logging.level,
            "[CONFIG] hub configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = HubConfig::parse("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.legacy_path, "/bletest.php");
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.storage.prefix, "node");
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.show_readings);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = HubConfig::parse(
            r#"
            [server]
            port = 8080

            [storage]
            backend = "memory"
            prefix = "xiao"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.prefix, "xiao");
        assert_eq!(config.storage.data_dir, PathBuf::from("data"));
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = HubConfig::parse("[storage]\nbackend = \"s3\"\n").unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.toml");
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\nshow_readings = false\n").unwrap();

        let config = HubConfig::load(&path).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.show_readings);
    }

    #[test]
    fn bundled_config_parses() {
        let config = HubConfig::parse(include_str!("../config/hub.toml")).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.server.legacy_path, "/bletest.php");
    }
}
