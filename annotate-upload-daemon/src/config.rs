//! Daemon Configuration
//!
//! Configuration management for the upload daemon.

use annotate_upload::PipelineConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "daemon.toml";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend endpoints
    pub server: ServerConfig,

    /// Upload pipeline tunables
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Storage paths
    pub paths: PathConfig,
}

/// Backend endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the REST API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// WebSocket URL of the push channel; polling only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_url: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Storage paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Persisted upload state
    pub state_dir: PathBuf,
}

fn default_base_url() -> String {
    "http://localhost:5000/api".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            push_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("annotate-upload")
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("annotate-upload");

        Self {
            server: ServerConfig::default(),
            pipeline: PipelineConfig::default(),
            paths: PathConfig {
                config_dir: default_config_dir(),
                state_dir,
            },
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the default location. A missing
    /// file is created with defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_dir().join(CONFIG_FILE),
        };

        if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            tracing::info!("Wrote default configuration to {}", config_path.display());
            Ok(config)
        }
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir).context("Failed to create config directory")?;
        fs::create_dir_all(self.store_dir()).context("Failed to create state directory")?;
        Ok(())
    }

    /// Where persisted upload records live
    pub fn store_dir(&self) -> PathBuf {
        self.paths.state_dir.join("uploads")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.base_url, "http://localhost:5000/api");
        assert!(config.server.push_url.is_none());
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.pipeline.gate.max_concurrent_uploads, 3);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.server.base_url, config.server.base_url);
        assert_eq!(parsed.paths.state_dir, config.paths.state_dir);
    }

    #[test]
    fn test_partial_pipeline_section() {
        let parsed: Config = toml::from_str(
            r#"
            [server]
            base_url = "https://annotate.example.com/api"
            push_url = "wss://annotate.example.com/ws"

            [pipeline.gate]
            max_concurrent_uploads = 5

            [paths]
            config_dir = "/tmp/cfg"
            state_dir = "/tmp/state"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.server.request_timeout_secs, 60);
        assert_eq!(parsed.pipeline.gate.max_concurrent_uploads, 5);
        assert_eq!(parsed.pipeline.gate.min_dispatch_interval_ms, 300);
        assert_eq!(parsed.store_dir(), PathBuf::from("/tmp/state/uploads"));
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("daemon.toml");

        let config = Config::load(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(config.server.base_url, default_base_url());

        let reloaded = Config::load(Some(&path)).unwrap();
        assert_eq!(reloaded.paths.state_dir, config.paths.state_dir);
    }
}
