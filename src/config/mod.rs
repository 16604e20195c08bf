//! Configuration management for strata

pub mod schema;

pub use schema::Config;

use crate::error::{StrataError, StrataResult};
use crate::fsutil::write_atomic;
use crate::image::Platform;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Log formats understood by the subscriber setup in `main`
const LOG_FORMATS: &[&str] = &["text", "json"];

/// Locates, reads and writes the strata configuration file
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Manager for the file at the default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Manager for the file given with `--config` or `STRATA_CONFIG`
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// `<config dir>/strata/config.toml`
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("strata")
            .join("config.toml")
    }

    /// Load and validate the configuration. A missing file means defaults.
    pub async fn load(&self) -> StrataResult<Config> {
        let content = match fs::read_to_string(&self.config_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", self.config_path.display());
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(StrataError::io(
                    format!("reading config from {}", self.config_path.display()),
                    e,
                ))
            }
        };

        let config: Config = toml::from_str(&content).map_err(|e| self.invalid(e.to_string()))?;
        self.validate(&config)?;
        Ok(config)
    }

    /// Write `config` to the file, replacing it atomically
    pub async fn save(&self, config: &Config) -> StrataResult<()> {
        self.validate(config)?;
        let content = toml::to_string_pretty(config)?;
        self.ensure_config_dir().await?;
        write_atomic(&self.config_path, content.as_bytes())?;
        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Write the default configuration. An existing file is only replaced
    /// with `force`, which is also how an invalid file is recovered.
    pub async fn init(&self, force: bool) -> StrataResult<Config> {
        if !force && fs::try_exists(&self.config_path).await.unwrap_or(false) {
            return Err(StrataError::ConfigExists(self.config_path.clone()));
        }
        let config = Config::default();
        self.save(&config).await?;
        Ok(config)
    }

    /// Values serde accepts but the rest of strata cannot use
    fn validate(&self, config: &Config) -> StrataResult<()> {
        if !LOG_FORMATS.contains(&config.general.log_format.as_str()) {
            return Err(self.invalid(format!(
                "general.log_format must be one of {}, got {:?}",
                LOG_FORMATS.join(", "),
                config.general.log_format
            )));
        }
        if let Some(platform) = &config.build.platform {
            Platform::parse(platform).map_err(|e| self.invalid(format!("build.platform: {}", e)))?;
        }
        if config.runtime.podman.trim().is_empty() {
            return Err(self.invalid("runtime.podman must name an executable".into()));
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> StrataError {
        StrataError::ConfigInvalid {
            path: self.config_path.clone(),
            reason,
        }
    }

    async fn ensure_config_dir(&self) -> StrataResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StrataError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_default_when_missing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nonexistent.toml");
        let manager = ConfigManager::with_path(path);

        let config = manager.load().await.unwrap();
        assert_eq!(config.general.log_format, "text");
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");
        let manager = ConfigManager::with_path(path);

        let mut config = Config::default();
        config.build.network_mode = "host".to_string();
        config.store.root = Some(temp.path().join("store"));

        manager.save(&config).await.unwrap();
        let loaded = manager.load().await.unwrap();

        assert_eq!(loaded.build.network_mode, "host");
        assert_eq!(loaded.store.root, Some(temp.path().join("store")));
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[serial_test::serial]
    fn default_paths_follow_xdg_dirs() {
        let temp = TempDir::new().unwrap();
        let saved = (
            std::env::var_os("XDG_CONFIG_HOME"),
            std::env::var_os("XDG_DATA_HOME"),
        );
        std::env::set_var("XDG_CONFIG_HOME", temp.path().join("config"));
        std::env::set_var("XDG_DATA_HOME", temp.path().join("data"));

        let config_path = ConfigManager::default_config_path();
        let store_root = Config::default().store.resolved_root();

        for (key, value) in [("XDG_CONFIG_HOME", saved.0), ("XDG_DATA_HOME", saved.1)] {
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
        }

        assert_eq!(config_path, temp.path().join("config/strata/config.toml"));
        assert_eq!(store_root, temp.path().join("data/strata"));
    }

    #[tokio::test]
    async fn invalid_file_is_reported_with_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[build]\nmemory = \"lots\"\n").unwrap();
        let manager = ConfigManager::with_path(path.clone());

        match manager.load().await.unwrap_err() {
            StrataError::ConfigInvalid { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn unknown_keys_are_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[build]\nnetwork = \"host\"\n").unwrap();
        let err = ConfigManager::with_path(path).load().await.unwrap_err();
        assert!(err.to_string().contains("network"));
        assert!(err.is_invalid_parameter());
    }

    #[tokio::test]
    async fn values_are_validated() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        let manager = ConfigManager::with_path(path.clone());

        std::fs::write(&path, "[general]\nlog_format = \"yaml\"\n").unwrap();
        assert!(manager.load().await.unwrap_err().to_string().contains("log_format"));

        std::fs::write(&path, "[build]\nplatform = \"linux\"\n").unwrap();
        assert!(manager.load().await.unwrap_err().to_string().contains("build.platform"));

        let mut config = Config::default();
        config.runtime.podman = String::new();
        assert!(manager.save(&config).await.is_err());
    }

    #[tokio::test]
    async fn init_refuses_to_overwrite_without_force() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("strata").join("config.toml");
        let manager = ConfigManager::with_path(path.clone());

        manager.init(false).await.unwrap();
        assert!(manager.load().await.is_ok());

        std::fs::write(&path, "not toml at all [").unwrap();
        assert!(matches!(
            manager.init(false).await.unwrap_err(),
            StrataError::ConfigExists(_)
        ));

        manager.init(true).await.unwrap();
        let loaded = manager.load().await.unwrap();
        assert_eq!(loaded.general.log_format, "text");
    }
}
