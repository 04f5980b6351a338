//! Configuration loader for YAML files

use crate::config::types::*;
use crate::errors::HubError;
use std::path::Path;
use tokio::fs;

/// Configuration loader with validation
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<HubConfig, HubError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            HubError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut config = Self::from_str(&content)?;
        if let Some(base_dir) = path.parent() {
            Self::resolve_paths(&mut config, base_dir);
        }
        Ok(config)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<HubConfig, HubError> {
        // An empty document deserializes to unit, not to an empty mapping.
        let config: HubConfig = if content.trim().is_empty() {
            HubConfig::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| HubError::Config(format!("Failed to parse YAML config: {}", e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub async fn from_file_or_default<P: AsRef<Path>>(path: P) -> Result<HubConfig, HubError> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::from_file(path).await
        } else {
            log::warn!(
                "Config file {} not found, using built-in defaults",
                path.display()
            );
            Ok(HubConfig::default())
        }
    }

    /// Relative paths in the file are taken relative to the file itself.
    fn resolve_paths(config: &mut HubConfig, base_dir: &Path) {
        let resolve = |path: &mut std::path::PathBuf| {
            if path.is_relative() {
                *path = base_dir.join(&*path);
            }
        };
        resolve(&mut config.control.key_file);
        resolve(&mut config.storage.program_dir);
        if let Some(driver) = config.storage.python_driver.as_mut() {
            resolve(driver);
        }
        if let Some(tls) = config.control.tls.as_mut() {
            resolve(&mut tls.cert);
            resolve(&mut tls.key);
        }
    }

    /// Reads the pre-shared key: the first whitespace-delimited token of the file.
    pub async fn read_key<P: AsRef<Path>>(path: P) -> Result<String, HubError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            HubError::Config(format!("Failed to read key file {}: {}", path.display(), e))
        })?;
        content
            .split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(|| HubError::Config(format!("Key file {} is empty", path.display())))
    }
}
