//! Configuration type definitions

use crate::errors::HubError;
use crate::registry::Language;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub binding: BindingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Primary, pre-shared-key authenticated channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_control_addr")]
    pub bind_addr: String,
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Container-facing channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    #[serde(default = "default_binding_addr")]
    pub bind_addr: String,
    /// Address containers use to reach the binding channel.
    #[serde(default = "default_advertise_addr")]
    pub advertise_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_program_dir")]
    pub program_dir: PathBuf,
    #[serde(default)]
    pub python_driver: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default)]
    pub images: ImageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_python2_image")]
    pub python2: String,
    #[serde(default = "default_python3_image")]
    pub python3: String,
    #[serde(default = "default_go_image")]
    pub go: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_go_binary")]
    pub go_binary: String,
    #[serde(default = "default_lint")]
    pub lint: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_control_addr(),
            key_file: default_key_file(),
            auth_timeout_secs: default_auth_timeout(),
            tls: None,
        }
    }
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_binding_addr(),
            advertise_addr: default_advertise_addr(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            program_dir: default_program_dir(),
            python_driver: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            images: ImageConfig::default(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            python2: default_python2_image(),
            python3: default_python3_image(),
            go: default_go_image(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            go_binary: default_go_binary(),
            lint: default_lint(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ControlConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

impl ImageConfig {
    pub fn for_language(&self, language: Language) -> &str {
        match language {
            Language::Python2 => &self.python2,
            Language::Python3 => &self.python3,
            Language::Go => &self.go,
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<(), HubError> {
        parse_addr("control.bind_addr", &self.control.bind_addr)?;
        parse_addr("binding.bind_addr", &self.binding.bind_addr)?;
        if self.binding.advertise_addr.trim().is_empty() {
            return Err(HubError::Config(
                "binding.advertise_addr must not be empty".to_string(),
            ));
        }
        if !self.runtime.workdir.starts_with('/') {
            return Err(HubError::Config(format!(
                "runtime.workdir must be an absolute container path, got '{}'",
                self.runtime.workdir
            )));
        }
        if let Some(tls) = &self.control.tls {
            if tls.cert.as_os_str().is_empty() || tls.key.as_os_str().is_empty() {
                return Err(HubError::Config(
                    "control.tls requires both cert and key paths".to_string(),
                ));
            }
        }
        if self.control.auth_timeout_secs == 0 {
            return Err(HubError::Config(
                "control.auth_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn parse_addr(field: &str, value: &str) -> Result<SocketAddr, HubError> {
    value
        .parse()
        .map_err(|e| HubError::Config(format!("Invalid {} '{}': {}", field, value, e)))
}

// Default value functions
fn default_control_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_binding_addr() -> String {
    "0.0.0.0:2076".to_string()
}

fn default_advertise_addr() -> String {
    "172.17.0.1:2076".to_string()
}

fn default_key_file() -> PathBuf {
    PathBuf::from("login.key")
}

fn default_auth_timeout() -> u64 {
    10
}

fn default_program_dir() -> PathBuf {
    PathBuf::from("program")
}

fn default_workdir() -> String {
    "/app".to_string()
}

fn default_python2_image() -> String {
    "python:2.7-slim".to_string()
}

fn default_python3_image() -> String {
    "python:3.10-slim".to_string()
}

fn default_go_image() -> String {
    "debian:bookworm-slim".to_string()
}

fn default_go_binary() -> String {
    "go".to_string()
}

fn default_lint() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}
