//! Host configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via STATECH_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use statech_persist::SnapshotPolicy;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, String),
}

/// Host configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Snapshot persistence configuration.
    pub snapshot: SnapshotSection,
    /// Interpreter configuration.
    pub interp: InterpSection,
}

impl HostConfig {
    /// Loads configuration from file, then applies environment
    /// variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("STATECH_CONFIG") {
            config = Self::from_file(&path)?;
        }
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: HostConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.snapshot.apply_env_overrides();
        self.interp.apply_env_overrides();
    }
}

/// Snapshot persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    /// When records are captured.
    pub policy: SnapshotPolicy,
    /// Directory for the snapshot store. Required unless the policy
    /// is off.
    pub dir: Option<PathBuf>,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            policy: SnapshotPolicy::Off,
            dir: None,
        }
    }
}

impl SnapshotSection {
    fn apply_env_overrides(&mut self) {
        if let Ok(policy) = std::env::var("STATECH_SNAPSHOT_POLICY") {
            match policy.as_str() {
                "off" => self.policy = SnapshotPolicy::Off,
                "per-macrostep" => self.policy = SnapshotPolicy::PerMacrostep,
                "per-microstep" => self.policy = SnapshotPolicy::PerMicrostep,
                _ => {}
            }
        }
        if let Ok(dir) = std::env::var("STATECH_SNAPSHOT_DIR") {
            self.dir = Some(PathBuf::from(dir));
        }
    }
}

/// Interpreter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpSection {
    /// Eventless-transition iterations allowed per macrostep.
    pub max_iterations: u32,
}

impl Default for InterpSection {
    fn default() -> Self {
        Self {
            max_iterations: 1024,
        }
    }
}

impl InterpSection {
    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("STATECH_MAX_ITERATIONS") {
            if let Ok(n) = max.parse() {
                self.max_iterations = n;
            }
        }
    }
}
