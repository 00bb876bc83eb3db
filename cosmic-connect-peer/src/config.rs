//! Peer connection configuration
//!
//! Timeouts and storage location for the connection core, loaded from TOML.

use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Peer connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Seconds before an unanswered pairing request fails
    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout_secs: u64,

    /// Seconds a blocking send waits for payload confirmation
    #[serde(default = "default_payload_confirmation_timeout")]
    pub payload_confirmation_timeout_secs: u64,

    /// Location of the per-device settings file
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,
}

fn default_pairing_timeout() -> u64 {
    10
}

fn default_payload_confirmation_timeout() -> u64 {
    10
}

fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("cosmic-connect")
        .join("peers.json")
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            pairing_timeout_secs: default_pairing_timeout(),
            payload_confirmation_timeout_secs: default_payload_confirmation_timeout(),
            settings_path: default_settings_path(),
        }
    }
}

impl PeerConfig {
    /// Load configuration from `path`, falling back to defaults if it does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration to `path` as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::Configuration(format!("Failed to serialize: {}", e)))?;
        fs::write(path, contents)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.pairing_timeout_secs == 0 {
            return Err(ProtocolError::Configuration(
                "pairing_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.payload_confirmation_timeout_secs == 0 {
            return Err(ProtocolError::Configuration(
                "payload_confirmation_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Pairing timeout as a duration
    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_timeout_secs)
    }

    /// Payload confirmation timeout as a duration
    pub fn payload_confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.payload_confirmation_timeout_secs)
    }
}
