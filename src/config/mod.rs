//! Sender configuration

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::mirroring::offer::{Features, HardwareProfiles};
use crate::mirroring::settings::{MirrorSettings, DEFAULT_MAX_RESOLUTION};
use crate::mirroring::stream::Resolution;
use crate::mirroring::{session, SessionOptions};

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub video: VideoConfig,
    pub features: FeatureConfig,
    pub hardware: HardwareConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Largest capture size offered to receivers.
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            max_width: DEFAULT_MAX_RESOLUTION.width,
            max_height: DEFAULT_MAX_RESOLUTION.height,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub av1: bool,
    pub vp9: bool,
    pub force_remoting_query: bool,
}

/// Hardware encoders available on this machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub vp8: bool,
    pub h264: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub offer_answer_secs: u64,
    pub capabilities_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            offer_answer_secs: session::OFFER_ANSWER_TIMEOUT.as_secs(),
            capabilities_secs: session::CAPABILITIES_TIMEOUT.as_secs(),
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "cast-mirror", "cast-mirror")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk. A missing file gives the defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<PathBuf> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        fs::write(&path, self.to_toml()?).context("Failed to write config file")?;
        Ok(path)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn mirror_settings(&self) -> MirrorSettings {
        MirrorSettings::new(Resolution::new(self.video.max_width, self.video.max_height))
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            hardware: HardwareProfiles {
                vp8: self.hardware.vp8,
                h264: self.hardware.h264,
            },
            features: Features {
                av1: self.features.av1,
                vp9: self.features.vp9,
                force_remoting_query: self.features.force_remoting_query,
            },
            offer_answer_timeout: Duration::from_secs(self.timeouts.offer_answer_secs),
            capabilities_timeout: Duration::from_secs(self.timeouts.capabilities_secs),
            ..SessionOptions::default()
        }
    }
}
