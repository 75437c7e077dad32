// Configuration for the timing engine

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sink::QualityProfile;

/// Error type for configuration loading and validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("'{field}' must not be negative")]
    NegativeDuration { field: &'static str },

    #[error("'{field}' range is inverted (min > max)")]
    InvertedRange { field: &'static str },

    #[error("'{field}' is not a finite number")]
    NotFinite { field: &'static str },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Inclusive range a randomized phase wait is drawn from, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JitterRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl JitterRange {
    pub fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if !self.min_secs.is_finite() || !self.max_secs.is_finite() {
            return Err(ConfigError::NotFinite { field });
        }
        if self.min_secs < 0.0 || self.max_secs < 0.0 {
            return Err(ConfigError::NegativeDuration { field });
        }
        if self.min_secs > self.max_secs {
            return Err(ConfigError::InvertedRange { field });
        }
        Ok(())
    }
}

/// Immutable per-session sequence configuration.
///
/// The two middle phases are deliberately randomized: a fixed delay would
/// let participants anticipate the beep, so each session draws fresh waits
/// from the configured ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Fixed duration of the "go to the start" phase, in seconds.
    #[serde(default = "default_go_to_start")]
    pub go_to_start_secs: f64,

    /// Random wait range for the "in position" phase.
    #[serde(default = "default_jitter_range")]
    pub in_position: JitterRange,

    /// Random wait range for the "set" phase.
    #[serde(default = "default_jitter_range")]
    pub set: JitterRange,

    /// Whether audio cues play during the sequence.
    #[serde(default = "default_true")]
    pub audio_enabled: bool,
}

impl SequenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.go_to_start_secs.is_finite() {
            return Err(ConfigError::NotFinite {
                field: "go_to_start_secs",
            });
        }
        if self.go_to_start_secs < 0.0 {
            return Err(ConfigError::NegativeDuration {
                field: "go_to_start_secs",
            });
        }
        self.in_position.validate("in_position")?;
        self.set.validate("set")?;
        Ok(())
    }

    pub fn go_to_start(&self) -> Duration {
        Duration::from_secs_f64(self.go_to_start_secs)
    }
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            go_to_start_secs: default_go_to_start(),
            in_position: default_jitter_range(),
            set: default_jitter_range(),
            audio_enabled: true,
        }
    }
}

/// Engine-level configuration, persisted as TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where session folders and the index live.
    pub storage_path: PathBuf,

    /// Real-time calibration window in seconds.
    #[serde(default = "default_calibration_window")]
    pub calibration_window_secs: f64,

    /// Ceiling on sink preparation, in seconds, before the attempt fails.
    #[serde(default = "default_prepare_timeout")]
    pub prepare_timeout_secs: f64,

    /// Output quality handed to the sink at prepare time.
    #[serde(default)]
    pub quality: QualityProfile,

    /// Default sequence timings (a caller may still pass its own per
    /// session).
    #[serde(default)]
    pub sequence: SequenceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            calibration_window_secs: default_calibration_window(),
            prepare_timeout_secs: default_prepare_timeout(),
            quality: QualityProfile::default(),
            sequence: SequenceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load config from disk or return defaults.
    pub fn load_or_default() -> Self {
        let path = config_path();
        if path.exists() {
            match Self::load_from(&path) {
                Ok(config) => return config,
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", path.display(), e);
                }
            }
        }
        Self::default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.sequence.validate()?;
        Ok(config)
    }

    /// Save config to its default location.
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn calibration_window(&self) -> Duration {
        Duration::from_secs_f64(self.calibration_window_secs.max(0.0))
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.prepare_timeout_secs.max(0.0))
    }
}

/// Default storage path for session folders
fn default_storage_path() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("StartGate")
}

/// Config file path
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("startgate")
        .join("config.toml")
}

fn default_go_to_start() -> f64 {
    5.0
}

fn default_jitter_range() -> JitterRange {
    JitterRange::new(1.0, 3.0)
}

fn default_calibration_window() -> f64 {
    2.0
}

fn default_prepare_timeout() -> f64 {
    crate::sequence::PREPARE_TIMEOUT.as_secs_f64()
}

fn default_true() -> bool {
    true
}
