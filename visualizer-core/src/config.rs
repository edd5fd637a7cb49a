//! # Configuration Module
//!
//! Run-time settings for one pipeline run. The configuration is a plain value
//! handed to the pipeline and the bar aggregator when they are constructed;
//! nothing in the core reads global settings.
//!
//! Files are JSON. Every field is optional and falls back to its default, so a
//! file only needs to name what it changes:
//!
//! ```json
//! { "barcount": 96, "source": { "kind": "tone", "frequency_hz": 220.0 } }
//! ```

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fft::spectrum_len;

/// Reasons a configuration is rejected by [`VisualizerConfig::validate`].
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("frame size must be an even number of at least 2 samples, got {0}")]
    FrameSize(usize),
    #[error("bar count must be between 1 and the spectrum length {spectrum_len}, got {barcount}")]
    BarCount { barcount: usize, spectrum_len: usize },
    #[error("gravity must be a finite, non-negative number, got {0}")]
    Gravity(f64),
    #[error("gain must be finite, got {0}")]
    Gain(f64),
    #[error("refresh rate must be greater than zero")]
    RefreshRate,
    #[error("sample rate must be greater than zero")]
    SampleRate,
}

/// Where the pipeline pulls its audio from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// An input device through the system audio host. `None` picks the default device.
    Device {
        #[serde(default)]
        name: Option<String>,
    },
    /// A synthetic sine tone.
    Tone { frequency_hz: f64 },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Device { name: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerConfig {
    /// Samples per capture frame (`N`). The spectrum has `N / 2 + 1` bins.
    pub frame_size: usize,

    /// Number of display bars the spectrum is reduced to.
    ///
    /// Best results come from a bar count that divides the spectrum length
    /// evenly; leftover bins are not shown.
    pub barcount: usize,

    /// Speed of the peak fall-off. The held peak drops by `gravity / 1000`
    /// once per capture cycle.
    pub gravity: f64,

    /// Gain applied to the windowed samples before the transform.
    pub gain: f64,

    /// How often the consumer samples the spectrum, in Hz.
    pub refresh_hz: u32,

    /// Preferred capture sample rate in Hz.
    pub sample_rate: u32,

    /// How long a single read may wait for audio before it is treated as failed.
    pub read_timeout_ms: u64,

    pub source: SourceConfig,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            frame_size: 4096,
            barcount: 160,
            gravity: 100.0 / 6.0,
            gain: 1.0,
            refresh_hz: 60,
            sample_rate: 44_100,
            read_timeout_ms: 1000,
            source: SourceConfig::default(),
        }
    }
}

impl VisualizerConfig {
    /// Loads a configuration from a JSON file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)
            .with_context(|| format!("failed to open config file {}", path.display()))?;
        let mut data = String::new();
        file.read_to_string(&mut data)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: VisualizerConfig = serde_json::from_str(&data)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_size < 2 || self.frame_size % 2 != 0 {
            return Err(ConfigError::FrameSize(self.frame_size));
        }
        let spectrum_len = self.spectrum_len();
        if self.barcount == 0 || self.barcount > spectrum_len {
            return Err(ConfigError::BarCount {
                barcount: self.barcount,
                spectrum_len,
            });
        }
        if !self.gravity.is_finite() || self.gravity < 0.0 {
            return Err(ConfigError::Gravity(self.gravity));
        }
        if !self.gain.is_finite() {
            return Err(ConfigError::Gain(self.gain));
        }
        if self.refresh_hz == 0 {
            return Err(ConfigError::RefreshRate);
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::SampleRate);
        }
        Ok(())
    }

    /// Length of the magnitude spectrum (`frame_size / 2 + 1`).
    pub fn spectrum_len(&self) -> usize {
        spectrum_len(self.frame_size)
    }

    /// Amount the held peak falls per capture cycle.
    pub fn decay_per_cycle(&self) -> f64 {
        self.gravity / 1000.0
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.refresh_hz.max(1)))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}
