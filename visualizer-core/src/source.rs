//! # Audio Source Module
//!
//! An [`AudioSource`] turns whatever a [`CaptureBackend`] delivers into a
//! frame that is ready for the spectral transform: the backend provides
//! normalized mono samples, the source applies the window function and the
//! configured gain.
//!
//! Backends are chosen when the pipeline is built. [`Backend`] covers the ones
//! the configuration can name; tests and embedders may plug in their own
//! [`CaptureBackend`].

use std::f64::consts::PI;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error};

use crate::audio::DeviceCapture;
use crate::config::{SourceConfig, VisualizerConfig};

/// Why a backend could not deliver a frame.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CaptureError {
    /// The backend never opened; no I/O is attempted.
    #[error("audio backend is unavailable")]
    Unavailable,
    #[error("no audio received within {0:?}")]
    Timeout(Duration),
    #[error("audio stream disconnected")]
    Disconnected,
    #[error("audio stream error: {0}")]
    Stream(String),
}

/// Supplies raw audio for an [`AudioSource`].
pub trait CaptureBackend {
    /// Fills `output` with normalized mono samples in `[-1, 1]`, without any
    /// windowing or gain.
    ///
    /// On error the contents of `output` are unspecified.
    fn capture(&mut self, output: &mut [f64]) -> Result<(), CaptureError>;
}

/// Computes the window table applied to every frame:
/// `w[i] = (1 + cos(π·i/N)) / 2`.
pub fn window_table(frame_len: usize) -> Vec<f64> {
    (0..frame_len)
        .map(|i| (1.0 + (i as f64 / frame_len as f64 * PI).cos()) / 2.0)
        .collect()
}

/// Windowing and gain stage in front of a capture backend.
pub struct AudioSource<B> {
    backend: B,
    window: Vec<f64>,
    unwindowed: Vec<f64>,
    gain: f64,
}

impl<B: CaptureBackend> AudioSource<B> {
    pub fn new(backend: B, frame_len: usize) -> Self {
        Self::with_gain(backend, frame_len, 1.0)
    }

    /// Creates a source whose output is scaled by `gain`. With a gain other
    /// than 1 the output is no longer guaranteed to stay within `[-1, 1]`.
    pub fn with_gain(backend: B, frame_len: usize, gain: f64) -> Self {
        Self {
            backend,
            window: window_table(frame_len),
            unwindowed: vec![0.0; frame_len],
            gain,
        }
    }

    pub fn frame_len(&self) -> usize {
        self.window.len()
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    /// Fills `output` with one windowed, gain-scaled frame.
    ///
    /// Returns `false` if the backend failed; the error has been logged and
    /// `output` is left as it was. The pipeline is expected to stop on `false`.
    ///
    /// Only the first `min(output.len(), frame_len)` samples are written.
    pub fn grab_audio(&mut self, output: &mut [f64]) -> bool {
        if let Err(err) = self.backend.capture(&mut self.unwindowed) {
            error!("audio capture failed: {err}");
            return false;
        }

        for ((out, &sample), &coefficient) in
            output.iter_mut().zip(&self.unwindowed).zip(&self.window)
        {
            *out = sample * coefficient * self.gain;
        }
        true
    }
}

/// A synthetic sine source. Never fails.
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    frequency_hz: f64,
    sample_rate: u32,
    phase: f64,
}

impl ToneGenerator {
    pub fn new(frequency_hz: f64, sample_rate: u32) -> Self {
        Self {
            frequency_hz,
            sample_rate: sample_rate.max(1),
            phase: 0.0,
        }
    }

    pub fn frequency_hz(&self) -> f64 {
        self.frequency_hz
    }
}

impl CaptureBackend for ToneGenerator {
    fn capture(&mut self, output: &mut [f64]) -> Result<(), CaptureError> {
        let step = 2.0 * PI * self.frequency_hz / f64::from(self.sample_rate);
        for sample in output.iter_mut() {
            *sample = self.phase.sin();
            self.phase = (self.phase + step) % (2.0 * PI);
        }
        Ok(())
    }
}

/// The backends a configuration can select.
pub enum Backend {
    Device(DeviceCapture),
    Tone(ToneGenerator),
}

impl Backend {
    /// Opens the backend named by the configuration.
    ///
    /// Opening never fails: a device that cannot be opened yields a backend
    /// that reports [`CaptureError::Unavailable`] on every read.
    pub fn open(config: &VisualizerConfig) -> Self {
        match &config.source {
            SourceConfig::Device { name } => Backend::Device(DeviceCapture::open(
                name.as_deref(),
                config.sample_rate,
                config.frame_size,
                config.read_timeout(),
            )),
            SourceConfig::Tone { frequency_hz } => {
                debug!("using synthetic {frequency_hz} Hz tone as audio source");
                Backend::Tone(ToneGenerator::new(*frequency_hz, config.sample_rate))
            }
        }
    }
}

impl CaptureBackend for Backend {
    fn capture(&mut self, output: &mut [f64]) -> Result<(), CaptureError> {
        match self {
            Backend::Device(device) => device.capture(output),
            Backend::Tone(tone) => tone.capture(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Yields one frame of ones, then fails.
    struct OneShot {
        used: bool,
    }

    impl CaptureBackend for OneShot {
        fn capture(&mut self, output: &mut [f64]) -> Result<(), CaptureError> {
            if self.used {
                return Err(CaptureError::Disconnected);
            }
            self.used = true;
            output.fill(1.0);
            Ok(())
        }
    }

    #[test]
    fn window_starts_at_one_and_falls() {
        let window = window_table(314);
        assert_eq!(window.len(), 314);
        assert!((window[0] - 1.0).abs() < 1e-12);
        assert!(window.windows(2).all(|w| w[1] < w[0]));
        assert!(window.iter().all(|&w| w > 0.0 && w <= 1.0));
        assert!((window[157] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn grab_applies_window_then_fails() {
        let mut source = AudioSource::new(OneShot { used: false }, 314);
        let mut data = [0.0; 314];

        assert!(source.grab_audio(&mut data));
        let expected = window_table(314);
        for (got, want) in data.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-12);
        }

        assert!(!source.grab_audio(&mut data));
    }

    #[test]
    fn failed_grab_leaves_output_alone() {
        let mut source = AudioSource::new(OneShot { used: true }, 8);
        let mut data = [0.25; 8];
        assert!(!source.grab_audio(&mut data));
        assert_eq!(data, [0.25; 8]);
    }

    #[test]
    fn gain_scales_past_normalized_range() {
        let mut source = AudioSource::with_gain(OneShot { used: false }, 4, 3.0);
        let mut data = [0.0; 4];
        assert!(source.grab_audio(&mut data));
        assert!((data[0] - 3.0).abs() < 1e-12);
        assert_eq!(source.gain(), 3.0);
    }

    #[test]
    fn short_output_is_not_overrun() {
        let mut source = AudioSource::new(OneShot { used: false }, 16);
        let mut data = [0.0; 4];
        assert!(source.grab_audio(&mut data));
        assert!((data[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn tone_stays_normalized() {
        let mut tone = ToneGenerator::new(1000.0, 44_100);
        let mut data = [0.0; 512];
        tone.capture(&mut data).unwrap();
        assert!(data.iter().all(|s| (-1.0..=1.0).contains(s)));
        assert!(data.iter().any(|s| s.abs() > 0.9));
    }

    #[test]
    fn tone_is_continuous_across_frames() {
        let mut split = ToneGenerator::new(440.0, 8000);
        let mut whole = ToneGenerator::new(440.0, 8000);
        let (mut a, mut b) = ([0.0; 100], [0.0; 100]);
        let mut both = [0.0; 200];
        split.capture(&mut a).unwrap();
        split.capture(&mut b).unwrap();
        whole.capture(&mut both).unwrap();
        for (x, y) in a.iter().chain(b.iter()).zip(both.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn configured_tone_backend_is_selected() {
        let config = VisualizerConfig {
            source: SourceConfig::Tone { frequency_hz: 220.0 },
            ..Default::default()
        };
        match Backend::open(&config) {
            Backend::Tone(tone) => assert_eq!(tone.frequency_hz(), 220.0),
            Backend::Device(_) => panic!("expected tone backend"),
        }
    }
}
