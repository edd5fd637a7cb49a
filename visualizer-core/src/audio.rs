//! # Audio Capture Module
//!
//! Captures audio from an input device using CPAL (Cross-Platform Audio Library)
//! and serves it to the pipeline one frame at a time.
//!
//! CPAL delivers samples on its own callback thread. The callback mixes every
//! interleaved frame down to one normalized mono sample and forwards the chunk
//! over a bounded channel; [`DeviceCapture::capture`] blocks on that channel
//! until a full frame is available.
//!
//! ## Features
//! - Default or named input device
//! - I16, U16 and F32 sample formats, any channel count
//! - Sample rate closest to the configured target
//! - A device that cannot be opened degrades to a permanently failing source

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SupportedStreamConfigRange};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use tracing::{debug, error, info, warn};

use crate::source::{CaptureBackend, CaptureError};

/// Chunks the callback may queue before new audio is dropped.
const CHANNEL_CAPACITY: usize = 64;

/// Averages each interleaved frame of `data` into one mono sample, converting
/// with `convert` and clamping the result into `[-1, 1]`.
///
/// A trailing partial frame is averaged over the channels it has.
pub fn append_downmixed<T, F>(out: &mut Vec<f64>, data: &[T], channels: usize, mut convert: F)
where
    T: Copy,
    F: FnMut(T) -> f64,
{
    let channels = channels.max(1);
    for frame in data.chunks(channels) {
        let sum: f64 = frame.iter().copied().map(&mut convert).sum();
        out.push((sum / frame.len() as f64).clamp(-1.0, 1.0));
    }
}

/// Signed 16-bit sample scaled by the format's full-scale magnitude.
pub fn normalize_i16(sample: i16) -> f64 {
    f64::from(sample) / f64::from(i16::MAX)
}

/// Unsigned 16-bit sample re-centred on zero, then scaled like [`normalize_i16`].
pub fn normalize_u16(sample: u16) -> f64 {
    (f64::from(sample) - 32_768.0) / f64::from(i16::MAX)
}

pub fn normalize_f32(sample: f32) -> f64 {
    f64::from(sample)
}

struct Feed {
    samples: Receiver<Vec<f64>>,
    errors: Receiver<String>,
}

/// Capture backend reading from a system input device.
pub struct DeviceCapture {
    stream: Option<cpal::Stream>,
    feed: Option<Feed>,
    pending: Vec<f64>,
    read_timeout: Duration,
    dropped: Arc<AtomicUsize>,
    reported_drops: usize,
}

impl DeviceCapture {
    /// Opens an input stream on `device_name` (or the default input device).
    ///
    /// Never fails: if the device cannot be opened the error is logged and the
    /// returned capture reports [`CaptureError::Unavailable`] on every read
    /// without touching the audio host again.
    pub fn open(
        device_name: Option<&str>,
        sample_rate: u32,
        frame_len: usize,
        read_timeout: Duration,
    ) -> Self {
        match Self::try_open(device_name, sample_rate, frame_len, read_timeout) {
            Ok(capture) => capture,
            Err(err) => {
                error!("audio connection error: {err:#}");
                Self::unavailable(read_timeout)
            }
        }
    }

    /// A capture that was never connected.
    pub fn unavailable(read_timeout: Duration) -> Self {
        Self {
            stream: None,
            feed: None,
            pending: Vec::new(),
            read_timeout,
            dropped: Arc::new(AtomicUsize::new(0)),
            reported_drops: 0,
        }
    }

    pub fn is_available(&self) -> bool {
        self.feed.is_some()
    }

    /// Number of callback chunks discarded because the pipeline fell behind.
    pub fn dropped_chunks(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    fn try_open(
        device_name: Option<&str>,
        sample_rate: u32,
        frame_len: usize,
        read_timeout: Duration,
    ) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => {
                let mut devices = host
                    .input_devices()
                    .context("no input devices available")?;
                devices
                    .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                    .ok_or_else(|| anyhow!("input device '{name}' not found"))?
            }
            None => host
                .default_input_device()
                .context("no default input device available")?,
        };

        info!(
            "using audio input device: {}",
            device.name().unwrap_or_else(|_| "unknown".to_string())
        );

        let configs = device.supported_input_configs()?.collect::<Vec<_>>();
        let supported = find_supported_config(configs, sample_rate)
            .ok_or_else(|| anyhow!("no supported I16, U16 or F32 input format found"))?;

        let rate = sample_rate.clamp(
            supported.min_sample_rate().0,
            supported.max_sample_rate().0,
        );
        let format = supported.sample_format();
        let config = supported.with_sample_rate(cpal::SampleRate(rate)).config();
        let channels = usize::from(config.channels.max(1));

        info!("capture format: {format:?}, {rate} Hz, {channels} channel(s)");

        let (sample_tx, sample_rx) = crossbeam_channel::bounded(CHANNEL_CAPACITY);
        let (error_tx, error_rx) = crossbeam_channel::bounded(1);
        let dropped = Arc::new(AtomicUsize::new(0));
        let link = CallbackLink {
            samples: sample_tx,
            errors: error_tx,
            dropped: dropped.clone(),
            channels,
        };

        let stream = match format {
            SampleFormat::I16 => build_stream(&device, &config, link, normalize_i16)?,
            SampleFormat::U16 => build_stream(&device, &config, link, normalize_u16)?,
            SampleFormat::F32 => build_stream(&device, &config, link, normalize_f32)?,
            other => return Err(anyhow!("unsupported sample format: {other:?}")),
        };
        stream.play().context("failed to start audio stream")?;

        Ok(Self {
            stream: Some(stream),
            feed: Some(Feed {
                samples: sample_rx,
                errors: error_rx,
            }),
            pending: Vec::with_capacity(frame_len * 2),
            read_timeout,
            dropped,
            reported_drops: 0,
        })
    }

    #[cfg(test)]
    fn from_channels(
        samples: Receiver<Vec<f64>>,
        errors: Receiver<String>,
        read_timeout: Duration,
    ) -> Self {
        let mut capture = Self::unavailable(read_timeout);
        capture.feed = Some(Feed { samples, errors });
        capture
    }
}

impl CaptureBackend for DeviceCapture {
    fn capture(&mut self, output: &mut [f64]) -> Result<(), CaptureError> {
        let Some(feed) = self.feed.as_ref() else {
            return Err(CaptureError::Unavailable);
        };

        match feed.errors.try_recv() {
            Ok(message) => return Err(CaptureError::Stream(message)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }

        while self.pending.len() < output.len() {
            match feed.samples.recv_timeout(self.read_timeout) {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(CaptureError::Timeout(self.read_timeout));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(CaptureError::Disconnected),
            }
        }

        let frame_len = output.len();
        output.copy_from_slice(&self.pending[..frame_len]);
        self.pending.drain(..frame_len);

        let dropped = self.dropped_chunks();
        if dropped > self.reported_drops {
            debug!(
                "audio callback dropped {} chunk(s) while the pipeline was busy",
                dropped - self.reported_drops
            );
            self.reported_drops = dropped;
        }
        Ok(())
    }
}

impl Drop for DeviceCapture {
    fn drop(&mut self) {
        let dropped = self.dropped_chunks();
        if dropped > 0 {
            warn!(dropped, "audio chunks were dropped while the pipeline fell behind");
        }
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("error pausing audio stream: {e}");
            }
        }
    }
}

/// Everything the CPAL callbacks need to hand audio to the pipeline.
struct CallbackLink {
    samples: Sender<Vec<f64>>,
    errors: Sender<String>,
    dropped: Arc<AtomicUsize>,
    channels: usize,
}

fn build_stream<T, F>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    link: CallbackLink,
    convert: F,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + 'static,
    F: Fn(T) -> f64 + Send + 'static,
{
    let CallbackLink {
        samples,
        errors,
        dropped,
        channels,
    } = link;

    let err_fn = move |err: cpal::StreamError| {
        error!("an error occurred on the audio stream: {err}");
        let _ = errors.try_send(err.to_string());
    };

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mut chunk = Vec::with_capacity(data.len() / channels + 1);
            append_downmixed(&mut chunk, data, channels, &convert);
            match samples.try_send(chunk) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Finds the supported input configuration closest to the target sample rate.
///
/// Only formats the downmixer can convert (I16, U16, F32) are considered; any
/// channel count is accepted since every frame is mixed down to mono.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| {
            matches!(
                c.sample_format(),
                SampleFormat::I16 | SampleFormat::U16 | SampleFormat::F32
            )
        })
        .min_by_key(|c| {
            let (min, max) = (c.min_sample_rate().0, c.max_sample_rate().0);
            if (min..=max).contains(&target_rate) {
                0
            } else {
                min.abs_diff(target_rate).min(max.abs_diff(target_rate))
            }
        })
}
