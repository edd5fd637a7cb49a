//! # Pipeline Module
//!
//! The audio thread: capture a frame, transform it, write the magnitudes into
//! the shared [`SpectrumBuffer`] and run the filter chain over them, until
//! told to stop or until capture fails.
//!
//! ## Threading
//! - **Pipeline thread**: owns the audio source, the transform plan and the
//!   filter chain for the whole run
//! - **Consumer**: reads the buffer through its lock at its own pace
//! - **Stop flag**: a one-way `false -> true` flag; either side may set it
//!
//! The buffer lock is held only while magnitudes are written and filtered,
//! never across capture or the transform.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::config::VisualizerConfig;
use crate::fft::{self, SpectralTransform};
use crate::filters::FilterChain;
use crate::source::{AudioSource, CaptureBackend};
use crate::spectrum::SpectrumBuffer;

/// Why a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The stop flag was set by someone else.
    Requested,
    /// The audio source reported a failure.
    CaptureFailed,
    /// The pipeline thread panicked.
    Panicked,
}

/// Runs capture, transform and filtering until the stop flag is set or
/// capture fails.
///
/// On capture failure the stop flag is set so other observers see the run
/// has ended. The transform must be planned for the source's frame length,
/// and the buffer must hold `frame_len / 2 + 1` elements.
pub fn run_pipeline<B: CaptureBackend>(
    stop: &AtomicBool,
    buffer: &SpectrumBuffer,
    source: &mut AudioSource<B>,
    transform: &mut SpectralTransform,
    filters: &mut FilterChain,
) -> StopReason {
    debug_assert_eq!(source.frame_len(), transform.frame_len());
    debug_assert_eq!(buffer.data_size(), fft::spectrum_len(transform.frame_len()));

    let mut frame = vec![0.0; transform.frame_len()];

    loop {
        if stop.load(Ordering::Relaxed) {
            return StopReason::Requested;
        }

        if !source.grab_audio(&mut frame) {
            stop.store(true, Ordering::Relaxed);
            return StopReason::CaptureFailed;
        }

        let bins = transform.process(&frame);
        {
            let mut data = buffer.acquire();
            fft::write_magnitudes(bins, &mut data);
            filters.apply(&mut data);
        }
    }
}

/// Sets the stop flag when the pipeline thread exits, unwinding included.
struct StopOnExit(Arc<AtomicBool>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Handle to a pipeline running on its own thread.
///
/// Dropping the worker stops the pipeline and waits for the thread, so the
/// buffer is never released under a running producer.
#[derive(Debug)]
pub struct PipelineWorker {
    stop: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<StopReason>>,
}

impl PipelineWorker {
    /// Starts the audio thread.
    ///
    /// `make_source` runs on the new thread, so backends that must stay on
    /// the thread that created them (such as device streams) work. The
    /// transform and the standard filter chain are also built there, once.
    pub fn spawn<B, F>(
        config: &VisualizerConfig,
        buffer: Arc<SpectrumBuffer>,
        stop: Arc<AtomicBool>,
        make_source: F,
    ) -> io::Result<Self>
    where
        B: CaptureBackend,
        F: FnOnce(&VisualizerConfig) -> AudioSource<B> + Send + 'static,
    {
        let config = config.clone();
        let thread_stop = Arc::clone(&stop);
        let thread_handle = thread::Builder::new()
            .name("audio-pipeline".to_string())
            .spawn(move || {
                let _stopped = StopOnExit(Arc::clone(&thread_stop));
                info!(
                    frame_size = config.frame_size,
                    bins = buffer.data_size(),
                    "starting audio pipeline"
                );
                let mut source = make_source(&config);
                let mut transform = SpectralTransform::new(config.frame_size);
                let mut filters =
                    FilterChain::standard(buffer.data_size(), config.decay_per_cycle());

                let reason = run_pipeline(
                    &thread_stop,
                    &buffer,
                    &mut source,
                    &mut transform,
                    &mut filters,
                );
                match reason {
                    StopReason::CaptureFailed => error!("audio pipeline stopped: capture failed"),
                    _ => info!("audio pipeline stopped: {reason:?}"),
                }
                reason
            })?;

        Ok(Self {
            stop,
            thread_handle: Some(thread_handle),
        })
    }

    /// Asks the pipeline to stop after its current cycle.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// `false` once a stop was requested or the pipeline stopped on its own.
    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
    }

    /// Requests a stop and waits for the thread to finish.
    pub fn join(mut self) -> StopReason {
        self.shutdown()
    }

    fn shutdown(&mut self) -> StopReason {
        self.stop();
        match self.thread_handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                warn!("audio pipeline thread panicked");
                StopReason::Panicked
            }),
            None => StopReason::Requested,
        }
    }
}

impl Drop for PipelineWorker {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::source::CaptureError;

    /// Delivers a fixed number of constant frames, then fails.
    struct Frames {
        remaining: usize,
        level: f64,
    }

    impl CaptureBackend for Frames {
        fn capture(&mut self, output: &mut [f64]) -> Result<(), CaptureError> {
            if self.remaining == 0 {
                return Err(CaptureError::Disconnected);
            }
            self.remaining -= 1;
            output.fill(self.level);
            Ok(())
        }
    }

    #[test]
    fn preset_stop_flag_exits_before_capture() {
        let stop = AtomicBool::new(true);
        let buffer = SpectrumBuffer::new(9);
        let mut source = AudioSource::new(Frames { remaining: 5, level: 1.0 }, 16);
        let mut transform = SpectralTransform::new(16);
        let mut filters = FilterChain::new();

        let reason = run_pipeline(&stop, &buffer, &mut source, &mut transform, &mut filters);
        assert_eq!(reason, StopReason::Requested);
        assert!(buffer.acquire().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn capture_failure_sets_stop_flag() {
        let stop = AtomicBool::new(false);
        let buffer = SpectrumBuffer::new(9);
        let mut source = AudioSource::new(Frames { remaining: 3, level: 0.5 }, 16);
        let mut transform = SpectralTransform::new(16);
        let mut filters = FilterChain::standard(9, 1.0 / 60.0);

        let reason = run_pipeline(&stop, &buffer, &mut source, &mut transform, &mut filters);
        assert_eq!(reason, StopReason::CaptureFailed);
        assert!(stop.load(Ordering::Relaxed));

        let data = buffer.acquire();
        assert!(data[0] > 0.0);
        assert!(data.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn magnitudes_are_written_unfiltered_with_empty_chain() {
        let stop = AtomicBool::new(false);
        let buffer = SpectrumBuffer::new(5);
        let mut source = AudioSource::new(Frames { remaining: 1, level: 1.0 }, 8);
        let mut transform = SpectralTransform::new(8);
        let mut filters = FilterChain::new();

        run_pipeline(&stop, &buffer, &mut source, &mut transform, &mut filters);

        let window_sum: f64 = crate::source::window_table(8).iter().sum();
        assert!((buffer.acquire()[0] - window_sum).abs() < 1e-9);
    }

    #[test]
    fn worker_stops_on_request() {
        let config = VisualizerConfig {
            frame_size: 64,
            barcount: 8,
            ..Default::default()
        };
        let buffer = Arc::new(SpectrumBuffer::new(config.spectrum_len()));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = PipelineWorker::spawn(&config, Arc::clone(&buffer), stop, |config| {
            AudioSource::new(Frames { remaining: usize::MAX, level: 0.1 }, config.frame_size)
        })
        .unwrap();

        assert!(worker.is_running());
        assert_eq!(worker.join(), StopReason::Requested);
    }

    #[test]
    fn worker_reports_capture_failure() {
        let config = VisualizerConfig {
            frame_size: 64,
            barcount: 8,
            ..Default::default()
        };
        let buffer = Arc::new(SpectrumBuffer::new(config.spectrum_len()));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = PipelineWorker::spawn(&config, buffer, Arc::clone(&stop), |config| {
            AudioSource::new(Frames { remaining: 2, level: 0.1 }, config.frame_size)
        })
        .unwrap();

        while !stop.load(Ordering::Relaxed) {
            thread::yield_now();
        }
        assert!(!worker.is_running());
        assert_eq!(worker.join(), StopReason::CaptureFailed);
    }

    #[test]
    fn panicking_source_clears_run_flag() {
        let config = VisualizerConfig {
            frame_size: 64,
            barcount: 8,
            ..Default::default()
        };
        let buffer = Arc::new(SpectrumBuffer::new(config.spectrum_len()));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = PipelineWorker::spawn(
            &config,
            buffer,
            Arc::clone(&stop),
            |_: &VisualizerConfig| -> AudioSource<Frames> { panic!("no audio host") },
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while worker.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!worker.is_running());
        assert!(stop.load(Ordering::Relaxed));
        assert_eq!(worker.join(), StopReason::Panicked);
    }
}
