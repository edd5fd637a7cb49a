// visualizer-core/src/lib.rs

//! The core logic for the spectrum visualizer.
//! This crate captures audio, turns each frame into a filtered magnitude
//! spectrum on a dedicated thread, and hands it to a consumer through a
//! locked buffer. It is completely headless and contains no drawing code.

pub mod audio;
pub mod config;
pub mod fft;
pub mod filters;
pub mod pipeline;
pub mod source;
pub mod spectrum;

pub use config::{ConfigError, SourceConfig, VisualizerConfig};
pub use filters::{ClipFilter, Filter, FilterChain, PeakFilter, SagcFilter};
pub use pipeline::{PipelineWorker, StopReason, run_pipeline};
pub use source::{AudioSource, Backend, CaptureBackend, CaptureError, ToneGenerator};
pub use spectrum::{BarAggregator, SpectrumBuffer, SpectrumGuard, calculate_bars};
