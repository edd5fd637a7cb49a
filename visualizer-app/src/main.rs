//! # Visualizer - headless spectrum consumer
//!
//! Owns the shared spectrum buffer, runs the audio pipeline on its own thread
//! and samples the display bars at the configured refresh rate, the way a
//! renderer would. Instead of drawing, it logs a short summary of the bars.
//!
//! ## Architecture
//! - **Main Thread**: ticks at `refresh_hz`, reduces the spectrum to bars
//! - **Audio Thread**: capture, transform and filtering (see `visualizer-core`)
//! - **Shutdown**: shared stop flag; the audio thread is joined before exit

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use clap::{Parser, ValueEnum};
use crossbeam_channel::{after, never, select, tick};
use tracing::{Level, debug, error, info};
use visualizer_core::{
    AudioSource, Backend, BarAggregator, PipelineWorker, SourceConfig, SpectrumBuffer, StopReason,
    VisualizerConfig,
};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "visualizer")]
#[command(about = "Real-time audio spectrum analyzer", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Audio source, overriding the configuration file
    #[arg(long, value_enum)]
    source: Option<SourceArg>,

    /// Input device name (device source only)
    #[arg(long, value_name = "NAME")]
    device: Option<String>,

    /// Frequency of the synthetic tone (tone source only)
    #[arg(long, value_name = "HZ", default_value_t = 440.0)]
    tone_hz: f64,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECONDS")]
    duration: Option<f64>,

    /// Seconds between bar summaries
    #[arg(long, value_name = "SECONDS", default_value_t = 1.0)]
    report_every: f64,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum SourceArg {
    Device,
    Tone,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose, args.json_logs);

    match run(&args) {
        Ok(StopReason::Requested) => ExitCode::SUCCESS,
        Ok(reason) => {
            error!("visualizer stopped: {reason:?}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbosity: u8, json: bool) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Loads the configuration file (if any) and applies command line overrides.
fn build_config(args: &Args) -> Result<VisualizerConfig> {
    let mut config = match &args.config {
        Some(path) => VisualizerConfig::load(path)?,
        None => VisualizerConfig::default(),
    };

    match args.source {
        Some(SourceArg::Tone) => {
            config.source = SourceConfig::Tone {
                frequency_hz: args.tone_hz,
            }
        }
        Some(SourceArg::Device) => {
            config.source = SourceConfig::Device {
                name: args.device.clone(),
            }
        }
        None => {
            if let (Some(device), SourceConfig::Device { name }) =
                (&args.device, &mut config.source)
            {
                *name = Some(device.clone());
            }
        }
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn seconds(value: f64, what: &str) -> Result<Duration> {
    ensure!(
        value.is_finite() && value > 0.0,
        "{what} must be a positive number of seconds, got {value}"
    );
    Ok(Duration::from_secs_f64(value))
}

fn run(args: &Args) -> Result<StopReason> {
    let config = build_config(args)?;
    let run_for = args.duration.map(|d| seconds(d, "duration")).transpose()?;
    let report_every = seconds(args.report_every, "report interval")?;

    debug!("configuration: {config:?}");

    let buffer = Arc::new(SpectrumBuffer::new(config.spectrum_len()));
    let stop = Arc::new(AtomicBool::new(false));
    let worker = PipelineWorker::spawn(&config, Arc::clone(&buffer), stop, |config| {
        AudioSource::with_gain(Backend::open(config), config.frame_size, config.gain)
    })
    .context("failed to start the audio thread")?;

    let mut aggregator = BarAggregator::new(config.barcount);
    let ticker = tick(config.refresh_interval());
    let reporter = tick(report_every);
    let deadline = run_for.map(after).unwrap_or_else(never);

    info!("sampling {} bars at {} Hz", config.barcount, config.refresh_hz);

    let mut frames: u64 = 0;
    while worker.is_running() {
        select! {
            recv(ticker) -> _ => {
                aggregator.sample(&buffer);
                frames += 1;
            }
            recv(reporter) -> _ => {
                let summary = BarSummary::from_bars(aggregator.bars());
                info!(
                    frames,
                    loudest_bar = summary.loudest,
                    peak = format_args!("{:.3}", summary.peak),
                    mean = format_args!("{:.3}", summary.mean),
                    "spectrum"
                );
            }
            recv(deadline) -> _ => {
                info!("run time elapsed, stopping");
                break;
            }
        }
    }

    let reason = worker.join();
    info!("audio thread joined after {frames} frames");
    Ok(reason)
}

/// What the log shows of one set of bars.
#[derive(Debug, Clone, PartialEq)]
struct BarSummary {
    loudest: usize,
    peak: f64,
    mean: f64,
}

impl BarSummary {
    fn from_bars(bars: &[f64]) -> Self {
        let (loudest, peak) = bars
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap_or((0, 0.0));
        let mean = if bars.is_empty() {
            0.0
        } else {
            bars.iter().sum::<f64>() / bars.len() as f64
        };
        Self {
            loudest,
            peak,
            mean,
        }
    }
}
