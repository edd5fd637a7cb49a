//! # Filter Module
//!
//! Post-processing applied to the magnitude spectrum after every transform.
//! Each filter works in place and keeps its own state between frames; a
//! [`FilterChain`] runs them in the order they were added.
//!
//! The standard chain is gain control, then clipping, then peak hold. Gain
//! control measures its energy before anything is clipped away.

use tracing::trace;

/// A stateful in-place transform of a magnitude buffer.
pub trait Filter {
    /// Applies the filter to `buffer`, which holds exactly the number of
    /// elements the filter was built for.
    fn apply(&mut self, buffer: &mut [f64]);
}

/// Upper mean-square bound; louder frames pull the gain down.
const SAGC_LOUD: f64 = 0.5 * 0.5;
/// Lower mean-square bound; quieter frames push the gain up.
const SAGC_QUIET: f64 = 0.3 * 0.3;
const SAGC_ATTENUATE: f64 = 0.85;
const SAGC_BOOST: f64 = 1.1;

/// Self-adjusting gain control.
///
/// Scales every element by the current gain and measures the mean-square
/// energy of the scaled frame. The gain then moves for the next frame: down by
/// 15% above the band `[0.09, 0.25]`, up by 10% below it. The gain has no floor
/// or ceiling.
#[derive(Debug, Clone)]
pub struct SagcFilter {
    data_size: usize,
    gain: f64,
}

impl SagcFilter {
    pub fn new(data_size: usize) -> Self {
        Self {
            data_size,
            gain: 1.0,
        }
    }

    /// Gain that the next frame will be scaled by.
    pub fn gain(&self) -> f64 {
        self.gain
    }
}

impl Filter for SagcFilter {
    fn apply(&mut self, buffer: &mut [f64]) {
        debug_assert_eq!(buffer.len(), self.data_size);
        let len = self.data_size as f64;
        let mut rms = 0.0;
        for value in buffer.iter_mut() {
            *value *= self.gain;
            rms += *value * *value / len;
        }

        if rms > SAGC_LOUD {
            self.gain *= SAGC_ATTENUATE;
        } else if rms < SAGC_QUIET {
            self.gain *= SAGC_BOOST;
        }
        trace!(rms, gain = self.gain, "sagc");
    }
}

/// Clamps every element to at most 1.0. Negative values pass through.
#[derive(Debug, Clone)]
pub struct ClipFilter {
    data_size: usize,
}

impl ClipFilter {
    pub fn new(data_size: usize) -> Self {
        Self { data_size }
    }
}

impl Filter for ClipFilter {
    fn apply(&mut self, buffer: &mut [f64]) {
        debug_assert_eq!(buffer.len(), self.data_size);
        for value in buffer.iter_mut() {
            *value = value.min(1.0);
        }
    }
}

/// Peak hold with linear fall-off.
///
/// Each bin shows the larger of its (clipped) input and its held peak. After a
/// frame is emitted the held peak drops by `decay`, down to zero. The drop
/// happens once per frame, so the fall speed follows the capture rate.
#[derive(Debug, Clone)]
pub struct PeakFilter {
    peaks: Vec<f64>,
    decay: f64,
}

impl PeakFilter {
    /// `decay` is the amount a held peak falls per frame; see
    /// [`VisualizerConfig::decay_per_cycle`](crate::VisualizerConfig::decay_per_cycle).
    pub fn new(data_size: usize, decay: f64) -> Self {
        Self {
            peaks: vec![0.0; data_size],
            decay,
        }
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }
}

impl Filter for PeakFilter {
    fn apply(&mut self, buffer: &mut [f64]) {
        debug_assert_eq!(buffer.len(), self.peaks.len());
        for (value, peak) in buffer.iter_mut().zip(self.peaks.iter_mut()) {
            *peak = value.min(1.0).max(*peak);
            *value = *peak;
            *peak = if *peak >= self.decay {
                *peak - self.decay
            } else {
                0.0
            };
        }
    }
}

/// An ordered list of filters applied one after another.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter + Send>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The reference chain: gain control, clip, peak hold.
    pub fn standard(data_size: usize, decay: f64) -> Self {
        let mut chain = Self::new();
        chain.push(SagcFilter::new(data_size));
        chain.push(ClipFilter::new(data_size));
        chain.push(PeakFilter::new(data_size, decay));
        chain
    }

    pub fn push(&mut self, filter: impl Filter + Send + 'static) {
        self.filters.push(Box::new(filter));
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn apply(&mut self, buffer: &mut [f64]) {
        for filter in &mut self.filters {
            filter.apply(buffer);
        }
    }
}
