//! # Spectral Transform Module
//!
//! Forward FFT of a real capture frame into its magnitude spectrum.
//!
//! Planning an FFT is expensive compared to running one, so a
//! [`SpectralTransform`] plans once for its frame length and reuses the plan
//! and all of its working buffers for every frame of a pipeline run.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// Number of bins in the spectrum of a real frame of `frame_len` samples.
pub fn spectrum_len(frame_len: usize) -> usize {
    frame_len / 2 + 1
}

/// A forward real-to-complex transform of fixed length.
pub struct SpectralTransform {
    fft: Arc<dyn Fft<f64>>,
    buffer: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl SpectralTransform {
    /// Plans a forward FFT for frames of `frame_len` samples.
    pub fn new(frame_len: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(frame_len);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        Self {
            fft,
            buffer: vec![Complex::new(0.0, 0.0); frame_len],
            scratch,
        }
    }

    pub fn frame_len(&self) -> usize {
        self.buffer.len()
    }

    /// Transforms one frame and returns the non-redundant half of the spectrum
    /// (`frame_len / 2 + 1` bins).
    ///
    /// # Panics
    /// * If `samples.len()` differs from the planned frame length
    pub fn process(&mut self, samples: &[f64]) -> &[Complex<f64>] {
        assert_eq!(
            samples.len(),
            self.buffer.len(),
            "input frame size must match the planned transform length"
        );

        for (slot, &sample) in self.buffer.iter_mut().zip(samples) {
            *slot = Complex::new(sample, 0.0);
        }
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        &self.buffer[..spectrum_len(self.buffer.len())]
    }
}

/// Writes the magnitude (`hypot(re, im)`) of each bin into `out`.
///
/// Only `min(bins.len(), out.len())` elements are written.
pub fn write_magnitudes(bins: &[Complex<f64>], out: &mut [f64]) {
    for (magnitude, bin) in out.iter_mut().zip(bins) {
        *magnitude = bin.re.hypot(bin.im);
    }
}
