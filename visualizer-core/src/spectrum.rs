//! # Spectrum Buffer Module
//!
//! The hand-off point between the pipeline thread and whoever draws the
//! spectrum. The pipeline writes a whole frame of magnitudes under the lock;
//! readers take the same lock to copy or reduce it, so a reader never sees a
//! half-written frame.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Fixed-size magnitude buffer shared between one writer and any readers.
///
/// The contents are only reachable through [`SpectrumBuffer::acquire`].
pub struct SpectrumBuffer {
    data_size: usize,
    data: Mutex<Box<[f64]>>,
}

impl SpectrumBuffer {
    /// Creates a zero-filled buffer of `size` elements.
    pub fn new(size: usize) -> Self {
        Self {
            data_size: size,
            data: Mutex::new(vec![0.0; size].into_boxed_slice()),
        }
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Locks the buffer. The lock is released when the guard is dropped.
    ///
    /// A lock poisoned by a panicking holder is recovered: the elements are
    /// plain numbers and every writer fills the whole buffer.
    pub fn acquire(&self) -> SpectrumGuard<'_> {
        let guard = match self.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("spectrum buffer lock poisoned; recovering");
                poisoned.into_inner()
            }
        };
        SpectrumGuard { guard }
    }
}

/// Scoped, exclusive access to the contents of a [`SpectrumBuffer`].
pub struct SpectrumGuard<'a> {
    guard: MutexGuard<'a, Box<[f64]>>,
}

impl Deref for SpectrumGuard<'_> {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.guard
    }
}

impl DerefMut for SpectrumGuard<'_> {
    fn deref_mut(&mut self) -> &mut [f64] {
        &mut self.guard
    }
}

/// Reduces `buffer` to `bars.len()` bars, each the mean of a contiguous slice.
///
/// `per_bar = buffer.len() / bars.len()`; trailing elements that do not fill a
/// whole bar are left out. If there are fewer elements than bars every bar is
/// zero.
pub fn calculate_bars(bars: &mut [f64], buffer: &[f64]) {
    bars.fill(0.0);
    if bars.is_empty() {
        return;
    }
    let per_bar = buffer.len() / bars.len();
    if per_bar == 0 {
        return;
    }
    let divisor = per_bar as f64;
    for (i, value) in buffer.iter().take(per_bar * bars.len()).enumerate() {
        bars[i / per_bar] += value / divisor;
    }
}

/// Consumer-side helper that keeps the bar vector between ticks.
#[derive(Debug, Clone)]
pub struct BarAggregator {
    bars: Vec<f64>,
}

impl BarAggregator {
    pub fn new(barcount: usize) -> Self {
        Self {
            bars: vec![0.0; barcount],
        }
    }

    pub fn barcount(&self) -> usize {
        self.bars.len()
    }

    /// Recomputes the bars from the current spectrum. The buffer lock is held
    /// only while aggregating.
    pub fn sample(&mut self, buffer: &SpectrumBuffer) -> &[f64] {
        {
            let spectrum = buffer.acquire();
            calculate_bars(&mut self.bars, &spectrum);
        }
        &self.bars
    }

    pub fn bars(&self) -> &[f64] {
        &self.bars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn bars_average_contiguous_slices() {
        let input = [1.0, 1.0, 1.0, 0.0, 0.5, 0.0, 0.5, 1.0, 0.2, 1.0];
        let mut bars = [0.0; 5];
        calculate_bars(&mut bars, &input);
        assert_eq!(bars, [1.0, 0.5, 0.25, 0.75, 0.6]);
    }

    #[test]
    fn bars_are_idempotent() {
        let input = [0.3, 0.9, 0.1, 0.4, 0.7, 0.2];
        let mut first = [7.0; 3];
        let mut second = [0.0; 3];
        calculate_bars(&mut first, &input);
        calculate_bars(&mut second, &input);
        assert_eq!(first, second);
    }

    #[test]
    fn remainder_is_left_out() {
        let input = [1.0, 1.0, 1.0, 1.0, 100.0];
        let mut bars = [0.0; 2];
        calculate_bars(&mut bars, &input);
        assert_eq!(bars, [1.0, 1.0]);
    }

    #[test]
    fn more_bars_than_samples_gives_zeros() {
        let mut bars = [5.0; 4];
        calculate_bars(&mut bars, &[1.0, 1.0]);
        assert_eq!(bars, [0.0; 4]);

        let mut none: [f64; 0] = [];
        calculate_bars(&mut none, &[1.0]);
    }

    #[test]
    fn buffer_write_is_visible_to_next_reader() {
        let buf = SpectrumBuffer::new(10);
        assert_eq!(buf.data_size(), 10);
        {
            let mut data = buf.acquire();
            data.fill(1.0);
        }
        let data = buf.acquire();
        assert_eq!(data.len(), 10);
        assert!(data.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn readers_never_see_torn_frames() {
        let buf = Arc::new(SpectrumBuffer::new(256));
        let writer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                for frame in 1..=500 {
                    let mut data = buf.acquire();
                    data.fill(frame as f64);
                }
            })
        };

        for _ in 0..500 {
            let data = buf.acquire();
            let first = data[0];
            assert!(data.iter().all(|&v| v == first));
        }
        writer.join().unwrap();
    }

    #[test]
    fn aggregator_samples_current_spectrum() {
        let buf = SpectrumBuffer::new(10);
        buf.acquire()
            .copy_from_slice(&[1.0, 1.0, 1.0, 0.0, 0.5, 0.0, 0.5, 1.0, 0.2, 1.0]);

        let mut aggregator = BarAggregator::new(5);
        assert_eq!(aggregator.sample(&buf), &[1.0, 0.5, 0.25, 0.75, 0.6]);
        assert_eq!(aggregator.barcount(), 5);
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let buf = Arc::new(SpectrumBuffer::new(4));
        let poisoner = Arc::clone(&buf);
        let _ = thread::spawn(move || {
            let mut data = poisoner.acquire();
            data.fill(2.0);
            panic!("writer died");
        })
        .join();

        assert_eq!(&*buf.acquire(), &[2.0; 4]);
    }
}
