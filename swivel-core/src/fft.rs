//! # Fast Fourier Transform (FFT) Module
//!
//! Window functions and a forward real-input FFT for the pitch estimator.
//! The transform is planned once with RustFFT and the plan is shared between
//! strings; every [`RealFft`] owns its own working buffers, so two strings
//! never write into the same scratch space.

use std::f64::consts::PI;
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner, Length};
use serde::{Deserialize, Serialize};

/// Taper applied to a frame before the transform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowFunction {
    #[default]
    Hann,
    Hamming,
    Blackman,
    /// No tapering at all.
    Rectangular,
}

impl WindowFunction {
    /// Periodic window coefficients for a frame of `size` samples.
    pub fn coefficients(self, size: usize) -> Vec<f64> {
        let n = size as f64;
        (0..size)
            .map(|i| {
                let x = 2.0 * PI * i as f64 / n;
                match self {
                    WindowFunction::Hann => 0.5 - 0.5 * x.cos(),
                    WindowFunction::Hamming => 0.54 - 0.46 * x.cos(),
                    WindowFunction::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
                    WindowFunction::Rectangular => 1.0,
                }
            })
            .collect()
    }
}

/// Plans a forward transform of `size` points that can be shared between strings.
pub fn plan_forward(size: usize) -> Arc<dyn Fft<f64>> {
    FftPlanner::new().plan_fft_forward(size)
}

/// Forward transform of real input, producing `size / 2 + 1` bins.
pub struct RealFft {
    fft: Arc<dyn Fft<f64>>,
    buffer: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl RealFft {
    /// Wraps a forward plan, allocating the buffers it needs once.
    ///
    /// # Arguments
    /// * `fft` - A forward plan, usually shared between strings via [`plan_forward`]
    pub fn new(fft: Arc<dyn Fft<f64>>) -> Self {
        let size = fft.len();
        let scratch_len = fft.get_inplace_scratch_len();
        Self {
            fft,
            buffer: vec![Complex::default(); size],
            scratch: vec![Complex::default(); scratch_len],
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Transforms `signal`, which must hold exactly [`len`](Self::len) samples.
    ///
    /// Returns the non-negative frequency half of the spectrum. Does not allocate.
    pub fn process(&mut self, signal: &[f64]) -> &[Complex<f64>] {
        debug_assert_eq!(signal.len(), self.buffer.len());
        for (slot, &sample) in self.buffer.iter_mut().zip(signal) {
            *slot = Complex { re: sample, im: 0.0 };
        }
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);
        &self.buffer[..self.buffer.len() / 2 + 1]
    }
}
