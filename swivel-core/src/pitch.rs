//! # Pitch Detection Module
//!
//! Spectral pitch estimation for a single plucked string.
//!
//! ## Per frame
//! 1. Window the frame and run the forward FFT.
//! 2. Take bin magnitudes inside the string's band only, so harmonics and
//!    neighbouring strings cannot win.
//! 3. Smooth the magnitudes with a 2-tap moving average and keep the strict
//!    local maxima as peaks; the largest one is the best peak.
//! 4. From the second frame of a pluck on, refine the best peak's frequency
//!    from the phase advance of that bin since the previous frame.
//!
//! ## Per pluck
//! The refined estimates are clustered (see [`crate::cluster`]) and the mean
//! of the largest cluster is the pluck's frequency.

use std::f64::consts::{PI, TAU};
use std::sync::Arc;

use rustfft::Fft;

use crate::cluster;
use crate::fft::{RealFft, WindowFunction};

/// Converts a frequency to the (truncated) FFT bin it falls in.
pub fn freq_to_bin(freq: f64, frame_size: usize, sample_rate: f64) -> usize {
    (freq * frame_size as f64 / sample_rate).max(0.0) as usize
}

pub fn bin_to_freq(bin: f64, frame_size: usize, sample_rate: f64) -> f64 {
    bin * sample_rate / frame_size as f64
}

/// Bins searched for a string calibrated between `min_freq` and `max_freq`,
/// widened by `guard` (0.2 = 20%) on both sides.
pub fn band_limits(
    min_freq: f64,
    max_freq: f64,
    guard: f64,
    frame_size: usize,
    sample_rate: f64,
) -> (usize, usize) {
    let nyquist_bin = frame_size / 2;
    let min_bin = freq_to_bin(min_freq * (1.0 - guard), frame_size, sample_rate).min(nyquist_bin);
    let max_bin = freq_to_bin(max_freq * (1.0 + guard), frame_size, sample_rate).min(nyquist_bin);
    (min_bin, max_bin)
}

/// Wraps a phase into `(-π, π]`.
fn wrap_phase(phase: f64) -> f64 {
    let wrapped = phase.rem_euclid(TAU);
    if wrapped > PI { wrapped - TAU } else { wrapped }
}

/// Estimates the fundamental of one string from overlapped frames.
///
/// Owns every buffer it writes; only the FFT plan is shared.
pub struct SpectralPitchEstimator {
    fft: RealFft,
    window: Vec<f64>,
    frame: Vec<f64>,
    magnitudes: Vec<f64>,
    peaks: Vec<usize>,
    frame_size: usize,
    hop_size: usize,
    sample_rate: f64,
    min_bin: usize,
    max_bin: usize,
    cohesion: f64,
    /// Best bin and its phase in the previous frame of this pluck.
    last: Option<(usize, f64)>,
    estimates: Vec<f64>,
}

impl SpectralPitchEstimator {
    /// Creates an estimator for one string.
    ///
    /// # Arguments
    /// * `plan` - Forward FFT plan; its length is the frame size
    /// * `window` - Window applied to every frame
    /// * `hop_size` - Samples between consecutive frames, needed for phase refinement
    /// * `sample_rate` - Sample rate in Hz
    /// * `(min_bin, max_bin)` - Inclusive search band, see [`band_limits`]
    /// * `cohesion` - Cluster width in Hz used by [`Self::best_frequency`]
    pub fn new(
        plan: Arc<dyn Fft<f64>>,
        window: WindowFunction,
        hop_size: usize,
        sample_rate: f64,
        (min_bin, max_bin): (usize, usize),
        cohesion: f64,
    ) -> Self {
        let fft = RealFft::new(plan);
        let frame_size = fft.len();
        Self {
            window: window.coefficients(frame_size),
            frame: vec![0.0; frame_size],
            magnitudes: vec![0.0; frame_size / 2 + 1],
            peaks: Vec::with_capacity(frame_size / 4),
            fft,
            frame_size,
            hop_size,
            sample_rate,
            min_bin,
            max_bin: max_bin.min(frame_size / 2),
            cohesion,
            last: None,
            estimates: Vec::with_capacity(64),
        }
    }

    /// Forgets the previous pluck's phase history and estimates.
    pub fn begin_pluck(&mut self) {
        self.last = None;
        self.estimates.clear();
    }

    pub fn estimates(&self) -> &[f64] {
        &self.estimates
    }

    pub fn estimate_count(&self) -> usize {
        self.estimates.len()
    }

    /// Bin of the best peak in the most recent frame, if it had one.
    pub fn last_peak_bin(&self) -> Option<usize> {
        self.last.map(|(bin, _)| bin)
    }

    /// Peaks of the most recent frame, in Hz.
    pub fn current_peaks_hz(&self) -> impl Iterator<Item = f64> + '_ {
        self.peaks
            .iter()
            .map(|&bin| bin_to_freq(bin as f64, self.frame_size, self.sample_rate))
    }

    /// Analyses one frame and returns the refined frequency it contributed, if any.
    ///
    /// The first frame of a pluck only records the phase of its best peak. A
    /// frame whose best peak moved to a different bin starts the phase history
    /// again, since phases of different bins cannot be compared.
    pub fn process_frame(&mut self, frame: &[f32]) -> Option<f64> {
        for ((out, &sample), &w) in self.frame.iter_mut().zip(frame).zip(&self.window) {
            *out = sample as f64 * w;
        }
        let spectrum = self.fft.process(&self.frame);

        let (lo, hi) = (self.min_bin, self.max_bin);
        self.peaks.clear();
        if hi < lo + 2 {
            self.last = None;
            return None;
        }

        for bin in lo..=hi {
            self.magnitudes[bin] = spectrum[bin].norm();
        }
        // Downwards so every bin averages with its unsmoothed lower neighbour.
        for bin in (lo + 1..=hi).rev() {
            self.magnitudes[bin] = (self.magnitudes[bin] + self.magnitudes[bin - 1]) / 2.0;
        }
        for bin in lo + 1..hi {
            let m = self.magnitudes[bin];
            if m > self.magnitudes[bin - 1] && m > self.magnitudes[bin + 1] {
                self.peaks.push(bin);
            }
        }

        let Some(&best) = self
            .peaks
            .iter()
            .max_by(|&&a, &&b| self.magnitudes[a].total_cmp(&self.magnitudes[b]))
        else {
            self.last = None;
            return None;
        };

        let phase = spectrum[best].im.atan2(spectrum[best].re);
        let refined = match self.last {
            Some((last_bin, last_phase)) if last_bin == best => {
                Some(self.refine(best, phase - last_phase))
            }
            _ => None,
        };
        self.last = Some((best, phase));

        if let Some(freq) = refined {
            self.estimates.push(freq);
        }
        refined
    }

    /// Phase-vocoder frequency of `bin` given its phase advance over one hop.
    ///
    /// The advance is compared with what the bin centre frequency predicts and
    /// the remainder, wrapped to `(-π, π]`, moves the estimate off the centre.
    /// With a half-frame hop this is `(bin - Δφ/π) · sr / N`, Δφ being the
    /// previous phase minus the current one.
    fn refine(&self, bin: usize, advance: f64) -> f64 {
        let hop_ratio = self.hop_size as f64 / self.frame_size as f64;
        let expected = TAU * bin as f64 * hop_ratio;
        let deviation = wrap_phase(advance - expected);
        let refined_bin = bin as f64 + deviation / (TAU * hop_ratio);
        bin_to_freq(refined_bin, self.frame_size, self.sample_rate)
    }

    /// Best frequency of the current pluck, or `None` if it produced no estimates.
    pub fn best_frequency(&self) -> Option<f64> {
        cluster::best_frequency(&self.estimates, self.cohesion)
    }

    /// Like [`Self::best_frequency`], but sorts the estimates in place instead
    /// of copying them. Used on the audio thread when a pluck ends.
    pub fn finish_pluck(&mut self) -> Option<f64> {
        cluster::best_frequency_in_place(&mut self.estimates, self.cohesion)
    }

    /// Hands the pluck's estimates over, leaving an empty list behind.
    pub fn take_estimates(&mut self) -> Vec<f64> {
        std::mem::take(&mut self.estimates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::FrameAccumulator;
    use crate::fft::plan_forward;

    const SR: f64 = 8000.0;
    const N: usize = 1024;

    fn sine(freq: f64, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (0.5 * (TAU * freq * i as f64 / SR).sin()) as f32)
            .collect()
    }

    fn run(freq: f64, overlap: usize, window: WindowFunction) -> (SpectralPitchEstimator, usize) {
        let band = band_limits(400.0, 480.0, 0.2, N, SR);
        let mut estimator =
            SpectralPitchEstimator::new(plan_forward(N), window, N / overlap, SR, band, 1.0);
        let mut acc = FrameAccumulator::new(N, overlap);
        let mut frames = 0;
        for block in sine(freq, N * 4).chunks(256) {
            acc.push(block, |frame| {
                estimator.process_frame(frame);
                frames += 1;
            });
        }
        (estimator, frames)
    }

    #[test]
    fn test_band_limits() {
        assert_eq!(band_limits(400.0, 480.0, 0.2, N, SR), (40, 73));
        assert_eq!(band_limits(3000.0, 3900.0, 0.2, N, SR).1, N / 2);
    }

    #[test]
    fn test_wrap_phase() {
        assert!((wrap_phase(3.0 * PI) - PI).abs() < 1e-12);
        assert!((wrap_phase(-PI) - PI).abs() < 1e-12);
        assert!((wrap_phase(0.5) - 0.5).abs() < 1e-12);
        assert!((wrap_phase(-1.5 * PI) - 0.5 * PI).abs() < 1e-12);
    }

    #[test]
    fn test_phase_refinement_beats_bin_resolution() {
        let freq = 440.0;
        let (estimator, frames) = run(freq, 2, WindowFunction::Hann);
        assert!(frames >= 5, "only {frames} frames");
        assert_eq!(estimator.estimate_count(), frames - 1);

        let best = estimator.best_frequency().unwrap();
        let resolution = SR / N as f64;
        let raw = bin_to_freq(estimator.last_peak_bin().unwrap() as f64, N, SR);

        assert!((best - freq).abs() < resolution, "best {best}");
        assert!(
            (best - freq).abs() * 10.0 < (raw - freq).abs(),
            "best {best} is not much closer than raw {raw}"
        );
    }

    #[test]
    fn test_refinement_with_quarter_hop() {
        let freq = 452.7;
        let (estimator, _) = run(freq, 4, WindowFunction::Blackman);
        let best = estimator.best_frequency().unwrap();
        assert!((best - freq).abs() < 0.1, "best {best}");
    }

    #[test]
    fn test_finish_pluck_matches_best_frequency() {
        let (mut estimator, frames) = run(440.0, 2, WindowFunction::Hann);
        let best = estimator.best_frequency().unwrap();
        assert_eq!(estimator.finish_pluck(), Some(best));

        let estimates = estimator.take_estimates();
        assert_eq!(estimates.len(), frames - 1);
        assert!(estimates.is_sorted());
        assert_eq!(estimator.estimate_count(), 0);
    }

    #[test]
    fn test_begin_pluck_clears_history() {
        let (mut estimator, _) = run(440.0, 2, WindowFunction::Hann);
        assert!(estimator.estimate_count() > 0);
        estimator.begin_pluck();
        assert_eq!(estimator.estimate_count(), 0);
        assert_eq!(estimator.last_peak_bin(), None);
        assert_eq!(estimator.best_frequency(), None);
    }
}
