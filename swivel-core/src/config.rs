//! Runtime configuration, loaded from an optional JSON file.
//!
//! Every field has a default, so a config file only needs the values it changes:
//!
//! ```json
//! { "analysis": { "input_channel": "mixdown" }, "sequencer": { "timeout_ms": 30000 } }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::InputChannel;
use crate::error::{Error, Result};
use crate::fft::WindowFunction;

/// Pitch analysis settings shared by every string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Samples per analysis frame (FFT size).
    pub frame_size: usize,
    /// Frames overlapping any given sample; the hop is `frame_size / overlap`.
    pub overlap: usize,
    pub window: WindowFunction,
    /// Block RMS that opens the onset gate.
    pub rms_up: f32,
    /// Block RMS that closes it.
    pub rms_down: f32,
    /// Estimates after which a pluck is finalised even if still ringing.
    pub estimate_cap: usize,
    /// Width in Hz of a cluster of agreeing estimates.
    pub cohesion_hz: f64,
    /// Fractional widening of a string's search band beyond its calibrated range.
    pub band_guard: f64,
    pub input_channel: InputChannel,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            frame_size: 8192,
            overlap: 2,
            window: WindowFunction::Hann,
            rms_up: 0.05,
            rms_down: 0.01,
            estimate_cap: 20,
            cohesion_hz: 1.0,
            band_guard: 0.2,
            input_channel: InputChannel::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn hop_size(&self) -> usize {
        self.frame_size / self.overlap.max(1)
    }

    /// Rejects settings the accumulator, gate or estimator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.overlap == 0 {
            return Err(Error::Config("overlap must be at least 1".into()));
        }
        if self.frame_size < 4 || self.frame_size % self.overlap != 0 {
            return Err(Error::Config(format!(
                "frame_size {} must be at least 4 and divisible by overlap {}",
                self.frame_size, self.overlap
            )));
        }
        if !(self.rms_up.is_finite() && self.rms_down.is_finite()) {
            return Err(Error::Config("RMS thresholds must be finite".into()));
        }
        if self.estimate_cap == 0 {
            return Err(Error::Config("estimate_cap must be at least 1".into()));
        }
        if !(self.cohesion_hz.is_finite() && self.cohesion_hz > 0.0) {
            return Err(Error::Config("cohesion_hz must be positive".into()));
        }
        if !(self.band_guard.is_finite() && (0.0..1.0).contains(&self.band_guard)) {
            return Err(Error::Config("band_guard must be in 0..1".into()));
        }
        Ok(())
    }
}

/// What the sequencer does when a string never produces a pluck.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Log it and move on to the next string.
    #[default]
    Continue,
    /// Stop the whole run with [`Error::AnalysisTimeout`].
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Delay between starting a string and its first scripted MIDI message.
    pub lead_in_ms: u64,
    /// How long to listen for a pluck before giving up on a string.
    pub timeout_ms: u64,
    pub on_timeout: TimeoutPolicy,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            lead_in_ms: 1000,
            timeout_ms: 15_000,
            on_timeout: TimeoutPolicy::Continue,
        }
    }
}

impl SequencerConfig {
    pub fn lead_in(&self) -> Duration {
        Duration::from_millis(self.lead_in_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::Config("timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwivelConfig {
    pub analysis: AnalysisConfig,
    pub sequencer: SequencerConfig,
}

impl SwivelConfig {
    /// Reads and validates a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: SwivelConfig = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.analysis.validate()?;
        self.sequencer.validate()
    }
}
