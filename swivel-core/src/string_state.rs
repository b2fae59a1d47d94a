//! # String State Module
//!
//! One calibrated string: its bundle, the audio parameters bound to it and
//! the results of its latest calibration pass. The audio-side half of a pass
//! is a [`PluckAnalyzer`], which the sequencer attaches to the audio source
//! while the string is being listened to.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use rustfft::Fft;
use tracing::{debug, trace, warn};

use crate::accumulator::FrameAccumulator;
use crate::audio::AudioCallback;
use crate::calibration::CalibrationBundle;
use crate::config::AnalysisConfig;
use crate::error::{Error, ParseError, Result};
use crate::gate::{GateEvent, OnsetGate, rms};
use crate::interpolate::{self, DerivedCurve, Interpolation, NoteKeyTable};
use crate::pitch::{SpectralPitchEstimator, band_limits};
use crate::transform::PitchBendTransformer;

/// What a finalised pluck reports back to the sequencer.
#[derive(Debug, Clone, PartialEq)]
pub struct PluckOutcome {
    pub frequency: f64,
    /// The pluck's estimates, sorted ascending. The analyser moves its own
    /// list here, so sending an outcome never allocates.
    pub estimates: Vec<f64>,
}

impl PluckOutcome {
    pub fn estimate_count(&self) -> usize {
        self.estimates.len()
    }
}

#[derive(Debug, Clone)]
struct AudioBinding {
    config: AnalysisConfig,
    sample_rate: f64,
    band: (usize, usize),
}

/// A string's calibration data and the results of its latest pass.
#[derive(Debug)]
pub struct StringState {
    bundle: CalibrationBundle,
    channel: u8,
    audio: Option<AudioBinding>,
    estimates: Vec<f64>,
    derived: Option<DerivedCurve>,
    determined_pitch: f64,
    transformer: Arc<PitchBendTransformer>,
}

impl StringState {
    /// Takes ownership of a parsed bundle. Fails if the bundle breaks its invariants.
    pub fn new(bundle: CalibrationBundle) -> Result<Self> {
        bundle.validate()?;
        let channel = bundle
            .channel()
            .ok_or_else(|| ParseError::new(0, "MIDI script has no status byte"))?;
        Ok(Self {
            transformer: Arc::new(PitchBendTransformer::new(channel)),
            bundle,
            channel,
            audio: None,
            estimates: Vec::new(),
            derived: None,
            determined_pitch: f64::NAN,
        })
    }

    /// Binds the analysis settings and the device sample rate, fixing the
    /// string's search band.
    pub fn init_audio(&mut self, config: &AnalysisConfig, sample_rate: f64) {
        let (min_freq, max_freq) = self.bundle.fundamental_range();
        let band = band_limits(
            min_freq,
            max_freq,
            config.band_guard,
            config.frame_size,
            sample_rate,
        );
        debug!(
            "String {}: searching bins {}..={} at {sample_rate} Hz",
            self.bundle.number, band.0, band.1
        );
        self.audio = Some(AudioBinding {
            config: config.clone(),
            sample_rate,
            band,
        });
    }

    /// Whether [`init_audio`](Self::init_audio) has run.
    pub fn is_fully_initialised(&self) -> bool {
        self.audio.is_some()
    }

    /// Forgets the previous pass so the string can be analysed again.
    pub fn reset(&mut self) {
        self.estimates.clear();
        self.derived = None;
        self.determined_pitch = f64::NAN;
        self.transformer.clear();
    }

    /// MIDI note of the open string, as given in the calibration file.
    pub fn number(&self) -> u8 {
        self.bundle.number
    }

    /// 1-based MIDI channel the string's script plays on and its transformer listens to.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn bundle(&self) -> &CalibrationBundle {
        &self.bundle
    }

    /// Search band in FFT bins, once audio parameters are bound.
    pub fn band(&self) -> Option<(usize, usize)> {
        self.audio.as_ref().map(|a| a.band)
    }

    /// Time from the start of the script until listening should begin.
    pub fn listen_delay(&self) -> Duration {
        self.bundle.script.listen_offset()
    }

    /// Estimates of the pluck that determined the pitch.
    pub fn estimates(&self) -> &[f64] {
        &self.estimates
    }

    pub fn derived(&self) -> Option<&DerivedCurve> {
        self.derived.as_ref()
    }

    /// Open-string pitch found by the last pass; NaN until one completes.
    pub fn determined_pitch(&self) -> f64 {
        self.determined_pitch
    }

    pub fn note_key_table(&self) -> Option<NoteKeyTable> {
        self.transformer.table()
    }

    pub fn transformer(&self) -> Arc<PitchBendTransformer> {
        Arc::clone(&self.transformer)
    }

    /// Builds the derived curve and note-key table for a measured open-string
    /// pitch and hands the table to the transformer.
    ///
    /// Returns `false` if no table could be built.
    pub fn apply_pitch(&mut self, pitch: f64) -> bool {
        self.determined_pitch = pitch;
        let Some(Interpolation { derived, table }) = interpolate::interpolate(&self.bundle, pitch)
        else {
            warn!(
                "String {}: cannot interpolate a pitch of {pitch} Hz",
                self.bundle.number
            );
            return false;
        };
        self.derived = Some(derived);
        self.transformer.install(table);
        true
    }

    /// Records a finished pluck and applies its frequency.
    pub fn apply_outcome(&mut self, outcome: PluckOutcome) -> bool {
        self.estimates = outcome.estimates;
        self.apply_pitch(outcome.frequency)
    }

    /// Builds the audio-side analyser for one pass.
    ///
    /// `done` receives exactly one [`PluckOutcome`], from the first pluck that
    /// produced any estimates.
    pub fn analyzer(
        &self,
        plan: Arc<dyn Fft<f64>>,
        done: Sender<PluckOutcome>,
    ) -> Result<PluckAnalyzer> {
        let audio = self
            .audio
            .as_ref()
            .ok_or(Error::NotInitialised(self.bundle.number))?;
        let config = &audio.config;
        Ok(PluckAnalyzer {
            string: self.bundle.number,
            accumulator: FrameAccumulator::new(config.frame_size, config.overlap),
            gate: OnsetGate::new(config.rms_up, config.rms_down, config.estimate_cap),
            estimator: SpectralPitchEstimator::new(
                plan,
                config.window,
                config.hop_size(),
                audio.sample_rate,
                audio.band,
                config.cohesion_hz,
            ),
            done,
            finished: false,
        })
    }
}

/// Gate, accumulator and estimator of one string, run on the audio thread.
pub struct PluckAnalyzer {
    string: u8,
    accumulator: FrameAccumulator,
    gate: OnsetGate,
    estimator: SpectralPitchEstimator,
    done: Sender<PluckOutcome>,
    finished: bool,
}

impl PluckAnalyzer {
    /// Whether the outcome has been sent; further audio is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn finalize(&mut self) {
        match self.estimator.finish_pluck() {
            Some(frequency) => {
                debug!(
                    "String {}: pluck finalised at {frequency:.2} Hz from {} estimates",
                    self.string,
                    self.estimator.estimate_count()
                );
                let outcome = PluckOutcome {
                    frequency,
                    estimates: self.estimator.take_estimates(),
                };
                // Capacity one, sent once.
                let _ = self.done.try_send(outcome);
                self.finished = true;
            }
            None => {
                debug!(
                    "String {}: pluck ended without estimates, still listening",
                    self.string
                );
                self.estimator.begin_pluck();
            }
        }
    }
}

impl AudioCallback for PluckAnalyzer {
    fn on_block(&mut self, samples: &[f32], _sample_rate: f64) {
        if self.finished {
            return;
        }

        match self.gate.update(rms(samples), self.estimator.estimate_count()) {
            GateEvent::Quiet => return,
            GateEvent::Opened => {
                trace!("String {}: gate opened", self.string);
                self.accumulator.clear();
                self.estimator.begin_pluck();
            }
            GateEvent::Held => {}
            GateEvent::Closed => {
                self.finalize();
                return;
            }
        }

        let estimator = &mut self.estimator;
        self.accumulator.push(samples, |frame| {
            estimator.process_frame(frame);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fft::plan_forward;
    use crate::interpolate::NoteKey;
    use crate::midi::{MidiMessage, MidiScript};
    use crossbeam_channel::bounded;
    use std::f64::consts::TAU;

    const SR: f64 = 8000.0;

    fn bundle() -> CalibrationBundle {
        let mut script = MidiScript::default();
        script.push(Duration::ZERO, MidiMessage::note_on(3, 40, 100));
        script.push(Duration::from_millis(250), MidiMessage::note_on(3, 40, 0));
        script.push(Duration::from_millis(400), MidiMessage::note_on(3, 40, 100));
        CalibrationBundle {
            number: 40,
            fundamentals: vec![100.0, 120.0],
            measurements: vec![
                vec![100.0, 105.0, 110.0, 115.0, 120.0],
                vec![120.0, 125.0, 130.0, 135.0, 140.0],
            ],
            targets: vec![105.0, 110.0, 112.5, 115.0, 120.0],
            pitch_bends: vec![0, 1000, 2000, 3000, 4000],
            script,
        }
    }

    fn config() -> AnalysisConfig {
        AnalysisConfig {
            frame_size: 1024,
            ..AnalysisConfig::default()
        }
    }

    fn sine_blocks(freq: f64, amplitude: f64, blocks: usize) -> Vec<Vec<f32>> {
        (0..blocks)
            .map(|b| {
                (0..256)
                    .map(|i| {
                        let t = (b * 256 + i) as f64 / SR;
                        (amplitude * (TAU * freq * t).sin()) as f32
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_lifecycle() {
        let mut state = StringState::new(bundle()).unwrap();
        assert_eq!(state.channel(), 3);
        assert_eq!(state.listen_delay(), Duration::from_millis(250));
        assert!(!state.is_fully_initialised());
        assert!(state.determined_pitch().is_nan());

        let (tx, _rx) = bounded(1);
        let err = state.analyzer(plan_forward(1024), tx).err().unwrap();
        assert!(matches!(err, Error::NotInitialised(40)));

        state.init_audio(&config(), SR);
        assert!(state.is_fully_initialised());
        assert_eq!(state.band(), Some((10, 18)));
    }

    #[test]
    fn test_invalid_bundle_rejected() {
        let mut b = bundle();
        b.pitch_bends.clear();
        assert!(matches!(StringState::new(b), Err(Error::Parse(_))));
    }

    #[test]
    fn test_apply_pitch_and_reset() {
        let mut state = StringState::new(bundle()).unwrap();
        let transformer = state.transformer();
        assert!(state.apply_pitch(110.0));
        assert!(transformer.is_ready());

        let table = state.note_key_table().unwrap();
        assert_eq!(table.get(40), NoteKey::Invalid);
        assert_eq!(table.get(41), NoteKey::Open);
        assert_eq!(table.get(42), NoteKey::Bend(500));
        assert_eq!(state.derived().unwrap().values[0], 110.0);

        state.reset();
        assert!(!transformer.is_ready());
        assert!(state.derived().is_none());
        assert!(state.determined_pitch().is_nan());
    }

    #[test]
    fn test_analyzer_reports_one_pluck() {
        let mut state = StringState::new(bundle()).unwrap();
        state.init_audio(&config(), SR);
        let (tx, rx) = bounded(1);
        let mut analyzer = state.analyzer(plan_forward(1024), tx).unwrap();

        for block in sine_blocks(113.0, 0.0, 10) {
            analyzer.on_block(&block, SR);
        }
        assert!(rx.try_recv().is_err());

        for block in sine_blocks(113.0, 0.5, 100) {
            analyzer.on_block(&block, SR);
        }
        assert!(analyzer.is_finished());
        let outcome = rx.try_recv().unwrap();
        assert!((outcome.frequency - 113.0).abs() < 0.5, "{}", outcome.frequency);
        assert_eq!(outcome.estimate_count(), 20);
        assert!(outcome.estimates.is_sorted());

        // Finished analysers ignore further audio.
        for block in sine_blocks(113.0, 0.5, 100) {
            analyzer.on_block(&block, SR);
        }
        assert!(rx.try_recv().is_err());

        assert!(state.apply_outcome(outcome));
        assert_eq!(state.estimates().len(), 20);
    }
}
