//! # Sequencer Module
//!
//! Calibrates strings one after another. For each string:
//!
//! 1. schedule its MIDI script to start after a short lead-in,
//! 2. wait until the second-to-last scripted message is due,
//! 3. attach the string's [`PluckAnalyzer`] to the audio source,
//! 4. wait for a finished pluck, a timeout, or cancellation,
//! 5. detach, then build the string's note-key table from the pluck.
//!
//! Only one analyser is ever attached, so strings never share audio-side
//! buffers. The run can happen on the calling thread ([`StringAnalysisSequencer::run`])
//! or on its own worker ([`StringAnalysisSequencer::spawn`]).
//!
//! [`PluckAnalyzer`]: crate::string_state::PluckAnalyzer

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, bounded, select};
use rustfft::Fft;
use tracing::{info, warn};

use crate::audio::AudioSource;
use crate::config::{AnalysisConfig, SequencerConfig, TimeoutPolicy};
use crate::error::{Error, Result};
use crate::fft::plan_forward;
use crate::midi::MidiSink;
use crate::string_state::{PluckOutcome, StringState};
use crate::transform::PitchBendTransformer;
use crate::tuning::describe_pitch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    PlayingCalibration,
    WaitingForAudioStart,
    Listening,
    Done,
    TimedOut,
}

/// Progress notifications for a front end.
#[derive(Debug, Clone, PartialEq)]
pub enum SequencerEvent {
    StateChanged { string: u8, state: SequencerState },
    PitchDetermined { string: u8, frequency: f64 },
    Finished,
}

/// How one string's pass ended.
#[derive(Debug, Clone, PartialEq)]
pub struct StringReport {
    pub string: u8,
    pub channel: u8,
    /// [`SequencerState::Done`] or [`SequencerState::TimedOut`].
    pub state: SequencerState,
    pub frequency: Option<f64>,
    /// Whether a note-key table was installed for the string.
    pub table_ready: bool,
}

/// Everything a finished run hands back.
#[derive(Debug)]
pub struct SequencerRun {
    pub reports: Vec<StringReport>,
    pub strings: Vec<StringState>,
}

/// Requests cancellation of a running sequence.
#[derive(Debug, Clone)]
pub struct Canceller(Sender<()>);

impl Canceller {
    /// Interrupts whatever wait the sequencer is in. Calling it again is a no-op.
    pub fn cancel(&self) {
        let _ = self.0.try_send(());
    }
}

pub struct StringAnalysisSequencer {
    strings: Vec<StringState>,
    audio: Arc<dyn AudioSource>,
    midi: Box<dyn MidiSink>,
    analysis: AnalysisConfig,
    config: SequencerConfig,
    plan: Arc<dyn Fft<f64>>,
    events: Option<Sender<SequencerEvent>>,
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
}

enum Wait {
    Plucked(PluckOutcome),
    TimedOut,
    Cancelled,
}

impl StringAnalysisSequencer {
    /// Creates a sequencer that will calibrate `strings` in order.
    ///
    /// # Arguments
    /// * `strings` - The strings to calibrate, in sequence order
    /// * `audio` - The live source each string's analyser is attached to
    /// * `midi` - Where the calibration scripts are sent
    /// * `analysis` - Pitch analysis settings shared by every string
    /// * `config` - Lead-in, timeout and timeout policy
    ///
    /// # Returns
    /// * `Ok(sequencer)` - ready to [`run`](Self::run) or [`spawn`](Self::spawn)
    /// * `Err(Error::Config)` - either config is unusable
    pub fn new(
        strings: Vec<StringState>,
        audio: Arc<dyn AudioSource>,
        midi: Box<dyn MidiSink>,
        analysis: AnalysisConfig,
        config: SequencerConfig,
    ) -> Result<Self> {
        analysis.validate()?;
        config.validate()?;
        let (cancel_tx, cancel_rx) = bounded(1);
        Ok(Self {
            strings,
            audio,
            midi,
            plan: plan_forward(analysis.frame_size),
            analysis,
            config,
            events: None,
            cancel_tx,
            cancel_rx,
        })
    }

    /// Publishes every state change on `events`.
    pub fn with_events(mut self, events: Sender<SequencerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn canceller(&self) -> Canceller {
        Canceller(self.cancel_tx.clone())
    }

    /// Transformers of every string, in sequence order. Their tables fill in
    /// as strings complete.
    pub fn transformers(&self) -> Vec<Arc<PitchBendTransformer>> {
        self.strings.iter().map(StringState::transformer).collect()
    }

    /// Runs the sequence on a named worker thread.
    pub fn spawn(self) -> Result<SequencerHandle> {
        let canceller = self.canceller();
        let thread = thread::Builder::new()
            .name("swivel-sequencer".to_string())
            .spawn(move || self.run())?;
        Ok(SequencerHandle { canceller, thread })
    }

    /// Runs the whole sequence on the current thread.
    ///
    /// Fails with [`Error::Cancelled`] when cancelled and with
    /// [`Error::AnalysisTimeout`] when a string times out under
    /// [`TimeoutPolicy::Abort`]. The audio source has nothing attached
    /// whenever this returns.
    pub fn run(mut self) -> Result<SequencerRun> {
        let mut strings = std::mem::take(&mut self.strings);
        let mut reports = Vec::with_capacity(strings.len());
        info!("Calibrating {} string(s)", strings.len());

        for string in &mut strings {
            let report = self.analyse(string)?;
            let timed_out = report.state == SequencerState::TimedOut;
            reports.push(report);
            if timed_out && self.config.on_timeout == TimeoutPolicy::Abort {
                return Err(Error::AnalysisTimeout {
                    string: string.number(),
                    timeout: self.config.timeout(),
                });
            }
        }

        self.publish(SequencerEvent::Finished);
        Ok(SequencerRun { reports, strings })
    }

    fn publish(&self, event: SequencerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn enter(&self, string: u8, state: SequencerState) {
        info!("String {string}: {state:?}");
        self.publish(SequencerEvent::StateChanged { string, state });
    }

    /// Stops the rest of a cancelled string's script from playing.
    fn silence(&mut self, number: u8) {
        if let Err(e) = self.midi.clear_scheduled() {
            warn!("String {number}: could not clear its calibration script: {e}");
        }
    }

    fn analyse(&mut self, string: &mut StringState) -> Result<StringReport> {
        let number = string.number();
        self.enter(number, SequencerState::Idle);

        string.reset();
        if !string.is_fully_initialised() {
            string.init_audio(&self.analysis, self.audio.sample_rate());
        }

        self.enter(number, SequencerState::PlayingCalibration);
        let start = Instant::now() + self.config.lead_in();
        self.midi.schedule(string.bundle().script.messages(), start)?;

        self.enter(number, SequencerState::WaitingForAudioStart);
        if self.cancel_rx.recv_deadline(start + string.listen_delay()).is_ok() {
            info!("String {number}: cancelled before listening");
            self.silence(number);
            return Err(Error::Cancelled);
        }

        let (done_tx, done_rx) = bounded(1);
        let analyzer = string.analyzer(Arc::clone(&self.plan), done_tx)?;
        self.audio.attach(Box::new(analyzer));
        self.enter(number, SequencerState::Listening);

        let timeout = self.config.timeout();
        let wait = select! {
            recv(done_rx) -> outcome => match outcome {
                Ok(outcome) => Wait::Plucked(outcome),
                Err(_) => Wait::TimedOut,
            },
            recv(self.cancel_rx) -> _ => Wait::Cancelled,
            default(timeout) => Wait::TimedOut,
        };
        // The analyser owns buffers of this string; it must be gone before
        // anything else happens to the string.
        self.audio.detach();

        let mut report = StringReport {
            string: number,
            channel: string.channel(),
            state: SequencerState::TimedOut,
            frequency: None,
            table_ready: false,
        };

        match wait {
            Wait::Plucked(outcome) => {
                let frequency = outcome.frequency;
                report.table_ready = string.apply_outcome(outcome);
                report.state = SequencerState::Done;
                report.frequency = Some(frequency);
                info!("String {number}: determined {}", describe_pitch(frequency));
                self.publish(SequencerEvent::PitchDetermined {
                    string: number,
                    frequency,
                });
                self.enter(number, SequencerState::Done);
            }
            Wait::TimedOut => {
                warn!(
                    "String {number}: no pluck detected within {:.1} s",
                    timeout.as_secs_f64()
                );
                self.enter(number, SequencerState::TimedOut);
            }
            Wait::Cancelled => {
                info!("String {number}: cancelled while listening");
                self.silence(number);
                return Err(Error::Cancelled);
            }
        }

        Ok(report)
    }
}

/// A sequence running on its worker thread.
pub struct SequencerHandle {
    canceller: Canceller,
    thread: thread::JoinHandle<Result<SequencerRun>>,
}

impl SequencerHandle {
    /// Asks the run to stop; [`join`](Self::join) then returns [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the run to end. A panic on the worker is resumed here.
    pub fn join(self) -> Result<SequencerRun> {
        match self.thread.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

