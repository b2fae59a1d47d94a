// swivel-core/src/lib.rs

//! The core logic for swivel-string autotuning.
//! This crate parses calibration files, listens to each string to find the
//! pitch it is currently tuned to, and rewrites live MIDI so every note lands
//! on its calibrated pitch-bend. It owns no devices: audio arrives through
//! [`audio::AudioSource`] and MIDI leaves through [`midi::MidiSink`], apart
//! from the optional cpal capture helper in [`audio`].

pub mod accumulator;
pub mod audio;
pub mod calibration;
pub mod cluster;
pub mod config;
pub mod error;
pub mod fft;
pub mod gate;
pub mod interpolate;
pub mod midi;
pub mod pitch;
pub mod sequencer;
pub mod string_state;
pub mod transform;
pub mod tuning;

pub use audio::{AudioCallback, AudioRouter, AudioSource, InputChannel};
pub use calibration::CalibrationBundle;
pub use config::{AnalysisConfig, SequencerConfig, SwivelConfig, TimeoutPolicy};
pub use error::{Error, ParseError, Result};
pub use interpolate::{NoteKey, NoteKeyTable};
pub use midi::{MidiMessage, MidiScript, MidiSink, ScheduledMessage};
pub use sequencer::{
    Canceller, SequencerEvent, SequencerHandle, SequencerRun, SequencerState,
    StringAnalysisSequencer, StringReport,
};
pub use string_state::StringState;
pub use transform::{MidiRouter, PitchBendTransformer};
