//! # Error Module
//!
//! Typed failures for the calibration engine. Conditions inside the real-time
//! audio callback are never reported through these types; they are expressed
//! as gate/sequencer state transitions instead.

use std::time::Duration;
use thiserror::Error;

/// A malformed calibration file.
///
/// Carries the 1-based line at which the parser gave up. Invariant checks on a
/// finished element report the line of its closing tag, or `0` when a bundle
/// built outside the parser is checked.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Calibration parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("No pluck detected on string {string} within {timeout:?}")]
    AnalysisTimeout { string: u8, timeout: Duration },

    #[error("String on channel {channel} has no note-key table yet")]
    UninitializedTransform { channel: u8 },

    #[error("String {0} is missing its audio parameters")]
    NotInitialised(u8),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("MIDI error: {0}")]
    Midi(String),

    #[error("Analysis cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
