//! # MIDI Module
//!
//! Raw MIDI byte model shared by the calibration parser, the sequencer and the
//! pitch-bend transformer. The core never owns a MIDI port; it produces
//! messages and hands scheduled scripts to a [`MidiSink`] supplied by the caller.

use std::time::{Duration, Instant};

use crate::error::Result;

pub const NOTE_ON: u8 = 0x90;
pub const PITCH_BEND: u8 = 0xE0;

/// Largest value a 14-bit pitch-bend can carry.
pub const MAX_BEND: u16 = 0x3FFF;

/// A short MIDI message of one to three raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiMessage {
    bytes: [u8; 3],
    len: u8,
}

impl MidiMessage {
    /// Builds a message from up to three bytes; anything past the third is dropped.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut bytes = [0u8; 3];
        let len = data.len().min(3);
        bytes[..len].copy_from_slice(&data[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }

    /// Note-on on a 1-based channel.
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::from_bytes(&[NOTE_ON | channel_nibble(channel), note & 0x7F, velocity & 0x7F])
    }

    /// Pitch-bend on a 1-based channel, `value` clamped to 14 bits.
    pub fn pitch_bend(channel: u8, value: u16) -> Self {
        let value = value.min(MAX_BEND);
        let lsb = (value & 0x7F) as u8;
        let msb = ((value >> 7) & 0x7F) as u8;
        Self::from_bytes(&[PITCH_BEND | channel_nibble(channel), lsb, msb])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn status(&self) -> Option<u8> {
        (self.len > 0).then_some(self.bytes[0])
    }

    /// 1-based channel of a channel-voice message.
    pub fn channel(&self) -> Option<u8> {
        self.status()
            .filter(|s| (0x80..0xF0).contains(s))
            .map(|s| (s & 0x0F) + 1)
    }

    pub fn is_note_on(&self) -> bool {
        self.len == 3 && self.bytes[0] & 0xF0 == NOTE_ON
    }

    pub fn is_pitch_bend(&self) -> bool {
        self.len == 3 && self.bytes[0] & 0xF0 == PITCH_BEND
    }

    pub fn note(&self) -> Option<u8> {
        self.is_note_on().then_some(self.bytes[1] & 0x7F)
    }

    /// 14-bit value of a pitch-bend message.
    pub fn bend_value(&self) -> Option<u16> {
        self.is_pitch_bend()
            .then(|| ((self.bytes[2] as u16 & 0x7F) << 7) | (self.bytes[1] as u16 & 0x7F))
    }
}

fn channel_nibble(channel: u8) -> u8 {
    channel.clamp(1, 16) - 1
}

/// A message to be sent `offset` after the start of its script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledMessage {
    pub offset: Duration,
    pub message: MidiMessage,
}

/// The time-ordered messages that excite a string during calibration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MidiScript {
    messages: Vec<ScheduledMessage>,
}

impl MidiScript {
    /// Inserts keeping the script ordered by offset; equal offsets keep insertion order.
    pub fn push(&mut self, offset: Duration, message: MidiMessage) {
        let at = self.messages.partition_point(|m| m.offset <= offset);
        self.messages.insert(at, ScheduledMessage { offset, message });
    }

    pub fn messages(&self) -> &[ScheduledMessage] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Channel the string owns: low nibble of the first message's status, plus one.
    pub fn channel(&self) -> Option<u8> {
        self.messages
            .first()
            .and_then(|m| m.message.status())
            .map(|s| (s & 0x0F) + 1)
    }

    /// Offset of the second-to-last message, when listening should begin.
    ///
    /// A single-message script starts listening straight away.
    pub fn listen_offset(&self) -> Duration {
        match self.messages.len() {
            0 | 1 => Duration::ZERO,
            n => self.messages[n - 2].offset,
        }
    }
}

/// Anything that can play a script of messages against a wall-clock start time.
pub trait MidiSink: Send {
    fn schedule(&mut self, messages: &[ScheduledMessage], start: Instant) -> Result<()>;

    /// Drops every scheduled message that has not been sent yet.
    fn clear_scheduled(&mut self) -> Result<()> {
        Ok(())
    }
}
