//! # MIDI Transform Module
//!
//! Rewrites live MIDI for a calibrated string. A note-on becomes the pitch-bend
//! that makes the string sound that note; an incoming pitch-bend is re-mapped
//! around the last note played so bends follow the string's real response.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLock;
use tracing::trace;

use crate::error::{Error, Result};
use crate::interpolate::NoteKeyTable;
use crate::midi::{MAX_BEND, MidiMessage};

/// Width of one neighbour-to-neighbour zone of an incoming pitch-bend.
const ZONE: u16 = 4096;

/// Per-string MIDI rewriter.
///
/// The table is written by the calibration pass and read from the MIDI
/// dispatch context, so it sits behind a reader/writer lock.
#[derive(Debug)]
pub struct PitchBendTransformer {
    channel: u8,
    table: RwLock<Option<NoteKeyTable>>,
    current_note: AtomicU8,
}

impl PitchBendTransformer {
    /// A transformer for a 1-based MIDI channel, with no table yet.
    pub fn new(channel: u8) -> Self {
        Self {
            channel,
            table: RwLock::new(None),
            current_note: AtomicU8::new(0),
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Installs the table produced by a finished calibration pass.
    pub fn install(&self, table: NoteKeyTable) {
        *self.table.write() = Some(table);
    }

    /// Drops the table; transforms are rejected until a new one is installed.
    pub fn clear(&self) {
        *self.table.write() = None;
        self.current_note.store(0, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.table.read().is_some()
    }

    pub fn table(&self) -> Option<NoteKeyTable> {
        self.table.read().clone()
    }

    /// Last note-on seen. Zero until the first one arrives.
    pub fn current_note(&self) -> u8 {
        self.current_note.load(Ordering::Relaxed)
    }

    /// Rewrites one message.
    ///
    /// Returns `Ok(None)` when the message must be dropped (a note-on the
    /// string cannot play) and the message itself when it is not ours to touch.
    /// Fails with [`Error::UninitializedTransform`] for a message this string
    /// would rewrite but has no table for yet.
    pub fn transform(&self, msg: &MidiMessage) -> Result<Option<MidiMessage>> {
        if msg.channel() != Some(self.channel) || !(msg.is_note_on() || msg.is_pitch_bend()) {
            return Ok(Some(*msg));
        }

        let guard = self.table.read();
        let table = guard.as_ref().ok_or(Error::UninitializedTransform {
            channel: self.channel,
        })?;

        if let Some(note) = msg.note() {
            return Ok(table.get(note as i32).bend().map(|value| {
                self.current_note.store(note, Ordering::Relaxed);
                MidiMessage::pitch_bend(self.channel, value)
            }));
        }

        let Some(value) = msg.bend_value() else {
            return Ok(Some(*msg));
        };
        // Four zones spanning current_note - 2 ..= current_note + 2. The
        // neighbours are read raw, sentinels included.
        let zone = (value / ZONE) as i32;
        let frac = (value % ZONE) as f64 / ZONE as f64;
        let base = self.current_note() as i32 - 2 + zone;
        let lo = table.get(base).raw() as f64;
        let hi = table.get(base + 1).raw() as f64;
        let bent = (lo + frac * (hi - lo)).round().clamp(0.0, MAX_BEND as f64) as u16;

        Ok(Some(MidiMessage::pitch_bend(self.channel, bent)))
    }
}

/// Dispatches incoming MIDI to the transformer owning its channel.
#[derive(Debug, Default, Clone)]
pub struct MidiRouter {
    transformers: Vec<Arc<PitchBendTransformer>>,
}

impl MidiRouter {
    /// Routes to `transformers`; on a shared channel the earlier one wins.
    pub fn new(transformers: Vec<Arc<PitchBendTransformer>>) -> Self {
        Self { transformers }
    }

    /// Message to forward for `msg`, or `None` to drop it.
    ///
    /// The first string on the message's channel handles it. Messages no string
    /// claims, and messages for strings still uncalibrated, pass through.
    pub fn route(&self, msg: &MidiMessage) -> Option<MidiMessage> {
        let Some(transformer) = self
            .transformers
            .iter()
            .find(|t| msg.channel() == Some(t.channel()))
        else {
            return Some(*msg);
        };

        match transformer.transform(msg) {
            Ok(out) => out,
            Err(e) => {
                trace!("Passing through: {e}");
                Some(*msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpolate::{INVALID_RAW, NoteKey};

    fn table() -> NoteKeyTable {
        let mut table = NoteKeyTable::default();
        table.set(40, NoteKey::OffString);
        table.set(41, NoteKey::Open);
        for (i, note) in (42..=47).enumerate() {
            table.set(note, NoteKey::Bend(1000 * (i as u16 + 1)));
        }
        table
    }

    fn ready(channel: u8) -> PitchBendTransformer {
        let t = PitchBendTransformer::new(channel);
        t.install(table());
        t
    }

    #[test]
    fn test_note_on_becomes_pitch_bend() {
        let t = ready(2);
        let out = t.transform(&MidiMessage::note_on(2, 44, 100)).unwrap();
        assert_eq!(out, Some(MidiMessage::pitch_bend(2, 3000)));
        assert_eq!(t.current_note(), 44);

        let out = t.transform(&MidiMessage::note_on(2, 41, 100)).unwrap();
        assert_eq!(out.and_then(|m| m.bend_value()), Some(0));
        assert_eq!(t.current_note(), 41);
    }

    #[test]
    fn test_unplayable_note_on_is_dropped() {
        let t = ready(2);
        t.transform(&MidiMessage::note_on(2, 44, 100)).unwrap();
        assert_eq!(t.transform(&MidiMessage::note_on(2, 40, 100)).unwrap(), None);
        assert_eq!(t.transform(&MidiMessage::note_on(2, 90, 100)).unwrap(), None);
        // Dropped notes do not move the latch.
        assert_eq!(t.current_note(), 44);
    }

    #[test]
    fn test_other_traffic_passes_through() {
        let t = ready(2);
        let other_channel = MidiMessage::note_on(3, 44, 100);
        assert_eq!(t.transform(&other_channel).unwrap(), Some(other_channel));
        let control = MidiMessage::from_bytes(&[0xB1, 7, 100]);
        assert_eq!(t.transform(&control).unwrap(), Some(control));
    }

    #[test]
    fn test_pitch_bend_zones() {
        let t = ready(1);
        t.transform(&MidiMessage::note_on(1, 45, 100)).unwrap();

        // Centre: exactly the current note.
        let out = t.transform(&MidiMessage::pitch_bend(1, 8192)).unwrap().unwrap();
        assert_eq!(out.bend_value(), Some(4000));
        // Half way into the top zone: between notes 46 and 47.
        let out = t
            .transform(&MidiMessage::pitch_bend(1, 3 * 4096 + 2048))
            .unwrap()
            .unwrap();
        assert_eq!(out.bend_value(), Some(5500));
        // Bottom of the range: two semitones down.
        let out = t.transform(&MidiMessage::pitch_bend(1, 0)).unwrap().unwrap();
        assert_eq!(out.bend_value(), Some(2000));
    }

    #[test]
    fn test_pitch_bend_reads_sentinels_raw() {
        let t = ready(1);
        // No note-on yet: the latch is note 0, whose neighbours are all invalid.
        let out = t.transform(&MidiMessage::pitch_bend(1, 8192)).unwrap().unwrap();
        assert_eq!(out.bend_value(), Some(INVALID_RAW));
    }

    #[test]
    fn test_uninitialised_rejected() {
        let t = PitchBendTransformer::new(4);
        let err = t.transform(&MidiMessage::note_on(4, 44, 100)).unwrap_err();
        assert!(matches!(err, Error::UninitializedTransform { channel: 4 }));

        let router = MidiRouter::new(vec![Arc::new(t)]);
        let msg = MidiMessage::note_on(4, 44, 100);
        assert_eq!(router.route(&msg), Some(msg));
    }

    #[test]
    fn test_router_dispatch() {
        let router = MidiRouter::new(vec![Arc::new(ready(1)), Arc::new(ready(2))]);
        assert_eq!(
            router.route(&MidiMessage::note_on(2, 42, 100)),
            Some(MidiMessage::pitch_bend(2, 1000))
        );
        assert_eq!(router.route(&MidiMessage::note_on(1, 40, 100)), None);
        let stray = MidiMessage::note_on(9, 42, 100);
        assert_eq!(router.route(&stray), Some(stray));
    }
}
