//! # Calibration Interpolation Module
//!
//! Turns a measured open-string pitch into the note-key table a string uses
//! to rewrite MIDI.
//!
//! 1. The two calibration runs whose fundamentals bracket the measured pitch
//!    are blended linearly into a *derived curve*: what each virtual fret
//!    produces at the string's current tuning.
//! 2. Every target frequency is located on the derived curve and the
//!    pitch-bend values recorded for the neighbouring frets are blended the
//!    same way, giving one table entry per MIDI note above the string's base.
//!
//! Pitches outside the calibrated range are extrapolated from the two nearest
//! runs, and targets beyond the top of the derived curve continue the slope of
//! the last two entries. Both are crude and are kept that way on purpose; they
//! are logged when they happen.

use tracing::{debug, warn};

use crate::calibration::CalibrationBundle;
use crate::midi::MAX_BEND;

/// Notes covered above the base note: two octaves, both ends included.
pub const NOTE_WINDOW: usize = 25;

/// Relative distance from the open pitch within which a target counts as open.
pub const OPEN_TOLERANCE: f64 = 0.001;

/// Pitch-bend sent for a note that is the open string.
pub const OPEN_BEND: u16 = 0;

/// Value an invalid entry reads as when a pitch-bend zone uses it unchecked.
pub const INVALID_RAW: u16 = 0xFF;
/// Value an off-string entry reads as when a pitch-bend zone uses it unchecked.
pub const OFF_STRING_RAW: u16 = 0xFE;

/// One entry of the note-key table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NoteKey {
    /// Not playable on this string (below the open pitch, or never filled).
    #[default]
    Invalid,
    /// Between the open pitch and the first fret; nothing can sound it.
    OffString,
    /// The open string itself.
    Open,
    /// A 14-bit pitch-bend value.
    Bend(u16),
}

impl NoteKey {
    /// Pitch-bend to send for a note-on, if the note can be played.
    pub fn bend(self) -> Option<u16> {
        match self {
            NoteKey::Bend(value) => Some(value),
            NoteKey::Open => Some(OPEN_BEND),
            NoteKey::Invalid | NoteKey::OffString => None,
        }
    }

    /// The entry as a number, sentinels included.
    pub fn raw(self) -> u16 {
        match self {
            NoteKey::Bend(value) => value,
            NoteKey::Open => OPEN_BEND,
            NoteKey::Invalid => INVALID_RAW,
            NoteKey::OffString => OFF_STRING_RAW,
        }
    }
}

/// MIDI note number → [`NoteKey`], every note starting out invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteKeyTable {
    keys: [NoteKey; 128],
}

impl Default for NoteKeyTable {
    fn default() -> Self {
        Self {
            keys: [NoteKey::Invalid; 128],
        }
    }
}

impl NoteKeyTable {
    /// Entry for `note`; anything outside 0..=127 is invalid.
    pub fn get(&self, note: i32) -> NoteKey {
        usize::try_from(note)
            .ok()
            .and_then(|n| self.keys.get(n))
            .copied()
            .unwrap_or_default()
    }

    pub fn set(&mut self, note: u8, key: NoteKey) {
        if let Some(slot) = self.keys.get_mut(note as usize) {
            *slot = key;
        }
    }

    /// Notes whose entry is not [`NoteKey::Invalid`].
    pub fn populated(&self) -> impl Iterator<Item = (u8, NoteKey)> + '_ {
        self.keys
            .iter()
            .enumerate()
            .filter(|(_, key)| **key != NoteKey::Invalid)
            .map(|(note, key)| (note as u8, *key))
    }
}

/// The measurement curve blended for one measured pitch.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedCurve {
    /// Index of the lower bracketing fundamental.
    pub below: usize,
    /// Index of the upper bracketing fundamental.
    pub above: usize,
    /// Position of the pitch between them; outside `0..=1` when extrapolating.
    pub fraction: f64,
    pub values: Vec<f64>,
}

/// Linear blend that returns the end points exactly at 0 and 1.
fn lerp(a: f64, b: f64, c: f64) -> f64 {
    if c == 1.0 { b } else { a + c * (b - a) }
}

/// Indices of the fundamentals bracketing `pitch`.
///
/// `below` is the largest fundamental not above the pitch and `above` the
/// smallest one over it. Outside the calibrated range the two nearest runs
/// are used instead.
fn bracket(fundamentals: &[f64], pitch: f64) -> Option<(usize, usize)> {
    let mut below: Option<usize> = None;
    let mut above: Option<usize> = None;
    for (i, &f) in fundamentals.iter().enumerate() {
        if f <= pitch {
            if below.is_none_or(|b| f > fundamentals[b]) {
                below = Some(i);
            }
        } else if above.is_none_or(|a| f < fundamentals[a]) {
            above = Some(i);
        }
    }

    let by_distance = |skip: usize| {
        (0..fundamentals.len())
            .filter(|&i| i != skip)
            .min_by(|&a, &b| {
                (fundamentals[a] - pitch)
                    .abs()
                    .total_cmp(&(fundamentals[b] - pitch).abs())
            })
    };

    match (below, above) {
        (Some(b), Some(a)) => Some((b, a)),
        (None, Some(a)) => {
            warn!("Pitch {pitch:.2} Hz is below every calibration run, extrapolating");
            by_distance(a).map(|next| (a, next))
        }
        (Some(b), None) => {
            if fundamentals[b] != pitch {
                warn!("Pitch {pitch:.2} Hz is above every calibration run, extrapolating");
            }
            by_distance(b).map(|prev| (prev, b))
        }
        (None, None) => None,
    }
}

/// Blends the measurement curves of the runs bracketing `pitch`.
///
/// Returns `None` for a pitch that is not a finite number or a bundle with
/// fewer than two runs.
pub fn derive_curve(bundle: &CalibrationBundle, pitch: f64) -> Option<DerivedCurve> {
    if !pitch.is_finite() {
        return None;
    }
    let (below, above) = bracket(&bundle.fundamentals, pitch)?;
    let (f_below, f_above) = (bundle.fundamentals[below], bundle.fundamentals[above]);
    let fraction = (pitch - f_below) / (f_above - f_below);

    let values = bundle.measurements[below]
        .iter()
        .zip(&bundle.measurements[above])
        .map(|(&lo, &hi)| lerp(lo, hi, fraction))
        .collect();

    Some(DerivedCurve {
        below,
        above,
        fraction,
        values,
    })
}

fn to_bend(value: f64) -> u16 {
    value.round().clamp(0.0, MAX_BEND as f64) as u16
}

/// Builds the note-key table for a string whose open pitch is `pitch`.
///
/// Target `i` becomes the entry for note `bundle.number + i`, for the first
/// [`NOTE_WINDOW`] targets.
pub fn build_note_key_table(
    bundle: &CalibrationBundle,
    pitch: f64,
    derived: &[f64],
) -> NoteKeyTable {
    let mut table = NoteKeyTable::default();
    let top = derived.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let bends = &bundle.pitch_bends;

    let mut cursor = 0;
    // The last two pitch-bend values written, oldest first.
    let mut filled: (Option<u16>, Option<u16>) = (None, None);

    let extrapolate = |filled: (Option<u16>, Option<u16>)| match filled {
        (Some(prev), Some(last)) => {
            let next = 2 * last as i32 - prev as i32;
            NoteKey::Bend(next.clamp(0, MAX_BEND as i32) as u16)
        }
        _ => NoteKey::Invalid,
    };

    for (i, &target) in bundle.targets.iter().enumerate().take(NOTE_WINDOW) {
        let Some(note) = u8::try_from(bundle.number as usize + i)
            .ok()
            .filter(|n| *n < 128)
        else {
            break;
        };

        let key = if target < pitch {
            NoteKey::Invalid
        } else if target > top {
            extrapolate(filled)
        } else {
            while cursor < derived.len() && derived[cursor] < target {
                cursor += 1;
            }
            if cursor == 0 {
                if (target - pitch).abs() <= OPEN_TOLERANCE * pitch {
                    NoteKey::Open
                } else {
                    NoteKey::OffString
                }
            } else if cursor >= bends.len() {
                extrapolate(filled)
            } else {
                let (lo, hi) = (derived[cursor - 1], derived[cursor]);
                let c = (target - lo) / (hi - lo);
                let value = lerp(bends[cursor - 1] as f64, bends[cursor] as f64, c);
                NoteKey::Bend(to_bend(value))
            }
        };

        if let NoteKey::Bend(value) = key {
            filled = (filled.1, Some(value));
        }
        table.set(note, key);
    }

    table
}

/// Everything one calibration pass produces for a string.
#[derive(Debug, Clone)]
pub struct Interpolation {
    pub derived: DerivedCurve,
    pub table: NoteKeyTable,
}

/// Derives the curve for `pitch` and builds the string's note-key table from it.
pub fn interpolate(bundle: &CalibrationBundle, pitch: f64) -> Option<Interpolation> {
    let derived = derive_curve(bundle, pitch)?;
    let table = build_note_key_table(bundle, pitch, &derived.values);
    debug!(
        "String {}: fraction {:.3} between runs {} and {}, {} playable notes",
        bundle.number,
        derived.fraction,
        derived.below,
        derived.above,
        table.populated().filter(|(_, k)| k.bend().is_some()).count()
    );
    Some(Interpolation { derived, table })
}
