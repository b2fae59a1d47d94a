//! # Musical Tuning Module
//!
//! MIDI note helpers used when reporting what a string was found to be tuned
//! to: equal-temperament frequencies (A4 = 440 Hz), note names and cent
//! deviations.

use once_cell::sync::Lazy;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Equal-temperament frequency of every MIDI note, computed once.
static MIDI_FREQUENCIES: Lazy<[f64; 128]> = Lazy::new(|| {
    let mut freqs = [0.0; 128];
    for (note, freq) in freqs.iter_mut().enumerate() {
        *freq = 440.0 * 2.0_f64.powf((note as f64 - 69.0) / 12.0);
    }
    freqs
});

/// Frequency of a MIDI note in Hz. Notes above 127 are clamped.
pub fn note_frequency(note: u8) -> f64 {
    MIDI_FREQUENCIES[note.min(127) as usize]
}

/// Name of a MIDI note, e.g. `E2` for 40.
pub fn note_name(note: u8) -> String {
    let octave = (note / 12) as i32 - 1;
    format!("{}{}", NOTE_NAMES[(note % 12) as usize], octave)
}

/// Closest MIDI note to a frequency, or `None` outside the MIDI range.
pub fn nearest_note(freq: f64) -> Option<u8> {
    if !(freq.is_finite() && freq > 0.0) {
        return None;
    }
    let note = (69.0 + 12.0 * (freq / 440.0).log2()).round();
    (0.0..=127.0).contains(&note).then_some(note as u8)
}

/// Deviation from a target frequency in cents; positive is sharp.
pub fn calculate_cents_deviation(freq: f64, target_freq: f64) -> f64 {
    1200.0 * (freq / target_freq).log2()
}

/// Short human description of a detected pitch, e.g. `82.60 Hz (E2 +4.2 cents)`.
pub fn describe_pitch(freq: f64) -> String {
    match nearest_note(freq) {
        Some(note) => format!(
            "{:.2} Hz ({} {:+.1} cents)",
            freq,
            note_name(note),
            calculate_cents_deviation(freq, note_frequency(note))
        ),
        None => format!("{freq:.2} Hz"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_note_mapping() {
        let cases = [(440.0, "A4"), (82.41, "E2"), (261.63, "C4"), (110.0, "A2")];
        for (freq, expected) in cases {
            let note = nearest_note(freq).unwrap();
            assert_eq!(note_name(note), expected);
            assert!(calculate_cents_deviation(freq, note_frequency(note)).abs() < 1.0);
        }
    }

    #[test]
    fn test_note_frequency() {
        assert_abs_diff_eq!(note_frequency(69), 440.0, epsilon = 1e-9);
        assert_abs_diff_eq!(note_frequency(81), 880.0, epsilon = 1e-9);
        assert_eq!(note_frequency(200), note_frequency(127));
    }

    #[test]
    fn test_out_of_range() {
        assert_eq!(nearest_note(f64::NAN), None);
        assert_eq!(nearest_note(0.0), None);
        assert_eq!(nearest_note(50_000.0), None);
        assert_eq!(describe_pitch(f64::NAN), "NaN Hz");
    }
}
