//! # Calibration File Module
//!
//! Reads the per-string calibration bundles recorded for each swivel string.
//! The format is line oriented: every tag sits on its own line and every list
//! of values sits on the single line between an opening and a closing tag.
//!
//! ```text
//! <swivelstring number="40">
//!   <measurements fundamental="82.4">
//!   82.4,87.3,92.5
//!   </measurements>
//!   <measurements fundamental="84.0">
//!   84.0,89.0,94.3
//!   </measurements>
//!   <targets>
//!   82.4,87.3,92.5
//!   </targets>
//!   <midimsbs>
//!   0,40,80
//!   </midimsbs>
//!   <midimessages>
//!     <message time="0.0">
//!     144,40,100
//!     </message>
//!   </midimessages>
//! </swivelstring>
//! ```
//!
//! Numbers are read leniently: attribute values have every non-digit trimmed
//! from both ends, and a token that is not a number reads as `0` (or as its
//! leading numeric part). Only the structural checks fail a parse.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ParseError, Result};
use crate::midi::{MidiMessage, MidiScript};

/// Everything recorded about one string during its calibration runs.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationBundle {
    /// Base MIDI note of the string; the note-key table starts here.
    pub number: u8,
    /// Open-string frequency of each calibration run, in Hz.
    pub fundamentals: Vec<f64>,
    /// One measured curve per fundamental, one value per virtual fret.
    pub measurements: Vec<Vec<f64>>,
    /// Desired frequency at each virtual fret, in Hz.
    pub targets: Vec<f64>,
    /// 14-bit pitch-bend values that produced the measurements.
    pub pitch_bends: Vec<u16>,
    /// Messages that excite the string while it is being listened to.
    pub script: MidiScript,
}

impl CalibrationBundle {
    /// 1-based MIDI channel owned by this string.
    pub fn channel(&self) -> Option<u8> {
        self.script.channel()
    }

    /// Lowest and highest calibration fundamentals.
    pub fn fundamental_range(&self) -> (f64, f64) {
        self.fundamentals
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &f| {
                (lo.min(f), hi.max(f))
            })
    }

    /// Checks the invariants every consumer of a bundle relies on.
    pub fn validate(&self) -> std::result::Result<(), ParseError> {
        let fail = |msg: String| Err(ParseError::new(0, msg));

        if self.pitch_bends.is_empty() {
            return fail("did not find any '<midimsbs>'".into());
        }
        if self.measurements.len() < 2 {
            return fail(format!(
                "need at least two '<measurements>' to work, found {}",
                self.measurements.len()
            ));
        }
        if self.fundamentals.len() != self.measurements.len() {
            return fail(format!(
                "found {} 'fundamental' attributes for {} '<measurements>'",
                self.fundamentals.len(),
                self.measurements.len()
            ));
        }
        if self.targets.is_empty() {
            return fail("did not find any '<targets>'".into());
        }
        if self.script.is_empty() {
            return fail("no '<midimessages>' found, nothing would make the string sound".into());
        }

        for (i, f) in self.fundamentals.iter().enumerate() {
            if self.fundamentals[..i].contains(f) {
                return fail(format!("fundamental {f} appears more than once"));
            }
        }

        let curve_len = self.measurements[0].len();
        if self.measurements.iter().any(|m| m.len() != curve_len) {
            return fail("'<measurements>' lists have different lengths".into());
        }
        if curve_len > self.targets.len() {
            return fail(format!(
                "measurements have {} points but there are only {} targets",
                curve_len,
                self.targets.len()
            ));
        }

        Ok(())
    }
}

/// Reads and parses every `<swivelstring>` element in a file.
pub fn parse_file(path: &Path) -> Result<Vec<CalibrationBundle>> {
    let text = std::fs::read_to_string(path)?;
    let bundles = parse_str(&text)?;
    debug!("Parsed {} string(s) from {:?}", bundles.len(), path);
    Ok(bundles)
}

/// Parses every `<swivelstring>` element in `text`, failing on the first bad one.
pub fn parse_str(text: &str) -> std::result::Result<Vec<CalibrationBundle>, ParseError> {
    let mut lines = LineReader::new(text);
    let mut bundles = Vec::new();

    while let Some((number, line)) = lines.next_non_blank() {
        bundles.push(parse_swivel_string(number, line, &mut lines)?);
    }

    if bundles.is_empty() {
        return Err(ParseError::new(0, "no '<swivelstring>' element found"));
    }
    Ok(bundles)
}

struct LineReader<'a> {
    lines: std::iter::Enumerate<std::str::Lines<'a>>,
    last: usize,
}

impl<'a> LineReader<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().enumerate(),
            last: 0,
        }
    }

    /// Next line, trimmed, with its 1-based number.
    fn next_line(&mut self) -> Option<(usize, &'a str)> {
        let (i, line) = self.lines.next()?;
        self.last = i + 1;
        Some((self.last, line.trim()))
    }

    fn next_non_blank(&mut self) -> Option<(usize, &'a str)> {
        loop {
            let (n, line) = self.next_line()?;
            if !line.is_empty() {
                return Some((n, line));
            }
        }
    }

    fn expect_line(&mut self, what: &str) -> std::result::Result<(usize, &'a str), ParseError> {
        self.next_line()
            .ok_or_else(|| ParseError::new(self.last, format!("file ended while expecting {what}")))
    }

    fn expect_close(&mut self, tag: &str) -> std::result::Result<(), ParseError> {
        let (n, line) = self.expect_line(tag)?;
        if line.eq_ignore_ascii_case(tag) {
            Ok(())
        } else {
            Err(ParseError::new(n, format!("expected '{tag}', got: {line}")))
        }
    }
}

fn parse_swivel_string(
    start: usize,
    tag: &str,
    lines: &mut LineReader<'_>,
) -> std::result::Result<CalibrationBundle, ParseError> {
    if !tag.starts_with("<swivelstring") {
        return Err(ParseError::new(start, "expected element to start with '<swivelstring'"));
    }
    let number_at = tag
        .find("number=")
        .ok_or_else(|| ParseError::new(start, "missing number attribute"))?;
    let number = leading_int(trim_to_number(&tag[number_at + "number=".len()..]));
    let number = u8::try_from(number)
        .ok()
        .filter(|n| *n < 128)
        .ok_or_else(|| ParseError::new(start, format!("string number {number} is not a MIDI note")))?;

    let mut bundle = CalibrationBundle {
        number,
        fundamentals: Vec::new(),
        measurements: Vec::new(),
        targets: Vec::new(),
        pitch_bends: Vec::new(),
        script: MidiScript::default(),
    };

    let end = loop {
        let (n, line) = lines
            .next_line()
            .ok_or_else(|| ParseError::new(lines.last, "missing '</swivelstring>' end tag"))?;

        if line.to_ascii_lowercase().ends_with("</swivelstring>") {
            break n;
        } else if line.is_empty() {
            continue;
        } else if line.starts_with("<measurements") {
            parse_measurements(n, line, lines, &mut bundle)?;
        } else if line.starts_with("<targets") {
            parse_targets(n, lines, &mut bundle)?;
        } else if line.starts_with("<midimsbs") {
            parse_midi_msbs(n, lines, &mut bundle)?;
        } else if line.starts_with("<midimessages") {
            parse_midi_messages(n, lines, &mut bundle)?;
        } else {
            return Err(ParseError::new(
                n,
                format!(
                    "expected 'measurements', 'targets', 'midimsbs' or 'midimessages' tag, got: {line}"
                ),
            ));
        }
    };

    bundle
        .validate()
        .map_err(|e| ParseError::new(end, e.message))?;
    Ok(bundle)
}

fn parse_measurements(
    n: usize,
    tag: &str,
    lines: &mut LineReader<'_>,
    bundle: &mut CalibrationBundle,
) -> std::result::Result<(), ParseError> {
    // Without the attribute name the trim still finds a number if one is there.
    let attr = match tag.find("fundamental=") {
        Some(at) => &tag[at + "fundamental=".len()..],
        None => &tag["<measurements".len()..],
    };
    let fundamental = leading_double(trim_to_number(attr));
    // 0 is also what an unparseable value reads as, so it cannot be allowed.
    if fundamental == 0.0 {
        return Err(ParseError::new(
            n,
            "couldn't find a number for the fundamental, or it is 0",
        ));
    }

    let (_, values) = lines.expect_line("measurement values")?;
    bundle.fundamentals.push(fundamental);
    bundle.measurements.push(parse_list(values, leading_double));
    lines.expect_close("</measurements>")
}

fn parse_targets(
    n: usize,
    lines: &mut LineReader<'_>,
    bundle: &mut CalibrationBundle,
) -> std::result::Result<(), ParseError> {
    if !bundle.targets.is_empty() {
        return Err(ParseError::new(n, "more than one '<targets>' tag in the element"));
    }
    let (_, values) = lines.expect_line("target values")?;
    bundle.targets = parse_list(values, leading_double);
    lines.expect_close("</targets>")
}

fn parse_midi_msbs(
    n: usize,
    lines: &mut LineReader<'_>,
    bundle: &mut CalibrationBundle,
) -> std::result::Result<(), ParseError> {
    if !bundle.pitch_bends.is_empty() {
        return Err(ParseError::new(n, "more than one '<midimsbs>' tag in the element"));
    }
    let (values_line, values) = lines.expect_line("pitch-bend MSBs")?;
    bundle.pitch_bends = parse_list(values, leading_int)
        .into_iter()
        .map(|v| {
            // Wraps like a byte; anything over 127 is not a data byte.
            let msb = v as u8;
            if msb > 0x7F {
                warn!("line {values_line}: MSB {v} does not fit in 7 bits, masking");
            }
            ((msb & 0x7F) as u16) << 7
        })
        .collect();
    lines.expect_close("</midimsbs>")
}

fn parse_midi_messages(
    n: usize,
    lines: &mut LineReader<'_>,
    bundle: &mut CalibrationBundle,
) -> std::result::Result<(), ParseError> {
    if !bundle.script.is_empty() {
        warn!("line {n}: more than one '<midimessages>' on this string, appending");
    }

    loop {
        let (n, line) = lines.expect_line("'</midimessages>'")?;
        if line.eq_ignore_ascii_case("</midimessages>") {
            return Ok(());
        }
        if !line.starts_with("<message") {
            return Err(ParseError::new(
                n,
                format!("expected a tag starting with '<message', got: {line}"),
            ));
        }
        let time = match line.find("time") {
            Some(at) => leading_double(trim_to_number(&line[at + "time".len()..])),
            None => 0.0,
        };
        let offset = Duration::try_from_secs_f64(time).unwrap_or(Duration::ZERO);

        let (bytes_line, bytes) = lines.expect_line("MIDI message bytes")?;
        let bytes: Vec<u8> = parse_list(bytes, leading_int)
            .into_iter()
            .map(|b| b as u8)
            .collect();
        if bytes.is_empty() || bytes.len() > 3 {
            return Err(ParseError::new(
                bytes_line,
                format!("a MIDI message needs one to three bytes, got {}", bytes.len()),
            ));
        }
        bundle.script.push(offset, MidiMessage::from_bytes(&bytes));

        lines.expect_close("</message>")?;
    }
}

/// Splits a comma separated line; an empty line is an empty list and a
/// trailing comma adds nothing.
fn parse_list<T>(line: &str, parse: fn(&str) -> T) -> Vec<T> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let line = line.strip_suffix(',').unwrap_or(line);
    line.split(',').map(|token| parse(token.trim())).collect()
}

/// Strips every non-digit from both ends of an attribute value.
fn trim_to_number(s: &str) -> &str {
    s.trim_matches(|c: char| !c.is_ascii_digit())
}

/// Integer value of the leading `[+-]digits` of `s`, or 0.
fn leading_int(s: &str) -> i64 {
    let s = s.trim_start();
    let (sign, digits) = match s.as_bytes().first() {
        Some(b'-') => (-1, &s[1..]),
        Some(b'+') => (1, &s[1..]),
        _ => (1, s),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().map(|v| sign * v).unwrap_or(0)
}

/// Value of the longest numeric prefix of `s`, or 0.
fn leading_double(s: &str) -> f64 {
    let s = s.trim_start();
    let candidate = s
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E')))
        .map_or(s, |end| &s[..end]);
    (1..=candidate.len())
        .rev()
        .find_map(|end| candidate[..end].parse::<f64>().ok())
        .unwrap_or(0.0)
}
