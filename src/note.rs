// Sonance
// Copyright (C) 2021  Wesley Merkel
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Note names, pitch conversions and small list helpers.
//!
//! Note names are a letter, an optional accidental (`s` or `#` for sharp, `b` or `f` for flat)
//! and an optional octave, defaulting to 4. Middle C, `:c4`, is MIDI note 60.
//!
//! ```
//! # use sonance::note::note_from_name;
//! assert_eq!(note_from_name("e3")?, 52.0);
//! assert_eq!(note_from_name("Fs4")?, 66.0);
//! assert_eq!(note_from_name("eb2")?, 39.0);
//! # Ok::<(), sonance::note::Error>(())
//! ```

use crate::value::Value;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("invalid note: {0}")]
    InvalidNote(String),
    #[error("expected a list of notes, got {0}")]
    NotAList(String),
}

/// Resolves a note value to a MIDI number. Rests resolve to `None`.
pub fn note(value: &Value) -> Result<Option<f64>> {
    match value.resolve() {
        Value::Number(n) => Ok(Some(n)),
        ref rest if rest.is_rest() => Ok(None),
        Value::Symbol(name) | Value::Text(name) => note_from_name(&name).map(Some),
        Value::List(ref items) if items.len() == 1 => note(&items[0]),
        other => Err(Error::InvalidNote(other.to_string())),
    }
}

pub fn note_from_name(name: &str) -> Result<f64> {
    let invalid = || Error::InvalidNote(name.to_owned());
    let mut chars = name.chars().peekable();

    let pitch_class: i32 = match chars.next().map(|c| c.to_ascii_lowercase()) {
        Some('c') => 0,
        Some('d') => 2,
        Some('e') => 4,
        Some('f') => 5,
        Some('g') => 7,
        Some('a') => 9,
        Some('b') => 11,
        _ => return Err(invalid()),
    };

    let accidental = match chars.peek().map(|c| c.to_ascii_lowercase()) {
        Some('s') | Some('#') => 1,
        Some('b') | Some('f') => -1,
        _ => 0,
    };
    if accidental != 0 {
        chars.next();
    }

    let rest: String = chars.collect();
    let octave: i32 = if rest.is_empty() {
        4
    } else {
        rest.parse().map_err(|_| invalid())?
    };

    Ok((pitch_class + accidental + (octave + 1) * 12) as f64)
}

pub fn midi_to_hz(note: f64) -> f64 {
    440.0 * 2.0_f64.powf((note - 69.0) / 12.0)
}

pub fn hz_to_midi(freq: f64) -> f64 {
    12.0 * (freq / 440.0).log2() + 69.0
}

/// The frequency ratio for a shift of `pitch` semitones.
pub fn pitch_to_ratio(pitch: f64) -> f64 {
    2.0_f64.powf(pitch / 12.0)
}

pub fn ratio_to_pitch(ratio: f64) -> f64 {
    12.0 * ratio.abs().log2()
}

/// Rotates a chord `shift` times, moving the wrapped note up (or down, for negative shifts) an
/// octave each time.
pub fn chord_invert(notes: &[f64], shift: i32) -> Vec<f64> {
    let mut notes = notes.to_vec();
    if notes.is_empty() {
        return notes;
    }
    for _ in 0..shift.max(0) {
        let first = notes.remove(0);
        notes.push(first + 12.0);
    }
    for _ in 0..(-shift).max(0) {
        if let Some(last) = notes.pop() {
            notes.push(last - 12.0);
        }
        notes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    }
    notes
}

/// `num_octaves` copies of `start`, an octave apart.
pub fn octs(start: f64, num_octaves: usize) -> Vec<f64> {
    (0..num_octaves).map(|i| start + 12.0 * i as f64).collect()
}

/// Indexes a list as a ring, wrapping in both directions.
pub fn ring_get<T>(items: &[T], index: i64) -> Option<&T> {
    if items.is_empty() {
        return None;
    }
    let len = items.len() as i64;
    items.get(index.rem_euclid(len) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_names() {
        assert_eq!(note_from_name("c").unwrap(), 60.0);
        assert_eq!(note_from_name("C4").unwrap(), 60.0);
        assert_eq!(note_from_name("a4").unwrap(), 69.0);
        assert_eq!(note_from_name("e1").unwrap(), 28.0);
        assert_eq!(note_from_name("Cs-1").unwrap(), 1.0);
        assert!(note_from_name("h2").is_err());
        assert!(note_from_name("c4x").is_err());
    }

    #[test]
    fn note_values() {
        assert_eq!(note(&Value::from(50)).unwrap(), Some(50.0));
        assert_eq!(note(&Value::sym("rest")).unwrap(), None);
        assert_eq!(note(&Value::Nil).unwrap(), None);
        assert_eq!(note(&Value::text("e3")).unwrap(), Some(52.0));
        assert_eq!(note(&Value::list(vec![62])).unwrap(), Some(62.0));
        assert!(note(&Value::Bool(true)).is_err());
    }

    #[test]
    fn frequencies() {
        assert!((midi_to_hz(60.0) - 261.6256).abs() < 1e-3);
        assert!((hz_to_midi(261.63) - 60.0003).abs() < 1e-3);
        assert_eq!(pitch_to_ratio(12.0), 2.0);
        assert_eq!(ratio_to_pitch(0.5), -12.0);
    }

    #[test]
    fn inversions() {
        let a_major = vec![57.0, 61.0, 64.0];
        assert_eq!(chord_invert(&a_major, 1), vec![61.0, 64.0, 69.0]);
        assert_eq!(chord_invert(&a_major, 2), vec![64.0, 69.0, 73.0]);
        assert_eq!(chord_invert(&a_major, 0), a_major);
        for k in 0..4 {
            assert_eq!(chord_invert(&chord_invert(&a_major, k), -k), a_major);
        }
    }

    #[test]
    fn rings_wrap() {
        let times = [1.0, 0.5];
        let slept: Vec<f64> = (0..4).map(|i| *ring_get(&times, i).unwrap()).collect();
        assert_eq!(slept, vec![1.0, 0.5, 1.0, 0.5]);
        assert_eq!(ring_get(&times, -1), Some(&0.5));
        assert_eq!(ring_get::<f64>(&[], 3), None);
    }
}
