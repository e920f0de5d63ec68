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

//! Alternative tuning systems.
//!
//! Notes are remapped relative to a fundamental pitch class: the semitone interval above the
//! fundamental selects a frequency ratio, which is converted back to a (fractional) MIDI pitch.

use crate::note::ratio_to_pitch;
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TuningSystem {
    Equal,
    Just,
    Pythagorean,
    Meantone,
}

const JUST: [f64; 12] = [
    1.0,
    16.0 / 15.0,
    9.0 / 8.0,
    6.0 / 5.0,
    5.0 / 4.0,
    4.0 / 3.0,
    45.0 / 32.0,
    3.0 / 2.0,
    8.0 / 5.0,
    5.0 / 3.0,
    9.0 / 5.0,
    15.0 / 8.0,
];

const PYTHAGOREAN: [f64; 12] = [
    1.0,
    256.0 / 243.0,
    9.0 / 8.0,
    32.0 / 27.0,
    81.0 / 64.0,
    4.0 / 3.0,
    729.0 / 512.0,
    3.0 / 2.0,
    128.0 / 81.0,
    27.0 / 16.0,
    16.0 / 9.0,
    243.0 / 128.0,
];

// Quarter-comma meantone.
const MEANTONE: [f64; 12] = [
    1.0, 1.0449, 1.1180, 1.1963, 1.25, 1.3375, 1.3975, 1.4953, 1.5625, 1.6719, 1.7889, 1.8692,
];

impl TuningSystem {
    fn ratios(self) -> Option<&'static [f64; 12]> {
        match self {
            TuningSystem::Equal => None,
            TuningSystem::Just => Some(&JUST),
            TuningSystem::Pythagorean => Some(&PYTHAGOREAN),
            TuningSystem::Meantone => Some(&MEANTONE),
        }
    }
}

impl FromStr for TuningSystem {
    type Err = String;

    fn from_str(name: &str) -> Result<TuningSystem, String> {
        match name {
            "equal" => Ok(TuningSystem::Equal),
            "just" => Ok(TuningSystem::Just),
            "pythagorean" => Ok(TuningSystem::Pythagorean),
            "meantone" => Ok(TuningSystem::Meantone),
            other => Err(format!("unknown tuning system: {}", other)),
        }
    }
}

impl fmt::Display for TuningSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TuningSystem::Equal => "equal",
            TuningSystem::Just => "just",
            TuningSystem::Pythagorean => "pythagorean",
            TuningSystem::Meantone => "meantone",
        };
        f.write_str(name)
    }
}

/// A tuning system anchored at a fundamental note.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tuning {
    pub system: TuningSystem,
    /// Any MIDI note of the fundamental's pitch class.
    pub fundamental: f64,
}

impl Default for Tuning {
    fn default() -> Tuning {
        Tuning {
            system: TuningSystem::Equal,
            fundamental: 60.0,
        }
    }
}

impl Tuning {
    pub fn new(system: TuningSystem, fundamental: f64) -> Tuning {
        Tuning {
            system,
            fundamental,
        }
    }

    /// Maps an equal-tempered MIDI note into this tuning. The fractional part of the note is
    /// kept as an offset on top of the retuned semitone.
    pub fn resolve(&self, note: f64) -> f64 {
        let ratios = match self.system.ratios() {
            Some(ratios) => ratios,
            None => return note,
        };
        let fundamental_class = self.fundamental.floor().rem_euclid(12.0);
        let whole = note.floor();
        let fraction = note - whole;

        let relative = whole - fundamental_class;
        let interval = relative.rem_euclid(12.0);
        let base = whole - interval;
        base + ratio_to_pitch(ratios[interval as usize]) + fraction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_temperament_is_identity() {
        assert_eq!(Tuning::default().resolve(61.5), 61.5);
    }

    #[test]
    fn just_intonation_from_c() {
        let just = Tuning::new(TuningSystem::Just, 60.0);
        assert!((just.resolve(62.0) - 62.039100017).abs() < 1e-6);
        assert_eq!(just.resolve(60.0), 60.0);
        assert_eq!(just.resolve(72.0), 72.0);
        assert!((just.resolve(64.0) - 63.863137139).abs() < 1e-6);
    }

    #[test]
    fn fundamental_shifts_the_intervals() {
        let just_d = Tuning::new(TuningSystem::Just, 62.0);
        assert_eq!(just_d.resolve(62.0), 62.0);
        assert!((just_d.resolve(64.0) - 64.039100017).abs() < 1e-6);
    }

    #[test]
    fn names_parse() {
        assert_eq!("pythagorean".parse(), Ok(TuningSystem::Pythagorean));
        assert!("wonky".parse::<TuningSystem>().is_err());
    }
}
