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

//! Synth arguments and the passes that resolve them into numbers.
//!
//! Arguments keep the order they were given in, so that the descriptions shown to the user read
//! the way the user wrote them.
//!
//! ```
//! use sonance::{args, args::normalise};
//!
//! let mut opts = args! {amp: true, decay_level: "sustain_level", sustain_level: 0.5};
//! normalise(&mut opts, &args! {})?;
//! assert_eq!(opts.to_string(), "{amp: 1.0, decay_level: 0.5, sustain_level: 0.5}");
//! # Ok::<(), sonance::Error>(())
//! ```

use crate::{
    error::{Error, Result},
    note,
    synth_info::SynthInfo,
    value::Value,
};
use std::{fmt, iter::FromIterator};

/// Builds an [`Args`] from `name: value` pairs.
#[macro_export]
macro_rules! args {
    () => {
        $crate::args::Args::new()
    };
    ($($name:ident : $value:expr),+ $(,)?) => {{
        let mut args = $crate::args::Args::new();
        $( args.insert(stringify!($name), $value); )+
        args
    }};
}

/// An insertion-ordered map of argument names to values.
#[derive(Clone, Default, PartialEq)]
pub struct Args(Vec<(String, Value)>);

impl Args {
    pub fn new() -> Args {
        Args(Vec::new())
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Args {
        self.insert(name, value);
        self
    }

    /// Sets an argument, keeping its position if it was already present.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(key, _)| *key == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.0.push((name, value));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let position = self.0.iter().position(|(key, _)| key == name)?;
        Some(self.0.remove(position).1)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Fills in every argument missing here from `defaults`. Arguments already present win.
    pub fn merge_defaults(&mut self, defaults: &Args) {
        for (name, value) in defaults.iter() {
            if !self.contains(name) && !value.is_nil() {
                self.insert(name, value.clone());
            }
        }
    }

    /// `self` with every argument in `overrides` applied on top.
    pub fn merged(&self, overrides: &Args) -> Args {
        let mut merged = self.clone();
        for (name, value) in overrides.iter() {
            merged.insert(name, value.clone());
        }
        merged
    }

    pub fn purge_nils(&mut self) {
        self.0.retain(|(_, value)| !value.is_nil());
    }

    /// The numeric arguments, for sending to the engine.
    pub fn numbers(&self) -> Vec<(String, f64)> {
        self.0
            .iter()
            .filter_map(|(key, value)| value.as_f64().map(|x| (key.clone(), x)))
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for Args
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Args {
        let mut args = Args::new();
        for (name, value) in iter {
            args.insert(name, value);
        }
        args
    }
}

/// Prints as `{note: 60.0, release: 2.0}`, skipping `nil` values.
impl fmt::Display for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for (name, value) in self.iter().filter(|(_, value)| !value.is_nil()) {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}: {}", name, value)?;
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Turns every argument into a number.
///
/// Booleans become 1 or 0 and thunks are evaluated. A symbol names another argument and takes
/// its value, looked up first in `args` and then in `defaults`, one level deep. `nil` arguments
/// are dropped.
pub fn normalise(args: &mut Args, defaults: &Args) -> Result<()> {
    let snapshot = args.clone();
    let mut normalised = Args::new();
    for (name, value) in snapshot.iter() {
        let value = value.resolve();
        let number = match &value {
            Value::Nil => continue,
            Value::Number(x) => *x,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Symbol(reference) => snapshot
                .get_f64(reference)
                .or_else(|| defaults.get_f64(reference))
                .ok_or_else(|| unnormalisable(name, &value))?,
            _ => return Err(unnormalisable(name, &value)),
        };
        normalised.insert(name, number);
    }
    *args = normalised;
    Ok(())
}

fn unnormalisable(name: &str, value: &Value) -> Error {
    Error::invalid(format!(
        "Unable to normalise argument with key :{} and value {}",
        name, value
    ))
}

/// Derives `sustain` from `duration` when only the latter is given.
pub fn calculate_sustain(args: &mut Args) {
    if !args.contains("duration") || args.contains("sustain") {
        return;
    }
    let time = |name: &str| args.get_f64(name).unwrap_or(0.0);
    let envelope = time("attack") + time("decay") + time("release");
    let duration = time("duration");
    args.insert("sustain", (duration - envelope).max(0.0));
    args.remove("duration");
}

/// Stretches time arguments by the thread's sleep multiplier.
///
/// With `force_add`, every time argument the synth declares is scaled, falling back to the
/// synth's default when it was not given. A scaled default is only added when it differs from
/// the unscaled default. Otherwise only the arguments present are scaled.
pub fn scale_time_args_to_bpm(args: &mut Args, info: &SynthInfo, sleep_mul: f64, force_add: bool) {
    let defaults = info.arg_defaults();
    let mut scaled = Args::new();
    for name in info.bpm_scale_args() {
        if force_add {
            let mut value = args
                .get(name)
                .cloned()
                .or_else(|| defaults.get(name).cloned());
            if let Some(Value::Symbol(reference)) = &value {
                value = args
                    .get(reference)
                    .cloned()
                    .or_else(|| defaults.get(reference).cloned());
            }
            let x = match value.and_then(|value| value.as_f64()) {
                Some(x) => x,
                None => continue,
            };
            let x = x * sleep_mul;
            if args.contains(name) || defaults.get_f64(name) != Some(x) {
                scaled.insert(name, x);
            }
        } else if let Some(x) = args.get_f64(name) {
            scaled.insert(name, x * sleep_mul);
        }
    }
    for (name, value) in scaled.iter() {
        args.insert(name, value.clone());
    }
}

/// Gives every slide argument the synth declares the value of `slide`, unless it was set.
pub fn add_arg_slide_times(args: &mut Args, info: &SynthInfo) {
    let slide = match args.get("slide") {
        Some(slide) if !slide.is_nil() => slide.clone(),
        _ => return,
    };
    for name in info.slide_args() {
        if !args.contains(name) {
            args.insert(name, slide.clone());
        }
    }
}

/// Converts note names in the synth's note arguments to MIDI numbers.
pub fn resolve_midi_args(args: &mut Args, info: &SynthInfo) -> Result<()> {
    for name in info.midi_args() {
        let value = match args.get(name) {
            Some(value) => value.clone(),
            None => continue,
        };
        match note::note(&value)? {
            Some(n) => {
                args.insert(*name, n);
            }
            None => {
                args.remove(name);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;

    #[test]
    fn insertion_order_is_kept() {
        let mut args = args! {release: 2, note: 60};
        args.insert("release", 3);
        assert_eq!(args.to_string(), "{release: 3.0, note: 60.0}");
    }

    #[test]
    fn display_skips_nils_and_rounds() {
        let args = args! {amp: 0.333333, pan: Value::Nil, synth: "beep"};
        assert_eq!(args.to_string(), "{amp: 0.3333, synth: :beep}");
    }

    #[test]
    fn normalises_references_booleans_and_thunks() {
        let mut args = args! {
            a: Value::thunk(|| 2.into()),
            b: false,
            c: "sustain_level",
            d: Value::Nil,
        };
        normalise(&mut args, &args! {sustain_level: 0.7}).unwrap();
        assert_eq!(args, args! {a: 2, b: 0, c: 0.7});
    }

    #[test]
    fn unknown_references_are_errors() {
        let mut args = args! {c: "nowhere"};
        assert!(normalise(&mut args, &args! {}).is_err());
        let mut args = args! {c: Value::text("text")};
        assert!(normalise(&mut args, &args! {}).is_err());
    }

    #[test]
    fn sustain_fills_the_duration() {
        let mut args = args! {duration: 3, attack: 0.5, release: 1};
        calculate_sustain(&mut args);
        assert_eq!(args.get_f64("sustain"), Some(1.5));
        assert!(!args.contains("duration"));

        let mut args = args! {duration: 1, release: 2};
        calculate_sustain(&mut args);
        assert_eq!(args.get_f64("sustain"), Some(0.0));

        let mut args = args! {duration: 1, sustain: 2};
        calculate_sustain(&mut args);
        assert_eq!(args.get_f64("sustain"), Some(2.0));
    }

    #[test]
    fn bpm_scaling() {
        let beep = SynthInfo::get("beep").unwrap();

        let mut args = args! {release: 2};
        scale_time_args_to_bpm(&mut args, beep, 0.5, true);
        assert_eq!(args.get_f64("release"), Some(1.0));
        // attack's default of zero is unchanged by scaling, so it is not added
        assert!(!args.contains("attack"));

        let mut args = args! {amp_slide: 1};
        scale_time_args_to_bpm(&mut args, beep, 2.0, false);
        assert_eq!(args.get_f64("amp_slide"), Some(2.0));
        assert!(!args.contains("release"));
    }

    #[test]
    fn slide_fills_unset_slides() {
        let beep = SynthInfo::get("beep").unwrap();
        let mut args = args! {slide: 0.5, amp_slide: 2};
        add_arg_slide_times(&mut args, beep);
        assert_eq!(args.get_f64("note_slide"), Some(0.5));
        assert_eq!(args.get_f64("amp_slide"), Some(2.0));
    }

    #[test]
    fn note_names_resolve() {
        let beep = SynthInfo::get("beep").unwrap();
        let mut args = args! {note: "e3", cutoff: "c4"};
        resolve_midi_args(&mut args, beep).unwrap();
        assert_eq!(args, args! {note: 52, cutoff: 60});
    }
}
