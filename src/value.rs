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

//! Dynamically typed argument values.
//!
//! User code passes synth options as loosely typed values: numbers, booleans, note names,
//! references to other options, lists of notes for chords, and functions evaluated at trigger
//! time. [`Value`] is the closed set of those shapes.

use std::{fmt, sync::Arc};

#[derive(Clone)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Nil,
    /// A note name such as `:e3`, or a reference to another option by name.
    Symbol(String),
    Text(String),
    List(Vec<Value>),
    /// Evaluated each time the value is resolved.
    Thunk(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl Value {
    pub fn sym(name: impl Into<String>) -> Value {
        Value::Symbol(name.into())
    }

    pub fn text(text: impl Into<String>) -> Value {
        Value::Text(text.into())
    }

    pub fn thunk<F>(f: F) -> Value
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Value::Thunk(Arc::new(f))
    }

    pub fn list<I, T>(items: I) -> Value
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::List(items.into_iter().map(T::into).collect())
    }

    /// Evaluates thunks until a plain value remains.
    pub fn resolve(&self) -> Value {
        match self {
            Value::Thunk(f) => f().resolve(),
            other => other.clone(),
        }
    }

    /// The numeric reading of a value. Booleans read as 1 and 0.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(x) => Some(*x),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Thunk(_) => self.resolve().as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Symbol(s) | Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_list_like(&self) -> bool {
        matches!(self, Value::List(_))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Zero, `false` and `nil` are falsy. Thunks are judged by what they return.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Number(x) => *x != 0.0,
            Value::Bool(b) => *b,
            Value::Nil => false,
            Value::Thunk(_) => self.resolve().is_truthy(),
            _ => true,
        }
    }

    /// `nil`, `:r` and `:rest` are rests.
    pub fn is_rest(&self) -> bool {
        match self {
            Value::Nil => true,
            Value::Symbol(s) => s == "r" || s == "rest",
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Thunk(a), Value::Thunk(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Formats values the way they are shown to the user: numbers rounded to four places, symbols
/// with a leading colon.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(x) => write!(f, "{}", format_number(*x)),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Nil => write!(f, "nil"),
            Value::Symbol(s) => write!(f, ":{}", s),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Thunk(_) => write!(f, "#<fn>"),
        }
    }
}

pub fn format_number(x: f64) -> String {
    let rounded = (x * 10_000.0).round() / 10_000.0;
    if rounded.fract() == 0.0 && rounded.abs() < 1e15 {
        format!("{:.1}", rounded)
    } else {
        format!("{}", rounded)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Value {
        Value::Number(x)
    }
}

impl From<f32> for Value {
    fn from(x: f32) -> Value {
        Value::Number(x as f64)
    }
}

impl From<i32> for Value {
    fn from(x: i32) -> Value {
        Value::Number(x as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

/// Bare strings are symbols, matching how note names and option references are written.
impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Symbol(s.to_owned())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Value {
        Value::list(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Value {
        value.map(Into::into).unwrap_or(Value::Nil)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(Value::from(1).is_truthy());
        assert!(!Value::from(0).is_truthy());
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::thunk(|| false.into()).is_truthy());
        assert!(Value::sym("foo").is_truthy());
    }

    #[test]
    fn thunks_resolve_to_numbers() {
        let v = Value::thunk(|| Value::thunk(|| 3.5.into()));
        assert_eq!(v.as_f64(), Some(3.5));
        assert_eq!(Value::from(true).as_f64(), Some(1.0));
        assert_eq!(Value::sym("e3").as_f64(), None);
    }

    #[test]
    fn display_rounds_numbers() {
        assert_eq!(Value::from(60).to_string(), "60.0");
        assert_eq!(Value::from(0.123456).to_string(), "0.1235");
        assert_eq!(Value::list(vec![1, 2]).to_string(), "[1.0, 2.0]");
        assert_eq!(Value::sym("beep").to_string(), ":beep");
    }

    #[test]
    fn rests() {
        assert!(Value::Nil.is_rest());
        assert!(Value::sym("r").is_rest());
        assert!(Value::sym("rest").is_rest());
        assert!(!Value::from(60).is_rest());
    }
}
