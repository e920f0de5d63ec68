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

//! The error type shared by the runtime.

use crate::{bus, config, messages, note, server};
use thiserror::Error;

/// A specialized [`Result`] type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while triggering sounds or running jobs.
///
/// Errors raised inside a job propagate up to the job's thread, where they are reported to the
/// GUI and end the job. Only [`Error::Killed`] is expected: it unwinds a job that has been
/// stopped.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Server(#[from] server::Error),
    #[error("all busses allocated: {0}")]
    Allocation(#[from] bus::AllocationError),
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Note(#[from] note::Error),
    #[error(transparent)]
    Messages(#[from] messages::Error),
    #[error("Timing Exception: thread got too far behind time.")]
    Timing,
    #[error("{0}")]
    InvalidArgument(String),
    #[error("Value of opt :{opt} for {synth} {message}")]
    ArgumentValidation {
        synth: String,
        opt: String,
        message: String,
    },
    #[error("Unknown synth :{0}")]
    UnknownSynth(String),
    #[error("Unknown FX :{0}")]
    UnknownFx(String),
    #[error("no sample found matching {0}")]
    SampleNotFound(String),
    #[error("failed to load sample {path}: {source}")]
    SampleLoad {
        path: String,
        #[source]
        source: server::Error,
    },
    #[error("recording file error: {0}")]
    Recording(#[source] std::io::Error),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("thread killed")]
    Killed,
    #[error("thread panicked: {0}")]
    Panicked(String),
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Error {
        Error::InvalidArgument(message.into())
    }

    pub fn is_killed(&self) -> bool {
        matches!(self, Error::Killed)
    }
}
