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

//! Runtime settings.
//!
//! Every field has a default, so an empty JSON object is a valid configuration.
//!
//! ```
//! # use sonance::config::RuntimeConfig;
//! let config = RuntimeConfig::from_json_str(r#"{ "sched_ahead_time": 0.2 }"#)?;
//! assert_eq!(config.sched_ahead_time, 0.2);
//! assert_eq!(config.num_audio_busses, 1024);
//! # Ok::<(), sonance::config::Error>(())
//! ```

use serde::{Deserialize, Serialize};
use std::{fs, io, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// UDP address of the `scsynth` process.
    pub scsynth_address: String,
    /// UDP address the GUI listens on.
    pub gui_address: String,
    /// Seconds between a trigger being scheduled and the engine playing it.
    pub sched_ahead_time: f64,
    /// Seconds added to a trigger's timestamp when it is sent with a control delta.
    pub control_delta: f64,
    pub num_audio_busses: usize,
    /// Busses below this index are hardware inputs and outputs.
    pub first_private_bus: usize,
    pub num_buffers: usize,
    /// Seconds over which a finished job's mixer fades out.
    pub job_fade_out: f64,
    /// Seconds an FX synth lingers after its block's synths finish, unless overridden.
    pub default_kill_delay: f64,
    /// Seconds between engine health checks.
    pub health_check_interval: f64,
    /// Seconds to wait for a reply from the engine.
    pub reply_timeout: f64,
    pub recording_bit_depth: u32,
    /// Global tuning offset in cents, applied to every note.
    pub cent_tuning: f64,
    pub samples_path: Option<PathBuf>,
    pub synthdefs_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            scsynth_address: "127.0.0.1:4556".to_owned(),
            gui_address: "127.0.0.1:4558".to_owned(),
            sched_ahead_time: 0.5,
            control_delta: 0.005,
            num_audio_busses: 1024,
            first_private_bus: 16,
            num_buffers: 4096,
            job_fade_out: 1.0,
            default_kill_delay: 1.0,
            health_check_interval: 5.0,
            reply_timeout: 5.0,
            recording_bit_depth: 16,
            cent_tuning: 0.0,
            samples_path: None,
            synthdefs_path: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(json: &str) -> Result<RuntimeConfig> {
        let config: RuntimeConfig = serde_json::from_str(json).map_err(Error::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
        let json = fs::read_to_string(path.as_ref()).map_err(Error::Read)?;
        RuntimeConfig::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Error::Serialize)
    }

    fn validate(&self) -> Result<()> {
        if self.first_private_bus >= self.num_audio_busses {
            return Err(Error::Invalid(format!(
                "first_private_bus ({}) must be below num_audio_busses ({})",
                self.first_private_bus, self.num_audio_busses
            )));
        }
        let durations = [
            ("sched_ahead_time", self.sched_ahead_time),
            ("control_delta", self.control_delta),
            ("job_fade_out", self.job_fade_out),
            ("default_kill_delay", self.default_kill_delay),
            ("health_check_interval", self.health_check_interval),
            ("reply_timeout", self.reply_timeout),
        ];
        for (name, value) in durations.iter() {
            if !value.is_finite() || *value < 0.0 {
                return Err(Error::Invalid(format!(
                    "{} must be a non-negative number of seconds, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    pub fn sched_ahead(&self) -> Duration {
        Duration::from_secs_f64(self.sched_ahead_time)
    }

    pub fn health_check_period(&self) -> Duration {
        Duration::from_secs_f64(self.health_check_interval)
    }

    pub fn reply_wait(&self) -> Duration {
        Duration::from_secs_f64(self.reply_timeout)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config file: {0}")]
    Read(io::Error),
    #[error("failed to deserialize config: {0}")]
    Deserialize(serde_json::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config = RuntimeConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.sched_ahead(), Duration::from_millis(500));
    }

    #[test]
    fn bus_layout_is_checked() {
        let err = RuntimeConfig::from_json_str(r#"{"num_audio_busses": 8}"#).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn negative_durations_are_rejected() {
        let err = RuntimeConfig::from_json_str(r#"{"job_fade_out": -1}"#).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn round_trips_through_json() {
        let mut config = RuntimeConfig::default();
        config.samples_path = Some(PathBuf::from("/opt/samples"));
        let json = config.to_json_string().unwrap();
        assert_eq!(RuntimeConfig::from_json_str(&json).unwrap(), config);
    }
}
