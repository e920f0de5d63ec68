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

//! The sound-triggering core of a live-coding music environment, driving
//! [SuperCollider](https://supercollider.github.io/) over OSC.
//!
//! # Introduction
//!
//! Music is written as ordinary Rust closures called *jobs*. A job plays notes, samples and
//! effects against a [`Context`], and sleeps in beats between them. The runtime turns each
//! trigger into an OSC bundle time-stamped a little ahead of the wall clock, so that a job which
//! keeps up with its own logical time sounds exactly in time regardless of scheduling jitter.
//!
//! The crate is organised in layers:
//!
//! * [`server`] - OSC commands and the [`Transport`](server::Transport) trait, with a UDP client
//!   for `scsynth` and an in-process [`Loopback`](server::Loopback) used by the test-suite.
//!
//! * [`studio`] - the engine's node tree: groups, busses, synths, samples and the master mixer.
//!   [`node`], [`bus`] and [`tracker`] hold the handles it hands out.
//!
//! * [`clock`] - logical time. Each thread keeps its own logical clock that only moves when the
//!   thread sleeps.
//!
//! * [`runtime`], [`context`] and [`jobs`] - jobs, their threads, per-thread musical state and
//!   the per-job group, bus and mixer every job plays through.
//!
//! * [`Context`] methods such as [`play`](Context::play), [`sample`](Context::sample) and
//!   [`with_fx`](Context::with_fx) - argument resolution, timing checks and the FX routing scopes.
//!
//! * [`messages`] - the log lines, errors and job events shown to the user, relayed to a GUI.
//!
//! # Example
//!
//! ```no_run
//! use sonance::{args, config::RuntimeConfig, messages::OscGuiSink, server::Server, Runtime};
//! use std::sync::Arc;
//!
//! let config = RuntimeConfig::from_file("sonance.json")?;
//! let gui = OscGuiSink::connect(&config.gui_address)?;
//! let server = Server::connect(&config.scsynth_address)?;
//! let runtime = Runtime::new(Arc::new(server), config, gui)?;
//!
//! runtime.run_job(|ctx| {
//!     ctx.use_bpm(120.0)?;
//!     ctx.with_fx("reverb", args! {room: 0.8}, |ctx, _fx| {
//!         for _ in 0..4 {
//!             ctx.play("e3", args! {release: 0.2})?;
//!             ctx.sleep(0.5)?;
//!         }
//!         Ok(())
//!     })
//! })?
//! .join();
//! runtime.shutdown()?;
//! # Ok::<(), sonance::Error>(())
//! ```

pub mod args;
pub mod bus;
pub mod clock;
pub mod config;
pub mod context;
mod error;
mod fx;
pub mod jobs;
pub mod messages;
pub mod node;
pub mod note;
pub mod promise;
pub mod runtime;
pub mod sampler;
pub mod server;
pub mod studio;
pub mod synth_info;
pub mod tracker;
mod trigger;
pub mod tuning;
pub mod value;

pub use context::Context;
pub use error::{Error, Result};
pub use node::SoundHandle;
pub use runtime::{JobHandle, Runtime};
pub use value::Value;
