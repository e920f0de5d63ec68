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

//! Static metadata about the synth definitions the runtime knows how to drive.
//!
//! Each [`SynthInfo`] lists a synth's argument defaults, which arguments are notes, which are
//! times that stretch with the BPM, how arguments are validated, and how long an FX should
//! linger once the sounds feeding it have finished.

use crate::{
    args::Args,
    error::{Error, Result},
    value::{format_number, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthKind {
    Synth,
    Fx,
    Sampler,
    LiveInput,
    Studio,
}

/// A default argument value: a number, or a reference to another argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgDefault {
    Num(f64),
    Ref(&'static str),
}

impl ArgDefault {
    pub fn to_value(self) -> Value {
        match self {
            ArgDefault::Num(x) => Value::Number(x),
            ArgDefault::Ref(name) => Value::sym(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Check {
    NonNegative,
    Positive,
    Between(f64, f64),
    LessThan(f64),
    OneOf(&'static [f64]),
}

impl Check {
    fn failure(&self, x: f64) -> Option<String> {
        let ok = match *self {
            Check::NonNegative => x >= 0.0,
            Check::Positive => x > 0.0,
            Check::Between(lo, hi) => x >= lo && x <= hi,
            Check::LessThan(max) => x < max,
            Check::OneOf(options) => options.contains(&x),
        };
        if ok {
            return None;
        }
        Some(match *self {
            Check::NonNegative => "must be zero or greater".to_owned(),
            Check::Positive => "must be greater than zero".to_owned(),
            Check::Between(lo, hi) => format!(
                "must be a value between {} and {} inclusively",
                format_number(lo),
                format_number(hi)
            ),
            Check::LessThan(max) => format!("must be a value less than {}", format_number(max)),
            Check::OneOf(options) => {
                let options: Vec<String> = options.iter().map(|x| format_number(*x)).collect();
                format!("must be one of the following values: [{}]", options.join(", "))
            }
        })
    }
}

/// How long an FX waits, after its block's synths have finished, before it is freed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KillDelay {
    /// The runtime's configured default.
    Standard,
    /// `arg * scale + offset`, using the argument's default when it was not given.
    FromArg {
        arg: &'static str,
        scale: f64,
        offset: f64,
    },
}

/// When a trigger for this synth is stamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// At the thread's logical time.
    Logical,
    /// Slightly ahead of the thread's logical time, so the synth exists before sounds triggered
    /// at the same logical time start writing to it.
    MinusDelta,
    /// Immediately.
    Now,
}

#[derive(Debug)]
pub struct SynthInfo {
    pub name: &'static str,
    pub kind: SynthKind,
    defaults: DefaultTables,
    midi_args: &'static [&'static str],
    bpm_scale_args: BpmScaling,
    validations: &'static [(&'static str, Check)],
    fixed_args: &'static [&'static str],
    pub kill_delay: KillDelay,
    pub clock: ClockMode,
}

#[derive(Debug, Clone, Copy)]
enum BpmScaling {
    /// The envelope times plus every slide time.
    EnvelopeAndSlides,
    /// Every slide time.
    Slides,
    /// Every slide time plus the named arguments.
    SlidesAnd(&'static [&'static str]),
}

impl SynthInfo {
    pub fn get(name: &str) -> Option<&'static SynthInfo> {
        SYNTHS.iter().find(|info| info.name == name)
    }

    /// The name of the synth definition on the engine.
    pub fn scsynth_name(&self) -> String {
        format!("sonic-pi-{}", self.name)
    }

    pub fn default_for(&self, arg: &str) -> Option<Value> {
        self.defaults
            .iter()
            .flat_map(|group| group.iter())
            .find(|(name, _)| *name == arg)
            .map(|(_, default)| default.to_value())
    }

    pub fn arg_defaults(&self) -> Args {
        let mut args = Args::new();
        for (name, default) in self.defaults.iter().flat_map(|group| group.iter()) {
            args.insert(*name, default.to_value());
        }
        args
    }

    pub fn arg_names(&self) -> impl Iterator<Item = &'static str> {
        self.defaults
            .iter()
            .flat_map(|group| group.iter())
            .map(|(name, _)| *name)
    }

    pub fn midi_args(&self) -> &'static [&'static str] {
        self.midi_args
    }

    pub fn slide_args(&self) -> impl Iterator<Item = &'static str> {
        self.arg_names().filter(|name| name.ends_with("_slide"))
    }

    pub fn bpm_scale_args(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = match self.bpm_scale_args {
            BpmScaling::EnvelopeAndSlides => vec!["attack", "decay", "sustain", "release"],
            BpmScaling::Slides => Vec::new(),
            BpmScaling::SlidesAnd(extra) => extra.to_vec(),
        };
        names.extend(self.slide_args());
        names
    }

    /// Checks every argument that has a validation rule.
    pub fn validate(&self, args: &Args) -> Result<()> {
        for (opt, check) in self.validations {
            if let Some(x) = args.get(opt).and_then(Value::as_f64) {
                if let Some(message) = check.failure(x) {
                    let message = format!("{}, got {}.", message, format_number(x));
                    return Err(self.validation_error(opt, message));
                }
            }
        }
        Ok(())
    }

    /// Like [`SynthInfo::validate`], and also rejects arguments that cannot change once the synth
    /// is running.
    pub fn ctl_validate(&self, args: &Args) -> Result<()> {
        for opt in self.fixed_args {
            if args.contains(opt) {
                return Err(self.validation_error(
                    opt,
                    "can not be changed once the synth has been triggered".to_owned(),
                ));
            }
        }
        self.validate(args)
    }

    fn validation_error(&self, opt: &str, message: String) -> Error {
        Error::ArgumentValidation {
            synth: format!("synth :{}", self.name),
            opt: opt.to_owned(),
            message,
        }
    }

    /// Seconds to wait before freeing an FX, or `None` for the runtime default.
    pub fn kill_delay(&self, args: &Args) -> Option<f64> {
        match self.kill_delay {
            KillDelay::Standard => None,
            KillDelay::FromArg { arg, scale, offset } => {
                let x = args
                    .get(arg)
                    .and_then(Value::as_f64)
                    .or_else(|| self.default_for(arg).and_then(|v| v.as_f64()))?;
                Some(x * scale + offset)
            }
        }
    }
}

use self::ArgDefault::{Num, Ref};

const NOTE: &[(&str, ArgDefault)] = &[
    ("note", Num(52.0)),
    ("note_slide", Num(0.0)),
    ("note_slide_shape", Num(1.0)),
    ("note_slide_curve", Num(0.0)),
];

const AMP: &[(&str, ArgDefault)] = &[
    ("amp", Num(1.0)),
    ("amp_slide", Num(0.0)),
    ("amp_slide_shape", Num(1.0)),
    ("amp_slide_curve", Num(0.0)),
];

const PAN: &[(&str, ArgDefault)] = &[
    ("pan", Num(0.0)),
    ("pan_slide", Num(0.0)),
    ("pan_slide_shape", Num(1.0)),
    ("pan_slide_curve", Num(0.0)),
];

const ENVELOPE: &[(&str, ArgDefault)] = &[
    ("attack", Num(0.0)),
    ("decay", Num(0.0)),
    ("sustain", Num(0.0)),
    ("release", Num(1.0)),
    ("attack_level", Num(1.0)),
    ("decay_level", Ref("sustain_level")),
    ("sustain_level", Num(1.0)),
    ("env_curve", Num(2.0)),
];

const CUTOFF: &[(&str, ArgDefault)] = &[
    ("cutoff", Num(100.0)),
    ("cutoff_slide", Num(0.0)),
    ("cutoff_slide_shape", Num(1.0)),
    ("cutoff_slide_curve", Num(0.0)),
];

const DETUNE: &[(&str, ArgDefault)] = &[
    ("detune", Num(0.1)),
    ("detune_slide", Num(0.0)),
    ("detune_slide_shape", Num(1.0)),
    ("detune_slide_curve", Num(0.0)),
];

const PROPHET: &[(&str, ArgDefault)] = &[
    ("cutoff", Num(110.0)),
    ("cutoff_slide", Num(0.0)),
    ("cutoff_slide_shape", Num(1.0)),
    ("cutoff_slide_curve", Num(0.0)),
    ("res", Num(0.7)),
    ("res_slide", Num(0.0)),
    ("res_slide_shape", Num(1.0)),
    ("res_slide_curve", Num(0.0)),
];

const FM: &[(&str, ArgDefault)] = &[
    ("divisor", Num(2.0)),
    ("divisor_slide", Num(0.0)),
    ("divisor_slide_shape", Num(1.0)),
    ("divisor_slide_curve", Num(0.0)),
    ("depth", Num(1.0)),
    ("depth_slide", Num(0.0)),
    ("depth_slide_shape", Num(1.0)),
    ("depth_slide_curve", Num(0.0)),
];

const TB303: &[(&str, ArgDefault)] = &[
    ("cutoff", Num(120.0)),
    ("cutoff_slide", Num(0.0)),
    ("cutoff_slide_shape", Num(1.0)),
    ("cutoff_slide_curve", Num(0.0)),
    ("cutoff_min", Num(30.0)),
    ("cutoff_min_slide", Num(0.0)),
    ("res", Num(0.9)),
    ("res_slide", Num(0.0)),
    ("wave", Num(0.0)),
    ("pulse_width", Num(0.5)),
    ("pulse_width_slide", Num(0.0)),
];

const PLUCK: &[(&str, ArgDefault)] = &[
    ("noise_amp", Num(0.8)),
    ("max_delay_time", Num(0.125)),
    ("pluck_decay", Num(30.0)),
    ("coef", Num(0.3)),
];

const FX_COMMON: &[(&str, ArgDefault)] = &[
    ("amp", Num(1.0)),
    ("amp_slide", Num(0.0)),
    ("amp_slide_shape", Num(1.0)),
    ("amp_slide_curve", Num(0.0)),
    ("mix", Num(1.0)),
    ("mix_slide", Num(0.0)),
    ("mix_slide_shape", Num(1.0)),
    ("mix_slide_curve", Num(0.0)),
    ("pre_amp", Num(1.0)),
    ("pre_amp_slide", Num(0.0)),
    ("pre_amp_slide_shape", Num(1.0)),
    ("pre_amp_slide_curve", Num(0.0)),
];

const REVERB: &[(&str, ArgDefault)] = &[
    ("room", Num(0.6)),
    ("room_slide", Num(0.0)),
    ("damp", Num(0.5)),
    ("damp_slide", Num(0.0)),
];

const ECHO: &[(&str, ArgDefault)] = &[
    ("phase", Num(0.25)),
    ("phase_slide", Num(0.0)),
    ("decay", Num(2.0)),
    ("decay_slide", Num(0.0)),
    ("max_phase", Num(2.0)),
];

const DISTORTION: &[(&str, ArgDefault)] = &[("distort", Num(0.5)), ("distort_slide", Num(0.0))];

const SLICER: &[(&str, ArgDefault)] = &[
    ("phase", Num(0.25)),
    ("phase_slide", Num(0.0)),
    ("amp_min", Num(0.0)),
    ("amp_max", Num(1.0)),
    ("pulse_width", Num(0.5)),
    ("phase_offset", Num(0.0)),
    ("wave", Num(1.0)),
];

const FILTER: &[(&str, ArgDefault)] = &[
    ("cutoff", Num(100.0)),
    ("cutoff_slide", Num(0.0)),
    ("cutoff_slide_shape", Num(1.0)),
    ("cutoff_slide_curve", Num(0.0)),
];

const BITCRUSHER: &[(&str, ArgDefault)] = &[
    ("sample_rate", Num(10000.0)),
    ("sample_rate_slide", Num(0.0)),
    ("bits", Num(8.0)),
    ("bits_slide", Num(0.0)),
    ("cutoff", Num(0.0)),
];

const BASIC_PLAYER: &[(&str, ArgDefault)] = &[
    ("buf", Num(0.0)),
    ("amp", Num(1.0)),
    ("amp_slide", Num(0.0)),
    ("amp_slide_shape", Num(1.0)),
    ("amp_slide_curve", Num(0.0)),
    ("pan", Num(0.0)),
    ("pan_slide", Num(0.0)),
    ("pan_slide_shape", Num(1.0)),
    ("pan_slide_curve", Num(0.0)),
    ("attack", Num(0.0)),
    ("decay", Num(0.0)),
    ("sustain", Num(-1.0)),
    ("release", Num(0.0)),
    ("attack_level", Num(1.0)),
    ("decay_level", Ref("sustain_level")),
    ("sustain_level", Num(1.0)),
    ("env_curve", Num(2.0)),
    ("rate", Num(1.0)),
    ("lpf", Num(-1.0)),
    ("lpf_slide", Num(0.0)),
    ("lpf_slide_shape", Num(1.0)),
    ("lpf_slide_curve", Num(0.0)),
    ("hpf", Num(-1.0)),
    ("hpf_slide", Num(0.0)),
    ("hpf_slide_shape", Num(1.0)),
    ("hpf_slide_curve", Num(0.0)),
];

const FULL_PLAYER: &[(&str, ArgDefault)] = &[
    ("start", Num(0.0)),
    ("finish", Num(1.0)),
    ("norm", Num(0.0)),
    ("pitch", Num(0.0)),
    ("pitch_slide", Num(0.0)),
    ("window_size", Num(0.2)),
    ("pitch_dis", Num(0.0)),
    ("time_dis", Num(0.0)),
    ("compress", Num(0.0)),
    ("threshold", Num(0.2)),
    ("slope_below", Num(1.0)),
    ("slope_above", Num(0.5)),
    ("clamp_time", Num(0.01)),
    ("relax_time", Num(0.01)),
    ("lpf_attack", Num(0.0)),
    ("lpf_decay", Num(0.0)),
    ("lpf_sustain", Num(-1.0)),
    ("lpf_release", Num(0.0)),
];

const SOUND_IN: &[(&str, ArgDefault)] = &[
    ("amp", Num(1.0)),
    ("amp_slide", Num(0.0)),
    ("pan", Num(0.0)),
    ("pan_slide", Num(0.0)),
    ("attack", Num(0.0)),
    ("decay", Num(0.0)),
    ("sustain", Num(1.0)),
    ("release", Num(0.0)),
    ("input", Num(1.0)),
];

const BASIC_MIXER: &[(&str, ArgDefault)] = &[
    ("in_bus", Num(0.0)),
    ("amp", Num(1.0)),
    ("amp_slide", Num(0.2)),
    ("amp_slide_shape", Num(1.0)),
    ("amp_slide_curve", Num(0.0)),
];

const MIXER: &[(&str, ArgDefault)] = &[
    ("in_bus", Num(0.0)),
    ("pre_amp", Num(1.0)),
    ("pre_amp_slide", Num(0.02)),
    ("amp", Num(1.0)),
    ("amp_slide", Num(0.02)),
    ("hpf", Num(0.0)),
    ("lpf", Num(135.5)),
    ("hpf_bypass", Num(0.0)),
    ("lpf_bypass", Num(0.0)),
    ("force_mono", Num(0.0)),
    ("invert_stereo", Num(0.0)),
    ("limiter_bypass", Num(0.0)),
    ("leak_dc_bypass", Num(0.0)),
];

const RECORDER: &[(&str, ArgDefault)] = &[("out_buf", Num(0.0)), ("in_bus", Num(0.0))];

const ENVELOPE_FIXED: &[&str] = &[
    "attack",
    "decay",
    "sustain",
    "release",
    "attack_level",
    "decay_level",
    "sustain_level",
    "env_curve",
];

const STANDARD_CHECKS: &[(&str, Check)] = &[
    ("note", Check::NonNegative),
    ("amp", Check::NonNegative),
    ("pan", Check::Between(-1.0, 1.0)),
    ("attack", Check::NonNegative),
    ("decay", Check::NonNegative),
    ("sustain", Check::NonNegative),
    ("release", Check::NonNegative),
    ("attack_level", Check::NonNegative),
    ("decay_level", Check::NonNegative),
    ("sustain_level", Check::NonNegative),
    ("env_curve", Check::OneOf(&[1.0, 2.0, 3.0, 4.0, 6.0, 7.0])),
    ("cutoff", Check::LessThan(131.0)),
    ("res", Check::Between(0.0, 1.0)),
    ("note_slide", Check::NonNegative),
    ("amp_slide", Check::NonNegative),
    ("pan_slide", Check::NonNegative),
    ("cutoff_slide", Check::NonNegative),
];

const PLAYER_CHECKS: &[(&str, Check)] = &[
    ("amp", Check::NonNegative),
    ("pan", Check::Between(-1.0, 1.0)),
    ("attack", Check::NonNegative),
    ("decay", Check::NonNegative),
    ("release", Check::NonNegative),
    ("start", Check::Between(0.0, 1.0)),
    ("finish", Check::Between(0.0, 1.0)),
    ("lpf", Check::LessThan(131.0)),
    ("hpf", Check::LessThan(131.0)),
    ("window_size", Check::Positive),
];

const FX_CHECKS: &[(&str, Check)] = &[
    ("amp", Check::NonNegative),
    ("mix", Check::Between(0.0, 1.0)),
    ("pre_amp", Check::NonNegative),
    ("room", Check::Between(0.0, 1.0)),
    ("damp", Check::Between(0.0, 1.0)),
    ("phase", Check::Positive),
    ("decay", Check::NonNegative),
    ("max_phase", Check::Positive),
    ("distort", Check::LessThan(1.0)),
    ("cutoff", Check::LessThan(131.0)),
    ("sample_rate", Check::Positive),
    ("bits", Check::Positive),
    ("pulse_width", Check::Between(0.0, 1.0)),
];

const MIXER_CHECKS: &[(&str, Check)] = &[
    ("amp", Check::NonNegative),
    ("pre_amp", Check::NonNegative),
];

type DefaultTables = &'static [&'static [(&'static str, ArgDefault)]];

const fn synth(name: &'static str, defaults: DefaultTables) -> SynthInfo {
    SynthInfo {
        name,
        kind: SynthKind::Synth,
        defaults,
        midi_args: &["note", "cutoff"],
        bpm_scale_args: BpmScaling::EnvelopeAndSlides,
        validations: STANDARD_CHECKS,
        fixed_args: ENVELOPE_FIXED,
        kill_delay: KillDelay::Standard,
        clock: ClockMode::Logical,
    }
}

const fn fx(
    name: &'static str,
    defaults: DefaultTables,
    extra_bpm_args: &'static [&'static str],
    kill_delay: KillDelay,
) -> SynthInfo {
    SynthInfo {
        name,
        kind: SynthKind::Fx,
        defaults,
        midi_args: &["cutoff"],
        bpm_scale_args: BpmScaling::SlidesAnd(extra_bpm_args),
        validations: FX_CHECKS,
        fixed_args: &[],
        kill_delay,
        clock: ClockMode::MinusDelta,
    }
}

const fn player(name: &'static str, defaults: DefaultTables) -> SynthInfo {
    SynthInfo {
        name,
        kind: SynthKind::Sampler,
        defaults,
        midi_args: &["lpf", "hpf"],
        bpm_scale_args: BpmScaling::Slides,
        validations: PLAYER_CHECKS,
        fixed_args: ENVELOPE_FIXED,
        kill_delay: KillDelay::Standard,
        clock: ClockMode::Logical,
    }
}

const fn studio(name: &'static str, defaults: DefaultTables) -> SynthInfo {
    SynthInfo {
        name,
        kind: SynthKind::Studio,
        defaults,
        midi_args: &[],
        bpm_scale_args: BpmScaling::Slides,
        validations: MIXER_CHECKS,
        fixed_args: &[],
        kill_delay: KillDelay::Standard,
        clock: ClockMode::Now,
    }
}

const fn live_input(name: &'static str) -> SynthInfo {
    SynthInfo {
        name,
        kind: SynthKind::LiveInput,
        defaults: &[SOUND_IN],
        midi_args: &[],
        bpm_scale_args: BpmScaling::EnvelopeAndSlides,
        validations: STANDARD_CHECKS,
        fixed_args: &["attack", "decay", "sustain", "release"],
        kill_delay: KillDelay::Standard,
        clock: ClockMode::Logical,
    }
}

static SYNTHS: &[SynthInfo] = &[
    synth("beep", &[NOTE, AMP, PAN, ENVELOPE]),
    synth("sine", &[NOTE, AMP, PAN, ENVELOPE]),
    synth("saw", &[NOTE, AMP, PAN, ENVELOPE, CUTOFF]),
    synth("dsaw", &[NOTE, AMP, PAN, ENVELOPE, CUTOFF, DETUNE]),
    synth("tri", &[NOTE, AMP, PAN, ENVELOPE, CUTOFF]),
    synth("square", &[NOTE, AMP, PAN, ENVELOPE, CUTOFF]),
    synth("prophet", &[NOTE, AMP, PAN, ENVELOPE, PROPHET]),
    synth("fm", &[NOTE, AMP, PAN, ENVELOPE, CUTOFF, FM]),
    synth("tb303", &[NOTE, AMP, PAN, ENVELOPE, TB303]),
    synth("pluck", &[NOTE, AMP, PAN, ENVELOPE, PLUCK]),
    live_input("sound_in"),
    live_input("sound_in_stereo"),
    player("basic_mono_player", &[BASIC_PLAYER]),
    player("basic_stereo_player", &[BASIC_PLAYER]),
    player("mono_player", &[BASIC_PLAYER, FULL_PLAYER]),
    player("stereo_player", &[BASIC_PLAYER, FULL_PLAYER]),
    studio("basic_mixer", &[BASIC_MIXER]),
    studio("mixer", &[MIXER]),
    studio("recorder", &[RECORDER]),
    fx(
        "fx_reverb",
        &[FX_COMMON, REVERB],
        &[],
        KillDelay::FromArg {
            arg: "room",
            scale: 10.0,
            offset: 1.0,
        },
    ),
    fx(
        "fx_echo",
        &[FX_COMMON, ECHO],
        &["phase", "decay"],
        KillDelay::FromArg {
            arg: "decay",
            scale: 1.0,
            offset: 0.0,
        },
    ),
    fx("fx_distortion", &[FX_COMMON, DISTORTION], &[], KillDelay::Standard),
    fx("fx_level", &[FX_COMMON], &[], KillDelay::Standard),
    fx("fx_slicer", &[FX_COMMON, SLICER], &["phase"], KillDelay::Standard),
    fx("fx_lpf", &[FX_COMMON, FILTER], &[], KillDelay::Standard),
    fx("fx_hpf", &[FX_COMMON, FILTER], &[], KillDelay::Standard),
    fx("fx_bitcrusher", &[FX_COMMON, BITCRUSHER], &[], KillDelay::Standard),
];

/// Names of the playable synths, excluding FX, samplers and studio internals.
pub fn synth_names() -> impl Iterator<Item = &'static str> {
    SYNTHS
        .iter()
        .filter(|info| info.kind == SynthKind::Synth)
        .map(|info| info.name)
}

/// FX names without their `fx_` prefix.
pub fn fx_names() -> impl Iterator<Item = &'static str> {
    SYNTHS
        .iter()
        .filter(|info| info.kind == SynthKind::Fx)
        .map(|info| info.name.trim_start_matches("fx_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;

    #[test]
    fn lookups() {
        let beep = SynthInfo::get("beep").unwrap();
        assert_eq!(beep.scsynth_name(), "sonic-pi-beep");
        assert_eq!(beep.default_for("note"), Some(Value::Number(52.0)));
        assert_eq!(beep.default_for("decay_level"), Some(Value::sym("sustain_level")));
        assert!(SynthInfo::get("fx_reverb").is_some());
        assert!(SynthInfo::get("kazoo").is_none());
    }

    #[test]
    fn bpm_scaling_covers_envelope_and_slides() {
        let beep = SynthInfo::get("beep").unwrap();
        let scaled = beep.bpm_scale_args();
        assert!(scaled.contains(&"release"));
        assert!(scaled.contains(&"amp_slide"));
        assert!(!scaled.contains(&"amp_slide_shape"));

        let echo = SynthInfo::get("fx_echo").unwrap();
        assert!(echo.bpm_scale_args().contains(&"phase"));
        assert!(!echo.bpm_scale_args().contains(&"attack"));
    }

    #[test]
    fn validation_messages() {
        let beep = SynthInfo::get("beep").unwrap();
        assert!(beep.validate(&args! {amp: 0.5, pan: -1}).is_ok());

        let err = beep.validate(&args! {amp: -1}).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Value of opt :amp for synth :beep must be zero or greater, got -1.0."
        );
        assert!(beep.validate(&args! {pan: 2}).is_err());
    }

    #[test]
    fn envelope_is_fixed_after_trigger() {
        let beep = SynthInfo::get("beep").unwrap();
        assert!(beep.ctl_validate(&args! {note: 60}).is_ok());
        assert!(beep.ctl_validate(&args! {release: 2}).is_err());
    }

    #[test]
    fn kill_delays() {
        let reverb = SynthInfo::get("fx_reverb").unwrap();
        assert!((reverb.kill_delay(&args! {}).unwrap() - 7.0).abs() < 1e-9);
        assert!((reverb.kill_delay(&args! {room: 0.1}).unwrap() - 2.0).abs() < 1e-9);
        let level = SynthInfo::get("fx_level").unwrap();
        assert_eq!(level.kill_delay(&args! {}), None);
    }

    #[test]
    fn names() {
        assert!(synth_names().any(|name| name == "prophet"));
        assert!(fx_names().any(|name| name == "reverb"));
        assert!(!synth_names().any(|name| name == "basic_mixer"));
    }
}
