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

//! Finding and playing sound files.
//!
//! Samples are chosen with a list of filters. Strings naming a directory or file are sources,
//! and a directory ending in `/**` is searched recursively. Other strings must appear in the
//! file name and symbols must equal its stem. The first number picks among the matches, wrapping
//! around. With no sources, the configured samples directory is searched.

use crate::{
    args::{add_arg_slide_times, normalise, resolve_midi_args, scale_time_args_to_bpm, Args},
    context::Context,
    error::{Error, Result},
    node::{LazyNode, SoundHandle},
    note::{pitch_to_ratio, ratio_to_pitch, ring_get},
    promise::Promise,
    studio::{SampleBuffer, Slice},
    synth_info::SynthInfo,
    value::Value,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

const EXTENSIONS: &[&str] = &["wav", "wave", "aif", "aiff", "flac"];

/// Arguments the basic players understand. Anything else needs a full player.
const SIMPLE_SAMPLER_ARGS: &[&str] = &[
    "amp",
    "amp_slide",
    "amp_slide_shape",
    "amp_slide_curve",
    "pan",
    "pan_slide",
    "pan_slide_shape",
    "pan_slide_curve",
    "cutoff",
    "cutoff_slide",
    "cutoff_slide_shape",
    "cutoff_slide_curve",
    "lpf",
    "lpf_slide",
    "lpf_slide_shape",
    "lpf_slide_curve",
    "hpf",
    "hpf_slide",
    "hpf_slide_shape",
    "hpf_slide_curve",
    "rate",
    "slide",
    "beat_stretch",
    "rpitch",
    "attack",
    "decay",
    "sustain",
    "release",
    "attack_level",
    "decay_level",
    "sustain_level",
    "env_curve",
];

#[derive(Debug, Clone, PartialEq)]
enum Filter {
    Source { dir: PathBuf, recursive: bool },
    File(PathBuf),
    Contains(String),
    Stem(String),
    Index(i64),
}

fn collect_filters(value: &Value, filters: &mut Vec<Filter>) {
    match value.resolve() {
        Value::Text(text) => {
            if let Some(dir) = text.strip_suffix("/**") {
                filters.push(Filter::Source {
                    dir: PathBuf::from(dir),
                    recursive: true,
                });
                return;
            }
            let path = PathBuf::from(&text);
            if path.is_dir() {
                filters.push(Filter::Source {
                    dir: path,
                    recursive: false,
                });
            } else if path.is_file() {
                filters.push(Filter::File(path));
            } else {
                filters.push(Filter::Contains(text));
            }
        }
        Value::Symbol(name) => filters.push(Filter::Stem(name)),
        Value::Number(x) => filters.push(Filter::Index(x.round() as i64)),
        Value::List(items) => {
            for item in items.iter() {
                collect_filters(item, filters);
            }
        }
        _ => {}
    }
}

fn is_sound_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| {
            EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known))
        })
}

fn list_dir(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            if recursive {
                list_dir(&path, true, out)?;
            }
        } else if is_sound_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

/// Looks up sound files by filter. Directory listings are cached until cleared.
#[derive(Debug)]
pub struct SampleIndex {
    samples_path: Option<PathBuf>,
    listings: Mutex<HashMap<(PathBuf, bool), Arc<Vec<PathBuf>>>>,
}

impl SampleIndex {
    pub fn new(samples_path: Option<PathBuf>) -> SampleIndex {
        SampleIndex {
            samples_path,
            listings: Mutex::new(HashMap::new()),
        }
    }

    fn listing(&self, dir: &Path, recursive: bool) -> Arc<Vec<PathBuf>> {
        let key = (dir.to_owned(), recursive);
        if let Some(listing) = self.listings.lock().get(&key) {
            return Arc::clone(listing);
        }
        let mut paths = Vec::new();
        if let Err(err) = list_dir(dir, recursive, &mut paths) {
            log::warn!("unable to list samples in {:?}: {}", dir, err);
        }
        paths.sort();
        let listing = Arc::new(paths);
        self.listings.lock().insert(key, Arc::clone(&listing));
        listing
    }

    fn search(&self, filters: &[Value]) -> (Vec<PathBuf>, Option<i64>) {
        let mut parsed = Vec::new();
        for filter in filters.iter() {
            collect_filters(filter, &mut parsed);
        }

        let mut candidates = Vec::new();
        let mut has_source = false;
        for filter in parsed.iter() {
            match filter {
                Filter::Source { dir, recursive } => {
                    has_source = true;
                    candidates.extend(self.listing(dir, *recursive).iter().cloned());
                }
                Filter::File(path) => {
                    has_source = true;
                    candidates.push(path.clone());
                }
                _ => {}
            }
        }
        if !has_source {
            if let Some(dir) = &self.samples_path {
                candidates.extend(self.listing(dir, false).iter().cloned());
            }
        }

        let mut index = None;
        for filter in parsed.iter() {
            match filter {
                Filter::Contains(text) => candidates.retain(|path| {
                    path.file_name()
                        .map_or(false, |name| name.to_string_lossy().contains(text.as_str()))
                }),
                Filter::Stem(stem) => candidates.retain(|path| {
                    path.file_stem()
                        .map_or(false, |name| name.to_string_lossy() == stem.as_str())
                }),
                Filter::Index(i) if index.is_none() => index = Some(*i),
                _ => {}
            }
        }
        (candidates, index)
    }

    /// Every sound file matching the filters, ignoring any index.
    pub fn find(&self, filters: &[Value]) -> Vec<PathBuf> {
        self.search(filters).0
    }

    /// The sound file the filters pick.
    pub fn resolve(&self, filters: &[Value]) -> Option<PathBuf> {
        let (candidates, index) = self.search(filters);
        ring_get(&candidates, index.unwrap_or(0)).cloned()
    }

    /// Forgets cached directory listings, so new files are seen.
    pub fn clear_cache(&self) {
        self.listings.lock().clear();
    }
}

fn describe_filters(filters: &[Value]) -> String {
    Value::list(filters.to_vec()).to_string()
}

/// Resolves a lazy sample to `None` if its loader thread ends without delivering a sound.
struct PendingSound(Promise<Option<SoundHandle>>);

impl Drop for PendingSound {
    fn drop(&mut self) {
        self.0.deliver(None);
    }
}

fn clamp_unit(x: f64) -> f64 {
    x.max(0.0).min(1.0)
}

impl Context {
    /// Paths of every sound file matching the filters.
    pub fn sample_paths(&self, filters: &[Value]) -> Vec<PathBuf> {
        self.runtime().samples().find(filters)
    }

    fn resolve_sample_path(&self, filters: &[Value]) -> Result<PathBuf> {
        self.runtime()
            .samples()
            .resolve(filters)
            .ok_or_else(|| Error::SampleNotFound(describe_filters(filters)))
    }

    /// Plays a sample. Samples not yet loaded are loaded on a new thread, and the sound is
    /// returned as a lazy handle that resolves once it has been triggered.
    pub fn sample(&mut self, filters: &[Value], args: Args) -> Result<SoundHandle> {
        self.check_killed()?;
        let mut args = self.musical.sample_defaults.merged(&args);
        let mut filters = filters.to_vec();
        if filters.is_empty() {
            if let Some(path) = args.remove("path") {
                filters.push(path);
            }
        }
        let path = match self.runtime().samples().resolve(&filters) {
            Some(path) if !filters.is_empty() => path,
            _ => {
                self.message(format!(
                    "sample {}\n           - no match found, skipping.",
                    describe_filters(&filters)
                ));
                return Ok(SoundHandle::blank(args));
            }
        };

        if self.studio().sample_loaded(&path) {
            return self.trigger_sampler(&path, args);
        }
        let promise = Promise::new();
        let pending = PendingSound(promise.clone());
        self.in_thread(None, move |ctx| {
            let result = ctx.trigger_sampler(&path, args);
            pending.0.deliver(result.as_ref().ok().cloned());
            result.map(|_| ())
        })?;
        let handle = SoundHandle::Lazy(LazyNode::new(promise));
        self.locals.last_triggered = Some(handle.clone());
        Ok(handle)
    }

    fn trigger_sampler(&mut self, path: &Path, args: Args) -> Result<SoundHandle> {
        let (buffer, _) = self.studio().load_sample(path)?;
        let complex = args
            .iter()
            .any(|(name, _)| !SIMPLE_SAMPLER_ARGS.contains(&name));
        let name = match (complex, buffer.num_chans == 1) {
            (true, true) => "mono_player",
            (true, false) => "stereo_player",
            (false, true) => "basic_mono_player",
            (false, false) => "basic_stereo_player",
        };
        let info = SynthInfo::get(name);
        let mut args = self.resolve_sample_args(&buffer, info, args)?;

        let shown_path = path.to_string_lossy();
        if self.out_of_time() {
            if args.is_empty() {
                self.serious_warning(format!("!! Out of time, skipping: sample {:?}", shown_path));
            } else {
                self.serious_warning(format!(
                    "!! Out of time, skipping: sample {:?}, {}",
                    shown_path, args
                ));
            }
            return Ok(SoundHandle::blank(args));
        }

        let dir = path
            .parent()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = path
            .file_name()
            .map(|file| file.to_string_lossy().into_owned())
            .unwrap_or_default();
        if args.is_empty() {
            self.describe(format!("sample {:?},\n           {:?}", dir, file));
        } else {
            self.describe(format!("sample {:?},\n           {:?}, {}", dir, file, args));
        }

        let synthdef = match info {
            Some(info) => {
                add_arg_slide_times(&mut args, info);
                info.scsynth_name()
            }
            None => format!("sonic-pi-{}", name),
        };
        args.insert("buf", buffer.id);
        let group = self.current_group()?;
        let out_bus = self.current_out_bus()?;
        self.trigger_synth(&synthdef, &group, args, info, out_bus)
    }

    /// Applies the stretch, pitch and slice options, then normalises the arguments.
    fn resolve_sample_args(
        &self,
        buffer: &SampleBuffer,
        info: Option<&'static SynthInfo>,
        mut args: Args,
    ) -> Result<Args> {
        args.purge_nils();
        let bpm = self.clock.bpm();
        let duration = buffer.duration();
        let positive = |name: &str, value: &Value| -> Result<f64> {
            value.as_f64().filter(|x| *x > 0.0).ok_or_else(|| {
                Error::invalid(format!(
                    "{}: opt needs to be a positive number. Got: {}",
                    name, value
                ))
            })
        };

        if let Some(stretch) = args.get("beat_stretch").map(Value::resolve) {
            let stretch = positive("beat_stretch", &stretch)?;
            let rate = args.get_f64("rate").unwrap_or(1.0);
            args.insert("rate", (1.0 / stretch) * rate * (bpm / (60.0 / duration)));
        }

        if let Some(stretch) = args.get("pitch_stretch").map(Value::resolve) {
            let stretch = positive("pitch_stretch", &stretch)?;
            let rate = args.get_f64("rate").unwrap_or(1.0);
            let new_rate = (1.0 / stretch) * (bpm / (60.0 / duration));
            let pitch = args.get_f64("pitch").unwrap_or(0.0);
            args.insert("rate", new_rate * rate);
            args.insert("pitch", pitch - ratio_to_pitch(new_rate));
        }

        if let Some(rpitch) = args.get_f64("rpitch") {
            let rate = args.get_f64("rate").unwrap_or(1.0);
            args.insert("rate", pitch_to_ratio(rpitch) * rate);
        }

        if let Some(slice) = args.get("slice").map(Value::resolve) {
            let num_slices = args.get_f64("num_slices").unwrap_or(16.0).round();
            if !(num_slices > 0.0) {
                return Err(Error::invalid(format!(
                    "Sample opt num_slices: needs to be greater than 0. Got: {}",
                    num_slices
                )));
            }
            let index = slice.as_f64().ok_or_else(|| {
                Error::invalid(format!(
                    "Unknown sample slice: value. Expected a number. Got {}",
                    slice
                ))
            })?;
            let slices = buffer.slices(num_slices as usize);
            apply_slice(&mut args, "slice", ring_get(&slices, index.round() as i64));
        }

        if let Some(onset) = args.get("onset").map(Value::resolve) {
            let index = onset.as_f64().ok_or_else(|| {
                Error::invalid(format!(
                    "Unknown sample onset: value. Expected a number. Got {}",
                    onset
                ))
            })?;
            let onsets = buffer.onset_slices();
            apply_slice(&mut args, "onset", ring_get(&onsets, index.round() as i64));
        }

        let defaults = info.map(SynthInfo::arg_defaults).unwrap_or_default();
        if let Some(info) = info {
            resolve_midi_args(&mut args, info)?;
        }
        normalise(&mut args, &defaults)?;
        if let Some(info) = info {
            if self.musical.arg_bpm_scaling {
                scale_time_args_to_bpm(&mut args, info, self.clock.sleep_mul(), true);
            }
        }
        Ok(args)
    }

    /// How many beats a sample plays for with the given arguments, at the current BPM.
    pub fn sample_duration(&mut self, filters: &[Value], args: Args) -> Result<f64> {
        let buffer = self.sample_buffer(filters)?;
        let args = self.musical.sample_defaults.merged(&args);
        let args = self.resolve_sample_args(&buffer, None, args)?;

        let start = clamp_unit(args.get_f64("start").unwrap_or(0.0));
        let finish = clamp_unit(args.get_f64("finish").unwrap_or(1.0));
        let rate = args.get_f64("rate").unwrap_or(1.0);
        let mut duration = buffer.duration() / rate.abs() * (finish - start).abs();

        if let Some(sustain) = args.get_f64("sustain").filter(|sustain| *sustain != -1.0) {
            let time = |name: &str| args.get_f64(name).unwrap_or(0.0).max(0.0);
            let envelope = time("attack") + time("decay") + sustain.max(0.0) + time("release");
            duration = duration.min(envelope);
        }

        if self.musical.arg_bpm_scaling {
            Ok(duration / self.clock.sleep_mul())
        } else {
            Ok(duration)
        }
    }

    /// Sets the BPM so that a beat lasts as long as the sample divided by `num_beats`.
    pub fn use_sample_bpm(&mut self, filters: &[Value], num_beats: Option<f64>) -> Result<()> {
        let duration = self.sample_buffer(filters)?.duration();
        if duration <= 0.0 {
            return Err(Error::invalid(format!(
                "sample {} has no duration",
                describe_filters(filters)
            )));
        }
        self.use_bpm(num_beats.unwrap_or(1.0) * (60.0 / duration))
    }

    /// Loads the sample the filters pick, so that playing it later does not wait.
    pub fn load_sample(&mut self, filters: &[Value]) -> Result<SampleBuffer> {
        let path = self.resolve_sample_path(filters)?;
        let (buffer, cached) = self.studio().load_sample(&path)?;
        if !cached {
            self.message(format!("Loaded sample {:?}", path.to_string_lossy()));
        }
        Ok(buffer)
    }

    /// Loads every sample matching the filters.
    pub fn load_samples(&mut self, filters: &[Value]) -> Result<Vec<SampleBuffer>> {
        let paths = self.sample_paths(filters);
        if paths.is_empty() {
            return Err(Error::SampleNotFound(describe_filters(filters)));
        }
        let mut buffers = Vec::with_capacity(paths.len());
        for path in paths {
            let (buffer, cached) = self.studio().load_sample(&path)?;
            if !cached {
                self.message(format!("Loaded sample {:?}", path.to_string_lossy()));
            }
            buffers.push(buffer);
        }
        Ok(buffers)
    }

    /// The buffer holding the sample the filters pick, loading it if needed.
    pub fn sample_buffer(&mut self, filters: &[Value]) -> Result<SampleBuffer> {
        let path = self.resolve_sample_path(filters)?;
        Ok(self.studio().load_sample(&path)?.0)
    }

    pub fn sample_info(&mut self, filters: &[Value]) -> Result<SampleBuffer> {
        self.sample_buffer(filters)
    }

    pub fn sample_loaded(&self, filters: &[Value]) -> bool {
        self.runtime()
            .samples()
            .resolve(filters)
            .map_or(false, |path| self.studio().sample_loaded(path))
    }

    /// Unloads the sample the filters pick. Returns whether it was loaded.
    pub fn sample_free(&mut self, filters: &[Value]) -> Result<bool> {
        let path = self.resolve_sample_path(filters)?;
        let freed = self.studio().free_sample(&path)?;
        if freed {
            self.message(format!("Freed sample {:?}", path.to_string_lossy()));
        }
        Ok(freed)
    }

    pub fn sample_free_all(&mut self) -> Result<()> {
        self.studio().free_all_samples()?;
        self.message("Freed all loaded samples");
        Ok(())
    }
}

fn apply_slice(args: &mut Args, name: &str, slice: Option<&Slice>) {
    if let Some(slice) = slice {
        args.insert("start", slice.start);
        args.insert("finish", slice.finish);
        args.insert(name, slice.index as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempdir::TempDir;

    fn sample_dir() -> TempDir {
        let dir = TempDir::new("sonance-samples").unwrap();
        for name in ["a_kick.wav", "b_snare.wav", "c_kick.flac", "notes.txt"].iter() {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("d_kick.WAV"), b"").unwrap();
        dir
    }

    fn text(path: &Path) -> Value {
        Value::text(path.to_string_lossy())
    }

    #[test]
    fn directories_list_sound_files_in_order() {
        let dir = sample_dir();
        let index = SampleIndex::new(None);
        let found = index.find(&[text(dir.path())]);
        let names: Vec<_> = found
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a_kick.wav", "b_snare.wav", "c_kick.flac"]);

        let recursive = Value::text(format!("{}/**", dir.path().to_string_lossy()));
        assert_eq!(index.find(&[recursive]).len(), 4);
    }

    #[test]
    fn filters_narrow_and_indexes_wrap() {
        let dir = sample_dir();
        let index = SampleIndex::new(None);
        let source = text(dir.path());

        let kicks = [source.clone(), Value::text("kick")];
        assert_eq!(index.resolve(&kicks), Some(dir.path().join("a_kick.wav")));
        let second = [source.clone(), Value::text("kick"), Value::from(1)];
        assert_eq!(index.resolve(&second), Some(dir.path().join("c_kick.flac")));
        let wrapped = [source.clone(), Value::text("kick"), Value::from(2)];
        assert_eq!(index.resolve(&wrapped), Some(dir.path().join("a_kick.wav")));

        let exact = [source, Value::sym("b_snare")];
        assert_eq!(index.resolve(&exact), Some(dir.path().join("b_snare.wav")));
        assert_eq!(index.resolve(&[text(dir.path()), Value::sym("snare")]), None);
    }

    #[test]
    fn samples_path_is_the_default_source() {
        let dir = sample_dir();
        let index = SampleIndex::new(Some(dir.path().to_owned()));
        assert_eq!(
            index.resolve(&[Value::sym("c_kick")]),
            Some(dir.path().join("c_kick.flac"))
        );
        assert_eq!(SampleIndex::new(None).resolve(&[Value::sym("c_kick")]), None);
    }

    #[test]
    fn listings_are_cached_until_cleared() {
        let dir = sample_dir();
        let index = SampleIndex::new(None);
        assert_eq!(index.find(&[text(dir.path())]).len(), 3);
        fs::write(dir.path().join("e_hat.aiff"), b"").unwrap();
        assert_eq!(index.find(&[text(dir.path())]).len(), 3);
        index.clear_cache();
        assert_eq!(index.find(&[text(dir.path())]).len(), 4);
    }
}
