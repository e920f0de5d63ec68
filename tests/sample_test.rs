mod common;

use common::{harness, lines};
use pretty_assertions::assert_eq;
use sonance::{args, Value};
use std::fs;
use tempdir::TempDir;

fn sample_dir() -> (TempDir, String) {
    let dir = TempDir::new("sonance-samples").unwrap();
    let path = dir.path().join("loop_amen.wav");
    fs::write(&path, b"").unwrap();
    let path = path.to_string_lossy().into_owned();
    (dir, path)
}

#[test]
fn sample_durations_follow_rate_and_bpm() {
    let h = harness();
    let (_dir, path) = sample_dir();
    h.engine.register_sound_file(path.clone(), 8 * 44100, 2, 44100.0);
    let amen = [Value::text(path)];

    let durations = h
        .runtime
        .run_job_inline(|ctx| {
            let plain = ctx.sample_duration(&amen, args! {})?;
            let fast = ctx.sample_duration(&amen, args! {rate: 2})?;
            let half = ctx.sample_duration(&amen, args! {start: 0.25, finish: 0.75})?;
            ctx.use_bpm(120.0)?;
            let in_beats = ctx.sample_duration(&amen, args! {})?;
            Ok(vec![plain, fast, half, in_beats])
        })
        .unwrap();

    assert_eq!(durations, vec![8.0, 4.0, 4.0, 16.0]);
}

#[test]
fn the_shorter_of_envelope_and_sample_wins() {
    let h = harness();
    let (_dir, path) = sample_dir();
    h.engine.register_sound_file(path.clone(), 8 * 44100, 1, 44100.0);
    let amen = [Value::text(path)];

    let durations = h
        .runtime
        .run_job_inline(|ctx| {
            let short = ctx.sample_duration(&amen, args! {sustain: 0, attack: 0.5})?;
            let long = ctx.sample_duration(&amen, args! {attack: 8, release: 3, sustain: 0})?;
            Ok((short, long))
        })
        .unwrap();

    assert_eq!(durations, (0.5, 8.0));
}

#[test]
fn samples_play_on_a_player_matching_their_channels() {
    let h = harness();
    let (dir, path) = sample_dir();
    h.engine.register_sound_file(path, 44100, 2, 44100.0);
    let source = dir.path().to_string_lossy().into_owned();

    h.runtime
        .run_job_inline(|ctx| {
            ctx.sample(&[Value::text(source), Value::sym("loop_amen")], args! {amp: 0.5})?;
            Ok(())
        })
        .unwrap();

    let buffer = h.engine.sent_to("/b_allocRead")[0].int(0).unwrap();
    let players = h.synths_named("sonic-pi-basic_stereo_player");
    assert_eq!(players.len(), 1);
    assert_eq!(players[0].control("buf"), Some(buffer as f32));
    assert_eq!(players[0].control("amp"), Some(0.5));
}

#[test]
fn lazy_samples_resolve_even_when_loading_panics() {
    let h = harness();
    let (_dir, path) = sample_dir();
    h.engine.register_sound_file(path.clone(), 44100, 2, 44100.0);

    let handle = h
        .runtime
        .run_job_inline(|ctx| {
            let amp = Value::thunk(|| panic!("amp unavailable"));
            ctx.sample(&[Value::text(path)], args! {amp: amp})
        })
        .unwrap();

    // the loader thread has been joined, so this must not block
    assert!(handle.is_blank());
    assert!(handle.node().is_none());
    assert!(h.synths_named("sonic-pi-basic_stereo_player").is_empty());
}

#[test]
fn missing_samples_are_skipped() {
    let h = harness();
    let handle = h
        .runtime
        .run_job_inline(|ctx| ctx.sample(&[Value::sym("nowhere")], args! {}))
        .unwrap();

    assert!(handle.is_blank());
    assert!(h.engine.sent_to("/b_allocRead").is_empty());
    let lines = lines(&h.gui_messages());
    assert!(
        lines.iter().any(|line| line.contains("no match found")),
        "{:?}",
        lines
    );
}
