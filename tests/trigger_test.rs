mod common;

use common::{harness, lines, seconds};
use pretty_assertions::assert_eq;
use sonance::{args, messages::OutboundMessage, Error, Value};
use std::time::Duration;

#[test]
fn transpose_and_octave_shift_notes() {
    let h = harness();
    h.runtime
        .run_job_inline(|ctx| {
            ctx.use_transpose(1.0);
            ctx.play(50, args! {})?;
            ctx.use_transpose(0.0);
            ctx.use_octave(1);
            ctx.play(50, args! {})?;
            Ok(())
        })
        .unwrap();

    let notes: Vec<Option<f32>> = h
        .synths_named("sonic-pi-beep")
        .iter()
        .map(|synth| synth.control("note"))
        .collect();
    assert_eq!(notes, vec![Some(51.0), Some(62.0)]);
}

#[test]
fn synths_play_through_the_job_bus() {
    let h = harness();
    h.runtime
        .run_job_inline(|ctx| {
            ctx.use_synth("saw")?;
            ctx.play("e3", args! {release: 0.25})?;
            Ok(())
        })
        .unwrap();

    let mixer = &h.synths_named("sonic-pi-basic_mixer")[0];
    let saw = &h.synths_named("sonic-pi-saw")[0];
    assert_eq!(saw.control("note"), Some(52.0));
    assert_eq!(saw.control("release"), Some(0.25));
    assert_eq!(saw.control("out_bus"), mixer.control("in_bus"));
}

#[test]
fn timed_patterns_sleep_between_notes() {
    let h = harness();
    let notes: Vec<Value> = vec![60.into(), 62.into(), 64.into(), 65.into(), 67.into()];
    h.runtime
        .run_job_inline(|ctx| {
            ctx.play_pattern_timed(&notes, &[1.0, 0.5], args! {})?;
            Ok(())
        })
        .unwrap();

    let beeps = h.synths_named("sonic-pi-beep");
    assert_eq!(beeps.len(), 5);
    let gaps: Vec<f64> = beeps
        .windows(2)
        .map(|pair| ((seconds(&pair[1]) - seconds(&pair[0])) * 1000.0).round() / 1000.0)
        .collect();
    assert_eq!(gaps, vec![1.0, 0.5, 1.0, 0.5]);
}

#[test]
fn rests_trigger_nothing() {
    let h = harness();
    let handle = h
        .runtime
        .run_job_inline(|ctx| ctx.play("rest", args! {}))
        .unwrap();
    assert!(handle.is_blank());
    assert!(h.synths_named("sonic-pi-beep").is_empty());
}

#[test]
fn chords_share_a_group_and_split_the_amp() {
    let h = harness();
    h.runtime
        .run_job_inline(|ctx| {
            ctx.play(Value::list(vec![60, 64, 67]), args! {amp: 0.9})?;
            Ok(())
        })
        .unwrap();

    let beeps = h.synths_named("sonic-pi-beep");
    let notes: Vec<Option<f32>> = beeps.iter().map(|beep| beep.control("note")).collect();
    assert_eq!(notes, vec![Some(60.0), Some(64.0), Some(67.0)]);
    for beep in beeps.iter() {
        assert!((beep.control("amp").unwrap() - 0.3).abs() < 1e-6);
        assert_eq!(beep.int(3), beeps[0].int(3));
    }
}

#[test]
fn unknown_synths_are_errors() {
    let h = harness();
    match h.runtime.run_job_inline(|ctx| ctx.use_synth("kazoo")) {
        Err(Error::UnknownSynth(name)) => assert_eq!(name, "kazoo"),
        other => panic!("expected an unknown synth error, got {:?}", other),
    }
}

#[test]
fn late_triggers_are_skipped_under_timing_guarantees() {
    let h = harness();
    let handle = h
        .runtime
        .run_job_inline(|ctx| {
            ctx.use_timing_guarantees(true);
            h.clock.advance(Duration::from_secs(1));
            ctx.play(60, args! {})
        })
        .unwrap();

    assert!(handle.is_blank());
    assert!(h.synths_named("sonic-pi-beep").is_empty());
    let lines = lines(&h.gui_messages());
    assert!(
        lines
            .iter()
            .any(|line| line.starts_with("!! Out of time, skipping: synth :beep")),
        "{:?}",
        lines
    );
}

#[test]
fn triggers_far_behind_are_skipped_under_timing_guarantees() {
    let h = harness();
    let handle = h
        .runtime
        .run_job_inline(|ctx| {
            ctx.use_timing_guarantees(true);
            h.clock.advance(Duration::from_secs(3));
            ctx.play(60, args! {})
        })
        .unwrap();

    assert!(handle.is_blank());
    assert!(h.synths_named("sonic-pi-beep").is_empty());
    let failed = h
        .gui_messages()
        .into_iter()
        .any(|message| matches!(message, OutboundMessage::Error { .. }));
    assert!(!failed);
}

#[test]
fn falling_far_behind_ends_the_job() {
    let h = harness();
    let result = h.runtime.run_job_inline(|ctx| {
        h.clock.advance(Duration::from_secs(2));
        ctx.play(60, args! {})
    });
    match result {
        Err(Error::Timing) => {}
        other => panic!("expected a timing error, got {:?}", other),
    }

    let reported = h.gui_messages().into_iter().any(|message| match message {
        OutboundMessage::Error { description, .. } => description.starts_with("Timing Exception"),
        _ => false,
    });
    assert!(reported);
}

#[test]
fn controlling_the_last_sound() {
    let h = harness();
    h.runtime
        .run_job_inline(|ctx| {
            ctx.play(60, args! {note_slide: 1})?;
            ctx.control(None, args! {note: 65})?;
            Ok(())
        })
        .unwrap();

    let beep = &h.synths_named("sonic-pi-beep")[0];
    let sets = h.engine.sent_to("/n_set");
    let control = sets
        .iter()
        .find(|set| set.int(0) == beep.int(1))
        .expect("the beep was controlled");
    assert_eq!(control.control("note"), Some(65.0));
}
