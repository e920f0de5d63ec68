mod common;

use common::{eventually, harness, harness_with, lines};
use pretty_assertions::assert_eq;
use sonance::{args, config::RuntimeConfig, Error};

#[test]
fn fx_none_runs_the_block_without_a_bus() {
    let h = harness();
    h.runtime
        .run_job_inline(|ctx| {
            ctx.play(60, args! {})?;
            let free_busses = ctx.studio().busses().free_count();
            let groups = h.engine.sent_to("/g_new").len();

            let mut runs = 0;
            ctx.with_fx("none", args! {reps: 2}, |ctx, fx| {
                assert!(fx.is_blank());
                runs += 1;
                ctx.play(62, args! {})?;
                Ok(())
            })?;

            assert_eq!(runs, 2);
            assert_eq!(ctx.studio().busses().free_count(), free_busses);
            assert_eq!(h.engine.sent_to("/g_new").len(), groups);
            Ok(())
        })
        .unwrap();

    assert_eq!(h.synths_named("sonic-pi-beep").len(), 3);
    assert!(h
        .engine
        .sent_to("/s_new")
        .iter()
        .all(|synth| !synth.string(0).unwrap_or("").starts_with("sonic-pi-fx_")));
}

#[test]
fn fx_route_the_block_through_their_bus() {
    let h = harness();
    h.runtime
        .run_job_inline(|ctx| {
            ctx.with_fx("reverb", args! {room: 0.2}, |ctx, _fx| {
                ctx.play(60, args! {})?;
                Ok(())
            })?;

            let mixer = &h.synths_named("sonic-pi-basic_mixer")[0];
            let reverb = &h.synths_named("sonic-pi-fx_reverb")[0];
            let beep = &h.synths_named("sonic-pi-beep")[0];
            assert_eq!(beep.control("out_bus"), reverb.control("in_bus"));
            assert_eq!(reverb.control("out_bus"), mixer.control("in_bus"));
            assert_ne!(reverb.control("in_bus"), mixer.control("in_bus"));

            // the FX goes once everything played inside it has finished
            let reverb_id = reverb.int(1).unwrap();
            assert!(h.engine.node_exists(reverb_id));
            h.engine.end_node(beep.int(1).unwrap());
            assert!(eventually(|| !h.engine.node_exists(reverb_id)));
            Ok(())
        })
        .unwrap();
}

#[test]
fn fx_bus_is_returned_when_the_fx_ends() {
    let h = harness();
    h.runtime
        .run_job_inline(|ctx| {
            ctx.play(60, args! {})?;
            let free_busses = ctx.studio().busses().free_count();
            ctx.with_fx("level", args! {}, |ctx, _fx| {
                assert_eq!(ctx.studio().busses().free_count(), free_busses - 1);
                ctx.play(64, args! {})?;
                Ok(())
            })?;

            let beep = &h.synths_named("sonic-pi-beep")[1];
            h.engine.end_node(beep.int(1).unwrap());
            let busses = ctx.studio().busses().clone();
            assert!(eventually(|| busses.free_count() == free_busses));
            Ok(())
        })
        .unwrap();
}

#[test]
fn reps_repeat_the_block_inside_one_fx() {
    let h = harness();
    h.runtime
        .run_job_inline(|ctx| {
            ctx.with_fx("echo", args! {reps: 3}, |ctx, _fx| {
                ctx.play(60, args! {})?;
                Ok(())
            })
        })
        .unwrap();

    assert_eq!(h.synths_named("sonic-pi-fx_echo").len(), 1);
    assert_eq!(h.synths_named("sonic-pi-beep").len(), 3);
}

#[test]
fn nested_fx_restore_the_outer_routing() {
    let h = harness();
    h.runtime
        .run_job_inline(|ctx| {
            ctx.with_fx("reverb", args! {}, |ctx, _reverb| {
                ctx.play(60, args! {})?;
                ctx.with_fx("echo", args! {}, |ctx, _echo| {
                    ctx.play(62, args! {})?;
                    Ok(())
                })?;
                ctx.play(64, args! {})?;
                Ok(())
            })?;

            let mixer = &h.synths_named("sonic-pi-basic_mixer")[0];
            let reverb = &h.synths_named("sonic-pi-fx_reverb")[0];
            let echo = &h.synths_named("sonic-pi-fx_echo")[0];
            let beeps = h.synths_named("sonic-pi-beep");
            assert_eq!(beeps.len(), 3);

            assert_eq!(reverb.control("out_bus"), mixer.control("in_bus"));
            assert_eq!(echo.control("out_bus"), reverb.control("in_bus"));
            let out_busses: Vec<Option<f32>> =
                beeps.iter().map(|beep| beep.control("out_bus")).collect();
            assert_eq!(
                out_busses,
                vec![
                    reverb.control("in_bus"),
                    echo.control("in_bus"),
                    reverb.control("in_bus"),
                ]
            );

            // synths after the inner block go back into the outer group
            assert_eq!(beeps[0].int(3), beeps[2].int(3));
            assert_ne!(beeps[0].int(3), beeps[1].int(3));

            // and are tracked by the outer FX, not the inner one
            let echo_id = echo.int(1).unwrap();
            let reverb_id = reverb.int(1).unwrap();
            h.engine.end_node(beeps[1].int(1).unwrap());
            assert!(eventually(|| !h.engine.node_exists(echo_id)));
            assert!(h.engine.node_exists(reverb_id));

            h.engine.end_node(beeps[0].int(1).unwrap());
            h.engine.end_node(beeps[2].int(1).unwrap());
            assert!(eventually(|| !h.engine.node_exists(reverb_id)));
            Ok(())
        })
        .unwrap();
}

#[test]
fn fx_are_bypassed_when_the_busses_run_out() {
    // room for the mixer, the job and one FX
    let h = harness_with(RuntimeConfig {
        num_audio_busses: 22,
        ..RuntimeConfig::default()
    });
    h.runtime
        .run_job_inline(|ctx| {
            ctx.with_fx("reverb", args! {}, |ctx, _reverb| {
                let mut runs = 0;
                ctx.with_fx("echo", args! {reps: 2}, |ctx, echo| {
                    assert!(echo.is_blank());
                    runs += 1;
                    ctx.play(60, args! {})?;
                    Ok(())
                })?;
                assert_eq!(runs, 2);
                Ok(())
            })
        })
        .unwrap();

    assert!(h.synths_named("sonic-pi-fx_echo").is_empty());
    let reverb = &h.synths_named("sonic-pi-fx_reverb")[0];
    let beeps = h.synths_named("sonic-pi-beep");
    assert_eq!(beeps.len(), 2);
    assert!(beeps
        .iter()
        .all(|beep| beep.control("out_bus") == reverb.control("in_bus")));

    let lines = lines(&h.gui_messages());
    assert!(
        lines
            .iter()
            .any(|line| line.contains("All busses allocated - unable to honour FX")),
        "{:?}",
        lines
    );
}

#[test]
fn unknown_fx_are_errors() {
    let h = harness();
    let result = h
        .runtime
        .run_job_inline(|ctx| ctx.with_fx("wobble", args! {}, |_, _| Ok(())));
    match result {
        Err(Error::UnknownFx(name)) => assert_eq!(name, "wobble"),
        other => panic!("expected an unknown FX error, got {:?}", other),
    }
}
