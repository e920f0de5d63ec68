mod common;

use common::{harness, seconds};
use pretty_assertions::assert_eq;
use sonance::{
    args,
    jobs::LifeEvent,
    messages::{JobAction, OutboundMessage},
    server::SentMessage,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

fn position(sent: &[SentMessage], matches: impl Fn(&SentMessage) -> bool) -> usize {
    sent.iter().position(|message| matches(message)).unwrap()
}

#[test]
fn finished_jobs_fade_out_and_release_their_resources() {
    let h = harness();
    let free_busses = h.runtime.studio().busses().free_count();
    h.engine.clear_sent();

    let job_id = h
        .runtime
        .run_job_inline(|ctx| {
            ctx.play(60, args! {})?;
            Ok(ctx.job_id())
        })
        .unwrap();

    let sent = h.engine.sent();
    let group = h.engine.sent_to("/g_new")[0].int(0).unwrap();
    let mixer = h.synths_named("sonic-pi-basic_mixer")[0].int(1).unwrap();
    let fade = position(&sent, |message| {
        message.addr == "/n_set"
            && message.int(0) == Some(mixer)
            && message.control("amp") == Some(0.0)
    });
    let mixer_freed = position(&sent, |message| {
        message.addr == "/n_free" && message.int(0) == Some(mixer)
    });
    let group_freed = position(&sent, |message| {
        message.addr == "/n_free" && message.int(0) == Some(group)
    });
    assert!(fade < mixer_freed);
    assert!(mixer_freed < group_freed);

    assert_eq!(sent[fade].control("amp_slide"), Some(1.0));
    assert_eq!(h.runtime.studio().busses().free_count(), free_busses);
    assert!(!h.runtime.resources().has_resources(job_id));
    assert!(!h.runtime.jobs().any_jobs_running());
}

#[test]
fn lifecycle_events_reach_hooks_and_the_gui() {
    let h = harness();
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    h.runtime
        .hooks()
        .subscribe(move |event| seen.lock().unwrap().push(event));

    let id = h.runtime.run_job_inline(|ctx| Ok(ctx.job_id())).unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            LifeEvent::Init(id),
            LifeEvent::Completed(id),
            LifeEvent::AllCompleted
        ]
    );
    let messages: Vec<OutboundMessage> = h
        .gui_messages()
        .into_iter()
        .filter(|message| match message {
            OutboundMessage::Job { .. } | OutboundMessage::AllJobsCompleted => true,
            _ => false,
        })
        .collect();
    assert_eq!(
        messages,
        vec![
            OutboundMessage::Job {
                job_id: id,
                action: JobAction::Started
            },
            OutboundMessage::Job {
                job_id: id,
                action: JobAction::Completed
            },
            OutboundMessage::AllJobsCompleted,
        ]
    );
}

#[test]
fn stopped_jobs_are_killed_not_failed() {
    let h = harness();
    let job = h
        .runtime
        .run_job(|ctx| loop {
            ctx.sleep(1.0)?;
        })
        .unwrap();

    assert!(h.runtime.stop_job(job.id()));
    assert!(job.join_timeout(Duration::from_secs(5)));
    assert!(job.thread().is_killed());

    let messages = h.gui_messages();
    assert!(messages.contains(&OutboundMessage::Job {
        job_id: job.id(),
        action: JobAction::Killed
    }));
    assert!(!messages
        .iter()
        .any(|message| matches!(message, OutboundMessage::Error { .. })));
}

#[test]
fn jobs_wait_for_their_threads() {
    let h = harness();
    h.runtime
        .run_job_inline(|ctx| {
            ctx.in_thread(Some("echo"), |ctx| {
                ctx.sleep(1.0)?;
                ctx.play(72, args! {})?;
                Ok(())
            })?;
            ctx.play(60, args! {})?;
            Ok(())
        })
        .unwrap();

    let mut beeps = h.synths_named("sonic-pi-beep");
    assert_eq!(beeps.len(), 2);
    beeps.sort_by_key(|beep| beep.control("note").map(|note| note as i32));
    assert_eq!(beeps[0].control("note"), Some(60.0));
    assert_eq!(beeps[1].control("note"), Some(72.0));
    let gap = seconds(&beeps[1]) - seconds(&beeps[0]);
    assert!((gap - 1.0).abs() < 1e-3, "{}", gap);
}

#[test]
fn errors_in_threads_are_reported() {
    let h = harness();
    h.runtime
        .run_job_inline(|ctx| {
            ctx.in_thread(None, |ctx| ctx.use_synth("kazoo"))?;
            Ok(())
        })
        .unwrap();

    let reported = h.gui_messages().into_iter().any(|message| match message {
        OutboundMessage::Error { description, .. } => description == "Unknown synth :kazoo",
        _ => false,
    });
    assert!(reported);
}

#[test]
fn the_mixer_pauses_between_runs() {
    let h = harness();
    let mixer_group = h.runtime.studio().mixer_group().id();

    h.runtime.run_job_inline(|ctx| ctx.play(60, args! {}).map(drop)).unwrap();
    assert!(h.runtime.studio().is_paused());

    h.runtime.run_job_inline(|_| Ok(())).unwrap();
    let runs: Vec<(Option<i32>, Option<i32>)> = h
        .engine
        .sent_to("/n_run")
        .iter()
        .map(|message| (message.int(0), message.int(1)))
        .collect();
    assert_eq!(
        runs,
        vec![
            (Some(mixer_group), Some(0)),
            (Some(mixer_group), Some(1)),
            (Some(mixer_group), Some(0)),
        ]
    );
}
