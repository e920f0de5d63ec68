#![allow(dead_code)]

use crossbeam_channel::{unbounded, Receiver};
use sonance::{
    clock::ManualClock,
    config::RuntimeConfig,
    messages::OutboundMessage,
    server::{Loopback, SentMessage},
    Runtime,
};
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

/// A runtime wired to a loopback engine and a manual clock.
pub struct Harness {
    pub engine: Loopback,
    pub clock: ManualClock,
    pub runtime: Runtime,
    pub gui: Receiver<OutboundMessage>,
}

pub fn harness() -> Harness {
    harness_with(RuntimeConfig::default())
}

/// Like [`harness`], with `config` in place of the defaults. Health checks stay off.
pub fn harness_with(config: RuntimeConfig) -> Harness {
    let engine = Loopback::new();
    let clock = ManualClock::default();
    let config = RuntimeConfig {
        health_check_interval: 3600.0,
        ..config
    };
    let (sink, gui) = unbounded();
    let runtime = Runtime::with_time_source(
        Arc::new(engine.clone()),
        config,
        sink,
        Arc::new(clock.clone()),
    )
    .unwrap();
    Harness {
        engine,
        clock,
        runtime,
        gui,
    }
}

impl Harness {
    /// Everything relayed to the GUI so far.
    pub fn gui_messages(&self) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.gui.recv_timeout(Duration::from_millis(200)) {
            messages.push(message);
        }
        messages
    }

    pub fn synths_named(&self, synthdef: &str) -> Vec<SentMessage> {
        self.engine
            .sent_to("/s_new")
            .into_iter()
            .filter(|message| message.string(0) == Some(synthdef))
            .collect()
    }
}

pub fn lines(messages: &[OutboundMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|message| match message {
            OutboundMessage::MultiMessage { lines, .. } => Some(lines),
            _ => None,
        })
        .flat_map(|lines| lines.iter().map(|(_, line)| line.clone()))
        .collect()
}

pub fn seconds(message: &SentMessage) -> f64 {
    let time = message.timetag.unwrap();
    time.seconds as f64 + time.fractional as f64 / 4294967296.0
}

/// Polls until `condition` holds, for up to five seconds.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
