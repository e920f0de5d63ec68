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

//! Messages from the runtime to the GUI.
//!
//! Everything the user should see (trigger descriptions, warnings, errors, job events) is pushed
//! onto one queue by any thread. A single relay thread pops messages in order and hands them to
//! a [`GuiSink`]. Messages from one thread keep their order; messages from different threads
//! interleave as they reach the queue.

use crossbeam_channel::{unbounded, Receiver, Sender};
use rosc::{encoder::encode, OscError, OscMessage, OscPacket, OscType};
use serde::Serialize;
use std::{
    io::{self, Write},
    net::{ToSocketAddrs, UdpSocket},
    thread::{self, JoinHandle},
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to serialize message: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to write message to output stream: {0}")]
    Write(io::Error),
    #[error("failed to bind GUI socket: {0}")]
    Bind(io::Error),
    #[error("failed to send message to GUI: {0}")]
    Send(io::Error),
    #[error("failed to encode OSC message: {0:?}")]
    Encode(OscError),
    #[error("message queue closed")]
    Closed,
    #[error("failed to start the relay thread: {0}")]
    Spawn(io::Error),
}

/// How a line of a multi-message is highlighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Info = 0,
    Warning = 1,
    SeriousWarning = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Started,
    Completed,
    Killed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Info {
        text: String,
    },
    /// The lines a thread produced between two sleeps, stamped with its logical time.
    MultiMessage {
        job_id: u64,
        thread_name: String,
        logical_time: f64,
        lines: Vec<(MessageKind, String)>,
    },
    Error {
        job_id: u64,
        description: String,
        backtrace: String,
        line: i32,
    },
    SyntaxError {
        job_id: u64,
        description: String,
        error_line: String,
        line: i32,
    },
    Version {
        version: String,
        platform: String,
    },
    AllJobsCompleted,
    Job {
        job_id: u64,
        action: JobAction,
    },
    /// The last message. The relay stops after forwarding it.
    Exit,
}

impl OutboundMessage {
    pub fn info(text: impl Into<String>) -> OutboundMessage {
        OutboundMessage::Info { text: text.into() }
    }

    /// The OSC message the GUI expects, or `None` for messages it has no address for.
    pub fn to_osc(&self) -> Option<OscMessage> {
        let (addr, args): (&str, Vec<OscType>) = match self {
            OutboundMessage::Info { text } => {
                ("/log/info", vec![OscType::Int(0), text.clone().into()])
            }
            OutboundMessage::MultiMessage {
                job_id,
                thread_name,
                logical_time,
                lines,
            } => {
                let mut args = vec![
                    OscType::Int(*job_id as i32),
                    thread_name.clone().into(),
                    OscType::String(format!("{:.4}", logical_time)),
                    OscType::Int(lines.len() as i32),
                ];
                for (kind, text) in lines {
                    args.push(OscType::Int(*kind as i32));
                    args.push(text.clone().into());
                }
                ("/log/multi_message", args)
            }
            OutboundMessage::Error {
                job_id,
                description,
                backtrace,
                line,
            } => (
                "/error",
                vec![
                    OscType::Int(*job_id as i32),
                    description.clone().into(),
                    backtrace.clone().into(),
                    OscType::Int(*line),
                ],
            ),
            OutboundMessage::SyntaxError {
                job_id,
                description,
                error_line,
                line,
            } => (
                "/syntax_error",
                vec![
                    OscType::Int(*job_id as i32),
                    description.clone().into(),
                    error_line.clone().into(),
                    OscType::Int(*line),
                    line.to_string().into(),
                ],
            ),
            OutboundMessage::Version { version, platform } => (
                "/version",
                vec![version.clone().into(), platform.clone().into()],
            ),
            OutboundMessage::AllJobsCompleted => ("/runs/all-completed", vec![]),
            OutboundMessage::Exit => ("/exited", vec![]),
            OutboundMessage::Job { .. } => return None,
        };
        Some(OscMessage {
            addr: addr.to_owned(),
            args,
        })
    }
}

/// Where the relay delivers messages.
pub trait GuiSink {
    fn emit(&mut self, message: &OutboundMessage) -> Result<()>;
}

/// Writes each message as a line of JSON.
pub struct JsonLinesSink<W> {
    write: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(write: W) -> JsonLinesSink<W> {
        JsonLinesSink { write }
    }
}

impl<W: Write> GuiSink for JsonLinesSink<W> {
    fn emit(&mut self, message: &OutboundMessage) -> Result<()> {
        let line = serde_json::to_string(message).map_err(Error::Serialize)?;
        writeln!(self.write, "{}", line).map_err(Error::Write)?;
        Ok(())
    }
}

/// Sends messages to the GUI over UDP.
pub struct OscGuiSink {
    socket: UdpSocket,
}

impl OscGuiSink {
    pub fn connect<A: ToSocketAddrs>(gui_address: A) -> Result<OscGuiSink> {
        let socket = UdpSocket::bind("127.0.0.1:0").map_err(Error::Bind)?;
        socket.connect(gui_address).map_err(Error::Bind)?;
        Ok(OscGuiSink { socket })
    }
}

impl GuiSink for OscGuiSink {
    fn emit(&mut self, message: &OutboundMessage) -> Result<()> {
        let message = match message.to_osc() {
            Some(message) => message,
            None => return Ok(()),
        };
        log::debug!("gui: {:?}", message);
        let bytes = encode(&OscPacket::Message(message)).map_err(Error::Encode)?;
        self.socket.send(&bytes).map_err(Error::Send)?;
        Ok(())
    }
}

/// Forwards messages into another channel. Handy for embedding the runtime and for tests.
impl GuiSink for Sender<OutboundMessage> {
    fn emit(&mut self, message: &OutboundMessage) -> Result<()> {
        self.send(message.clone()).map_err(|_| Error::Closed)
    }
}

/// The producing end of the message queue.
#[derive(Debug, Clone)]
pub struct MessageQueue(Sender<OutboundMessage>);

impl MessageQueue {
    pub fn new() -> (MessageQueue, Receiver<OutboundMessage>) {
        let (sender, receiver) = unbounded();
        (MessageQueue(sender), receiver)
    }

    pub fn push(&self, message: OutboundMessage) {
        if self.0.send(message).is_err() {
            log::warn!("message queue closed, dropping message");
        }
    }

    pub fn info(&self, text: impl Into<String>) {
        self.push(OutboundMessage::info(text));
    }
}

/// The thread that drains the message queue into a sink.
pub struct Relay {
    handle: JoinHandle<()>,
}

impl Relay {
    /// Starts relaying. The relay stops after forwarding [`OutboundMessage::Exit`], or when every
    /// producer is gone. Sink errors are logged and the relay carries on.
    pub fn spawn<S>(messages: Receiver<OutboundMessage>, mut sink: S) -> Result<Relay>
    where
        S: GuiSink + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name("gui-relay".to_owned())
            .spawn(move || {
                for message in messages {
                    if let Err(err) = sink.emit(&message) {
                        log::error!("failed to relay {:?}: {}", message, err);
                    }
                    if message == OutboundMessage::Exit {
                        break;
                    }
                }
                log::debug!("gui relay stopped");
            })
            .map_err(Error::Spawn)?;
        Ok(Relay { handle })
    }

    pub fn join(self) {
        if self.handle.join().is_err() {
            log::error!("gui relay panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingSink(Sender<OutboundMessage>);

    impl GuiSink for FailingSink {
        fn emit(&mut self, message: &OutboundMessage) -> Result<()> {
            let _ = self.0.send(message.clone());
            Err(Error::Closed)
        }
    }

    #[test]
    fn relay_stops_after_exit() {
        let (queue, receiver) = MessageQueue::new();
        let buffer = SharedBuffer::default();
        let relay = Relay::spawn(receiver, JsonLinesSink::new(buffer.clone())).unwrap();
        queue.info("hello");
        queue.push(OutboundMessage::Exit);
        queue.info("never relayed");
        relay.join();

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(
            lines,
            vec![r#"{"type":"info","text":"hello"}"#, r#"{"type":"exit"}"#]
        );
    }

    #[test]
    fn sink_errors_do_not_stop_the_relay() {
        let (queue, receiver) = MessageQueue::new();
        let (seen, seen_receiver) = unbounded();
        let relay = Relay::spawn(receiver, FailingSink(seen)).unwrap();
        queue.info("one");
        queue.info("two");
        queue.push(OutboundMessage::Exit);
        relay.join();
        assert_eq!(seen_receiver.try_iter().count(), 3);
    }

    #[test]
    fn multi_messages_flatten_into_osc_args() {
        let message = OutboundMessage::MultiMessage {
            job_id: 3,
            thread_name: "run".to_owned(),
            logical_time: 1.5,
            lines: vec![
                (MessageKind::Info, "synth :beep, {note: 60.0}".to_owned()),
                (MessageKind::SeriousWarning, "!! Out of time".to_owned()),
            ],
        };
        let osc = message.to_osc().unwrap();
        assert_eq!(osc.addr, "/log/multi_message");
        assert_eq!(osc.args.len(), 8);
        assert_eq!(osc.args[3], OscType::Int(2));
        assert_eq!(osc.args[6], OscType::Int(2));
        assert_eq!(OutboundMessage::Exit.to_osc().unwrap().addr, "/exited");
        assert!(OutboundMessage::Job {
            job_id: 1,
            action: JobAction::Started
        }
        .to_osc()
        .is_none());
    }
}
