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

use super::{BufferInfo, NodeNotification, Reply, Result, StatusInfo, Transport};
use parking_lot::Mutex;
use rosc::{OscMessage, OscPacket, OscTime, OscType};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
};

/// An in-process synthesis engine.
///
/// `Loopback` keeps a log of everything it is sent and answers the way `scsynth` would: it tracks
/// the node tree so that freeing a group ends its children, reads "sound files" from a table
/// registered with [`Loopback::register_sound_file`], and replies to `/sync`, `/status` and the
/// buffer commands. Bundles are applied as soon as they arrive regardless of their time tag.
#[derive(Clone)]
pub struct Loopback(Arc<LoopbackInner>);

struct LoopbackInner {
    sent: Mutex<Vec<SentMessage>>,
    subscribers: Mutex<Vec<mpsc::Sender<Reply>>>,
    sound_files: Mutex<HashMap<String, SoundFile>>,
    buffers: Mutex<HashMap<i32, SoundFile>>,
    // node id -> (parent group id, is group)
    tree: Mutex<HashMap<i32, (i32, bool)>>,
    responsive: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
struct SoundFile {
    frames: i32,
    channels: i32,
    sample_rate: f32,
}

/// A message received by a [`Loopback`], with the time tag of the bundle it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub addr: String,
    pub args: Vec<OscType>,
    pub timetag: Option<OscTime>,
}

impl SentMessage {
    pub fn int(&self, index: usize) -> Option<i32> {
        match self.args.get(index)? {
            OscType::Int(x) => Some(*x),
            _ => None,
        }
    }

    pub fn string(&self, index: usize) -> Option<&str> {
        match self.args.get(index)? {
            OscType::String(x) => Some(x),
            _ => None,
        }
    }

    /// Looks up a named control in a `/s_new` or `/n_set` message.
    pub fn control(&self, name: &str) -> Option<f32> {
        let position = self
            .args
            .iter()
            .position(|arg| matches!(arg, OscType::String(s) if s == name))?;
        match self.args.get(position + 1)? {
            OscType::Float(x) => Some(*x),
            OscType::Int(x) => Some(*x as f32),
            _ => None,
        }
    }
}

impl Default for Loopback {
    fn default() -> Loopback {
        Loopback::new()
    }
}

impl Loopback {
    pub fn new() -> Loopback {
        Loopback(Arc::new(LoopbackInner {
            sent: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            sound_files: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            tree: Mutex::new(HashMap::new()),
            responsive: AtomicBool::new(true),
        }))
    }

    /// Makes `path` readable by `/b_allocRead`.
    pub fn register_sound_file(
        &self,
        path: impl Into<String>,
        frames: i32,
        channels: i32,
        sample_rate: f32,
    ) {
        self.0.sound_files.lock().insert(
            path.into(),
            SoundFile {
                frames,
                channels,
                sample_rate,
            },
        );
    }

    /// An unresponsive engine stops answering `/status`.
    pub fn set_responsive(&self, responsive: bool) {
        self.0.responsive.store(responsive, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.0.sent.lock().clone()
    }

    pub fn sent_to(&self, addr: &str) -> Vec<SentMessage> {
        self.0
            .sent
            .lock()
            .iter()
            .filter(|message| message.addr == addr)
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.0.sent.lock().clear();
    }

    pub fn node_exists(&self, node_id: i32) -> bool {
        self.0.tree.lock().contains_key(&node_id)
    }

    /// Ends a node as if its envelope had finished.
    pub fn end_node(&self, node_id: i32) {
        self.free_node(node_id, true);
    }

    /// Delivers a reply to every subscriber.
    pub fn emit(&self, reply: Reply) {
        self.0
            .subscribers
            .lock()
            .retain(|subscriber| subscriber.send(reply.clone()).is_ok());
    }

    fn receive(&self, packet: OscPacket, timetag: Option<OscTime>) {
        match packet {
            OscPacket::Message(message) => self.apply(message, timetag),
            OscPacket::Bundle(bundle) => {
                for packet in bundle.content {
                    self.receive(packet, Some(bundle.timetag));
                }
            }
        }
    }

    fn apply(&self, message: OscMessage, timetag: Option<OscTime>) {
        let message = SentMessage {
            addr: message.addr,
            args: message.args,
            timetag,
        };
        self.0.sent.lock().push(message.clone());

        match message.addr.as_str() {
            "/sync" => {
                if let Some(id) = message.int(0) {
                    self.emit(Reply::Synced { id });
                }
            }
            "/notify" => self.emit(Reply::NotifyDone {
                client_id: 0,
                max_logins: None,
            }),
            "/status" => {
                if self.0.responsive.load(Ordering::SeqCst) {
                    let synths = self.0.tree.lock().values().filter(|(_, g)| !g).count();
                    self.emit(Reply::StatusReply(StatusInfo {
                        ugens: 0,
                        synths: synths as i32,
                        groups: 0,
                        synthdefs: 0,
                        average_cpu: 0.0,
                        peak_cpu: 0.0,
                        nominal_sample_rate: 44100.0,
                        actual_sample_rate: 44100.0,
                    }));
                }
            }
            "/d_loadDir" => self.emit(Reply::SynthDefLoadDirDone),
            "/b_allocRead" => {
                let (buffer_number, path) = match (message.int(0), message.string(1)) {
                    (Some(n), Some(path)) => (n, path.to_owned()),
                    _ => return,
                };
                let file = self.0.sound_files.lock().get(&path).copied();
                match file {
                    Some(file) => {
                        self.0.buffers.lock().insert(buffer_number, file);
                        self.emit(Reply::BufferAllocateReadDone { buffer_number });
                    }
                    None => self.emit(Reply::Fail {
                        command: "/b_allocRead".to_owned(),
                        error: format!("File '{}' could not be opened", path),
                    }),
                }
            }
            "/b_alloc" => {
                if let Some(buffer_number) = message.int(0) {
                    let file = SoundFile {
                        frames: message.int(1).unwrap_or(0),
                        channels: message.int(2).unwrap_or(1),
                        sample_rate: 44100.0,
                    };
                    self.0.buffers.lock().insert(buffer_number, file);
                    self.emit(Reply::BufferAllocateDone { buffer_number });
                }
            }
            "/b_query" => {
                let buffers = self.0.buffers.lock();
                let infos = message
                    .args
                    .iter()
                    .filter_map(|arg| match arg {
                        OscType::Int(n) => Some(*n),
                        _ => None,
                    })
                    .map(|buffer_number| {
                        let file = buffers.get(&buffer_number).copied().unwrap_or(SoundFile {
                            frames: 0,
                            channels: 0,
                            sample_rate: 0.0,
                        });
                        BufferInfo {
                            buffer_number,
                            number_of_frames: file.frames,
                            number_of_channels: file.channels,
                            sample_rate: file.sample_rate,
                        }
                    })
                    .collect();
                drop(buffers);
                self.emit(Reply::BufferInfo { buffers: infos });
            }
            "/b_write" => {
                if let Some(buffer_number) = message.int(0) {
                    self.emit(Reply::BufferWriteDone { buffer_number });
                }
            }
            "/b_close" => {
                if let Some(buffer_number) = message.int(0) {
                    self.emit(Reply::BufferCloseDone { buffer_number });
                }
            }
            "/b_free" => {
                if let Some(buffer_number) = message.int(0) {
                    self.0.buffers.lock().remove(&buffer_number);
                    self.emit(Reply::BufferFreeDone { buffer_number });
                }
            }
            "/s_new" => {
                if let (Some(id), Some(action), Some(target)) =
                    (message.int(1), message.int(2), message.int(3))
                {
                    self.add_node(id, action, target, false);
                }
            }
            "/g_new" => {
                if let (Some(id), Some(action), Some(target)) =
                    (message.int(0), message.int(1), message.int(2))
                {
                    self.add_node(id, action, target, true);
                }
            }
            "/g_tail" => {
                if let (Some(group), Some(node)) = (message.int(0), message.int(1)) {
                    let is_group = {
                        let mut tree = self.0.tree.lock();
                        let is_group = tree.get(&node).map(|(_, g)| *g).unwrap_or(false);
                        tree.insert(node, (group, is_group));
                        is_group
                    };
                    self.emit(Reply::NodeMove(notification(node, group, is_group)));
                }
            }
            "/n_free" => {
                for id in message.args.iter().filter_map(as_int) {
                    self.free_node(id, true);
                }
            }
            "/g_freeAll" => {
                for id in message.args.iter().filter_map(as_int) {
                    self.free_node(id, false);
                }
            }
            _ => {}
        }
    }

    fn add_node(&self, id: i32, action: i32, target: i32, is_group: bool) {
        // Server-assigned IDs are never reported.
        if id < 0 {
            return;
        }
        let parent = {
            let mut tree = self.0.tree.lock();
            let parent = match action {
                0 | 1 => target,
                _ => tree.get(&target).map(|(parent, _)| *parent).unwrap_or(0),
            };
            tree.insert(id, (parent, is_group));
            parent
        };
        self.emit(Reply::NodeGo(notification(id, parent, is_group)));
    }

    fn free_node(&self, node_id: i32, including_self: bool) {
        let ended = {
            let mut tree = self.0.tree.lock();
            let mut ended = Vec::new();
            collect_descendants(&tree, node_id, &mut ended);
            if including_self {
                if let Some((parent, is_group)) = tree.get(&node_id) {
                    ended.push((node_id, *parent, *is_group));
                }
            }
            for (id, _, _) in ended.iter() {
                tree.remove(id);
            }
            ended
        };
        for (id, parent, is_group) in ended {
            self.emit(Reply::NodeEnd(notification(id, parent, is_group)));
        }
    }
}

fn collect_descendants(
    tree: &HashMap<i32, (i32, bool)>,
    group: i32,
    out: &mut Vec<(i32, i32, bool)>,
) {
    let mut children: Vec<_> = tree
        .iter()
        .filter(|(_, (parent, _))| *parent == group)
        .map(|(id, (parent, is_group))| (*id, *parent, *is_group))
        .collect();
    children.sort();
    for child in children {
        collect_descendants(tree, child.0, out);
        out.push(child);
    }
}

fn notification(node_id: i32, parent_group_id: i32, is_group: bool) -> NodeNotification {
    NodeNotification {
        node_id,
        parent_group_id,
        previous_node_id: -1,
        next_node_id: -1,
        is_group,
    }
}

fn as_int(arg: &OscType) -> Option<i32> {
    match arg {
        OscType::Int(x) => Some(*x),
        _ => None,
    }
}

impl Transport for Loopback {
    fn send_packet(&self, packet: OscPacket) -> Result<()> {
        log::debug!("loopback recv: {:?}", packet);
        self.receive(packet, None);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::Receiver<Reply> {
        let (sender, receiver) = mpsc::channel();
        self.0.subscribers.lock().push(sender);
        receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{AddAction, BufferAllocateRead, BufferQuery, GroupNew, NodeFree, SynthNew};

    #[test]
    fn freeing_a_group_ends_its_children() {
        let loopback = Loopback::new();
        let transport: &dyn Transport = &loopback;
        let replies = transport.subscribe();

        transport
            .send(GroupNew::new(10, AddAction::HeadOfGroup, 0))
            .unwrap();
        transport
            .send(SynthNew::new("beep", 10).synth_id(11))
            .unwrap();
        transport.send(NodeFree::new(vec![10])).unwrap();

        let ended: Vec<i32> = replies
            .try_iter()
            .filter_map(|reply| match reply {
                Reply::NodeEnd(n) => Some(n.node_id),
                _ => None,
            })
            .collect();
        assert_eq!(ended, vec![11, 10]);
        assert!(!loopback.node_exists(10));
    }

    #[test]
    fn reading_an_unknown_file_fails() {
        let loopback = Loopback::new();
        let transport: &dyn Transport = &loopback;
        let result = transport.send_sync(BufferAllocateRead::new(0, "/nope.wav"));
        assert!(result.is_err());
    }

    #[test]
    fn registered_files_can_be_queried() {
        let loopback = Loopback::new();
        loopback.register_sound_file("/loop.wav", 88200, 2, 44100.0);
        let transport: &dyn Transport = &loopback;

        transport
            .send_sync(BufferAllocateRead::new(3, "/loop.wav"))
            .unwrap();
        let reply = transport.send_sync(BufferQuery::new(vec![3])).unwrap();
        assert_eq!(
            reply,
            Reply::BufferInfo {
                buffers: vec![BufferInfo {
                    buffer_number: 3,
                    number_of_frames: 88200,
                    number_of_channels: 2,
                    sample_rate: 44100.0,
                }]
            }
        );
    }
}
