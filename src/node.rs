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

//! Handles to sounds running on the engine.
//!
//! A [`Node`] mirrors one node in the engine's tree. Its state follows the notifications the
//! engine sends back, and callbacks can be hung off its destruction and its next move.
//!
//! Callers mostly deal in [`SoundHandle`]s, the result of triggering something: a single synth,
//! a chord of synths in their own group, an FX, a placeholder for a sound that was skipped, or a
//! sound that is still being prepared on another thread.

use crate::{
    args::Args, bus::AudioBus, promise::Promise, server::NodeNotification, synth_info::SynthInfo,
};
use parking_lot::Mutex;
use std::{fmt, sync::Arc, thread, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Sent to the engine but not yet confirmed.
    Pending,
    Running,
    Paused,
    Destroyed,
}

/// What to do with an `on_next_move` callback after it has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveAction {
    Done,
    Keep,
}

type DestroyedCallback = Box<dyn FnOnce() + Send>;
type MoveCallback = Box<dyn FnMut(&NodeNotification) -> MoveAction + Send>;

/// A synth or group on the engine. Clones refer to the same node.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

struct NodeInner {
    id: i32,
    name: String,
    is_group: bool,
    info: Option<&'static SynthInfo>,
    state: Mutex<NodeState>,
    parent: Mutex<i32>,
    destroyed: Promise<()>,
    on_destroyed: Mutex<Vec<(Option<&'static str>, DestroyedCallback)>>,
    on_next_move: Mutex<Vec<MoveCallback>>,
}

impl Node {
    pub(crate) fn synth(
        id: i32,
        name: impl Into<String>,
        parent: i32,
        info: Option<&'static SynthInfo>,
    ) -> Node {
        Node::new(id, name.into(), parent, false, info)
    }

    pub(crate) fn group(id: i32, name: impl Into<String>, parent: i32) -> Node {
        Node::new(id, name.into(), parent, true, None)
    }

    fn new(
        id: i32,
        name: String,
        parent: i32,
        is_group: bool,
        info: Option<&'static SynthInfo>,
    ) -> Node {
        Node(Arc::new(NodeInner {
            id,
            name,
            is_group,
            info,
            state: Mutex::new(NodeState::Pending),
            parent: Mutex::new(parent),
            destroyed: Promise::new(),
            on_destroyed: Mutex::new(Vec::new()),
            on_next_move: Mutex::new(Vec::new()),
        }))
    }

    pub fn id(&self) -> i32 {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_group(&self) -> bool {
        self.0.is_group
    }

    pub fn info(&self) -> Option<&'static SynthInfo> {
        self.0.info
    }

    pub fn state(&self) -> NodeState {
        *self.0.state.lock()
    }

    pub fn is_alive(&self) -> bool {
        self.state() != NodeState::Destroyed
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == NodeState::Destroyed
    }

    /// The group this node was last seen in.
    pub fn parent_group_id(&self) -> i32 {
        *self.0.parent.lock()
    }

    /// Runs `f` once the node is destroyed, or right away if it already has been.
    pub fn on_destroyed<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_destroyed_callback(None, Box::new(f));
    }

    /// Like [`Node::on_destroyed`], replacing any callback registered under the same key.
    pub fn on_destroyed_keyed<F>(&self, key: &'static str, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_destroyed_callback(Some(key), Box::new(f));
    }

    fn add_destroyed_callback(&self, key: Option<&'static str>, f: DestroyedCallback) {
        {
            let mut callbacks = self.0.on_destroyed.lock();
            if !self.is_destroyed() {
                if key.is_some() {
                    callbacks.retain(|(existing, _)| *existing != key);
                }
                callbacks.push((key, f));
                return;
            }
        }
        f();
    }

    /// Runs `f` the next time the engine reports that this node moved. Returning
    /// [`MoveAction::Keep`] keeps it registered for the move after that.
    pub fn on_next_move<F>(&self, f: F)
    where
        F: FnMut(&NodeNotification) -> MoveAction + Send + 'static,
    {
        if self.is_alive() {
            self.0.on_next_move.lock().push(Box::new(f));
        }
    }

    pub fn wait_until_destroyed(&self) {
        self.0.destroyed.get();
    }

    /// Returns whether the node was destroyed before the timeout.
    pub fn wait_until_destroyed_timeout(&self, timeout: Duration) -> bool {
        self.0.destroyed.get_timeout(timeout).is_some()
    }

    pub(crate) fn started(&self, notification: &NodeNotification) {
        *self.0.parent.lock() = notification.parent_group_id;
        let mut state = self.0.state.lock();
        if *state == NodeState::Pending {
            *state = NodeState::Running;
        }
    }

    pub(crate) fn paused(&self) {
        let mut state = self.0.state.lock();
        if *state != NodeState::Destroyed {
            *state = NodeState::Paused;
        }
    }

    pub(crate) fn resumed(&self) {
        let mut state = self.0.state.lock();
        if *state != NodeState::Destroyed {
            *state = NodeState::Running;
        }
    }

    pub(crate) fn moved(&self, notification: &NodeNotification) {
        *self.0.parent.lock() = notification.parent_group_id;
        let callbacks: Vec<MoveCallback> = self.0.on_next_move.lock().drain(..).collect();
        let mut kept = Vec::new();
        for mut callback in callbacks {
            if callback(notification) == MoveAction::Keep {
                kept.push(callback);
            }
        }
        let mut registered = self.0.on_next_move.lock();
        kept.append(&mut registered);
        *registered = kept;
    }

    pub(crate) fn destroyed(&self) {
        {
            let mut state = self.0.state.lock();
            if *state == NodeState::Destroyed {
                return;
            }
            *state = NodeState::Destroyed;
        }
        let callbacks: Vec<_> = self.0.on_destroyed.lock().drain(..).collect();
        self.0.on_next_move.lock().clear();
        self.0.destroyed.deliver(());
        for (_, callback) in callbacks {
            callback();
        }
    }

    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.0.is_group { "Group" } else { "Node" };
        write!(f, "#<{} {} {:?} {:?}>", kind, self.0.id, self.0.name, self.state())
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Node) -> bool {
        self.ptr_eq(other)
    }
}

/// The synths of a chord, grouped so they can be controlled and killed together.
#[derive(Debug, Clone)]
pub struct ChordGroup {
    pub group: Node,
    pub notes: Vec<f64>,
    pub nodes: Vec<Node>,
    pub info: Option<&'static SynthInfo>,
}

/// An FX synth, reading the bus its block plays into and writing to the enclosing output.
#[derive(Debug, Clone)]
pub struct FxNode {
    pub node: Node,
    pub in_bus: AudioBus,
    pub out_bus: i32,
}

/// Stands in for a sound that was not triggered.
#[derive(Debug, Clone, Default)]
pub struct BlankNode {
    pub args: Args,
}

/// A sound being prepared on another thread, such as a sample that is still loading.
#[derive(Debug, Clone)]
pub struct LazyNode(Promise<Option<SoundHandle>>);

impl LazyNode {
    pub(crate) fn new(promise: Promise<Option<SoundHandle>>) -> LazyNode {
        LazyNode(promise)
    }

    /// Blocks until the sound is ready. `None` means it could not be triggered.
    pub fn resolve(&self) -> Option<SoundHandle> {
        self.0.get()
    }

    pub fn try_resolve(&self) -> Option<Option<SoundHandle>> {
        self.0.try_get()
    }
}

/// The result of triggering a sound.
#[derive(Debug, Clone)]
pub enum SoundHandle {
    Synth(Node),
    Chord(ChordGroup),
    Fx(FxNode),
    Blank(BlankNode),
    Lazy(LazyNode),
}

impl SoundHandle {
    pub(crate) fn blank(args: Args) -> SoundHandle {
        SoundHandle::Blank(BlankNode { args })
    }

    /// The engine node behind this sound. Waits for lazy sounds.
    pub fn node(&self) -> Option<Node> {
        match self {
            SoundHandle::Synth(node) => Some(node.clone()),
            SoundHandle::Chord(chord) => Some(chord.group.clone()),
            SoundHandle::Fx(fx) => Some(fx.node.clone()),
            SoundHandle::Blank(_) => None,
            SoundHandle::Lazy(lazy) => lazy.resolve().and_then(|handle| handle.node()),
        }
    }

    pub fn id(&self) -> Option<i32> {
        self.node().map(|node| node.id())
    }

    pub fn info(&self) -> Option<&'static SynthInfo> {
        match self {
            SoundHandle::Synth(node) => node.info(),
            SoundHandle::Chord(chord) => chord.info,
            SoundHandle::Fx(fx) => fx.node.info(),
            SoundHandle::Blank(_) => None,
            SoundHandle::Lazy(lazy) => lazy.resolve().and_then(|handle| handle.info()),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            SoundHandle::Blank(_) => true,
            SoundHandle::Lazy(lazy) => match lazy.try_resolve() {
                Some(Some(handle)) => handle.is_blank(),
                Some(None) => true,
                None => false,
            },
            _ => false,
        }
    }

    /// Whether the sound may still be playing. Sounds still being prepared count as alive.
    pub fn is_alive(&self) -> bool {
        match self {
            SoundHandle::Synth(node) => node.is_alive(),
            SoundHandle::Chord(chord) => chord.group.is_alive(),
            SoundHandle::Fx(fx) => fx.node.is_alive(),
            SoundHandle::Blank(_) => false,
            SoundHandle::Lazy(lazy) => match lazy.try_resolve() {
                Some(Some(handle)) => handle.is_alive(),
                Some(None) => false,
                None => true,
            },
        }
    }

    /// Runs `f` when the sound ends. Blank sounds never end, so `f` is dropped.
    pub fn on_destroyed<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            SoundHandle::Synth(node) => node.on_destroyed(f),
            SoundHandle::Chord(chord) => chord.group.on_destroyed(f),
            SoundHandle::Fx(fx) => fx.node.on_destroyed(f),
            SoundHandle::Blank(_) => {}
            SoundHandle::Lazy(lazy) => {
                let lazy = lazy.clone();
                let spawned = thread::Builder::new()
                    .name("lazy-on-destroyed".to_owned())
                    .spawn(move || {
                        if let Some(handle) = lazy.resolve() {
                            handle.on_destroyed(f);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("unable to watch lazy sound for its end: {}", err);
                }
            }
        }
    }

    pub fn wait_until_destroyed_timeout(&self, timeout: Duration) -> bool {
        match self.node() {
            Some(node) => node.wait_until_destroyed_timeout(timeout),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn notification(node_id: i32, parent_group_id: i32) -> NodeNotification {
        NodeNotification {
            node_id,
            parent_group_id,
            previous_node_id: -1,
            next_node_id: -1,
            is_group: false,
        }
    }

    #[test]
    fn destruction_runs_callbacks_once() {
        let node = Node::synth(1000, "sonic-pi-beep", 1, None);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let count = count.clone();
            node.on_destroyed(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        node.started(&notification(1000, 1));
        assert_eq!(node.state(), NodeState::Running);

        node.destroyed();
        node.destroyed();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(node.wait_until_destroyed_timeout(Duration::from_millis(1)));

        let late = count.clone();
        node.on_destroyed(move || {
            late.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn keyed_callbacks_replace_each_other() {
        let node = Node::synth(1000, "sonic-pi-sound_in", 1, None);
        let count = Arc::new(AtomicUsize::new(0));
        for n in 1..=2 {
            let count = count.clone();
            node.on_destroyed_keyed("live", move || {
                count.fetch_add(n, Ordering::SeqCst);
            });
        }
        node.destroyed();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn move_callbacks_can_stay_registered() {
        let node = Node::synth(1000, "sonic-pi-sound_in", 5, None);
        let moves = Arc::new(AtomicUsize::new(0));
        let counter = moves.clone();
        node.on_next_move(move |n| {
            counter.fetch_add(1, Ordering::SeqCst);
            if n.parent_group_id > 10 {
                MoveAction::Done
            } else {
                MoveAction::Keep
            }
        });
        node.moved(&notification(1000, 7));
        node.moved(&notification(1000, 12));
        node.moved(&notification(1000, 14));
        assert_eq!(moves.load(Ordering::SeqCst), 2);
        assert_eq!(node.parent_group_id(), 14);
    }

    #[test]
    fn blank_handles() {
        let blank = SoundHandle::blank(Args::new());
        assert!(blank.is_blank());
        assert!(!blank.is_alive());
        assert_eq!(blank.id(), None);
    }

    #[test]
    fn lazy_handles_follow_their_sound() {
        let promise = Promise::new();
        let lazy = SoundHandle::Lazy(LazyNode::new(promise.clone()));
        assert!(lazy.is_alive());
        assert!(!lazy.is_blank());

        let node = Node::synth(1001, "sonic-pi-basic_stereo_player", 1, None);
        promise.deliver(Some(SoundHandle::Synth(node.clone())));
        assert_eq!(lazy.id(), Some(1001));
        node.destroyed();
        assert!(!lazy.is_alive());
    }

    #[test]
    fn lazy_handles_pass_end_callbacks_on() {
        let promise = Promise::new();
        let lazy = SoundHandle::Lazy(LazyNode::new(promise.clone()));
        let ended = Arc::new(AtomicUsize::new(0));
        let counter = ended.clone();
        lazy.on_destroyed(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let node = Node::synth(1002, "sonic-pi-basic_stereo_player", 1, None);
        promise.deliver(Some(SoundHandle::Synth(node.clone())));
        node.destroyed();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ended.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }
}
