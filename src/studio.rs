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

//! The runtime's view of the synthesis engine.
//!
//! [`Studio`] owns the transport and everything shared across jobs on the engine side: the node
//! tree the runtime builds at startup, node and buffer numbering, the audio bus pool, the sample
//! cache, the master mixer and the recorder.
//!
//! ```text
//! root group 0
//! ├── STUDIO-SYNTHS       job groups, FX containers, chords
//! ├── STUDIO-MIXER        job mixers (head), master mixer
//! └── STUDIO-RECORDING    recorder
//! ```
//!
//! Every node the studio creates is registered in a table before its creation command is sent.
//! A background thread feeds the engine's node notifications into that table, so each [`Node`]
//! tracks whether it is still running.

use crate::{
    args::Args,
    bus::{AudioBus, BusAllocator, IndexAllocator},
    config::RuntimeConfig,
    error::{Error, Result},
    node::Node,
    server::{
        AddAction, BufferAllocate, BufferAllocateRead, BufferClose, BufferFree, BufferQuery,
        BufferWrite, Bundle, ClearSched, Command, Control, GroupFreeAll, GroupNew, GroupTail,
        HeaderFormat, NodeFree, NodeRun, NodeSet, Notify, NotifySetting, Reply, SampleFormat,
        StatusInfo, Sync, SynthDefLoadDir, SynthNew, Transport,
    },
    synth_info::SynthInfo,
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc,
    },
    thread,
    time::SystemTime,
};

const ROOT_GROUP: i32 = 0;
const FIRST_NODE_ID: i32 = 1000;
const RECORDING_FRAMES: i32 = 65536;

/// When the engine should act on a command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timing {
    Now,
    At(SystemTime),
}

/// Where a new node goes, relative to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Head,
    Tail,
    Before,
    After,
    Replace,
}

impl From<Position> for AddAction {
    fn from(position: Position) -> AddAction {
        match position {
            Position::Head => AddAction::HeadOfGroup,
            Position::Tail => AddAction::TailOfGroup,
            Position::Before => AddAction::BeforeNode,
            Position::After => AddAction::AfterNode,
            Position::Replace => AddAction::ReplaceNode,
        }
    }
}

/// A section of a sample, as fractions of its length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slice {
    pub index: usize,
    pub start: f64,
    pub finish: f64,
}

/// A sound file loaded into an engine buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub id: i32,
    pub path: PathBuf,
    pub num_frames: i32,
    pub num_chans: i32,
    pub sample_rate: f64,
    onsets: Arc<Vec<f64>>,
}

impl SampleBuffer {
    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate <= 0.0 {
            return 0.0;
        }
        f64::from(self.num_frames) / self.sample_rate
    }

    /// `num_slices` equal slices.
    pub fn slices(&self, num_slices: usize) -> Vec<Slice> {
        let n = num_slices as f64;
        (0..num_slices)
            .map(|index| Slice {
                index,
                start: index as f64 / n,
                finish: (index + 1) as f64 / n,
            })
            .collect()
    }

    /// One slice per detected onset, running up to the next onset or the end of the sample.
    pub fn onset_slices(&self) -> Vec<Slice> {
        let mut onsets: Vec<f64> = self.onsets.iter().copied().collect();
        if onsets.first() != Some(&0.0) {
            onsets.insert(0, 0.0);
        }
        onsets
            .iter()
            .enumerate()
            .map(|(index, start)| Slice {
                index,
                start: *start,
                finish: onsets.get(index + 1).copied().unwrap_or(1.0),
            })
            .collect()
    }
}

#[derive(Clone)]
struct BaseTree {
    synth_group: Node,
    mixer_group: Node,
    recording_group: Node,
    mixer_bus: AudioBus,
    mixer: Node,
}

struct Recording {
    buffer: i32,
    recorder: Node,
    path: PathBuf,
}

/// Nodes the engine has been asked to create and has not yet reported ended.
#[derive(Default)]
struct NodeTable(Mutex<HashMap<i32, Node>>);

impl NodeTable {
    fn register(&self, node: &Node) {
        self.0.lock().insert(node.id(), node.clone());
    }

    fn forget(&self, id: i32) {
        self.0.lock().remove(&id);
    }

    fn get(&self, id: i32) -> Option<Node> {
        self.0.lock().get(&id).cloned()
    }

    fn handle(&self, reply: &Reply) {
        match reply {
            Reply::NodeGo(n) => {
                if let Some(node) = self.get(n.node_id) {
                    node.started(n);
                }
            }
            Reply::NodeEnd(n) => {
                let node = self.0.lock().remove(&n.node_id);
                if let Some(node) = node {
                    node.destroyed();
                }
            }
            Reply::NodeOff(n) => {
                if let Some(node) = self.get(n.node_id) {
                    node.paused();
                }
            }
            Reply::NodeOn(n) => {
                if let Some(node) = self.get(n.node_id) {
                    node.resumed();
                }
            }
            Reply::NodeMove(n) => {
                if let Some(node) = self.get(n.node_id) {
                    node.moved(n);
                }
            }
            Reply::Fail { command, error } => {
                log::warn!("engine failure in {}: {}", command, error)
            }
            _ => {}
        }
    }

    /// Marks every remaining node as ended.
    fn clear(&self) {
        let nodes: Vec<Node> = self.0.lock().drain().map(|(_, node)| node).collect();
        for node in nodes {
            node.destroyed();
        }
    }
}

/// Shared handle to the engine. Clones refer to the same studio.
#[derive(Clone)]
pub struct Studio(Arc<StudioInner>);

struct StudioInner {
    transport: Arc<dyn Transport>,
    config: RuntimeConfig,
    nodes: Arc<NodeTable>,
    next_node_id: AtomicI32,
    next_sync_id: AtomicI32,
    busses: BusAllocator,
    buffers: IndexAllocator,
    base: RwLock<BaseTree>,
    samples: Mutex<HashMap<PathBuf, SampleBuffer>>,
    sample_loading: Mutex<()>,
    onsets: Mutex<HashMap<PathBuf, Arc<Vec<f64>>>>,
    live_synths: Mutex<HashMap<String, Node>>,
    volume: Mutex<f64>,
    paused: AtomicBool,
    recording: Mutex<Option<Recording>>,
    last_recording: Mutex<Option<PathBuf>>,
}

impl fmt::Debug for Studio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Studio")
            .field("busses", &self.0.busses)
            .field("buffers", &self.0.buffers)
            .finish()
    }
}

impl Studio {
    /// Registers for notifications, loads the synth definitions if a directory is configured and
    /// builds the base node tree.
    pub fn new(transport: Arc<dyn Transport>, config: RuntimeConfig) -> Result<Studio> {
        let nodes = Arc::new(NodeTable::default());
        let replies = transport.subscribe();
        let table = Arc::clone(&nodes);
        thread::Builder::new()
            .name("studio-replies".to_owned())
            .spawn(move || {
                for reply in replies {
                    table.handle(&reply);
                }
                log::debug!("reply stream closed");
            })
            .map_err(Error::Spawn)?;

        transport.send_sync_timeout(Notify::new(NotifySetting::Start), config.reply_wait())?;
        transport.send(ClearSched::new())?;

        let busses = BusAllocator::new(config.num_audio_busses, config.first_private_bus);
        let buffers = IndexAllocator::new(config.num_buffers, 1, 0);
        let placeholder = Self::placeholder_tree()?;
        let studio = Studio(Arc::new(StudioInner {
            transport,
            config,
            nodes,
            next_node_id: AtomicI32::new(FIRST_NODE_ID),
            next_sync_id: AtomicI32::new(1),
            busses,
            buffers,
            base: RwLock::new(placeholder),
            samples: Mutex::new(HashMap::new()),
            sample_loading: Mutex::new(()),
            onsets: Mutex::new(HashMap::new()),
            live_synths: Mutex::new(HashMap::new()),
            volume: Mutex::new(1.0),
            paused: AtomicBool::new(false),
            recording: Mutex::new(None),
            last_recording: Mutex::new(None),
        }));

        studio.load_configured_synthdefs()?;
        let base = studio.build_base_tree()?;
        *studio.0.base.write() = base;
        Ok(studio)
    }

    // Stands in until the real tree is built. Never sent to the engine, and its bus comes from a
    // pool of its own.
    fn placeholder_tree() -> Result<BaseTree> {
        let group = Node::group(ROOT_GROUP, "ROOT", ROOT_GROUP);
        let scratch = BusAllocator::new(BusAllocator::ALLOCATION_SIZE, 0);
        Ok(BaseTree {
            synth_group: group.clone(),
            mixer_group: group.clone(),
            recording_group: group.clone(),
            mixer_bus: scratch.allocate()?,
            mixer: group,
        })
    }

    fn load_configured_synthdefs(&self) -> Result<()> {
        if let Some(path) = self.0.config.synthdefs_path.clone() {
            self.load_synthdefs(path)?;
        }
        Ok(())
    }

    fn build_base_tree(&self) -> Result<BaseTree> {
        let synth_group = self.create_group(AddAction::HeadOfGroup, ROOT_GROUP, "STUDIO-SYNTHS")?;
        let recording_group =
            self.create_group(AddAction::TailOfGroup, ROOT_GROUP, "STUDIO-RECORDING")?;
        let mixer_group =
            self.create_group(AddAction::BeforeNode, recording_group.id(), "STUDIO-MIXER")?;
        let mixer_bus = self.0.busses.allocate()?;
        let info = SynthInfo::get("mixer");
        let args = Args::new()
            .with("in_bus", mixer_bus.to_i32())
            .with("pre_amp", *self.0.volume.lock());
        let mixer = self.trigger_synth(
            "sonic-pi-mixer",
            &mixer_group,
            &args,
            info,
            Timing::Now,
            Position::Tail,
        )?;
        Ok(BaseTree {
            synth_group,
            mixer_group,
            recording_group,
            mixer_bus,
            mixer,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.0.config
    }

    pub fn transport(&self) -> &dyn Transport {
        &*self.0.transport
    }

    pub fn busses(&self) -> &BusAllocator {
        &self.0.busses
    }

    pub fn synth_group(&self) -> Node {
        self.0.base.read().synth_group.clone()
    }

    pub fn mixer_group(&self) -> Node {
        self.0.base.read().mixer_group.clone()
    }

    pub fn recording_group(&self) -> Node {
        self.0.base.read().recording_group.clone()
    }

    /// The private bus the master mixer reads from.
    pub fn mixer_bus(&self) -> i32 {
        self.0.base.read().mixer_bus.to_i32()
    }

    pub fn mixer(&self) -> Node {
        self.0.base.read().mixer.clone()
    }

    fn next_node_id(&self) -> i32 {
        self.0.next_node_id.fetch_add(1, Ordering::SeqCst)
    }

    fn send_timed<C: Command>(&self, timing: Timing, command: C) -> Result<()> {
        let bundle = match timing {
            Timing::Now => Bundle::immediately(vec![command]),
            Timing::At(time) => Bundle::new(time, vec![command]),
        };
        self.transport().send(bundle)?;
        Ok(())
    }

    /// Blocks until the engine has processed everything sent before.
    pub fn sync(&self) -> Result<()> {
        let id = self.0.next_sync_id.fetch_add(1, Ordering::SeqCst);
        self.transport()
            .send_sync_timeout(Sync::new(id), self.0.config.reply_wait())?;
        Ok(())
    }

    pub fn load_synthdefs(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_string_lossy().into_owned();
        self.transport()
            .send_sync_timeout(SynthDefLoadDir::new(path), self.0.config.reply_wait())?;
        Ok(())
    }

    //
    // ========== Nodes ==========
    //

    /// Starts a synth with the given arguments. Sends exactly one bundle, after resuming the
    /// mixer if it was paused.
    pub fn trigger_synth(
        &self,
        synthdef: &str,
        target: &Node,
        args: &Args,
        info: Option<&'static SynthInfo>,
        timing: Timing,
        position: Position,
    ) -> Result<Node> {
        self.start()?;
        let id = self.next_node_id();
        let parent = match position {
            Position::Head | Position::Tail => target.id(),
            _ => target.parent_group_id(),
        };
        let node = Node::synth(id, synthdef, parent, info);
        self.0.nodes.register(&node);
        let controls: Vec<Control> = args
            .numbers()
            .into_iter()
            .map(|(name, value)| Control::new(name, value))
            .collect();
        let command = SynthNew::new(synthdef, target.id())
            .synth_id(id)
            .add_action(position.into())
            .controls(controls);
        if let Err(err) = self.send_timed(timing, command) {
            self.0.nodes.forget(id);
            return Err(err);
        }
        Ok(node)
    }

    /// Starts a synth that exists at most once per `live_id`.
    ///
    /// If the synth is already running it is given the new arguments and moved to the tail of
    /// `target` instead. `pre_trigger` is called with the node before it is started or moved,
    /// `on_move` after.
    #[allow(clippy::too_many_arguments)]
    pub fn trigger_live_synth<S, M>(
        &self,
        live_id: &str,
        synthdef: &str,
        target: &Node,
        args: &Args,
        info: Option<&'static SynthInfo>,
        timing: Timing,
        pre_trigger: S,
        on_move: M,
    ) -> Result<Node>
    where
        S: FnOnce(&Node),
        M: FnOnce(&Node),
    {
        let mut live_synths = self.0.live_synths.lock();
        if let Some(node) = live_synths.get(live_id).filter(|node| node.is_alive()).cloned() {
            pre_trigger(&node);
            on_move(&node);
            self.control(&node, args, timing)?;
            self.send_timed(timing, GroupTail::new(target.id(), node.id()))?;
            return Ok(node);
        }
        let id = self.next_node_id();
        let node = Node::synth(id, synthdef, target.id(), info);
        pre_trigger(&node);
        on_move(&node);
        self.0.nodes.register(&node);
        let controls: Vec<Control> = args
            .numbers()
            .into_iter()
            .map(|(name, value)| Control::new(name, value))
            .collect();
        self.send_timed(
            timing,
            SynthNew::new(synthdef, target.id())
                .synth_id(id)
                .add_action(AddAction::TailOfGroup)
                .controls(controls),
        )?;
        live_synths.insert(live_id.to_owned(), node.clone());
        Ok(node)
    }

    /// Stops a live synth. Returns whether one was running.
    pub fn kill_live_synth(&self, live_id: &str) -> Result<bool> {
        let node = self.0.live_synths.lock().remove(live_id);
        match node {
            Some(node) if node.is_alive() => {
                self.kill(&node, Timing::Now)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn create_group(&self, action: AddAction, target: i32, name: &str) -> Result<Node> {
        let id = self.next_node_id();
        let parent = match action {
            AddAction::HeadOfGroup | AddAction::TailOfGroup => target,
            _ => self
                .0
                .nodes
                .get(target)
                .map(|node| node.parent_group_id())
                .unwrap_or(ROOT_GROUP),
        };
        let group = Node::group(id, name, parent);
        self.0.nodes.register(&group);
        log::debug!("new group {} {:?}", id, name);
        self.transport().send(GroupNew::new(id, action, target))?;
        Ok(group)
    }

    /// Creates a group right away.
    pub fn new_group(&self, position: Position, target: &Node, name: &str) -> Result<Node> {
        self.create_group(position.into(), target.id(), name)
    }

    /// The group a job's synths are created in.
    pub fn new_synth_group(&self, job_id: u64) -> Result<Node> {
        let synth_group = self.synth_group();
        self.new_group(Position::Tail, &synth_group, &format!("Run-{}", job_id))
    }

    pub fn new_fx_bus(&self) -> Result<AudioBus> {
        Ok(self.0.busses.allocate()?)
    }

    /// Sets controls on a running node. Does nothing if the node has ended.
    pub fn control(&self, node: &Node, args: &Args, timing: Timing) -> Result<()> {
        if !node.is_alive() {
            return Ok(());
        }
        let controls: Vec<Control> = args
            .numbers()
            .into_iter()
            .map(|(name, value)| Control::new(name, value))
            .collect();
        if controls.is_empty() {
            return Ok(());
        }
        self.send_timed(timing, NodeSet::new(node.id(), controls))
    }

    /// Frees a node, and everything inside it if it is a group. Does nothing if it has ended.
    pub fn kill(&self, node: &Node, timing: Timing) -> Result<()> {
        if !node.is_alive() {
            return Ok(());
        }
        match timing {
            Timing::Now => self.transport().send(NodeFree::new(vec![node.id()]))?,
            Timing::At(_) => self.send_timed(timing, NodeFree::new(vec![node.id()]))?,
        }
        Ok(())
    }

    //
    // ========== Samples ==========
    //

    /// Loads a sound file into a buffer, returning the buffer and whether it was already loaded.
    pub fn load_sample(&self, path: impl AsRef<Path>) -> Result<(SampleBuffer, bool)> {
        let path = path.as_ref();
        if let Some(buffer) = self.0.samples.lock().get(path) {
            return Ok((buffer.clone(), true));
        }
        let _loading = self.0.sample_loading.lock();
        if let Some(buffer) = self.0.samples.lock().get(path) {
            return Ok((buffer.clone(), true));
        }

        let id = self.0.buffers.allocate()? as i32;
        let path_str = path.to_string_lossy().into_owned();
        let load_failed = |source| Error::SampleLoad {
            path: path_str.clone(),
            source,
        };
        let wait = self.0.config.reply_wait();
        if let Err(err) = self
            .transport()
            .send_sync_timeout(BufferAllocateRead::new(id, path_str.clone()), wait)
        {
            self.0.buffers.release(id as usize);
            return Err(load_failed(err));
        }
        let reply = match self.transport().send_sync_timeout(BufferQuery::new(vec![id]), wait) {
            Ok(reply) => reply,
            Err(err) => {
                self.0.buffers.release(id as usize);
                return Err(load_failed(err));
            }
        };
        let info = match reply {
            Reply::BufferInfo { buffers } => buffers.into_iter().find(|b| b.buffer_number == id),
            _ => None,
        };
        let info = match info {
            Some(info) => info,
            None => {
                self.0.buffers.release(id as usize);
                return Err(Error::invalid(format!("no buffer info for sample {}", path_str)));
            }
        };

        let onsets = self
            .0
            .onsets
            .lock()
            .get(path)
            .cloned()
            .unwrap_or_default();
        let mut buffer = SampleBuffer {
            id,
            path: path.to_owned(),
            num_frames: info.number_of_frames,
            num_chans: info.number_of_channels,
            sample_rate: f64::from(info.sample_rate),
            onsets: Arc::new(Vec::new()),
        };
        buffer.onsets = Arc::new(onset_fractions(&onsets, buffer.duration()));
        log::debug!("loaded sample {:?} into buffer {}", path, id);
        self.0.samples.lock().insert(path.to_owned(), buffer.clone());
        Ok((buffer, false))
    }

    pub fn sample_loaded(&self, path: impl AsRef<Path>) -> bool {
        self.0.samples.lock().contains_key(path.as_ref())
    }

    /// Onset times, in seconds, for a sound file. Applies to the cached buffer too.
    pub fn register_onsets(&self, path: impl Into<PathBuf>, onsets: Vec<f64>) {
        let path = path.into();
        let onsets = Arc::new(onsets);
        if let Some(buffer) = self.0.samples.lock().get_mut(&path) {
            buffer.onsets = Arc::new(onset_fractions(&onsets, buffer.duration()));
        }
        self.0.onsets.lock().insert(path, onsets);
    }

    /// Frees a sample's buffer. Returns whether it was loaded.
    pub fn free_sample(&self, path: impl AsRef<Path>) -> Result<bool> {
        let buffer = self.0.samples.lock().remove(path.as_ref());
        match buffer {
            Some(buffer) => {
                self.free_buffer(buffer.id)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn free_all_samples(&self) -> Result<()> {
        let buffers: Vec<SampleBuffer> = self.0.samples.lock().drain().map(|(_, b)| b).collect();
        for buffer in buffers {
            self.free_buffer(buffer.id)?;
        }
        Ok(())
    }

    fn free_buffer(&self, id: i32) -> Result<()> {
        let result = self
            .transport()
            .send_sync_timeout(BufferFree::new(id), self.0.config.reply_wait());
        self.0.buffers.release(id as usize);
        result?;
        Ok(())
    }

    //
    // ========== Mixer ==========
    //

    /// Sets the master volume, clamped to `0..=5`. Returns the volume applied.
    pub fn set_volume(&self, volume: f64) -> Result<f64> {
        let volume = volume.max(0.0).min(5.0);
        *self.0.volume.lock() = volume;
        self.mixer_control(&Args::new().with("pre_amp", volume))?;
        Ok(volume)
    }

    pub fn volume(&self) -> f64 {
        *self.0.volume.lock()
    }

    /// Sets controls on the master mixer right away.
    pub fn mixer_control(&self, args: &Args) -> Result<()> {
        if let Some(info) = SynthInfo::get("mixer") {
            info.validate(args)?;
        }
        let mixer = self.mixer();
        self.control(&mixer, args, Timing::Now)
    }

    /// Puts the master mixer's filters and modes back to their defaults.
    pub fn mixer_reset(&self) -> Result<()> {
        let mut args = SynthInfo::get("mixer")
            .map(SynthInfo::arg_defaults)
            .unwrap_or_default();
        args.remove("in_bus");
        args.insert("pre_amp", self.volume());
        self.mixer_control(&args)
    }

    pub fn mixer_invert_stereo(&self) -> Result<()> {
        self.mixer_control(&Args::new().with("invert_stereo", 1))
    }

    pub fn mixer_standard_stereo(&self) -> Result<()> {
        self.mixer_control(&Args::new().with("invert_stereo", 0))
    }

    pub fn mixer_mono_mode(&self) -> Result<()> {
        self.mixer_control(&Args::new().with("force_mono", 1))
    }

    pub fn mixer_stereo_mode(&self) -> Result<()> {
        self.mixer_control(&Args::new().with("force_mono", 0))
    }

    /// Stops the mixer group from processing. Does nothing if already paused.
    pub fn pause(&self) -> Result<()> {
        if self.0.paused.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("pausing mixer");
        let mixer_group = self.mixer_group();
        self.transport().send(NodeRun::new(vec![(mixer_group.id(), false)]))?;
        Ok(())
    }

    /// Resumes the mixer group after [`pause`](Studio::pause).
    pub fn start(&self) -> Result<()> {
        if !self.0.paused.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("resuming mixer");
        let mixer_group = self.mixer_group();
        self.transport().send(NodeRun::new(vec![(mixer_group.id(), true)]))?;
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.0.paused.load(Ordering::SeqCst)
    }

    //
    // ========== Recording ==========
    //

    pub fn is_recording(&self) -> bool {
        self.0.recording.lock().is_some()
    }

    /// Starts writing the master output to `path`. Returns false if already recording.
    pub fn recording_start(&self, path: impl Into<PathBuf>) -> Result<bool> {
        let mut recording = self.0.recording.lock();
        if recording.is_some() {
            return Ok(false);
        }
        let path = path.into();
        let buffer = self.0.buffers.allocate()? as i32;
        let wait = self.0.config.reply_wait();
        let started = self
            .transport()
            .send_sync_timeout(
                BufferAllocate::new(buffer, RECORDING_FRAMES).number_of_channels(2),
                wait,
            )
            .and_then(|_| {
                self.transport().send_sync_timeout(
                    BufferWrite::new(
                        buffer,
                        path.to_string_lossy(),
                        HeaderFormat::Wav,
                        SampleFormat::for_bit_depth(self.0.config.recording_bit_depth),
                    )
                    .number_of_frames(0)
                    .leave_file_open(),
                    wait,
                )
            });
        if let Err(err) = started {
            self.0.buffers.release(buffer as usize);
            return Err(err.into());
        }
        let recorder = self.trigger_synth(
            "sonic-pi-recorder",
            &self.recording_group(),
            &Args::new().with("out_buf", buffer).with("in_bus", 0),
            SynthInfo::get("recorder"),
            Timing::Now,
            Position::Head,
        )?;
        log::debug!("recording to {:?}", path);
        *recording = Some(Recording {
            buffer,
            recorder,
            path,
        });
        Ok(true)
    }

    /// Stops recording and closes the file. Returns false if not recording.
    pub fn recording_stop(&self) -> Result<bool> {
        let recording = match self.0.recording.lock().take() {
            Some(recording) => recording,
            None => return Ok(false),
        };
        self.kill(&recording.recorder, Timing::Now)?;
        let wait = self.0.config.reply_wait();
        let closed = self
            .transport()
            .send_sync_timeout(BufferClose::new(recording.buffer), wait);
        let freed = self
            .transport()
            .send_sync_timeout(BufferFree::new(recording.buffer), wait);
        self.0.buffers.release(recording.buffer as usize);
        *self.0.last_recording.lock() = Some(recording.path);
        closed?;
        freed?;
        Ok(true)
    }

    /// Where the last finished recording was written.
    pub fn recording_path(&self) -> Option<PathBuf> {
        self.0.last_recording.lock().clone()
    }

    /// Copies the last finished recording to `dest`. Returns false if there is none.
    pub fn recording_save(&self, dest: impl AsRef<Path>) -> Result<bool> {
        let path = match self.recording_path() {
            Some(path) => path,
            None => return Ok(false),
        };
        fs::copy(&path, dest.as_ref()).map_err(Error::Recording)?;
        Ok(true)
    }

    /// Deletes the last finished recording. Returns false if there is none.
    pub fn recording_delete(&self) -> Result<bool> {
        let path = match self.0.last_recording.lock().take() {
            Some(path) => path,
            None => return Ok(false),
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(err) => Err(Error::Recording(err)),
        }
    }

    //
    // ========== Health ==========
    //

    pub fn status(&self) -> Result<StatusInfo> {
        let reply = self
            .transport()
            .send_sync_timeout(crate::server::Status::new(), self.0.config.reply_wait())?;
        match reply {
            Reply::StatusReply(status) => Ok(status),
            other => Err(Error::invalid(format!("unexpected status reply: {:?}", other))),
        }
    }

    /// Whether the engine failed to answer a status request in time.
    pub fn error_occurred(&self) -> bool {
        match self.status() {
            Ok(_) => false,
            Err(err) => {
                log::error!("engine health check failed: {}", err);
                true
            }
        }
    }

    /// Clears the engine and rebuilds the base tree, as after a restart. Jobs should be stopped
    /// first.
    pub fn reboot(&self) -> Result<()> {
        log::debug!("rebooting studio");
        self.0.live_synths.lock().clear();
        self.0.recording.lock().take();
        self.transport().send(GroupFreeAll::new(vec![ROOT_GROUP]))?;
        self.transport().send(ClearSched::new())?;
        self.sync()?;
        self.0.nodes.clear();
        self.0.samples.lock().clear();
        self.0.buffers.reset();
        self.0.base.read().mixer_bus.free();
        self.load_configured_synthdefs()?;
        let base = self.build_base_tree()?;
        *self.0.base.write() = base;
        self.0.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Frees every node. Used on shutdown.
    pub fn clear(&self) -> Result<()> {
        if self.is_recording() {
            self.recording_stop()?;
        }
        self.transport().send(GroupFreeAll::new(vec![ROOT_GROUP]))?;
        Ok(())
    }
}

fn onset_fractions(onsets: &[f64], duration: f64) -> Vec<f64> {
    if duration <= 0.0 {
        return Vec::new();
    }
    onsets
        .iter()
        .map(|t| (t / duration).max(0.0).min(1.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Loopback;
    use std::time::Duration;

    fn studio() -> (Loopback, Studio) {
        let engine = Loopback::new();
        let studio = Studio::new(Arc::new(engine.clone()), RuntimeConfig::default()).unwrap();
        (engine, studio)
    }

    #[test]
    fn pausing_toggles_the_mixer_group_once() {
        let (engine, studio) = studio();
        let mixer_group = studio.mixer_group().id();
        studio.start().unwrap();
        assert!(engine.sent_to("/n_run").is_empty());

        studio.pause().unwrap();
        studio.pause().unwrap();
        assert!(studio.is_paused());
        studio.start().unwrap();
        assert!(!studio.is_paused());

        let runs = engine.sent_to("/n_run");
        assert_eq!(runs.len(), 2);
        assert_eq!((runs[0].int(0), runs[0].int(1)), (Some(mixer_group), Some(0)));
        assert_eq!((runs[1].int(0), runs[1].int(1)), (Some(mixer_group), Some(1)));
    }

    #[test]
    fn builds_the_base_tree() {
        let (engine, studio) = studio();
        let groups = engine.sent_to("/g_new");
        assert_eq!(groups.len(), 3);
        // synth group at the head of root, recording at the tail, mixer before recording
        assert_eq!((groups[0].int(1), groups[0].int(2)), (Some(0), Some(0)));
        assert_eq!((groups[1].int(1), groups[1].int(2)), (Some(1), Some(0)));
        assert_eq!(groups[2].int(1), Some(2));
        assert_eq!(groups[2].int(2), Some(studio.recording_group().id()));

        let mixer = &engine.sent_to("/s_new")[0];
        assert_eq!(mixer.string(0), Some("sonic-pi-mixer"));
        assert_eq!(mixer.control("in_bus"), Some(studio.mixer_bus() as f32));
        assert_eq!(studio.busses().free_count(), studio.busses().capacity() - 1);
    }

    #[test]
    fn triggers_are_single_bundles() {
        let (engine, studio) = studio();
        engine.clear_sent();
        let group = studio.synth_group();
        let at = SystemTime::now();
        let node = studio
            .trigger_synth(
                "sonic-pi-beep",
                &group,
                &Args::new().with("note", 60),
                SynthInfo::get("beep"),
                Timing::At(at),
                Position::Tail,
            )
            .unwrap();
        let sent = engine.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].addr, "/s_new");
        assert_eq!(sent[0].timetag, Some(Bundle::osc_time(at)));
        assert_eq!(sent[0].control("note"), Some(60.0));

        engine.end_node(node.id());
        assert!(node.wait_until_destroyed_timeout(Duration::from_secs(1)));
        // Controlling or killing an ended node sends nothing.
        studio.control(&node, &Args::new().with("amp", 0.5), Timing::Now).unwrap();
        studio.kill(&node, Timing::Now).unwrap();
        assert_eq!(engine.sent().len(), 1);
    }

    #[test]
    fn killing_a_group_ends_its_synths() {
        let (engine, studio) = studio();
        let group = studio.new_synth_group(1).unwrap();
        let synth = studio
            .trigger_synth("sonic-pi-beep", &group, &Args::new(), None, Timing::Now, Position::Tail)
            .unwrap();
        studio.kill(&group, Timing::Now).unwrap();
        assert!(synth.wait_until_destroyed_timeout(Duration::from_secs(1)));
        assert!(group.wait_until_destroyed_timeout(Duration::from_secs(1)));
        assert!(!engine.node_exists(synth.id()));
    }

    #[test]
    fn samples_are_cached() {
        let (engine, studio) = studio();
        engine.register_sound_file("/samples/loop.wav", 88200, 2, 44100.0);
        studio.register_onsets("/samples/loop.wav", vec![0.5, 1.0]);

        let (buffer, cached) = studio.load_sample("/samples/loop.wav").unwrap();
        assert!(!cached);
        assert_eq!(buffer.duration(), 2.0);
        assert_eq!(buffer.num_chans, 2);
        let onsets = buffer.onset_slices();
        assert_eq!(onsets.len(), 3);
        assert_eq!((onsets[1].start, onsets[1].finish), (0.25, 0.5));

        let (again, cached) = studio.load_sample("/samples/loop.wav").unwrap();
        assert!(cached);
        assert_eq!(again.id, buffer.id);
        assert!(studio.sample_loaded("/samples/loop.wav"));

        assert!(studio.free_sample("/samples/loop.wav").unwrap());
        assert!(!studio.sample_loaded("/samples/loop.wav"));
        assert_eq!(engine.sent_to("/b_free").len(), 1);
    }

    #[test]
    fn missing_samples_release_their_buffer() {
        let (_engine, studio) = studio();
        match studio.load_sample("/nowhere.wav") {
            Err(Error::SampleLoad { path, .. }) => assert_eq!(path, "/nowhere.wav"),
            other => panic!("unexpected result: {:?}", other.map(|(b, _)| b)),
        }
        assert_eq!(studio.0.buffers.free_count(), studio.0.buffers.capacity());
    }

    #[test]
    fn volume_is_clamped() {
        let (engine, studio) = studio();
        assert_eq!(studio.set_volume(7.0).unwrap(), 5.0);
        assert_eq!(studio.set_volume(-1.0).unwrap(), 0.0);
        let sets = engine.sent_to("/n_set");
        assert_eq!(sets.last().unwrap().control("pre_amp"), Some(0.0));
        assert_eq!(sets.last().unwrap().int(0), Some(studio.mixer().id()));
    }

    #[test]
    fn recording_round_trip() {
        let (engine, studio) = studio();
        assert!(studio.recording_start("/tmp/sonance-test.wav").unwrap());
        assert!(!studio.recording_start("/tmp/other.wav").unwrap());
        assert!(studio.is_recording());
        assert!(studio.recording_stop().unwrap());
        assert!(!studio.recording_stop().unwrap());

        let addrs: Vec<String> = engine
            .sent()
            .into_iter()
            .map(|m| m.addr)
            .filter(|a| a.starts_with("/b_"))
            .collect();
        assert_eq!(addrs, vec!["/b_alloc", "/b_write", "/b_close", "/b_free"]);
        assert_eq!(studio.recording_path(), Some(PathBuf::from("/tmp/sonance-test.wav")));
    }

    #[test]
    fn health_checks_time_out() {
        let engine = Loopback::new();
        let config = RuntimeConfig {
            reply_timeout: 0.05,
            ..RuntimeConfig::default()
        };
        let studio = Studio::new(Arc::new(engine.clone()), config).unwrap();
        assert!(!studio.error_occurred());
        engine.set_responsive(false);
        assert!(studio.error_occurred());
    }

    #[test]
    fn reboot_rebuilds_the_tree() {
        let (engine, studio) = studio();
        let old_mixer = studio.mixer();
        studio.reboot().unwrap();
        assert!(old_mixer.wait_until_destroyed_timeout(Duration::from_secs(1)));
        assert!(studio.mixer().id() != old_mixer.id());
        assert_eq!(engine.sent_to("/g_freeAll").len(), 1);
        assert_eq!(studio.busses().free_count(), studio.busses().capacity() - 1);
    }
}
