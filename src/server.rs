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

//! The OSC conversation with the synthesis engine.
//!
//! Everything the runtime says to SuperCollider goes through a [`Transport`]. Two transports are
//! provided:
//!
//! * [`Server`] - a UDP client for a running `scsynth` process. A background thread decodes every
//!   packet the engine sends back and fans the parsed [`Reply`] values out to subscribers.
//! * [`Loopback`] - an in-process stand-in for the engine that records every packet and answers
//!   asynchronous commands the way `scsynth` would. It backs the test-suite and dry runs.
//!
//! # Commands
//!
//! Only the commands the runtime needs are modelled. Each one is a struct whose required fields
//! are the positional arguments of its `new` constructor, with builder methods for the optional
//! ones.
//!
//! ```
//! # use sonance::server::{AddAction, Control, SynthNew};
//! let command = SynthNew::new("sonic-pi-beep", 1)
//!     .synth_id(1000)
//!     .add_action(AddAction::TailOfGroup)
//!     .controls(vec![Control::new("note", 60.0_f32)]);
//! ```
//!
//! Commands described as **Asynchronous** are run by the engine off the audio thread and answered
//! with a reply. They implement [`AsyncCommand`] so that a transport can block until the answer
//! arrives (see `send_sync` on `dyn Transport`).
//!
//! Timed commands are wrapped in a [`Bundle`] whose NTP time tag tells the engine when to act.

mod loopback;
mod osc_router;
mod private;

pub use loopback::{Loopback, SentMessage};

use private::{Message, Packet, ReplyMatcher};
use rosc::{
    decoder::decode, encoder::encode, OscBundle, OscError, OscMessage, OscPacket, OscTime, OscType,
};
use parking_lot::Mutex;
use std::{
    error, fmt, io,
    net::{ToSocketAddrs, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        mpsc, Arc,
    },
    thread,
    time::{Duration, Instant, SystemTime},
};

/// A channel to the synthesis engine.
///
/// Implementations must deliver every reply the engine sends to every live subscriber, in the
/// order the engine sent them.
pub trait Transport: Send + std::marker::Sync + 'static {
    /// Puts a single encoded packet on the wire.
    fn send_packet(&self, packet: OscPacket) -> Result<()>;

    /// Subscribes to replies from the engine.
    ///
    /// Replies accumulate in the returned channel until the receiver is dropped.
    fn subscribe(&self) -> mpsc::Receiver<Reply>;
}

impl dyn Transport {
    /// Sends a command and returns immediately.
    pub fn send(&self, command: impl Command) -> Result<()> {
        log::debug!("send: {:?}", command);
        self.send_packet(command.into_packet().0)
    }

    /// Sends an asynchronous command and blocks until the engine answers it.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be sent, if the engine reports that the command
    /// failed, or if the transport shuts down before the reply arrives.
    pub fn send_sync(&self, command: impl AsyncCommand) -> Result<Reply> {
        await_reply(self, command, None)
    }

    /// Like `send_sync`, but gives up with a timeout error after `timeout`.
    pub fn send_sync_timeout(
        &self,
        command: impl AsyncCommand,
        timeout: Duration,
    ) -> Result<Reply> {
        await_reply(self, command, Some(timeout))
    }
}

fn await_reply<T>(
    transport: &T,
    command: impl AsyncCommand,
    timeout: Option<Duration>,
) -> Result<Reply>
where
    T: Transport + ?Sized,
{
    log::debug!("send_sync: {:?}", command);
    let reply_matcher = command.reply_matcher();
    let packet = command.into_packet();
    let command_addr = packet.addr().map(str::to_owned);

    let replies = transport.subscribe();
    transport.send_packet(packet.0)?;

    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    loop {
        let reply = match deadline {
            None => replies
                .recv()
                .map_err(|_| Error(ErrorInner::Disconnected))?,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                replies.recv_timeout(remaining).map_err(|err| match err {
                    mpsc::RecvTimeoutError::Timeout => Error(ErrorInner::ReplyTimeout),
                    mpsc::RecvTimeoutError::Disconnected => Error(ErrorInner::Disconnected),
                })?
            }
        };
        if reply_matcher.matches(&reply) {
            return Ok(reply);
        }
        if let Reply::Fail { command, error } = &reply {
            if command_addr.as_deref() == Some(command.as_str()) {
                return Err(Error(ErrorInner::Failed {
                    command: command.clone(),
                    error: error.clone(),
                }));
            }
        }
    }
}

/// A SuperCollider server reached over UDP.
///
/// `Server` is cheap to clone and safe to use from many threads at once.
#[derive(Clone)]
pub struct Server(Arc<ServerInner>);

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers_len = self.0.subscribers.lock().len();
        f.debug_struct("Server")
            .field("socket", &self.0.socket)
            .field("subscribers", &subscribers_len)
            .field("closed", &self.0.closed.load(Ordering::Relaxed))
            .finish()
    }
}

struct ServerInner {
    socket: UdpSocket,
    subscribers: Mutex<Vec<mpsc::Sender<Reply>>>,
    closed: AtomicBool,

    // Sync IDs only need to be unique per client.
    sync_id_counter: AtomicI32,
}

impl Server {
    /// Connects to an externally running engine at the given UDP address.
    ///
    /// This does not boot `scsynth`. Call [`Server::close`] to stop the receive thread.
    ///
    /// # Errors
    ///
    /// Returns an error if a UDP socket cannot be created or cannot connect to `server_address`.
    pub fn connect<A: ToSocketAddrs>(server_address: A) -> Result<Server> {
        let socket =
            UdpSocket::bind("0.0.0.0:0").map_err(|err| Error(ErrorInner::UdpBind(err)))?;
        socket
            .connect(server_address)
            .map_err(|err| Error(ErrorInner::UdpConnect(err)))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(250)))
            .map_err(|err| Error(ErrorInner::UdpConnect(err)))?;
        let server = Server(Arc::new(ServerInner {
            socket,
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            sync_id_counter: AtomicI32::new(0),
        }));
        let reader = server.clone();
        thread::Builder::new()
            .name("scsynth-replies".to_owned())
            .spawn(move || reader.recv_loop())
            .map_err(|err| Error(ErrorInner::Spawn(err)))?;
        Ok(server)
    }

    /// Stops the receive loop. Subscribers see their channels disconnect once it exits.
    pub fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }

    /// Waits for every asynchronous command sent before this call to complete.
    pub fn sync(&self) -> Result<()> {
        let id = self.0.sync_id_counter.fetch_add(1, Ordering::Relaxed);
        await_reply(self, Sync::new(id), None)?;
        Ok(())
    }

    fn recv_loop(self) {
        const MTU: usize = 65536;
        let mut buffer = vec![0_u8; MTU];

        while !self.0.closed.load(Ordering::SeqCst) {
            match self.recv(&mut buffer) {
                Ok(Some(OscPacket::Message(message))) => {
                    if let Some(reply) = Reply::parse(&message) {
                        self.0
                            .subscribers
                            .lock()
                            .retain(|subscriber| subscriber.send(reply.clone()).is_ok());
                    }
                }
                Ok(Some(OscPacket::Bundle(bundle))) => {
                    log::error!("unexpected bundle in server response: {:?}", bundle)
                }
                Ok(None) => {}
                Err(err) => log::error!("error receiving next packet from server: {}", err),
            }
        }
        self.0.subscribers.lock().clear();
        log::debug!("reply loop stopped");
    }

    fn recv(&self, buffer: &mut [u8]) -> Result<Option<OscPacket>> {
        let len = match self.0.socket.recv(buffer) {
            Ok(len) => len,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(None)
            }
            Err(err) => return Err(Error(ErrorInner::Recv(err))),
        };
        let packet = decode(&buffer[..len]).map_err(|err| Error(ErrorInner::OscDecode(err)))?;
        log::debug!("recv: {:?}", packet);
        Ok(Some(packet))
    }
}

impl Transport for Server {
    fn send_packet(&self, packet: OscPacket) -> Result<()> {
        log::debug!("send packet: {:?}", packet);
        let bytes = encode(&packet).map_err(|err| Error(ErrorInner::OscEncode(err)))?;
        self.0
            .socket
            .send(&bytes)
            .map_err(|err| Error(ErrorInner::Send(err)))?;
        Ok(())
    }

    fn subscribe(&self) -> mpsc::Receiver<Reply> {
        let (sender, receiver) = mpsc::channel();
        self.0.subscribers.lock().push(sender);
        receiver
    }
}

/// A specialized [`Result`] type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned by [`Transport`] operations.
#[derive(Debug)]
pub struct Error(ErrorInner);

// Kept private so that OscError does not leak into the public API.
#[derive(Debug)]
enum ErrorInner {
    UdpBind(io::Error),
    UdpConnect(io::Error),
    Spawn(io::Error),
    Send(io::Error),
    Recv(io::Error),
    OscDecode(OscError),
    OscEncode(OscError),
    ReplyTimeout,
    Disconnected,
    Failed { command: String, error: String },
}

impl Error {
    /// True if the engine did not answer in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self.0, ErrorInner::ReplyTimeout)
    }

    /// The engine's own error message, when it rejected a command.
    pub fn engine_failure(&self) -> Option<&str> {
        match &self.0 {
            ErrorInner::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            ErrorInner::UdpBind(e) => write!(f, "binding to UDP socket: {}", e),
            ErrorInner::UdpConnect(e) => write!(f, "connecting UDP socket to server: {}", e),
            ErrorInner::Spawn(e) => write!(f, "spawning reply thread: {}", e),
            ErrorInner::Send(e) => write!(f, "sending message to server: {}", e),
            ErrorInner::Recv(e) => write!(f, "receiving message from server: {}", e),
            ErrorInner::OscDecode(e) => write!(f, "decoding OSC packet: {:?}", e),
            ErrorInner::OscEncode(_) => write!(f, "encoding OSC packet"),
            ErrorInner::ReplyTimeout => write!(f, "timed out waiting for a reply from the server"),
            ErrorInner::Disconnected => write!(f, "server connection closed"),
            ErrorInner::Failed { command, error } => {
                write!(f, "server failed to run {}: {}", command, error)
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.0 {
            ErrorInner::UdpBind(e)
            | ErrorInner::UdpConnect(e)
            | ErrorInner::Spawn(e)
            | ErrorInner::Send(e)
            | ErrorInner::Recv(e) => Some(e),
            _ => None,
        }
    }
}

/// Where a new node goes relative to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddAction {
    HeadOfGroup = 0,
    TailOfGroup = 1,
    BeforeNode = 2,
    AfterNode = 3,
    ReplaceNode = 4,
}

impl Default for AddAction {
    fn default() -> AddAction {
        AddAction::HeadOfGroup
    }
}

/// A synth control's name and value.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct Control {
    id: ControlID,
    value: ControlValue,
}

impl Control {
    pub fn new(id: impl Into<ControlID>, value: impl Into<ControlValue>) -> Control {
        Control {
            id: id.into(),
            value: value.into(),
        }
    }

    fn into_osc_args(self) -> Vec<OscType> {
        vec![self.id.into_osc_type(), self.value.into_osc_type()]
    }
}

/// A control is addressed either by its index in the synth definition or by name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControlID {
    Index(i32),
    Name(String),
}

impl From<i32> for ControlID {
    fn from(index: i32) -> Self {
        Self::Index(index)
    }
}

impl From<String> for ControlID {
    fn from(name: String) -> Self {
        ControlID::Name(name)
    }
}

impl From<&str> for ControlID {
    fn from(name: &str) -> Self {
        ControlID::Name(name.to_owned())
    }
}

impl ControlID {
    fn into_osc_type(self) -> OscType {
        match self {
            ControlID::Index(index) => index.into(),
            ControlID::Name(name) => name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub enum ControlValue {
    Int(i32),
    Float(f32),
    /// Maps the control to a control bus.
    ControlBus(i32),
    /// Maps the control to an audio bus.
    AudioBus(i32),
}

impl From<i32> for ControlValue {
    fn from(n: i32) -> ControlValue {
        ControlValue::Int(n)
    }
}

impl From<f32> for ControlValue {
    fn from(n: f32) -> ControlValue {
        ControlValue::Float(n)
    }
}

impl From<f64> for ControlValue {
    fn from(n: f64) -> ControlValue {
        ControlValue::Float(n as f32)
    }
}

impl ControlValue {
    fn into_osc_type(self) -> OscType {
        match self {
            ControlValue::Int(x) => x.into(),
            ControlValue::Float(x) => x.into(),
            ControlValue::ControlBus(x) => format!("c{}", x).into(),
            ControlValue::AudioBus(x) => format!("a{}", x).into(),
        }
    }
}

/// Commands stamped with the time at which the engine should apply them.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle(OscBundle);

impl Bundle {
    /// A bundle applied at `time`.
    pub fn new<I, C>(time: SystemTime, commands: I) -> Bundle
    where
        I: IntoIterator<Item = C>,
        C: Command,
    {
        Bundle::with_timetag(Self::osc_time(time), commands)
    }

    /// A bundle applied as soon as the engine receives it.
    pub fn immediately<I, C>(commands: I) -> Bundle
    where
        I: IntoIterator<Item = C>,
        C: Command,
    {
        // The OSC spec reserves a time tag of 1 for "now".
        Bundle::with_timetag(OscTime::from((0, 1)), commands)
    }

    fn with_timetag<I, C>(timetag: OscTime, commands: I) -> Bundle
    where
        I: IntoIterator<Item = C>,
        C: Command,
    {
        Bundle(OscBundle {
            timetag,
            content: commands
                .into_iter()
                .map(|command| command.into_packet().0)
                .collect(),
        })
    }

    /// Converts a wall-clock time to an NTP time tag.
    pub fn osc_time(time: SystemTime) -> OscTime {
        const UNIX_OFFSET: u64 = 2_208_988_800; // From RFC 5905
        const TWO_POW_32: f64 = 4294967296.0;

        let unix_time = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        let epoch_time = Duration::new(UNIX_OFFSET, 0) + unix_time;
        let ts_secs = epoch_time.as_secs() as u32;
        let ts_nanos = epoch_time.subsec_nanos() as f64;
        let ts_frac = ((ts_nanos * TWO_POW_32) / 1.0e9).round() as u32;
        OscTime::from((ts_secs, ts_frac))
    }
}

impl Command for Bundle {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Packet(OscPacket::Bundle(self.0))
    }
}

/// OSC commands accepted by the engine.
///
/// This trait cannot be implemented by types outside of this crate.
pub trait Command: fmt::Debug {
    #[doc(hidden)]
    fn into_packet(self) -> Packet;
}

/// Commands that the engine answers with a reply once they complete.
pub trait AsyncCommand: Command {
    #[doc(hidden)]
    fn reply_matcher(&self) -> ReplyMatcher;
}

//
// ========== Master Controls ==========
//

/// Register to receive node notifications (`/n_go`, `/n_end` and friends).
///
/// **Asynchronous**. Replies with [`Reply::NotifyDone`].
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct Notify {
    setting: NotifySetting,
    client_id: Option<i32>,
}

impl Notify {
    pub fn new(setting: NotifySetting) -> Notify {
        Notify {
            setting,
            client_id: None,
        }
    }

    pub fn client_id(mut self, client_id: i32) -> Notify {
        self.client_id = Some(client_id);
        self
    }
}

impl Command for Notify {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/notify")
            .arg(self.setting as i32)
            .optional(self.client_id)
            .into_packet()
    }
}

impl AsyncCommand for Notify {
    #[doc(hidden)]
    fn reply_matcher(&self) -> ReplyMatcher {
        ReplyMatcher::new(|reply| matches!(reply, Reply::NotifyDone { .. }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NotifySetting {
    Start = 1,
    Stop = 0,
}

/// Query the server's load.
///
/// Replies with [`Reply::StatusReply`]. A server that stops answering this is considered dead.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct Status {
    _hidden: (),
}

impl Status {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Status {
        Status { _hidden: () }
    }
}

impl Command for Status {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/status").into_packet()
    }
}

impl AsyncCommand for Status {
    #[doc(hidden)]
    fn reply_matcher(&self) -> ReplyMatcher {
        ReplyMatcher::new(|reply| matches!(reply, Reply::StatusReply(_)))
    }
}

/// Replies with [`Reply::Synced`] once every asynchronous command received before it completed.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct Sync {
    id: i32,
}

impl Sync {
    pub fn new(id: i32) -> Sync {
        Sync { id }
    }
}

impl Command for Sync {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/sync").arg(self.id).into_packet()
    }
}

impl AsyncCommand for Sync {
    #[doc(hidden)]
    fn reply_matcher(&self) -> ReplyMatcher {
        let command_id = self.id;
        ReplyMatcher::new(move |reply| matches!(reply, Reply::Synced { id } if *id == command_id))
    }
}

/// Removes all bundles from the scheduling queue.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct ClearSched {
    _hidden: (),
}

impl ClearSched {
    #[allow(clippy::new_without_default)]
    pub fn new() -> ClearSched {
        ClearSched { _hidden: () }
    }
}

impl Command for ClearSched {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/clearSched").into_packet()
    }
}

//
// ========== Synth Definition Commands ==========
//

/// Load every synth definition file in a directory on the server's filesystem.
///
/// **Asynchronous**. Replies with [`Reply::SynthDefLoadDirDone`].
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct SynthDefLoadDir {
    path: String,
}

impl SynthDefLoadDir {
    pub fn new(path: impl Into<String>) -> SynthDefLoadDir {
        SynthDefLoadDir { path: path.into() }
    }
}

impl Command for SynthDefLoadDir {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/d_loadDir").arg(self.path).into_packet()
    }
}

impl AsyncCommand for SynthDefLoadDir {
    #[doc(hidden)]
    fn reply_matcher(&self) -> ReplyMatcher {
        ReplyMatcher::new(|reply| matches!(reply, Reply::SynthDefLoadDirDone))
    }
}

//
// ========== Node Commands ==========
//

/// Stops nodes abruptly and frees them.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct NodeFree {
    node_ids: Vec<i32>,
}

impl NodeFree {
    pub fn new(node_ids: impl IntoIterator<Item = i32>) -> NodeFree {
        NodeFree {
            node_ids: node_ids.into_iter().collect(),
        }
    }
}

impl Command for NodeFree {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/n_free").args(self.node_ids).into_packet()
    }
}

/// Pauses or resumes nodes.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct NodeRun {
    flags: Vec<(i32, bool)>,
}

impl NodeRun {
    pub fn new(flags: impl IntoIterator<Item = (i32, bool)>) -> NodeRun {
        NodeRun {
            flags: flags.into_iter().collect(),
        }
    }
}

impl Command for NodeRun {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/n_run")
            .args(
                self.flags
                    .into_iter()
                    .flat_map(|(node_id, run)| vec![node_id, run as i32]),
            )
            .into_packet()
    }
}

/// Sets controls on a node. On a group, every node in the group is affected.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct NodeSet {
    node_id: i32,
    controls: Vec<Control>,
}

impl NodeSet {
    pub fn new(node_id: i32, controls: impl IntoIterator<Item = Control>) -> NodeSet {
        NodeSet {
            node_id,
            controls: controls.into_iter().collect(),
        }
    }
}

impl Command for NodeSet {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/n_set")
            .arg(self.node_id)
            .args(self.controls.into_iter().flat_map(Control::into_osc_args))
            .into_packet()
    }
}

//
// ========== Synth Commands ==========
//

/// Creates a synth from a loaded synth definition.
///
/// A synth ID of -1 asks the server to pick one; such synths cannot be addressed later and send
/// no notifications.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct SynthNew {
    synthdef_name: String,
    synth_id: i32,
    add_action: AddAction,
    add_target_id: i32,
    controls: Vec<Control>,
}

impl SynthNew {
    pub fn new(synthdef_name: impl Into<String>, add_target_id: i32) -> SynthNew {
        SynthNew {
            synthdef_name: synthdef_name.into(),
            synth_id: -1,
            add_target_id,
            controls: Vec::new(),
            add_action: AddAction::default(),
        }
    }

    pub fn controls(mut self, controls: impl IntoIterator<Item = Control>) -> SynthNew {
        self.controls = controls.into_iter().collect();
        self
    }

    pub fn add_action(mut self, add_action: AddAction) -> SynthNew {
        self.add_action = add_action;
        self
    }

    pub fn synth_id(mut self, synth_id: i32) -> SynthNew {
        self.synth_id = synth_id;
        self
    }
}

impl Command for SynthNew {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/s_new")
            .arg(self.synthdef_name)
            .arg(self.synth_id)
            .arg(self.add_action as i32)
            .arg(self.add_target_id)
            .args(self.controls.into_iter().flat_map(Control::into_osc_args))
            .into_packet()
    }
}

//
// ========== Group Commands ==========
//

/// Creates an empty group.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct GroupNew {
    group_id: i32,
    add_action: AddAction,
    add_target_id: i32,
}

impl GroupNew {
    pub fn new(group_id: i32, add_action: AddAction, add_target_id: i32) -> GroupNew {
        GroupNew {
            group_id,
            add_action,
            add_target_id,
        }
    }
}

impl Command for GroupNew {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/g_new")
            .arg(self.group_id)
            .arg(self.add_action as i32)
            .arg(self.add_target_id)
            .into_packet()
    }
}

/// Moves a node to the tail of a group.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct GroupTail {
    group_id: i32,
    node_id: i32,
}

impl GroupTail {
    pub fn new(group_id: i32, node_id: i32) -> GroupTail {
        GroupTail { group_id, node_id }
    }
}

impl Command for GroupTail {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/g_tail")
            .arg(self.group_id)
            .arg(self.node_id)
            .into_packet()
    }
}

/// Frees every node in the given groups, leaving the groups in place.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct GroupFreeAll {
    group_ids: Vec<i32>,
}

impl GroupFreeAll {
    pub fn new(group_ids: impl IntoIterator<Item = i32>) -> GroupFreeAll {
        GroupFreeAll {
            group_ids: group_ids.into_iter().collect(),
        }
    }
}

impl Command for GroupFreeAll {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/g_freeAll").args(self.group_ids).into_packet()
    }
}

//
// ========== Buffer Commands ==========
//

/// Allocates a zero-filled buffer.
///
/// **Asynchronous**. Replies with [`Reply::BufferAllocateDone`].
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct BufferAllocate {
    buffer_number: i32,
    number_of_frames: i32,
    number_of_channels: i32,
}

impl BufferAllocate {
    pub fn new(buffer_number: i32, number_of_frames: i32) -> BufferAllocate {
        BufferAllocate {
            buffer_number,
            number_of_frames,
            number_of_channels: 1,
        }
    }

    pub fn number_of_channels(mut self, number_of_channels: i32) -> BufferAllocate {
        self.number_of_channels = number_of_channels;
        self
    }
}

impl Command for BufferAllocate {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/b_alloc")
            .arg(self.buffer_number)
            .arg(self.number_of_frames)
            .arg(self.number_of_channels)
            .into_packet()
    }
}

impl AsyncCommand for BufferAllocate {
    #[doc(hidden)]
    fn reply_matcher(&self) -> ReplyMatcher {
        let command_buffer_number = self.buffer_number;
        ReplyMatcher::new(move |reply| {
            matches!(reply,
                Reply::BufferAllocateDone { buffer_number }
                if *buffer_number == command_buffer_number
            )
        })
    }
}

/// Allocates a buffer and fills it from a sound file. The file decides the channel count.
///
/// **Asynchronous**. Replies with [`Reply::BufferAllocateReadDone`].
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct BufferAllocateRead {
    buffer_number: i32,
    file_path: String,
    starting_frame: i32,
    number_of_frames: i32,
}

impl BufferAllocateRead {
    pub fn new(buffer_number: i32, file_path: impl Into<String>) -> BufferAllocateRead {
        BufferAllocateRead {
            buffer_number,
            file_path: file_path.into(),
            starting_frame: 0,
            number_of_frames: 0,
        }
    }

    pub fn starting_frame(mut self, starting_frame: i32) -> BufferAllocateRead {
        self.starting_frame = starting_frame;
        self
    }

    /// Zero or less reads the whole file.
    pub fn number_of_frames(mut self, number_of_frames: i32) -> BufferAllocateRead {
        self.number_of_frames = number_of_frames;
        self
    }
}

impl Command for BufferAllocateRead {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/b_allocRead")
            .arg(self.buffer_number)
            .arg(self.file_path)
            .arg(self.starting_frame)
            .arg(self.number_of_frames)
            .into_packet()
    }
}

impl AsyncCommand for BufferAllocateRead {
    #[doc(hidden)]
    fn reply_matcher(&self) -> ReplyMatcher {
        let command_buffer_number = self.buffer_number;
        ReplyMatcher::new(move |reply| {
            matches!(reply,
                Reply::BufferAllocateReadDone { buffer_number }
                if *buffer_number == command_buffer_number
            )
        })
    }
}

/// Writes a buffer to a sound file.
///
/// With `leave_file_open` the file is only created; frames are streamed into it by a `DiskOut`
/// synth and the header is finished by [`BufferClose`].
///
/// **Asynchronous**. Replies with [`Reply::BufferWriteDone`].
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct BufferWrite {
    buffer_number: i32,
    file_path: String,
    header_format: HeaderFormat,
    sample_format: SampleFormat,
    number_of_frames: i32,
    starting_frame: i32,
    leave_file_open: i32,
}

impl BufferWrite {
    pub fn new(
        buffer_number: i32,
        file_path: impl Into<String>,
        header_format: HeaderFormat,
        sample_format: SampleFormat,
    ) -> BufferWrite {
        BufferWrite {
            buffer_number,
            file_path: file_path.into(),
            header_format,
            sample_format,
            number_of_frames: -1,
            starting_frame: 0,
            leave_file_open: 0,
        }
    }

    pub fn number_of_frames(mut self, number_of_frames: i32) -> BufferWrite {
        self.number_of_frames = number_of_frames;
        self
    }

    pub fn leave_file_open(mut self) -> BufferWrite {
        self.leave_file_open = 1;
        self
    }
}

impl Command for BufferWrite {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/b_write")
            .arg(self.buffer_number)
            .arg(self.file_path)
            .arg(self.header_format.to_string())
            .arg(self.sample_format.to_string())
            .arg(self.number_of_frames)
            .arg(self.starting_frame)
            .arg(self.leave_file_open)
            .into_packet()
    }
}

impl AsyncCommand for BufferWrite {
    #[doc(hidden)]
    fn reply_matcher(&self) -> ReplyMatcher {
        let command_buffer_number = self.buffer_number;
        ReplyMatcher::new(move |reply| {
            matches!(reply,
                Reply::BufferWriteDone { buffer_number }
                if *buffer_number == command_buffer_number
            )
        })
    }
}

/// Closes the sound file a buffer is streaming into and writes its header.
///
/// **Asynchronous**. Replies with [`Reply::BufferCloseDone`].
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct BufferClose {
    buffer_number: i32,
}

impl BufferClose {
    pub fn new(buffer_number: i32) -> BufferClose {
        BufferClose { buffer_number }
    }
}

impl Command for BufferClose {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/b_close").arg(self.buffer_number).into_packet()
    }
}

impl AsyncCommand for BufferClose {
    #[doc(hidden)]
    fn reply_matcher(&self) -> ReplyMatcher {
        let command_buffer_number = self.buffer_number;
        ReplyMatcher::new(move |reply| {
            matches!(reply,
                Reply::BufferCloseDone { buffer_number }
                if *buffer_number == command_buffer_number
            )
        })
    }
}

/// Frees a buffer and releases its number.
///
/// **Asynchronous**. Replies with [`Reply::BufferFreeDone`].
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct BufferFree {
    buffer_number: i32,
}

impl BufferFree {
    pub fn new(buffer_number: i32) -> BufferFree {
        BufferFree { buffer_number }
    }
}

impl Command for BufferFree {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/b_free").arg(self.buffer_number).into_packet()
    }
}

impl AsyncCommand for BufferFree {
    #[doc(hidden)]
    fn reply_matcher(&self) -> ReplyMatcher {
        let command_buffer_number = self.buffer_number;
        ReplyMatcher::new(move |reply| {
            matches!(reply,
                Reply::BufferFreeDone { buffer_number }
                if *buffer_number == command_buffer_number
            )
        })
    }
}

/// Asks for the size and sample rate of buffers.
///
/// Replies with a single [`Reply::BufferInfo`] covering every requested buffer.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct BufferQuery {
    buffer_numbers: Vec<i32>,
}

impl BufferQuery {
    pub fn new(buffer_numbers: impl IntoIterator<Item = i32>) -> BufferQuery {
        BufferQuery {
            buffer_numbers: buffer_numbers.into_iter().collect(),
        }
    }
}

impl Command for BufferQuery {
    #[doc(hidden)]
    fn into_packet(self) -> Packet {
        Message::addr("/b_query")
            .args(self.buffer_numbers)
            .into_packet()
    }
}

impl AsyncCommand for BufferQuery {
    #[doc(hidden)]
    fn reply_matcher(&self) -> ReplyMatcher {
        let command_buffer_numbers = self.buffer_numbers.clone();
        ReplyMatcher::new(move |reply| {
            matches!(reply,
                Reply::BufferInfo { buffers }
                if buffers.iter().map(|buffer| &buffer.buffer_number).eq(&command_buffer_numbers)
            )
        })
    }
}

//
// ========== Replies ==========
//

/// Messages the engine sends back to the client.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum Reply {
    /// A generic completion, carrying the address of the command that completed.
    Done { command: String },
    NotifyDone {
        client_id: i32,
        max_logins: Option<i32>,
    },
    Synced { id: i32 },
    SynthDefLoadDirDone,
    BufferAllocateDone { buffer_number: i32 },
    BufferAllocateReadDone { buffer_number: i32 },
    BufferWriteDone { buffer_number: i32 },
    BufferCloseDone { buffer_number: i32 },
    BufferFreeDone { buffer_number: i32 },
    BufferInfo { buffers: Vec<BufferInfo> },
    StatusReply(StatusInfo),
    /// A node was created.
    NodeGo(NodeNotification),
    /// A node was freed.
    NodeEnd(NodeNotification),
    /// A node was paused.
    NodeOff(NodeNotification),
    /// A node was resumed.
    NodeOn(NodeNotification),
    /// A node moved within the tree.
    NodeMove(NodeNotification),
    Fail { command: String, error: String },
}

impl Reply {
    fn parse(message: &OscMessage) -> Option<Reply> {
        let mut router = osc_router::Router::default();
        router
            .addr("/done")
            .expect_str("/notify")
            .capture("client_id")
            .capture_optional("max_logins")
            .handle(|args| {
                Some(Reply::NotifyDone {
                    client_id: args.int("client_id")?,
                    max_logins: args.int("max_logins"),
                })
            });
        router
            .addr("/done")
            .expect_str("/d_loadDir")
            .handle(|_| Some(Reply::SynthDefLoadDirDone));
        buffer_done(&mut router, "/b_alloc", |buffer_number| {
            Reply::BufferAllocateDone { buffer_number }
        });
        buffer_done(&mut router, "/b_allocRead", |buffer_number| {
            Reply::BufferAllocateReadDone { buffer_number }
        });
        buffer_done(&mut router, "/b_write", |buffer_number| {
            Reply::BufferWriteDone { buffer_number }
        });
        buffer_done(&mut router, "/b_close", |buffer_number| {
            Reply::BufferCloseDone { buffer_number }
        });
        buffer_done(&mut router, "/b_free", |buffer_number| {
            Reply::BufferFreeDone { buffer_number }
        });
        router
            .addr("/done")
            .capture("command")
            .capture_rest()
            .handle(|args| {
                Some(Reply::Done {
                    command: args.string("command")?,
                })
            });
        router.addr("/synced").capture("id").handle(|args| {
            Some(Reply::Synced {
                id: args.int("id")?,
            })
        });
        router.addr("/b_info").capture_rest().handle(|args| {
            let buffers = args
                .rest()?
                .chunks(4)
                .map(|chunk| match *chunk {
                    [
                        OscType::Int(buffer_number),
                        OscType::Int(number_of_frames),
                        OscType::Int(number_of_channels),
                        OscType::Float(sample_rate),
                    ] => Some(BufferInfo {
                        buffer_number,
                        number_of_frames,
                        number_of_channels,
                        sample_rate,
                    }),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()?;
            Some(Reply::BufferInfo { buffers })
        });
        router
            .addr("/status.reply")
            .capture("unused")
            .capture("ugens")
            .capture("synths")
            .capture("groups")
            .capture("synthdefs")
            .capture("average_cpu")
            .capture("peak_cpu")
            .capture("nominal_sample_rate")
            .capture("actual_sample_rate")
            .handle(|args| {
                Some(Reply::StatusReply(StatusInfo {
                    ugens: args.int("ugens")?,
                    synths: args.int("synths")?,
                    groups: args.int("groups")?,
                    synthdefs: args.int("synthdefs")?,
                    average_cpu: args.float("average_cpu")?,
                    peak_cpu: args.float("peak_cpu")?,
                    nominal_sample_rate: args.double("nominal_sample_rate")?,
                    actual_sample_rate: args.double("actual_sample_rate")?,
                }))
            });
        node_notification(&mut router, "/n_go", Reply::NodeGo);
        node_notification(&mut router, "/n_end", Reply::NodeEnd);
        node_notification(&mut router, "/n_off", Reply::NodeOff);
        node_notification(&mut router, "/n_on", Reply::NodeOn);
        node_notification(&mut router, "/n_move", Reply::NodeMove);
        router
            .addr("/fail")
            .capture("command")
            .capture("error")
            .capture_optional("other")
            .handle(|args| {
                Some(Reply::Fail {
                    command: args.string("command")?,
                    error: args.string("error")?,
                })
            });

        router.route(message)
    }
}

fn buffer_done<F>(router: &mut osc_router::Router<Reply>, command: &'static str, f: F)
where
    F: Fn(i32) -> Reply + 'static,
{
    router
        .addr("/done")
        .expect_str(command)
        .capture("buffer_number")
        .handle(move |args| Some(f(args.int("buffer_number")?)));
}

fn node_notification<F>(router: &mut osc_router::Router<Reply>, addr: &'static str, f: F)
where
    F: Fn(NodeNotification) -> Reply + 'static,
{
    router
        .addr(addr)
        .capture("node_id")
        .capture("parent_group_id")
        .capture("previous_node_id")
        .capture("next_node_id")
        .capture("is_group")
        .capture_optional("head_node_id")
        .capture_optional("tail_node_id")
        .handle(move |args| {
            Some(f(NodeNotification {
                node_id: args.int("node_id")?,
                parent_group_id: args.int("parent_group_id")?,
                previous_node_id: args.int("previous_node_id")?,
                next_node_id: args.int("next_node_id")?,
                is_group: args.int("is_group")? == 1,
            }))
        });
}

/// The position of a node in the tree, as reported by a node notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeNotification {
    pub node_id: i32,
    pub parent_group_id: i32,
    /// -1 when the node is first in its group.
    pub previous_node_id: i32,
    /// -1 when the node is last in its group.
    pub next_node_id: i32,
    pub is_group: bool,
}

/// The answer to [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct StatusInfo {
    pub ugens: i32,
    pub synths: i32,
    pub groups: i32,
    pub synthdefs: i32,
    pub average_cpu: f32,
    pub peak_cpu: f32,
    pub nominal_sample_rate: f64,
    pub actual_sample_rate: f64,
}

/// The size and rate of one buffer, as obtained by [`BufferQuery`].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct BufferInfo {
    pub buffer_number: i32,
    pub number_of_frames: i32,
    pub number_of_channels: i32,
    pub sample_rate: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HeaderFormat {
    Aiff,
    Wav,
    Raw,
}

impl fmt::Display for HeaderFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeaderFormat::Aiff => write!(f, "aiff"),
            HeaderFormat::Wav => write!(f, "wav"),
            HeaderFormat::Raw => write!(f, "raw"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SampleFormat {
    Int8,
    Int16,
    Int24,
    Int32,
    Float,
}

impl SampleFormat {
    /// Picks the integer sample format for a recording bit depth.
    pub fn for_bit_depth(bit_depth: u32) -> SampleFormat {
        match bit_depth {
            8 => SampleFormat::Int8,
            16 => SampleFormat::Int16,
            24 => SampleFormat::Int24,
            32 => SampleFormat::Int32,
            _ => SampleFormat::Float,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SampleFormat::Int8 => write!(f, "int8"),
            SampleFormat::Int16 => write!(f, "int16"),
            SampleFormat::Int24 => write!(f, "int24"),
            SampleFormat::Int32 => write!(f, "int32"),
            SampleFormat::Float => write!(f, "float"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_replies() {
        assert_eq!(
            reply("/done", vec![arg("/quit")]),
            Some(Reply::Done {
                command: "/quit".to_owned()
            })
        );
        assert_eq!(
            reply("/done", vec![arg("/notify"), arg(2), arg(3)]),
            Some(Reply::NotifyDone {
                client_id: 2,
                max_logins: Some(3),
            })
        );
        assert_eq!(reply("/synced", vec![1]), Some(Reply::Synced { id: 1 }));
        assert_eq!(
            reply("/done", vec![arg("/d_loadDir")]),
            Some(Reply::SynthDefLoadDirDone)
        );
        assert_eq!(
            reply("/done", vec![arg("/b_allocRead"), arg(1)]),
            Some(Reply::BufferAllocateReadDone { buffer_number: 1 })
        );
        assert_eq!(
            reply("/done", vec![arg("/b_close"), arg(1)]),
            Some(Reply::BufferCloseDone { buffer_number: 1 })
        );
        assert_eq!(
            reply("/b_info", vec![arg(1), arg(2), arg(3), OscType::Float(4.0)]),
            Some(Reply::BufferInfo {
                buffers: vec![BufferInfo {
                    buffer_number: 1,
                    number_of_frames: 2,
                    number_of_channels: 3,
                    sample_rate: 4.0,
                }]
            })
        );
        assert_eq!(
            reply("/fail", vec![arg("/b_allocRead"), arg("File not found"), arg(3)]),
            Some(Reply::Fail {
                command: "/b_allocRead".to_owned(),
                error: "File not found".to_owned(),
            })
        );
    }

    #[test]
    fn test_parse_node_notifications() {
        assert_eq!(
            reply("/n_end", vec![1001, 2, -1, -1, 0]),
            Some(Reply::NodeEnd(NodeNotification {
                node_id: 1001,
                parent_group_id: 2,
                previous_node_id: -1,
                next_node_id: -1,
                is_group: false,
            }))
        );
        assert_eq!(
            reply("/n_go", vec![5, 0, -1, 6, 1, -1, -1]),
            Some(Reply::NodeGo(NodeNotification {
                node_id: 5,
                parent_group_id: 0,
                previous_node_id: -1,
                next_node_id: 6,
                is_group: true,
            }))
        );
        assert_eq!(reply("/n_move", vec![1, 2]), None);
    }

    #[test]
    fn test_parse_status_reply() {
        let args = vec![
            arg(1),
            arg(10),
            arg(2),
            arg(4),
            arg(90),
            OscType::Float(1.5),
            OscType::Float(3.0),
            OscType::Double(44100.0),
            OscType::Double(44099.9),
        ];
        assert_eq!(
            reply("/status.reply", args),
            Some(Reply::StatusReply(StatusInfo {
                ugens: 10,
                synths: 2,
                groups: 4,
                synthdefs: 90,
                average_cpu: 1.5,
                peak_cpu: 3.0,
                nominal_sample_rate: 44100.0,
                actual_sample_rate: 44099.9,
            }))
        );
    }

    #[test]
    fn immediate_bundles_use_the_reserved_time_tag() {
        let packet = Bundle::immediately(vec![NodeFree::new(vec![1])]).into_packet();
        match packet.0 {
            OscPacket::Bundle(bundle) => assert_eq!(bundle.timetag, OscTime::from((0, 1))),
            other => panic!("expected a bundle, got {:?}", other),
        }
    }

    #[test]
    fn osc_time_counts_from_1900() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_millis(1500);
        assert_eq!(
            Bundle::osc_time(time),
            OscTime::from((2_208_988_801, 1 << 31))
        );
    }

    fn reply<I, T>(addr: &'static str, args: I) -> Option<Reply>
    where
        I: IntoIterator<Item = T>,
        T: Into<OscType>,
    {
        Reply::parse(&OscMessage {
            addr: addr.to_owned(),
            args: args.into_iter().map(T::into).collect(),
        })
    }

    fn arg(x: impl Into<OscType>) -> OscType {
        x.into()
    }
}
