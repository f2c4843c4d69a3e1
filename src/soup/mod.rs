//! The execution queue ("soup"): channels, pending comm frames and the set
//! of reactions waiting to run.
//!
//! All mutation goes through [`ExecutionQueue::add_channel`],
//! [`ExecutionQueue::add_group`], [`ExecutionQueue::enqueue`] /
//! [`ExecutionQueue::dequeue`] and the export pair. Registering a group runs
//! the rendezvous matcher on every channel the group touched.

mod codec;
mod frames;

pub use codec::ReplacementMap;
pub use frames::ChannelFrame;

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::channel::{export_token, parse_export_token, Channel, ChannelType, CommChannel};
use crate::comm::{Comm, CommGroup};
use crate::error::{KernelError, Result};
use crate::process::{Continuation, Process};
use crate::registry::Resolver;
use crate::types::{ChannelId, Cycle, FrameId, GroupId, Value};

use frames::{CommFrame, CommGroupFrame, FrameOp};

/// Durable state of one process instance.
#[derive(Default)]
pub struct ExecutionQueue {
    /// Pending reactions; any of them may run next.
    reactions: VecDeque<Continuation>,
    channels: BTreeMap<ChannelId, ChannelFrame>,
    groups: BTreeMap<GroupId, CommGroupFrame>,
    frames: BTreeMap<FrameId, CommFrame>,
    object_id_counter: u32,
    cycle_counter: Cycle,
    global_data: Option<Value>,
    /// Closures rebuilt by the last read, grouped by their index key.
    index: BTreeMap<String, Vec<Arc<dyn Process>>>,
    resolver: Option<Arc<Resolver>>,
    replacement: Option<Arc<dyn ReplacementMap>>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Hooks ──

    /// Install the resolver used to rebuild closures on [`ExecutionQueue::read`].
    pub fn set_resolver(&mut self, resolver: Arc<Resolver>) {
        self.resolver = Some(resolver);
    }

    pub fn resolver(&self) -> Option<&Arc<Resolver>> {
        self.resolver.as_ref()
    }

    /// Install a hook that swaps values out on write and back in on read.
    pub fn set_replacement_map(&mut self, replacement: Arc<dyn ReplacementMap>) {
        self.replacement = Some(replacement);
    }

    // ── Channels ──

    /// Register a fresh channel and assign it the next id.
    pub fn add_channel(&mut self, channel: &mut CommChannel) -> Result<Channel> {
        if let Some(id) = channel.id() {
            return Err(KernelError::AlreadyRegistered {
                what: "channel",
                id,
            });
        }
        let id = self.next_id();
        let frame = ChannelFrame::new(
            channel.kind().clone(),
            id,
            channel.description().to_string(),
        );
        trace!(channel = %frame.channel(), description = %frame.description, "add channel");
        self.channels.insert(id, frame);
        channel.assign_id(id);
        Ok(Channel::new(id, channel.kind().clone()))
    }

    /// Shorthand for registering a new [`CommChannel`].
    pub fn new_channel(
        &mut self,
        kind: impl Into<ChannelType>,
        description: impl Into<String>,
    ) -> Channel {
        let id = self.next_id();
        let kind = kind.into();
        self.channels
            .insert(id, ChannelFrame::new(kind.clone(), id, description.into()));
        Channel::new(id, kind)
    }

    pub fn channel_frame(&self, id: ChannelId) -> Option<&ChannelFrame> {
        self.channels.get(&id)
    }

    pub fn channel_frames(&self) -> impl Iterator<Item = &ChannelFrame> {
        self.channels.values()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn find_channel_frame(&mut self, id: ChannelId) -> Result<&mut ChannelFrame> {
        self.channels
            .get_mut(&id)
            .ok_or(KernelError::NoSuchChannel(id))
    }

    // ── Comm groups ──

    /// Register every member of `group`, then match each channel it touched.
    ///
    /// The group is validated as a whole first, so a rejected group leaves
    /// the queue untouched.
    pub fn add_group(&mut self, group: &mut CommGroup) -> Result<()> {
        if let Some(id) = group.id() {
            return Err(KernelError::AlreadyRegistered { what: "group", id });
        }
        trace!(
            replicated = group.is_replicated(),
            members = group.comms().len(),
            "add group"
        );
        self.check_group(group)?;

        let group_id = self.next_id();
        let replicated = group.is_replicated();
        let mut member_frames = Vec::with_capacity(group.comms().len());
        for comm in group.comms() {
            let frame_id = self.next_id();
            let channel_id = comm.channel().id();
            let (op, is_send) = match comm {
                Comm::Send { message, reply, .. } => (
                    FrameOp::Send {
                        message: message.clone(),
                        reply: reply.clone(),
                    },
                    true,
                ),
                Comm::Recv { listener, .. } => (
                    FrameOp::Recv {
                        listener: Arc::clone(listener),
                    },
                    false,
                ),
            };
            let cframe = self.find_channel_frame(channel_id)?;
            if is_send {
                cframe.send_frames.insert(frame_id);
                cframe.replicated_send |= replicated;
            } else {
                cframe.recv_frames.insert(frame_id);
                cframe.replicated_recv |= replicated;
            }
            self.frames.insert(
                frame_id,
                CommFrame {
                    group: group_id,
                    channel: channel_id,
                    op,
                },
            );
            member_frames.push(frame_id);
        }
        self.groups.insert(
            group_id,
            CommGroupFrame {
                replicated,
                frames: member_frames,
            },
        );
        group.assign_id(group_id);

        for channel in group.channels() {
            self.match_communications(channel)?;
        }
        Ok(())
    }

    fn check_group(&self, group: &CommGroup) -> Result<()> {
        // Replication flags as they would stand after each member registers.
        let mut flags: BTreeMap<ChannelId, (bool, bool)> = BTreeMap::new();
        for comm in group.comms() {
            let id = comm.channel().id();
            let cframe = self
                .channels
                .get(&id)
                .ok_or(KernelError::NoSuchChannel(id))?;
            let (rsend, rrecv) = flags
                .entry(id)
                .or_insert((cframe.replicated_send, cframe.replicated_recv));
            if comm.is_send() {
                if *rsend {
                    return Err(KernelError::ReplicatedSend { channel: id });
                }
                if group.is_replicated() {
                    if *rrecv {
                        return Err(KernelError::ReplicationConflict { channel: id });
                    }
                    *rsend = true;
                }
            } else {
                if *rrecv {
                    return Err(KernelError::ReplicatedReceive { channel: id });
                }
                if group.is_replicated() {
                    if *rsend {
                        return Err(KernelError::ReplicationConflict { channel: id });
                    }
                    *rrecv = true;
                }
            }
        }
        Ok(())
    }

    /// Pair pending sends with pending receives on `channel` until one side
    /// runs dry. Which candidate pairs first is unspecified.
    fn match_communications(&mut self, channel: ChannelId) -> Result<usize> {
        let mut produced = 0;
        loop {
            let Some(cframe) = self.channels.get(&channel) else {
                break;
            };
            let (Some(&send_id), Some(&recv_id)) =
                (cframe.send_frames.first(), cframe.recv_frames.first())
            else {
                break;
            };
            let via = cframe.kind.clone();
            let send = self.frame(send_id)?;
            let recv = self.frame(recv_id)?;
            let (message, reply) = match &send.op {
                FrameOp::Send { message, reply } => (message.clone(), reply.clone()),
                FrameOp::Recv { .. } => {
                    return Err(internal(format!("frame {send_id} is not a send")))
                }
            };
            let listener = match &recv.op {
                FrameOp::Recv { listener } => Arc::clone(listener),
                FrameOp::Send { .. } => {
                    return Err(internal(format!("frame {recv_id} is not a receive")))
                }
            };
            let (send_group, recv_group) = (send.group, recv.group);
            let send_replicated = self.group_replicated(send_group)?;
            let recv_replicated = self.group_replicated(recv_group)?;
            if send_replicated && recv_replicated {
                return Err(KernelError::ReplicationConflict { channel });
            }

            let description = tracing::enabled!(tracing::Level::DEBUG).then(|| {
                let ch = Channel::new(channel, via.clone());
                format!("{ch} ? {{...}} | {ch} ! {}(...)", message.method)
            });
            let mut continuation = Continuation::delivery(listener, message, reply, via);
            if let Some(desc) = description {
                continuation = continuation.with_description(desc);
            }
            debug!(channel, send = send_id, recv = recv_id, "rendezvous");
            self.enqueue(continuation);
            produced += 1;

            if !send_replicated {
                self.remove_group(send_group);
            }
            if !recv_replicated {
                self.remove_group(recv_group);
            }
        }
        Ok(produced)
    }

    fn frame(&self, id: FrameId) -> Result<&CommFrame> {
        self.frames
            .get(&id)
            .ok_or_else(|| internal(format!("dangling frame {id}")))
    }

    fn group_replicated(&self, id: GroupId) -> Result<bool> {
        self.groups
            .get(&id)
            .map(|g| g.replicated)
            .ok_or_else(|| internal(format!("dangling group {id}")))
    }

    /// Retract every frame of a group from its channel.
    fn remove_group(&mut self, id: GroupId) {
        let Some(group) = self.groups.remove(&id) else {
            return;
        };
        for frame_id in group.frames {
            if let Some(frame) = self.frames.remove(&frame_id) {
                if let Some(cframe) = self.channels.get_mut(&frame.channel) {
                    if frame.op.is_send() {
                        cframe.send_frames.remove(&frame_id);
                    } else {
                        cframe.recv_frames.remove(&frame_id);
                    }
                }
            }
        }
    }

    // ── Reactions ──

    pub fn enqueue(&mut self, continuation: Continuation) {
        trace!(target_method = %continuation.target(), "enqueue reaction");
        self.reactions.push_back(continuation);
    }

    /// Remove and return some pending reaction.
    pub fn dequeue(&mut self) -> Option<Continuation> {
        self.reactions.pop_front()
    }

    pub fn has_reactions(&self) -> bool {
        !self.reactions.is_empty()
    }

    pub fn reaction_count(&self) -> usize {
        self.reactions.len()
    }

    pub fn reactions(&self) -> impl Iterator<Item = &Continuation> {
        self.reactions.iter()
    }

    // ── Counters ──

    /// Advance and return the cycle counter.
    pub fn cycle(&mut self) -> Cycle {
        self.cycle_counter += 1;
        self.cycle_counter
    }

    pub fn current_cycle(&self) -> Cycle {
        self.cycle_counter
    }

    pub fn object_id_counter(&self) -> u32 {
        self.object_id_counter
    }

    fn next_id(&mut self) -> u32 {
        self.object_id_counter += 1;
        self.object_id_counter
    }

    // ── Exports ──

    /// Hand out a token for use outside the queue; holds a reference until
    /// consumed.
    pub fn create_export(&mut self, channel: &Channel) -> Result<String> {
        let cframe = self.find_channel_frame(channel.id())?;
        cframe.ref_count += 1;
        trace!(channel = %channel, ref_count = cframe.ref_count, "create export");
        Ok(export_token(channel))
    }

    /// Resolve an exported token back into a channel, releasing its
    /// reference. A token with no outstanding reference is rejected.
    pub fn consume_export(&mut self, token: &str) -> Result<Channel> {
        let id = parse_export_token(token)?;
        let cframe = self.find_channel_frame(id)?;
        if cframe.ref_count <= 0 {
            warn!(channel = id, ref_count = cframe.ref_count, "export consumed twice");
            return Err(KernelError::ExportNotHeld(id));
        }
        cframe.ref_count -= 1;
        trace!(channel = id, ref_count = cframe.ref_count, "consume export");
        Ok(cframe.channel())
    }

    /// True once nothing is left to run and nothing outside the queue holds
    /// a channel.
    pub fn is_complete(&self) -> bool {
        self.reactions.is_empty() && self.channels.values().all(|c| c.ref_count <= 0)
    }

    // ── Global data ──

    pub fn global_data(&self) -> Option<&Value> {
        self.global_data.as_ref()
    }

    pub fn set_global_data(&mut self, data: Value) {
        self.global_data = Some(data);
    }

    // ── Index ──

    /// Closures restored by the last [`ExecutionQueue::read`] that carry an
    /// index key. Rebuilt on every read.
    pub fn index(&self) -> &BTreeMap<String, Vec<Arc<dyn Process>>> {
        &self.index
    }

    pub fn indexed(&self, key: &str) -> &[Arc<dyn Process>] {
        self.index.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    // ── Diagnostics ──

    pub fn dump_state(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "execution queue state dump:");
        let _ = writeln!(out, "-- GENERAL INFO");
        let _ = writeln!(out, "   Current Cycle   : {}", self.cycle_counter);
        let _ = writeln!(out, "   Num. Reactions  : {}", self.reactions.len());
        let _ = writeln!(out, "   Num. Channels   : {}", self.channels.len());
        let _ = writeln!(out, "   Num. Groups     : {}", self.groups.len());
        if !self.reactions.is_empty() {
            let _ = writeln!(out, "-- REACTIONS");
            for (i, c) in self.reactions.iter().enumerate() {
                let _ = writeln!(out, "   #{}:  {}", i + 1, c);
            }
        }
        if !self.channels.is_empty() {
            let _ = writeln!(out, "-- CHANNELS");
            for cframe in self.channels.values() {
                let _ = writeln!(out, "   {cframe}");
            }
        }
        out
    }
}

impl std::fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionQueue")
            .field("cycle", &self.cycle_counter)
            .field("object_id_counter", &self.object_id_counter)
            .field("reactions", &self.reactions.len())
            .field("channels", &self.channels.len())
            .field("groups", &self.groups.len())
            .field("indexed", &self.index.len())
            .finish()
    }
}

fn internal(msg: String) -> KernelError {
    KernelError::Internal(msg)
}
