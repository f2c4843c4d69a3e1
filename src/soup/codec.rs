//! Persisted form of the execution queue.
//!
//! The stream is gzip-compressed and holds a sequence of bincode records,
//! in order:
//!
//! ```text
//! objectIdCounter:u32  cycleCounter:u32
//! reactionCount:u32    { closure, method, argCount:u32, args.., reply?, via? }*
//! groupCount:u32       { id, replicated, memberCount:u32, { frameId, channelId, op }* }*
//! channelCount:u32     { type, id, description, refCount:i32, rsend, rrecv,
//!                        sendCount:u32, frameId*, recvCount:u32, frameId* }*
//! globalData?
//! ```
//!
//! Channels inside any value are written as `(type, id)` references. Writing
//! is the only point where unreachable channels are collected. No single
//! record may exceed [`MAX_RECORD`] bytes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{Read, Write};
use std::sync::Arc;

use bincode::Options;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::frames::{ChannelFrame, CommFrame, CommGroupFrame, FrameOp};
use super::ExecutionQueue;
use crate::channel::{Channel, ChannelType, Message};
use crate::error::{KernelError, Result};
use crate::process::{Continuation, Process};
use crate::registry::Resolver;
use crate::types::{ChannelId, FrameId, GroupId, Value};

const OP_SEND: u8 = 0;
const OP_RECV: u8 = 1;

/// Upper bound on the encoded size of one record.
pub const MAX_RECORD: u64 = 64 * 1024 * 1024;

/// Fixed-width little-endian records, each bounded by [`MAX_RECORD`].
fn wire() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(MAX_RECORD)
}

/// Swaps values for lightweight stand-ins on write and back on read.
///
/// Channels are never offered to the hook. `restore` must undo `replace`.
pub trait ReplacementMap: Send + Sync {
    fn replace(&self, value: &Value) -> Option<Value>;

    fn restore(&self, value: &Value) -> Option<Value>;
}

// =============================================================================
// WRITE
// =============================================================================

struct Encoder<W> {
    out: W,
}

impl<W: Write> Encoder<W> {
    fn put<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        wire()
            .serialize_into(&mut self.out, value)
            .map_err(|e| KernelError::Encode(e.to_string()))
    }

    fn count(&mut self, n: usize) -> Result<()> {
        let n = u32::try_from(n).map_err(|_| KernelError::Encode(format!("count {n} too large")))?;
        self.put(&n)
    }

    fn closure(&mut self, kind: &str, state: &Value) -> Result<()> {
        self.put(kind)?;
        self.put(state)
    }

    fn message(&mut self, message: &Message, reply: &Option<Channel>) -> Result<()> {
        self.put(message.method.as_str())?;
        self.count(message.args.len())?;
        for arg in &message.args {
            self.put(arg)?;
        }
        self.put(reply)
    }
}

/// Values as they go on the wire, with every referenced channel noted.
struct Outgoing<'a> {
    replacement: Option<&'a dyn ReplacementMap>,
    referenced: BTreeSet<ChannelId>,
}

impl Outgoing<'_> {
    fn value(&mut self, value: &Value) -> Value {
        let out = match self.replacement {
            Some(map) => value.substitute(&|v| map.replace(v)),
            None => value.clone(),
        };
        out.collect_channels(&mut self.referenced);
        out
    }

    fn message(&mut self, message: &Message, reply: &Option<Channel>) -> (Message, Option<Channel>) {
        if let Some(r) = reply {
            self.referenced.insert(r.id());
        }
        let args = message.args.iter().map(|a| self.value(a)).collect();
        (Message::new(message.method.clone(), args), reply.clone())
    }
}

impl ExecutionQueue {
    /// Serialize the whole queue to `out`.
    ///
    /// Channels with no external references that nothing in the stream
    /// points at are dropped from the queue instead of being written.
    pub fn write<W: Write>(&mut self, out: W) -> Result<()> {
        let mut outgoing = Outgoing {
            replacement: self.replacement.as_deref(),
            referenced: BTreeSet::new(),
        };

        let reactions: Vec<_> = self
            .reactions
            .iter()
            .map(|c| {
                let state = outgoing.value(&c.closure().state());
                let (message, reply) = outgoing.message(c.message(), &c.reply().cloned());
                let via = c.via().map(|v| v.as_str().to_string());
                (c.closure().kind(), state, message, reply, via)
            })
            .collect();

        let mut groups = Vec::with_capacity(self.groups.len());
        for (&group_id, group) in &self.groups {
            let mut members = Vec::with_capacity(group.frames.len());
            for frame_id in &group.frames {
                let frame = self.frames.get(frame_id).ok_or_else(|| {
                    KernelError::Internal(format!("group {group_id} lists missing frame {frame_id}"))
                })?;
                outgoing.referenced.insert(frame.channel);
                let op = match &frame.op {
                    FrameOp::Send { message, reply } => {
                        let (message, reply) = outgoing.message(message, reply);
                        OutgoingOp::Send { message, reply }
                    }
                    FrameOp::Recv { listener } => OutgoingOp::Recv {
                        kind: listener.kind(),
                        state: outgoing.value(&listener.state()),
                    },
                };
                members.push((*frame_id, frame.channel, op));
            }
            groups.push((group_id, group.replicated, members));
        }

        let global_data = self.global_data.as_ref().map(|g| outgoing.value(g));
        let referenced = outgoing.referenced;

        self.channels.retain(|id, cframe| {
            let keep = cframe.ref_count > 0 || cframe.has_pending() || referenced.contains(id);
            if !keep {
                debug!(channel = %cframe, "GC channel");
            }
            keep
        });

        let mut enc = Encoder {
            out: GzEncoder::new(out, Compression::default()),
        };
        enc.put(&self.object_id_counter)?;
        enc.put(&self.cycle_counter)?;

        enc.count(reactions.len())?;
        for (kind, state, message, reply, via) in &reactions {
            enc.closure(kind, state)?;
            enc.message(message, reply)?;
            enc.put(via)?;
        }

        enc.count(groups.len())?;
        for (group_id, replicated, members) in &groups {
            enc.put(group_id)?;
            enc.put(replicated)?;
            enc.count(members.len())?;
            for (frame_id, channel, op) in members {
                enc.put(frame_id)?;
                enc.put(channel)?;
                match op {
                    OutgoingOp::Send { message, reply } => {
                        enc.put(&OP_SEND)?;
                        enc.message(message, reply)?;
                    }
                    OutgoingOp::Recv { kind, state } => {
                        enc.put(&OP_RECV)?;
                        enc.closure(kind, state)?;
                    }
                }
            }
        }

        enc.count(self.channels.len())?;
        for cframe in self.channels.values() {
            debug!(channel = %cframe, "writing channel");
            enc.put(cframe.kind.as_str())?;
            enc.put(&cframe.id)?;
            enc.put(cframe.description.as_str())?;
            enc.put(&cframe.ref_count)?;
            enc.put(&cframe.replicated_send)?;
            enc.put(&cframe.replicated_recv)?;
            enc.count(cframe.send_frames.len())?;
            for id in &cframe.send_frames {
                enc.put(id)?;
            }
            enc.count(cframe.recv_frames.len())?;
            for id in &cframe.recv_frames {
                enc.put(id)?;
            }
        }

        enc.put(&global_data)?;
        let mut out = enc
            .out
            .finish()
            .map_err(|e| KernelError::Encode(e.to_string()))?;
        out.flush().map_err(|e| KernelError::Encode(e.to_string()))
    }

    /// Serialize into a fresh buffer.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write(&mut buf)?;
        Ok(buf)
    }
}

enum OutgoingOp {
    Send {
        message: Message,
        reply: Option<Channel>,
    },
    Recv {
        kind: &'static str,
        state: Value,
    },
}

// =============================================================================
// READ
// =============================================================================

struct Decoder<'a, R> {
    input: R,
    resolver: &'a Resolver,
    replacement: Option<&'a dyn ReplacementMap>,
    /// Channels referenced from values, checked against the table at the end.
    referenced: BTreeSet<ChannelId>,
    index: BTreeMap<String, Vec<Arc<dyn Process>>>,
}

impl<R: Read> Decoder<'_, R> {
    fn get<T: DeserializeOwned>(&mut self) -> Result<T> {
        Ok(wire().deserialize_from(&mut self.input)?)
    }

    /// Resolve a persisted type name against the registered capabilities.
    fn channel_type(&self, name: &str) -> Result<ChannelType> {
        self.resolver
            .channel_type(name)
            .map_err(|_| corrupt(format!("unknown channel type '{name}'")))
    }

    /// Require the end of the stream, which also verifies the gzip trailer.
    fn finish(&mut self) -> Result<()> {
        let mut rest = Vec::new();
        (&mut self.input)
            .take(1)
            .read_to_end(&mut rest)
            .map_err(|e| KernelError::Decode(e.to_string()))?;
        if rest.is_empty() {
            Ok(())
        } else {
            Err(corrupt("trailing data after global data".into()))
        }
    }

    fn count(&mut self) -> Result<usize> {
        let n: u32 = self.get()?;
        Ok(n as usize)
    }

    fn value(&mut self) -> Result<Value> {
        let raw: Value = self.get()?;
        let value = match self.replacement {
            Some(map) => raw.substitute(&|v| map.restore(v)),
            None => raw,
        };
        value.collect_channels(&mut self.referenced);
        Ok(value)
    }

    fn closure(&mut self) -> Result<Arc<dyn Process>> {
        let kind: String = self.get()?;
        let state = self.value()?;
        let closure = self.resolver.load(&kind, &state)?;
        if let Some(key) = closure.index_key() {
            self.index.entry(key).or_default().push(Arc::clone(&closure));
        }
        Ok(closure)
    }

    fn message(&mut self) -> Result<(Message, Option<Channel>)> {
        let method: String = self.get()?;
        let argc = self.count()?;
        let mut args = Vec::with_capacity(argc.min(64));
        for _ in 0..argc {
            args.push(self.value()?);
        }
        let reply: Option<Channel> = self.get()?;
        if let Some(r) = &reply {
            self.referenced.insert(r.id());
        }
        Ok((Message::new(method, args), reply))
    }
}

impl ExecutionQueue {
    /// Replace this queue's contents with the state read from `input`.
    ///
    /// Requires a resolver. On error the queue is left as it was.
    pub fn read<R: Read>(&mut self, input: R) -> Result<()> {
        let resolver = self.resolver.clone().ok_or(KernelError::ResolverNotSet)?;
        let mut dec = Decoder {
            input: GzDecoder::new(input),
            resolver: &resolver,
            replacement: self.replacement.as_deref(),
            referenced: BTreeSet::new(),
            index: BTreeMap::new(),
        };

        let object_id_counter: u32 = dec.get()?;
        let cycle_counter: u32 = dec.get()?;

        let reaction_count = dec.count()?;
        let mut reactions = VecDeque::with_capacity(reaction_count.min(1024));
        for _ in 0..reaction_count {
            let closure = dec.closure()?;
            let (message, reply) = dec.message()?;
            let via = match dec.get::<Option<String>>()? {
                Some(name) => Some(dec.channel_type(&name)?),
                None => None,
            };
            reactions.push_back(Continuation::from_parts(closure, message, reply, via));
        }

        let group_count = dec.count()?;
        let mut groups = BTreeMap::new();
        let mut frames = BTreeMap::new();
        for _ in 0..group_count {
            let group_id: GroupId = dec.get()?;
            let replicated: bool = dec.get()?;
            let member_count = dec.count()?;
            let mut members = Vec::with_capacity(member_count.min(64));
            for _ in 0..member_count {
                let frame_id: FrameId = dec.get()?;
                let channel: ChannelId = dec.get()?;
                let tag: u8 = dec.get()?;
                let op = match tag {
                    OP_SEND => {
                        let (message, reply) = dec.message()?;
                        FrameOp::Send { message, reply }
                    }
                    OP_RECV => FrameOp::Recv {
                        listener: dec.closure()?,
                    },
                    other => return Err(corrupt(format!("frame {frame_id}: unknown op tag {other}"))),
                };
                let frame = CommFrame {
                    group: group_id,
                    channel,
                    op,
                };
                if frames.insert(frame_id, frame).is_some() {
                    return Err(corrupt(format!("duplicate frame id {frame_id}")));
                }
                members.push(frame_id);
            }
            let group = CommGroupFrame {
                replicated,
                frames: members,
            };
            if groups.insert(group_id, group).is_some() {
                return Err(corrupt(format!("duplicate group id {group_id}")));
            }
        }

        let channel_count = dec.count()?;
        let mut channels = BTreeMap::new();
        for _ in 0..channel_count {
            let kind: String = dec.get()?;
            let id: ChannelId = dec.get()?;
            let description: String = dec.get()?;
            let mut cframe = ChannelFrame::new(dec.channel_type(&kind)?, id, description);
            cframe.ref_count = dec.get()?;
            cframe.replicated_send = dec.get()?;
            cframe.replicated_recv = dec.get()?;
            for _ in 0..dec.count()? {
                cframe.send_frames.insert(dec.get()?);
            }
            for _ in 0..dec.count()? {
                cframe.recv_frames.insert(dec.get()?);
            }
            if channels.insert(id, cframe).is_some() {
                return Err(corrupt(format!("duplicate channel id {id}")));
            }
        }

        let global_data: Option<Value> = match dec.get::<Option<Value>>()? {
            Some(raw) => {
                let value = match dec.replacement {
                    Some(map) => raw.substitute(&|v| map.restore(v)),
                    None => raw,
                };
                value.collect_channels(&mut dec.referenced);
                Some(value)
            }
            None => None,
        };

        dec.finish()?;
        check_consistency(object_id_counter, &channels, &groups, &frames, &dec.referenced)?;

        self.object_id_counter = object_id_counter;
        self.cycle_counter = cycle_counter;
        self.reactions = reactions;
        self.groups = groups;
        self.frames = frames;
        self.channels = channels;
        self.global_data = global_data;
        self.index = dec.index;
        debug!(
            cycle = cycle_counter,
            reactions = self.reactions.len(),
            channels = self.channels.len(),
            indexed = self.index.len(),
            "execution queue restored"
        );
        Ok(())
    }

    /// Build a queue from a buffer written by [`ExecutionQueue::to_bytes`].
    pub fn from_bytes(bytes: &[u8], resolver: Arc<Resolver>) -> Result<Self> {
        let mut queue = ExecutionQueue::new();
        queue.set_resolver(resolver);
        queue.read(bytes)?;
        Ok(queue)
    }
}

fn check_consistency(
    object_id_counter: u32,
    channels: &BTreeMap<ChannelId, ChannelFrame>,
    groups: &BTreeMap<GroupId, CommGroupFrame>,
    frames: &BTreeMap<FrameId, CommFrame>,
    referenced: &BTreeSet<ChannelId>,
) -> Result<()> {
    let highest = channels
        .keys()
        .chain(groups.keys())
        .chain(frames.keys())
        .max()
        .copied()
        .unwrap_or(0);
    if highest > object_id_counter {
        return Err(corrupt(format!(
            "id {highest} exceeds object id counter {object_id_counter}"
        )));
    }

    for (frame_id, frame) in frames {
        let cframe = channels.get(&frame.channel).ok_or_else(|| {
            corrupt(format!("frame {frame_id} on missing channel {}", frame.channel))
        })?;
        let listed = if frame.op.is_send() {
            cframe.send_frames.contains(frame_id)
        } else {
            cframe.recv_frames.contains(frame_id)
        };
        if !listed {
            return Err(corrupt(format!(
                "frame {frame_id} not listed on channel {}",
                frame.channel
            )));
        }
    }

    for cframe in channels.values() {
        let pending = cframe.send_frames.len() + cframe.recv_frames.len();
        let owned = frames.values().filter(|f| f.channel == cframe.id).count();
        if pending != owned {
            return Err(corrupt(format!(
                "channel {} lists {pending} pending frames, stream holds {owned}",
                cframe.id
            )));
        }
    }

    if let Some(missing) = referenced.iter().find(|id| !channels.contains_key(id)) {
        return Err(corrupt(format!("reference to unknown channel {missing}")));
    }
    Ok(())
}

fn corrupt(msg: String) -> KernelError {
    KernelError::Corrupt(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Capability, Operation};
    use crate::comm::{Comm, CommGroup};
    use crate::vpu::ExecutionContext;

    static ECHO: Capability = Capability {
        name: "Echo",
        operations: &[Operation::asynchronous("ping", 1)],
    };

    /// Listener that remembers a channel and a label.
    #[derive(Debug)]
    struct Holder {
        label: String,
        target: Option<Channel>,
    }

    impl Process for Holder {
        fn kind(&self) -> &'static str {
            "Holder"
        }
        fn state(&self) -> Value {
            let target = self.target.clone().map(Value::Channel).unwrap_or(Value::Unit);
            Value::record([("label", Value::str(&*self.label)), ("target", target)])
        }
        fn invoke(&self, _ctx: &mut ExecutionContext<'_>, _m: Message) -> anyhow::Result<()> {
            Ok(())
        }
        fn index_key(&self) -> Option<String> {
            self.target.as_ref().map(|_| self.label.clone())
        }
    }

    fn load_holder(state: &Value) -> anyhow::Result<Arc<dyn Process>> {
        let label = state
            .field("label")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("missing label"))?;
        let target = state.field("target").and_then(Value::as_channel).cloned();
        Ok(Arc::new(Holder {
            label: label.to_string(),
            target,
        }))
    }

    fn resolver() -> Arc<Resolver> {
        Arc::new(
            Resolver::new()
                .with_capability(&ECHO)
                .with_closure("Holder", load_holder),
        )
    }

    fn holder(label: &str, target: Option<Channel>) -> Arc<dyn Process> {
        Arc::new(Holder {
            label: label.to_string(),
            target,
        })
    }

    fn round_trip(q: &mut ExecutionQueue) -> ExecutionQueue {
        let bytes = q.to_bytes().unwrap();
        ExecutionQueue::from_bytes(&bytes, resolver()).unwrap()
    }

    #[test]
    fn round_trip_preserves_identity() {
        let mut q = ExecutionQueue::new();
        let c = q.new_channel(&ECHO, "echo");
        let held = q.new_channel(&ECHO, "held");
        let waiting = q.new_channel(&ECHO, "waiting");
        q.cycle();

        let mut g = CommGroup::new(false)
            .with(Comm::send(c.clone(), Message::new("ping", vec![Value::Channel(held.clone())])));
        q.add_group(&mut g).unwrap();
        let mut g = CommGroup::new(false).with(Comm::recv(c.clone(), holder("L", None)));
        q.add_group(&mut g).unwrap();
        let mut g = CommGroup::new(false).with(Comm::recv(waiting.clone(), holder("W", Some(c.clone()))));
        q.add_group(&mut g).unwrap();

        let complete = q.is_complete();
        let restored = round_trip(&mut q);

        assert_eq!(restored.current_cycle(), 1);
        assert_eq!(restored.object_id_counter(), q.object_id_counter());
        assert_eq!(restored.reaction_count(), 1);
        assert_eq!(restored.is_complete(), complete);

        let k = restored.reactions().next().unwrap();
        assert_eq!(k.method(), "ping");
        let arg = k.args()[0].as_channel().unwrap();
        assert_eq!(arg, &held);
        let frame = restored.channel_frame(arg.id()).unwrap();
        assert_eq!(frame.kind(), held.kind());
        assert_eq!(frame.description(), "held");

        let w = restored.channel_frame(waiting.id()).unwrap();
        assert_eq!(w.pending_receives(), 1);
    }

    #[test]
    fn restored_frames_still_match() {
        let mut q = ExecutionQueue::new();
        let c = q.new_channel(&ECHO, "later");
        let mut g = CommGroup::new(false).with(Comm::recv(c.clone(), holder("late", None)));
        q.add_group(&mut g).unwrap();

        let mut restored = round_trip(&mut q);
        let mut g = CommGroup::new(false).with(Comm::send(c, Message::new("ping", vec![Value::Int(1)])));
        restored.add_group(&mut g).unwrap();
        assert_eq!(restored.reaction_count(), 1);
        let k = restored.dequeue().unwrap();
        assert_eq!(k.closure().kind(), "Holder");
        assert_eq!(k.closure().state().field("label"), Some(&Value::str("late")));
    }

    #[test]
    fn unreferenced_channels_are_collected() {
        let mut q = ExecutionQueue::new();
        let dead = q.new_channel(&ECHO, "dead");
        let exported = q.new_channel(&ECHO, "exported");
        let busy = q.new_channel(&ECHO, "busy");
        q.create_export(&exported).unwrap();
        let mut g = CommGroup::new(false).with(Comm::send(busy.clone(), Message::new("ping", vec![Value::Int(1)])));
        q.add_group(&mut g).unwrap();

        let restored = round_trip(&mut q);
        assert!(restored.channel_frame(dead.id()).is_none());
        assert!(q.channel_frame(dead.id()).is_none());
        assert_eq!(restored.channel_frame(exported.id()).unwrap().ref_count(), 1);
        assert!(restored.channel_frame(busy.id()).is_some());
        assert!(!restored.is_complete());
    }

    #[test]
    fn channels_referenced_from_global_data_survive() {
        let mut q = ExecutionQueue::new();
        let root = q.new_channel(&ECHO, "root");
        q.set_global_data(Value::record([("root", Value::Channel(root.clone()))]));
        let restored = round_trip(&mut q);
        assert!(restored.channel_frame(root.id()).is_some());
        assert_eq!(
            restored.global_data().and_then(|g| g.field("root")),
            Some(&Value::Channel(root))
        );
    }

    struct BlobStore;

    impl ReplacementMap for BlobStore {
        fn replace(&self, value: &Value) -> Option<Value> {
            match value {
                Value::Bytes(b) if b.len() > 4 => Some(Value::Ref {
                    kind: "blob".into(),
                    key: format!("{}", b.len()),
                }),
                _ => None,
            }
        }

        fn restore(&self, value: &Value) -> Option<Value> {
            match value {
                Value::Ref { kind, key } if kind == "blob" => {
                    key.parse::<usize>().ok().map(|n| Value::Bytes(vec![7; n]))
                }
                _ => None,
            }
        }
    }

    #[test]
    fn replacement_is_undone_on_read() {
        let mut q = ExecutionQueue::new();
        q.set_replacement_map(Arc::new(BlobStore));
        q.set_global_data(Value::List(vec![Value::Bytes(vec![7; 10]), Value::Bytes(vec![1])]));

        let bytes = q.to_bytes().unwrap();
        let mut restored = ExecutionQueue::new();
        restored.set_resolver(resolver());
        restored.set_replacement_map(Arc::new(BlobStore));
        restored.read(bytes.as_slice()).unwrap();
        assert_eq!(
            restored.global_data(),
            Some(&Value::List(vec![Value::Bytes(vec![7; 10]), Value::Bytes(vec![1])]))
        );

        let plain = ExecutionQueue::from_bytes(&bytes, resolver()).unwrap();
        assert!(matches!(
            plain.global_data(),
            Some(Value::List(items)) if matches!(items[0], Value::Ref { .. })
        ));
    }

    #[test]
    fn read_requires_resolver() {
        let mut q = ExecutionQueue::new();
        let bytes = q.to_bytes().unwrap();
        let mut fresh = ExecutionQueue::new();
        assert!(matches!(
            fresh.read(bytes.as_slice()),
            Err(KernelError::ResolverNotSet)
        ));
    }

    #[test]
    fn unknown_closure_kind_fails_read() {
        let mut q = ExecutionQueue::new();
        let c = q.new_channel(&ECHO, "c");
        let mut g = CommGroup::new(false).with(Comm::recv(c, holder("x", None)));
        q.add_group(&mut g).unwrap();
        let bytes = q.to_bytes().unwrap();

        let err = ExecutionQueue::from_bytes(&bytes, Arc::new(Resolver::new())).unwrap_err();
        assert!(matches!(err, KernelError::UnknownClosure(ref k) if k == "Holder"));
    }

    #[test]
    fn truncated_stream_is_rejected_without_partial_state() {
        let mut q = ExecutionQueue::new();
        let c = q.new_channel(&ECHO, "c");
        let mut g = CommGroup::new(false).with(Comm::recv(c, holder("x", None)));
        q.add_group(&mut g).unwrap();
        let bytes = q.to_bytes().unwrap();

        let mut target = ExecutionQueue::new();
        target.set_resolver(resolver());
        let keep = target.new_channel(&ECHO, "keep");
        let err = target.read(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(err.is_corruption());
        assert!(target.channel_frame(keep.id()).is_some());
    }

    #[test]
    fn counter_behind_ids_is_corrupt() {
        let mut q = ExecutionQueue::new();
        let c = q.new_channel(&ECHO, "c");
        q.create_export(&c).unwrap();
        let mut raw = gunzip(&q.to_bytes().unwrap());
        // objectIdCounter is the first record.
        raw[..4].copy_from_slice(&0u32.to_le_bytes());
        let err = ExecutionQueue::from_bytes(&gzip(&raw), resolver()).unwrap_err();
        assert!(matches!(err, KernelError::Corrupt(_)));
    }

    #[test]
    fn stream_is_gzip_framed() {
        let mut q = ExecutionQueue::new();
        let c = q.new_channel(&ECHO, "c");
        q.create_export(&c).unwrap();
        let bytes = q.to_bytes().unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);

        let raw = gunzip(&bytes);
        let counter: u32 = wire().deserialize_from(&raw[..4]).unwrap();
        assert_eq!(counter, q.object_id_counter());
    }

    #[test]
    fn index_is_rebuilt_on_every_read() {
        let mut q = ExecutionQueue::new();
        let a = q.new_channel(&ECHO, "a");
        let b = q.new_channel(&ECHO, "b");
        for (ch, label, target) in [(&a, "W", Some(b.clone())), (&b, "W", Some(a.clone())), (&b, "plain", None)] {
            let mut g = CommGroup::new(false).with(Comm::recv(ch.clone(), holder(label, target)));
            q.add_group(&mut g).unwrap();
        }
        assert!(q.index().is_empty());

        let mut restored = round_trip(&mut q);
        assert_eq!(restored.index().len(), 1);
        assert_eq!(restored.indexed("W").len(), 2);
        assert!(restored.indexed("plain").is_empty());

        let empty = ExecutionQueue::new().to_bytes().unwrap();
        restored.read(empty.as_slice()).unwrap();
        assert!(restored.index().is_empty());
    }

    // ── Hand-built streams ──

    fn gzip(raw: &[u8]) -> Vec<u8> {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(raw).unwrap();
        gz.finish().unwrap()
    }

    fn gunzip(bytes: &[u8]) -> Vec<u8> {
        let mut raw = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut raw).unwrap();
        raw
    }

    /// Writes records exactly as the encoder does.
    #[derive(Default)]
    struct Stream(Vec<u8>);

    impl Stream {
        fn put<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
            wire().serialize_into(&mut self.0, value).unwrap();
            self
        }

        /// Counters followed by an empty reaction set.
        fn header(counter: u32) -> Self {
            Stream::default().put(&counter).put(&0u32).put(&0u32)
        }

        /// One non-replicated group holding a single receive.
        fn receive_group(self, group: GroupId, frame: FrameId, channel: ChannelId) -> Self {
            self.put(&1u32)
                .put(&group)
                .put(&false)
                .put(&1u32)
                .put(&frame)
                .put(&channel)
                .put(&OP_RECV)
                .put("Holder")
                .put(&Value::record([("label", Value::str("x")), ("target", Value::Unit)]))
        }

        fn channel(self, kind: &str, id: ChannelId, recv_frames: &[FrameId]) -> Self {
            let mut s = self
                .put(kind)
                .put(&id)
                .put("crafted")
                .put(&0i32)
                .put(&false)
                .put(&false)
                .put(&0u32)
                .put(&(recv_frames.len() as u32));
            for f in recv_frames {
                s = s.put(f);
            }
            s
        }

        fn bytes(self) -> Vec<u8> {
            gzip(&self.0)
        }
    }

    /// Read `bytes` into a queue that already holds a channel and return
    /// the error, checking the queue kept its contents.
    fn read_fails(bytes: &[u8]) -> KernelError {
        let mut target = ExecutionQueue::new();
        target.set_resolver(resolver());
        let keep = target.new_channel(&ECHO, "keep");
        let counter = target.object_id_counter();
        let err = target.read(bytes).unwrap_err();
        assert!(target.channel_frame(keep.id()).is_some());
        assert_eq!(target.object_id_counter(), counter);
        err
    }

    #[test]
    fn hand_built_stream_reads_back() {
        let bytes = Stream::header(10)
            .receive_group(2, 3, 1)
            .put(&1u32)
            .channel("Echo", 1, &[3])
            .put(&None::<Value>)
            .bytes();
        let q = ExecutionQueue::from_bytes(&bytes, resolver()).unwrap();
        assert_eq!(q.channel_frame(1).unwrap().pending_receives(), 1);
        assert_eq!(q.object_id_counter(), 10);
    }

    #[test]
    fn read_rejects_oversized_length_prefix() {
        // One reaction whose closure kind claims a 1 TiB string.
        let bytes = Stream::header(0).0;
        let mut raw = bytes[..8].to_vec();
        raw.extend_from_slice(&1u32.to_le_bytes());
        raw.extend_from_slice(&(1u64 << 40).to_le_bytes());
        raw.extend_from_slice(b"Holder");

        let err = read_fails(&gzip(&raw));
        assert!(err.is_corruption(), "{err}");
    }

    #[test]
    fn frame_missing_from_its_channel_is_corrupt() {
        let bytes = Stream::header(10)
            .receive_group(2, 3, 1)
            .put(&1u32)
            .channel("Echo", 1, &[])
            .put(&None::<Value>)
            .bytes();
        let err = read_fails(&bytes);
        assert!(matches!(err, KernelError::Corrupt(ref m) if m.contains("not listed")), "{err}");
    }

    #[test]
    fn pending_count_mismatch_is_corrupt() {
        let bytes = Stream::header(10)
            .receive_group(2, 3, 1)
            .put(&1u32)
            .channel("Echo", 1, &[3, 4])
            .put(&None::<Value>)
            .bytes();
        let err = read_fails(&bytes);
        assert!(matches!(err, KernelError::Corrupt(ref m) if m.contains("pending")), "{err}");
    }

    #[test]
    fn reference_to_missing_channel_is_corrupt() {
        let ghost = Channel::new(5, ECHO.channel_type());
        let bytes = Stream::header(10)
            .put(&0u32)
            .put(&0u32)
            .put(&Some(Value::Channel(ghost)))
            .bytes();
        let err = read_fails(&bytes);
        assert!(matches!(err, KernelError::Corrupt(ref m) if m.contains("unknown channel 5")), "{err}");
    }

    #[test]
    fn unregistered_channel_type_is_corrupt() {
        let bytes = Stream::header(10)
            .put(&0u32)
            .put(&1u32)
            .channel("Mystery", 1, &[])
            .put(&None::<Value>)
            .bytes();
        let err = read_fails(&bytes);
        assert!(matches!(err, KernelError::Corrupt(ref m) if m.contains("Mystery")), "{err}");
    }

    #[test]
    fn trailing_bytes_are_corrupt() {
        let mut raw = gunzip(&ExecutionQueue::new().to_bytes().unwrap());
        raw.push(0);
        let err = read_fails(&gzip(&raw));
        assert!(matches!(err, KernelError::Corrupt(ref m) if m.contains("trailing")), "{err}");
    }
}
