//! Durable frames backing channels and comm groups.
//!
//! Frames live in id-keyed arenas inside the queue; cross references are ids,
//! never pointers, so the whole structure can be written out and rebuilt.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::channel::{Channel, ChannelType, Message};
use crate::process::Process;
use crate::types::{ChannelId, FrameId, GroupId};

/// The queue's record of one channel.
#[derive(Debug, Clone)]
pub struct ChannelFrame {
    pub(crate) kind: ChannelType,
    pub(crate) id: ChannelId,
    pub(crate) description: String,
    /// External reference count.
    pub(crate) ref_count: i32,
    pub(crate) replicated_send: bool,
    pub(crate) replicated_recv: bool,
    pub(crate) send_frames: BTreeSet<FrameId>,
    pub(crate) recv_frames: BTreeSet<FrameId>,
}

impl ChannelFrame {
    pub(crate) fn new(kind: ChannelType, id: ChannelId, description: String) -> Self {
        Self {
            kind,
            id,
            description,
            ref_count: 0,
            replicated_send: false,
            replicated_recv: false,
            send_frames: BTreeSet::new(),
            recv_frames: BTreeSet::new(),
        }
    }

    pub fn channel(&self) -> Channel {
        Channel::new(self.id, self.kind.clone())
    }

    pub fn kind(&self) -> &ChannelType {
        &self.kind
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count
    }

    pub fn replicated_send(&self) -> bool {
        self.replicated_send
    }

    pub fn replicated_recv(&self) -> bool {
        self.replicated_recv
    }

    pub fn pending_sends(&self) -> usize {
        self.send_frames.len()
    }

    pub fn pending_receives(&self) -> usize {
        self.recv_frames.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.send_frames.is_empty() || !self.recv_frames.is_empty()
    }
}

impl fmt::Display for ChannelFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{CFRAME {}:{}#{} refCount={}, msgs={}",
            self.kind,
            self.description,
            self.id,
            self.ref_count,
            self.send_frames.len()
        )?;
        if self.replicated_send {
            write!(f, "R")?;
        }
        write!(f, ", objs={}", self.recv_frames.len())?;
        if self.replicated_recv {
            write!(f, "R")?;
        }
        write!(f, "}}")
    }
}

/// A registered comm group: the frames that are retracted together.
#[derive(Debug, Clone)]
pub(crate) struct CommGroupFrame {
    pub(crate) replicated: bool,
    pub(crate) frames: Vec<FrameId>,
}

/// A pending send (message frame) or receive (object frame).
#[derive(Debug, Clone)]
pub(crate) struct CommFrame {
    pub(crate) group: GroupId,
    pub(crate) channel: ChannelId,
    pub(crate) op: FrameOp,
}

#[derive(Debug, Clone)]
pub(crate) enum FrameOp {
    Send {
        message: Message,
        reply: Option<Channel>,
    },
    Recv {
        listener: Arc<dyn Process>,
    },
}

impl FrameOp {
    pub(crate) fn is_send(&self) -> bool {
        matches!(self, FrameOp::Send { .. })
    }
}
