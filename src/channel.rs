//! Channels and the capabilities they carry.
//!
//! A [`Channel`] is a plain value: an id inside one execution queue plus the
//! name of the capability it communicates. The capability decides which
//! operations (and how many arguments) may flow over the channel.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

use crate::error::{KernelError, Result};
use crate::types::{ChannelId, Value};

// ─── Capabilities ─────────────────────────────────────────────

/// One operation a capability accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub name: &'static str,
    /// Number of caller-supplied arguments.
    pub arity: usize,
    /// A synchronous operation carries an implicit reply channel and is
    /// acknowledged with [`SYNCH`]`.ret()` once the receiver has run.
    pub synchronous: bool,
}

impl Operation {
    pub const fn asynchronous(name: &'static str, arity: usize) -> Self {
        Self {
            name,
            arity,
            synchronous: false,
        }
    }

    pub const fn synchronous(name: &'static str, arity: usize) -> Self {
        Self {
            name,
            arity,
            synchronous: true,
        }
    }
}

/// Static description of a channel interface.
#[derive(Debug, PartialEq, Eq)]
pub struct Capability {
    pub name: &'static str,
    pub operations: &'static [Operation],
}

impl Capability {
    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.name == name)
    }

    pub fn channel_type(&'static self) -> ChannelType {
        ChannelType(Cow::Borrowed(self.name))
    }

    /// Check a message against this capability's operation table.
    pub fn check(&self, message: &Message) -> Result<&Operation> {
        let op = self
            .operation(&message.method)
            .ok_or_else(|| KernelError::UnknownOperation {
                capability: self.name.to_string(),
                operation: message.method.clone(),
            })?;
        if op.arity != message.args.len() {
            return Err(KernelError::ArityMismatch {
                capability: self.name.to_string(),
                operation: op.name.to_string(),
                expected: op.arity,
                actual: message.args.len(),
            });
        }
        Ok(op)
    }
}

/// Operation name used for structural reductions ("run process P").
pub const RUN: &str = "run";

/// Operation name of the reply sent on [`SYNCH`] channels.
pub const RET: &str = "ret";

/// The reply channel capability used by synchronous calls.
pub static SYNCH: Capability = Capability {
    name: "Synch",
    operations: &[Operation::asynchronous(RET, 0)],
};

// ─── Channel type tag ─────────────────────────────────────────

/// Name of the capability a channel communicates.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelType(Cow<'static, str>);

impl ChannelType {
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static Capability> for ChannelType {
    fn from(cap: &'static Capability) -> Self {
        cap.channel_type()
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Channel ──────────────────────────────────────────────────

/// Typed reference to a channel registered in an execution queue.
///
/// Two channels are equal when both id and type agree; this is the identity
/// that survives a save/restore of the queue.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel {
    id: ChannelId,
    kind: ChannelType,
}

impl Channel {
    pub fn new(id: ChannelId, kind: ChannelType) -> Self {
        Self { id, kind }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn kind(&self) -> &ChannelType {
        &self.kind
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// A channel that has not been registered with a queue yet.
///
/// Registration assigns the id; registering the same object twice is
/// rejected.
#[derive(Debug, Clone)]
pub struct CommChannel {
    kind: ChannelType,
    description: String,
    id: Option<ChannelId>,
}

impl CommChannel {
    pub fn new(kind: impl Into<ChannelType>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            id: None,
        }
    }

    pub fn kind(&self) -> &ChannelType {
        &self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn id(&self) -> Option<ChannelId> {
        self.id
    }

    pub(crate) fn assign_id(&mut self, id: ChannelId) {
        self.id = Some(id);
    }

    /// The registered channel, once an id has been assigned.
    pub fn channel(&self) -> Option<Channel> {
        self.id.map(|id| Channel::new(id, self.kind.clone()))
    }
}

// ─── Export tokens ────────────────────────────────────────────

/// Render the token handed out by an export.
pub fn export_token(channel: &Channel) -> String {
    channel.id().to_string()
}

/// Parse a token produced by [`export_token`].
pub fn parse_export_token(token: &str) -> Result<ChannelId> {
    token
        .trim()
        .parse::<ChannelId>()
        .map_err(|_| KernelError::InvalidExportToken(token.to_string()))
}

// ─── Messages ─────────────────────────────────────────────────

/// An operation invocation travelling over a channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub method: String,
    pub args: Vec<Value>,
}

impl Message {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    /// The message a structural reduction delivers to its process.
    pub fn run() -> Self {
        Self::new(RUN, Vec::new())
    }

    pub fn ret() -> Self {
        Self::new(RET, Vec::new())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.method)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ")")
    }
}

/// A closed message type for one capability.
///
/// Receivers decode the kernel [`Message`] into their enum and `match` on it
/// instead of looking methods up by name.
pub trait ChannelMessage: Sized {
    const CAPABILITY: &'static Capability;

    fn into_message(self) -> Message;

    fn from_message(message: Message) -> Result<Self>;
}

/// Typed view of the [`SYNCH`] capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynchMsg {
    Ret,
}

impl ChannelMessage for SynchMsg {
    const CAPABILITY: &'static Capability = &SYNCH;

    fn into_message(self) -> Message {
        Message::ret()
    }

    fn from_message(message: Message) -> Result<Self> {
        SYNCH.check(&message)?;
        Ok(SynchMsg::Ret)
    }
}
