//! Closures and continuations.

use std::fmt;
use std::sync::Arc;

use crate::channel::{Channel, ChannelType, Message};
use crate::types::Value;
use crate::vpu::ExecutionContext;

/// The contract every closure held by the queue implements.
///
/// A closure is either a process body (invoked with [`Message::run`]) or a
/// channel listener (invoked with the message a sender offered).
pub trait Process: fmt::Debug + Send + Sync {
    /// Registry key used to rebuild the closure when a queue is read back.
    fn kind(&self) -> &'static str;

    /// Fields needed to rebuild the closure.
    fn state(&self) -> Value;

    /// Run one method of this closure.
    fn invoke(&self, ctx: &mut ExecutionContext<'_>, message: Message) -> anyhow::Result<()>;

    fn describe(&self) -> String {
        self.kind().to_string()
    }

    /// Key under which a restored queue indexes this closure, if any.
    fn index_key(&self) -> Option<String> {
        None
    }
}

/// A pending method invocation: one unit of process work.
#[derive(Clone)]
pub struct Continuation {
    closure: Arc<dyn Process>,
    message: Message,
    /// Implicit reply channel of a synchronous operation.
    reply: Option<Channel>,
    /// Type of the channel the message arrived on, `None` for structural
    /// reductions.
    via: Option<ChannelType>,
    description: Option<String>,
}

impl Continuation {
    /// A structural reduction: run `process`.
    pub fn instance(process: Arc<dyn Process>) -> Self {
        Self {
            closure: process,
            message: Message::run(),
            reply: None,
            via: None,
            description: None,
        }
    }

    /// A communication reduction: deliver `message` to `listener`.
    pub fn delivery(
        listener: Arc<dyn Process>,
        message: Message,
        reply: Option<Channel>,
        via: ChannelType,
    ) -> Self {
        Self {
            closure: listener,
            message,
            reply,
            via: Some(via),
            description: None,
        }
    }

    pub(crate) fn from_parts(
        closure: Arc<dyn Process>,
        message: Message,
        reply: Option<Channel>,
        via: Option<ChannelType>,
    ) -> Self {
        Self {
            closure,
            message,
            reply,
            via,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn closure(&self) -> &Arc<dyn Process> {
        &self.closure
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn method(&self) -> &str {
        &self.message.method
    }

    pub fn args(&self) -> &[Value] {
        &self.message.args
    }

    pub fn reply(&self) -> Option<&Channel> {
        self.reply.as_ref()
    }

    pub fn via(&self) -> Option<&ChannelType> {
        self.via.as_ref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Diagnostic key: closure kind and method.
    pub fn target(&self) -> String {
        format!("{}.{}", self.closure.kind(), self.message.method)
    }

    pub(crate) fn into_parts(self) -> (Arc<dyn Process>, Message, Option<Channel>) {
        (self.closure, self.message, self.reply)
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("closure", &self.closure.describe())
            .field("message", &self.message)
            .field("reply", &self.reply)
            .field("via", &self.via)
            .finish()
    }
}

impl fmt::Display for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(desc) => f.write_str(desc),
            None => write!(f, "{}.{}", self.closure.describe(), self.message),
        }
    }
}
