//! Kernel error types.
//!
//! Only genuine coding and protocol errors surface here. A channel that is
//! still waiting for a partner is never an error: that condition shows up as
//! an empty reaction set.

use std::sync::Arc;

use thiserror::Error;

use crate::types::ChannelId;
use crate::vpu::Fault;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, KernelError>;

#[derive(Debug, Clone, Error)]
pub enum KernelError {
    /// A second replicated send was offered on a channel.
    #[error("send attempted on channel #{channel} which already holds a replicated send")]
    ReplicatedSend { channel: ChannelId },

    /// A second replicated receive was offered on a channel.
    #[error("receive attempted on channel #{channel} which already holds a replicated receive")]
    ReplicatedReceive { channel: ChannelId },

    /// A replicated send and a replicated receive would pair forever.
    #[error("channel #{channel} would hold both a replicated send and a replicated receive")]
    ReplicationConflict { channel: ChannelId },

    /// A channel or group that already has an identity was registered again.
    #[error("{what} is already registered with id {id}")]
    AlreadyRegistered { what: &'static str, id: u32 },

    #[error("no such channel; id={0}")]
    NoSuchChannel(ChannelId),

    #[error("unknown channel capability '{0}'")]
    UnknownCapability(String),

    #[error("capability '{capability}' has no operation '{operation}'")]
    UnknownOperation {
        capability: String,
        operation: String,
    },

    #[error("operation '{capability}.{operation}' takes {expected} argument(s), got {actual}")]
    ArityMismatch {
        capability: String,
        operation: String,
        expected: usize,
        actual: usize,
    },

    #[error("argument {index} of '{operation}': expected {expected}")]
    ArgumentType {
        operation: String,
        index: usize,
        expected: &'static str,
    },

    /// An invoked continuation failed; latched until cleared.
    #[error("{0}")]
    Faulted(Arc<Fault>),

    /// Broken kernel invariant.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("no resolver installed; set one before reading persisted state")]
    ResolverNotSet,

    #[error("no loader registered for closure kind '{0}'")]
    UnknownClosure(String),

    #[error("malformed persisted state: {0}")]
    Corrupt(String),

    #[error("failed to encode execution queue: {0}")]
    Encode(String),

    #[error("failed to decode execution queue: {0}")]
    Decode(String),

    #[error("invalid export token '{0}'")]
    InvalidExportToken(String),

    /// The token was already consumed; no export of the channel is held.
    #[error("channel #{0} has no outstanding export")]
    ExportNotHeld(ChannelId),

    #[error("no state object for VPU")]
    NoContext,
}

impl KernelError {
    /// Check if this error is a process-calculus protocol violation.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            KernelError::ReplicatedSend { .. }
                | KernelError::ReplicatedReceive { .. }
                | KernelError::ReplicationConflict { .. }
        )
    }

    /// Check if this error comes from dispatching a message onto a closure.
    pub fn is_dispatch(&self) -> bool {
        matches!(
            self,
            KernelError::UnknownCapability(_)
                | KernelError::UnknownOperation { .. }
                | KernelError::ArityMismatch { .. }
                | KernelError::ArgumentType { .. }
        )
    }

    /// Check if this error is a deserialization failure.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            KernelError::Corrupt(_) | KernelError::Decode(_) | KernelError::UnknownClosure(_)
        )
    }
}

impl From<bincode::Error> for KernelError {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::Io(ref io) => KernelError::Decode(io.to_string()),
            ref other => KernelError::Decode(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_violations_are_classified() {
        assert!(KernelError::ReplicatedSend { channel: 1 }.is_protocol_violation());
        assert!(KernelError::ReplicationConflict { channel: 1 }.is_protocol_violation());
        assert!(!KernelError::NoSuchChannel(1).is_protocol_violation());
    }

    #[test]
    fn dispatch_errors_are_classified() {
        let err = KernelError::UnknownOperation {
            capability: "Echo".into(),
            operation: "pong".into(),
        };
        assert!(err.is_dispatch());
        assert!(!KernelError::Corrupt("x".into()).is_dispatch());
        assert!(KernelError::Corrupt("x".into()).is_corruption());
    }

    #[test]
    fn error_display() {
        let err = KernelError::NoSuchChannel(42);
        assert!(err.to_string().contains("42"));

        let err = KernelError::AlreadyRegistered {
            what: "channel",
            id: 7,
        };
        assert!(err.to_string().contains("already registered"));
    }
}
