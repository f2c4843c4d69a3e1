//! Comm operations and the groups that register them atomically.

use std::sync::Arc;

use crate::channel::{Channel, Message};
use crate::process::Process;
use crate::types::{ChannelId, GroupId};

/// A single send or receive offered on a channel.
#[derive(Debug, Clone)]
pub enum Comm {
    /// `channel ! message`
    Send {
        channel: Channel,
        message: Message,
        reply: Option<Channel>,
    },
    /// `channel ? listener`
    Recv {
        channel: Channel,
        listener: Arc<dyn Process>,
    },
}

impl Comm {
    pub fn send(channel: Channel, message: Message) -> Self {
        Comm::Send {
            channel,
            message,
            reply: None,
        }
    }

    pub fn recv(channel: Channel, listener: Arc<dyn Process>) -> Self {
        Comm::Recv { channel, listener }
    }

    pub fn channel(&self) -> &Channel {
        match self {
            Comm::Send { channel, .. } | Comm::Recv { channel, .. } => channel,
        }
    }

    pub fn is_send(&self) -> bool {
        matches!(self, Comm::Send { .. })
    }
}

/// An atomically registered set of comms.
///
/// A non-replicated group is an external choice: the first member to match
/// retracts all of its siblings. A replicated group stays registered after
/// every match and behaves as a server.
#[derive(Debug, Clone, Default)]
pub struct CommGroup {
    id: Option<GroupId>,
    replicated: bool,
    comms: Vec<Comm>,
}

impl CommGroup {
    pub fn new(replicated: bool) -> Self {
        Self {
            id: None,
            replicated,
            comms: Vec::new(),
        }
    }

    pub fn with(mut self, comm: Comm) -> Self {
        self.comms.push(comm);
        self
    }

    pub fn add(&mut self, comm: Comm) {
        self.comms.push(comm);
    }

    pub fn is_replicated(&self) -> bool {
        self.replicated
    }

    pub fn comms(&self) -> &[Comm] {
        &self.comms
    }

    pub fn is_empty(&self) -> bool {
        self.comms.is_empty()
    }

    pub fn id(&self) -> Option<GroupId> {
        self.id
    }

    pub(crate) fn assign_id(&mut self, id: GroupId) {
        self.id = Some(id);
    }

    /// Distinct channels touched by this group, in member order.
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut seen = Vec::with_capacity(self.comms.len());
        for comm in &self.comms {
            let id = comm.channel().id();
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelType;

    #[test]
    fn channels_are_deduplicated_in_order() {
        let a = Channel::new(2, ChannelType::named("A"));
        let b = Channel::new(1, ChannelType::named("B"));
        let group = CommGroup::new(false)
            .with(Comm::send(a.clone(), Message::new("x", vec![])))
            .with(Comm::send(b, Message::new("y", vec![])))
            .with(Comm::send(a, Message::new("z", vec![])));
        assert_eq!(group.channels(), vec![2, 1]);
        assert!(!group.is_replicated());
        assert!(group.id().is_none());
    }
}
