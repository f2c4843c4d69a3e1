use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::channel::Channel;
use crate::error::{KernelError, Result};

// ─── Scalar aliases ───────────────────────────────────────────

/// Channel identifier, assigned from the queue's object-id counter.
pub type ChannelId = u32;

/// Identifier of a registered comm group.
pub type GroupId = u32;

/// Identifier of a pending send or receive frame.
pub type FrameId = u32;

/// VPU cycle number.
pub type Cycle = u32;

// ─── Value ────────────────────────────────────────────────────

/// A message argument, a piece of closure state, or the global data payload.
///
/// Channels appear only as [`Value::Channel`] references, so persisting a
/// value never deep-copies the channel it points at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    /// `(type, id)` reference to a channel in the owning queue.
    Channel(Channel),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
    /// Opaque handle standing in for an object kept outside the queue.
    Ref { kind: String, key: String },
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn record<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Channel(_) => "channel",
            Value::List(_) => "list",
            Value::Record(_) => "record",
            Value::Ref { .. } => "ref",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_channel(&self) -> Option<&Channel> {
        match self {
            Value::Channel(c) => Some(c),
            _ => None,
        }
    }

    /// Look up a field of a [`Value::Record`].
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) => fields.get(name),
            _ => None,
        }
    }

    /// Record every channel id reachable from this value.
    pub fn collect_channels(&self, out: &mut BTreeSet<ChannelId>) {
        match self {
            Value::Channel(c) => {
                out.insert(c.id());
            }
            Value::List(items) => items.iter().for_each(|v| v.collect_channels(out)),
            Value::Record(fields) => fields.values().for_each(|v| v.collect_channels(out)),
            _ => {}
        }
    }

    /// Rebuild this value top-down, letting `f` substitute any non-channel
    /// node. A substituted node is not descended into.
    pub fn substitute(&self, f: &dyn Fn(&Value) -> Option<Value>) -> Value {
        if let Value::Channel(_) = self {
            return self.clone();
        }
        if let Some(replacement) = f(self) {
            return replacement;
        }
        match self {
            Value::List(items) => Value::List(items.iter().map(|v| v.substitute(f)).collect()),
            Value::Record(fields) => Value::Record(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.substitute(f)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Channel> for Value {
    fn from(c: Channel) -> Self {
        Value::Channel(c)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Channel(c) => write!(f, "{c}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Record(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Ref { kind, key } => write!(f, "&{kind}:{key}"),
        }
    }
}

// ─── Argument extraction ──────────────────────────────────────

/// Positional argument accessors used by typed message decoders.
pub trait Args {
    fn int_at(&self, operation: &str, index: usize) -> Result<i64>;
    fn str_at(&self, operation: &str, index: usize) -> Result<String>;
    fn channel_at(&self, operation: &str, index: usize) -> Result<Channel>;
}

impl Args for [Value] {
    fn int_at(&self, operation: &str, index: usize) -> Result<i64> {
        self.get(index)
            .and_then(Value::as_int)
            .ok_or_else(|| arg_error(operation, index, "int"))
    }

    fn str_at(&self, operation: &str, index: usize) -> Result<String> {
        self.get(index)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| arg_error(operation, index, "string"))
    }

    fn channel_at(&self, operation: &str, index: usize) -> Result<Channel> {
        self.get(index)
            .and_then(Value::as_channel)
            .cloned()
            .ok_or_else(|| arg_error(operation, index, "channel"))
    }
}

fn arg_error(operation: &str, index: usize, expected: &'static str) -> KernelError {
    KernelError::ArgumentType {
        operation: operation.to_string(),
        index,
        expected,
    }
}
