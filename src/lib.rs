//! # bpel-vpu
//!
//! A process-calculus execution kernel for long-running business processes.
//!
//! A process instance is an [`ExecutionQueue`]: a set of typed channels, the
//! comm groups (sends and receives) pending on them, and the reactions that
//! are ready to run. The [`Vpu`] repeatedly picks one reaction and invokes its
//! closure through an [`ExecutionContext`], which is the only way closures
//! create channels, communicate or spawn further processes.
//!
//! Between cycles the whole queue can be written to bytes and read back,
//! possibly in another process, with [`ExecutionQueue::write`] and
//! [`ExecutionQueue::read`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use bpel_vpu::{ExecutionQueue, Extensions, Resolver, Vpu};
//!
//! let resolver = Arc::new(Resolver::new());
//! let mut vpu = Vpu::new(resolver, Extensions::new());
//! vpu.set_context(ExecutionQueue::new());
//! while vpu.execute()? {}
//! # Ok::<(), bpel_vpu::KernelError>(())
//! ```

pub mod channel;
pub mod comm;
pub mod config;
pub mod error;
pub mod extension;
pub mod process;
pub mod registry;
pub mod sieve;
pub mod soup;
pub mod stats;
pub mod types;
pub mod vpu;

pub use channel::{
    Capability, Channel, ChannelMessage, ChannelType, CommChannel, Message, Operation, SynchMsg,
    SYNCH,
};
pub use comm::{Comm, CommGroup};
pub use config::VpuConfig;
pub use error::{KernelError, Result};
pub use extension::Extensions;
pub use process::{Continuation, Process};
pub use registry::{ClosureLoader, Resolver};
pub use soup::{ChannelFrame, ExecutionQueue, ReplacementMap};
pub use stats::{Statistics, TargetTiming};
pub use types::{Args, ChannelId, Cycle, Value};
pub use vpu::{ActiveReaction, ExecutionContext, Fault, FaultKind, SliceOutcome, Vpu};
