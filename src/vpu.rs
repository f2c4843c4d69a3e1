//! The virtual processing unit: runs one reaction per cycle.
//!
//! A VPU is bound to at most one [`ExecutionQueue`] at a time. Each call to
//! [`Vpu::execute`] dequeues a single reaction and runs it to completion
//! against an [`ExecutionContext`]; the closure expresses all further work by
//! registering comm groups and instantiating processes through that context.
//! A failure escaping a closure is latched and re-raised on every later call
//! until [`Vpu::clear_fault`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::channel::{Capability, Channel, ChannelMessage, CommChannel, Message, SYNCH};
use crate::comm::{Comm, CommGroup};
use crate::config::VpuConfig;
use crate::error::{KernelError, Result};
use crate::extension::Extensions;
use crate::process::{Continuation, Process};
use crate::registry::Resolver;
use crate::soup::ExecutionQueue;
use crate::stats::Statistics;
use crate::types::{Cycle, Value};

// ─── Faults ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The closure itself failed.
    Process,
    /// The message could not be dispatched onto the closure.
    Dispatch,
}

/// An unrecoverable failure captured from an invoked continuation.
#[derive(Debug)]
pub struct Fault {
    pub cycle: Cycle,
    /// Closure kind and method that failed.
    pub target: String,
    pub kind: FaultKind,
    error: anyhow::Error,
}

impl Fault {
    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            FaultKind::Process => "ClientMethodException",
            FaultKind::Dispatch => "DispatchFailure",
        };
        write!(
            f,
            "{label} in {} at cycle {}: {:#}",
            self.target, self.cycle, self.error
        )
    }
}

// ─── Active slot ──────────────────────────────────────────────

/// The reaction currently running. At most one exists at any instant.
#[derive(Debug, Clone)]
pub struct ActiveReaction {
    pub cycle: Cycle,
    pub target: String,
    pub description: Option<String>,
}

/// Why a slice stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    /// No reactions left; waiting for outside stimulus.
    Idle { cycles: u32 },
    /// Hit the slice limit with work still pending.
    Exhausted { cycles: u32 },
}

// ─── VPU ──────────────────────────────────────────────────────

pub struct Vpu {
    queue: Option<ExecutionQueue>,
    resolver: Arc<Resolver>,
    extensions: Extensions,
    config: VpuConfig,
    /// The fault register.
    fault: Option<Arc<Fault>>,
    cycle: Cycle,
    active: Option<ActiveReaction>,
    statistics: Statistics,
}

impl Vpu {
    pub fn new(resolver: Arc<Resolver>, extensions: Extensions) -> Self {
        Self {
            queue: None,
            resolver,
            extensions,
            config: VpuConfig::default(),
            fault: None,
            cycle: 0,
            active: None,
            statistics: Statistics::new(),
        }
    }

    pub fn with_config(mut self, config: VpuConfig) -> Self {
        self.config = config;
        self
    }

    /// Load a queue into the VPU (re-hydration).
    pub fn set_context(&mut self, mut queue: ExecutionQueue) {
        trace!(?queue, "set context");
        queue.set_resolver(Arc::clone(&self.resolver));
        self.cycle = queue.current_cycle();
        self.queue = Some(queue);
    }

    /// Unload the queue, e.g. to persist it.
    pub fn take_context(&mut self) -> Option<ExecutionQueue> {
        self.queue.take()
    }

    pub fn queue(&self) -> Option<&ExecutionQueue> {
        self.queue.as_ref()
    }

    pub fn queue_mut(&mut self) -> Option<&mut ExecutionQueue> {
        self.queue.as_mut()
    }

    fn context(&mut self) -> Result<&mut ExecutionQueue> {
        self.queue.as_mut().ok_or(KernelError::NoContext)
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn config(&self) -> &VpuConfig {
        &self.config
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn active(&self) -> Option<&ActiveReaction> {
        self.active.as_ref()
    }

    pub fn fault(&self) -> Option<&Arc<Fault>> {
        self.fault.as_ref()
    }

    /// Discard the latched fault. Callers normally also reload the queue
    /// from its last persisted state.
    pub fn clear_fault(&mut self) -> Option<Arc<Fault>> {
        self.fault.take()
    }

    /// Add `process` to the run queue from outside any running reaction
    /// (`P` becomes `P | Q`).
    pub fn inject(&mut self, process: Arc<dyn Process>) -> Result<()> {
        debug!(process = %process.describe(), "injecting");
        let description = process.describe();
        self.context()?
            .enqueue(Continuation::instance(process).with_description(description));
        self.statistics.run_queue_entries += 1;
        Ok(())
    }

    pub fn is_complete(&self) -> Result<bool> {
        self.queue
            .as_ref()
            .map(ExecutionQueue::is_complete)
            .ok_or(KernelError::NoContext)
    }

    /// Execute one cycle.
    ///
    /// Returns `Ok(false)` when there was nothing to run.
    pub fn execute(&mut self) -> Result<bool> {
        trace!(">> Vpu::execute()");
        if let Some(fault) = &self.fault {
            return Err(KernelError::Faulted(Arc::clone(fault)));
        }
        let queue = self.queue.as_mut().ok_or(KernelError::NoContext)?;
        if !queue.has_reactions() {
            return Ok(false);
        }
        if let Some(stale) = &self.active {
            return Err(KernelError::Internal(format!(
                "active slot held by {} before cycle start",
                stale.target
            )));
        }

        self.cycle = queue.cycle();
        let reaction = queue
            .dequeue()
            .ok_or_else(|| KernelError::Internal("reaction set emptied during dequeue".into()))?;
        let target = reaction.target();
        let started = Instant::now();

        let active = self.active.insert(ActiveReaction {
            cycle: self.cycle,
            target: target.clone(),
            description: reaction.description().map(str::to_string),
        });
        trace!(cycle = self.cycle, reaction = %reaction, ">> run");

        let (closure, message, reply) = reaction.into_parts();
        let mut ctx = ExecutionContext {
            queue,
            resolver: &self.resolver,
            extensions: &self.extensions,
            statistics: &mut self.statistics,
            active,
        };
        let client_started = Instant::now();
        let mut result = closure.invoke(&mut ctx, message);
        let client_time = client_started.elapsed();
        if result.is_ok() {
            if let Some(reply) = reply {
                result = ctx.send(&reply, Message::ret()).map(drop).map_err(Into::into);
            }
        }
        drop(ctx);

        if self.active.take().is_none() {
            return Err(KernelError::Internal(
                "active slot vacated while the reaction ran".into(),
            ));
        }

        match result {
            Ok(()) => {
                if self.config.collect_statistics {
                    self.statistics
                        .record_cycle(&target, started.elapsed(), client_time);
                } else {
                    self.statistics.num_cycles += 1;
                }
                Ok(true)
            }
            Err(error) => {
                let kind = match error.downcast_ref::<KernelError>() {
                    Some(e) if e.is_dispatch() => FaultKind::Dispatch,
                    _ => FaultKind::Process,
                };
                let fault = Arc::new(Fault {
                    cycle: self.cycle,
                    target,
                    kind,
                    error,
                });
                warn!(cycle = self.cycle, fault = %fault, "VPU fault latched");
                self.fault = Some(Arc::clone(&fault));
                Err(KernelError::Faulted(fault))
            }
        }
    }

    /// Run cycles until the queue idles or the configured slice is used up.
    pub fn run_slice(&mut self) -> Result<SliceOutcome> {
        let limit = self.config.max_cycles_per_slice;
        let mut cycles = 0;
        while cycles < limit {
            if !self.execute()? {
                return Ok(SliceOutcome::Idle { cycles });
            }
            cycles += 1;
        }
        let pending = self.queue.as_ref().is_some_and(ExecutionQueue::has_reactions);
        Ok(if pending {
            SliceOutcome::Exhausted { cycles }
        } else {
            SliceOutcome::Idle { cycles }
        })
    }

    pub fn dump_state(&self) -> String {
        let mut out = self.statistics.to_string();
        match &self.queue {
            Some(q) => out.push_str(&q.dump_state()),
            None => out.push_str("(no execution queue)\n"),
        }
        if let Some(fault) = &self.fault {
            out.push_str(&format!("-- FAULT\n   {fault}\n"));
        }
        out
    }
}

impl fmt::Debug for Vpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vpu")
            .field("cycle", &self.cycle)
            .field("queue", &self.queue)
            .field("faulted", &self.fault.is_some())
            .finish()
    }
}

// ─── Execution context ────────────────────────────────────────

/// Everything a running closure may do, valid for one cycle.
pub struct ExecutionContext<'a> {
    queue: &'a mut ExecutionQueue,
    resolver: &'a Resolver,
    extensions: &'a Extensions,
    statistics: &'a mut Statistics,
    active: &'a ActiveReaction,
}

impl ExecutionContext<'_> {
    pub fn cycle(&self) -> Cycle {
        self.active.cycle
    }

    /// The reaction being executed.
    pub fn active(&self) -> &ActiveReaction {
        self.active
    }

    /// Create and register a new channel (`(v x)`).
    pub fn new_channel(
        &mut self,
        capability: &'static Capability,
        description: &str,
    ) -> Result<Channel> {
        let mut chan = CommChannel::new(capability, description);
        let channel = self.queue.add_channel(&mut chan)?;
        trace!(cycle = self.active.cycle, channel = %channel, "new channel");
        self.statistics.channels_created += 1;
        Ok(channel)
    }

    /// `channel ! message`.
    ///
    /// For a synchronous operation a reply channel is created, carried with
    /// the message and returned to the caller.
    pub fn send(&mut self, channel: &Channel, message: Message) -> Result<Option<Channel>> {
        trace!(cycle = self.active.cycle, channel = %channel, %message, "send");
        let op = *self.resolver.capability(channel.kind())?.check(&message)?;
        let reply = if op.synchronous {
            Some(self.new_channel(&SYNCH, "Reply Channel")?)
        } else {
            None
        };
        let mut group = CommGroup::new(false).with(Comm::Send {
            channel: channel.clone(),
            message,
            reply: reply.clone(),
        });
        self.queue.add_group(&mut group)?;
        self.statistics.messages_sent += 1;
        Ok(reply)
    }

    /// Typed [`ExecutionContext::send`].
    pub fn send_msg<M: ChannelMessage>(
        &mut self,
        channel: &Channel,
        message: M,
    ) -> Result<Option<Channel>> {
        if channel.kind().as_str() != M::CAPABILITY.name {
            return Err(KernelError::UnknownOperation {
                capability: channel.kind().to_string(),
                operation: format!("<{} message>", M::CAPABILITY.name),
            });
        }
        self.send(channel, message.into_message())
    }

    /// Synchronous call: send, then run `on_reply` once the receiver has
    /// finished.
    pub fn call(
        &mut self,
        channel: &Channel,
        message: Message,
        on_reply: Arc<dyn Process>,
    ) -> Result<()> {
        let method = message.method.clone();
        let reply = self.send(channel, message)?.ok_or_else(|| KernelError::UnknownOperation {
            capability: channel.kind().to_string(),
            operation: format!("{method} (not synchronous)"),
        })?;
        self.receive(&reply, on_reply)
    }

    /// `channel ? listener`, consumed by the first matching send.
    pub fn receive(&mut self, channel: &Channel, listener: Arc<dyn Process>) -> Result<()> {
        self.select(false, vec![(channel.clone(), listener)])
    }

    /// `!channel ? listener`, a replicated receive that serves every send.
    pub fn serve(&mut self, channel: &Channel, listener: Arc<dyn Process>) -> Result<()> {
        self.select(true, vec![(channel.clone(), listener)])
    }

    /// Register several receives as one group (external choice).
    pub fn select(
        &mut self,
        replicated: bool,
        branches: Vec<(Channel, Arc<dyn Process>)>,
    ) -> Result<()> {
        if tracing::enabled!(tracing::Level::TRACE) {
            let desc = branches
                .iter()
                .map(|(ch, l)| format!("{ch} ? {}", l.describe()))
                .collect::<Vec<_>>()
                .join(" + ");
            trace!(cycle = self.active.cycle, replicated, "{desc}");
        }
        let mut group = CommGroup::new(replicated);
        for (channel, listener) in branches {
            group.add(Comm::recv(channel, listener));
        }
        self.register(&mut group)
    }

    /// Register an arbitrary comm group.
    pub fn register(&mut self, group: &mut CommGroup) -> Result<()> {
        self.queue.add_group(group)?;
        self.statistics.num_continuations += 1;
        Ok(())
    }

    /// Structural reduction: schedule `process` to run.
    pub fn instance(&mut self, process: Arc<dyn Process>) {
        trace!(cycle = self.active.cycle, process = %process.describe(), "instance");
        self.statistics.num_reductions_struct += 1;
        let mut continuation = Continuation::instance(process);
        if tracing::enabled!(tracing::Level::DEBUG) {
            let desc = continuation.closure().describe();
            continuation = continuation.with_description(desc);
        }
        self.queue.enqueue(continuation);
    }

    pub fn export_channel(&mut self, channel: &Channel) -> Result<String> {
        trace!(cycle = self.active.cycle, channel = %channel, "export");
        self.queue.create_export(channel)
    }

    pub fn import_channel(&mut self, token: &str) -> Result<Channel> {
        trace!(cycle = self.active.cycle, token, "import");
        self.queue.consume_export(token)
    }

    pub fn extension<T: Any>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }

    pub fn global_data(&self) -> Option<&Value> {
        self.queue.global_data()
    }

    pub fn set_global_data(&mut self, data: Value) {
        self.queue.set_global_data(data);
    }
}
