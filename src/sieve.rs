//! Sieve of Eratosthenes as a process network.
//!
//! ```text
//! Sieve              := (v integers)(v primes) Counter(integers, 2) | Head(integers, primes) | Print(primes)
//! Counter(out, n)    := (v a) out ! val(n, a) | a ? ret = Counter(out, n + 1)
//! Head(in, primes)   := in ? val(n, r) = (v a) primes ! val(n, a)
//!                          | a ? ret = (v x) PrimeFilter(n, in, x) | Head(x, primes) | r ! ret
//! Print(in)          := ! in ? val(n, r) = emit(n) | r ! ret
//! PrimeFilter(p, in, out) := ! in ? val(n, r) = if n mod p != 0 then (v a) out ! val(n, a) | a ? ret = r ! ret
//!                                              else r ! ret
//! ```
//!
//! Every closure keeps its fields in a [`Value`] record so a running sieve
//! can be persisted between any two cycles. Found primes go to the
//! [`PrimeSink`] extension.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context as _};
use tracing::{debug, info};

use crate::channel::{Capability, Channel, ChannelMessage, Message, Operation, SynchMsg, SYNCH};
use crate::config::VpuConfig;
use crate::error::{KernelError, Result};
use crate::extension::Extensions;
use crate::process::Process;
use crate::registry::Resolver;
use crate::soup::ExecutionQueue;
use crate::stats::Statistics;
use crate::types::{Args, Value};
use crate::vpu::{ExecutionContext, Vpu};

/// A stream of natural numbers; every value is acknowledged on `ack`.
pub static NUMBER_STREAM: Capability = Capability {
    name: "NaturalNumberStream",
    operations: &[Operation::asynchronous("val", 2)],
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NumberMsg {
    Val { n: i64, ack: Channel },
}

impl ChannelMessage for NumberMsg {
    const CAPABILITY: &'static Capability = &NUMBER_STREAM;

    fn into_message(self) -> Message {
        match self {
            NumberMsg::Val { n, ack } => Message::new("val", vec![Value::Int(n), Value::Channel(ack)]),
        }
    }

    fn from_message(message: Message) -> Result<Self> {
        NUMBER_STREAM.check(&message)?;
        Ok(NumberMsg::Val {
            n: message.args.int_at("val", 0)?,
            ack: message.args.channel_at("val", 1)?,
        })
    }
}

/// Collects the primes printed by the network.
#[derive(Debug, Default)]
pub struct PrimeSink {
    primes: Mutex<Vec<i64>>,
}

impl PrimeSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn emit(&self, n: i64) {
        if let Ok(mut primes) = self.primes.lock() {
            primes.push(n);
        }
    }

    pub fn count(&self) -> usize {
        self.primes.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn last(&self) -> Option<i64> {
        self.primes.lock().ok().and_then(|p| p.last().copied())
    }

    pub fn primes(&self) -> Vec<i64> {
        self.primes.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

/// A resolver that can rebuild every sieve closure.
pub fn resolver() -> Resolver {
    Resolver::new()
        .with_capability(&NUMBER_STREAM)
        .with_closure("Sieve", |_| Ok(Arc::new(Sieve)))
        .with_closure("Counter", |s| {
            Ok(Arc::new(Counter { out: channel(s, "out")?, n: int(s, "n")? }))
        })
        .with_closure("CounterAck", |s| {
            Ok(Arc::new(CounterAck { out: channel(s, "out")?, n: int(s, "n")? }))
        })
        .with_closure("Head", |s| {
            Ok(Arc::new(Head { input: channel(s, "in")?, primes: channel(s, "primes")? }))
        })
        .with_closure("HeadListener", |s| {
            Ok(Arc::new(HeadListener { input: channel(s, "in")?, primes: channel(s, "primes")? }))
        })
        .with_closure("HeadAck", |s| {
            Ok(Arc::new(HeadAck {
                n: int(s, "n")?,
                input: channel(s, "in")?,
                primes: channel(s, "primes")?,
                ret: channel(s, "ret")?,
            }))
        })
        .with_closure("Print", |s| Ok(Arc::new(Print { input: channel(s, "in")? })))
        .with_closure("PrintListener", |_| Ok(Arc::new(PrintListener)))
        .with_closure("PrimeFilter", |s| {
            Ok(Arc::new(PrimeFilter {
                prime: int(s, "prime")?,
                input: channel(s, "in")?,
                out: channel(s, "out")?,
            }))
        })
        .with_closure("FilterListener", |s| {
            Ok(Arc::new(FilterListener { prime: int(s, "prime")?, out: channel(s, "out")? }))
        })
        .with_closure("Relay", |s| Ok(Arc::new(Relay { ret: channel(s, "ret")? })))
}

fn channel(state: &Value, name: &str) -> anyhow::Result<Channel> {
    state
        .field(name)
        .and_then(Value::as_channel)
        .cloned()
        .ok_or_else(|| anyhow!("missing channel field '{name}'"))
}

fn int(state: &Value, name: &str) -> anyhow::Result<i64> {
    state
        .field(name)
        .and_then(Value::as_int)
        .ok_or_else(|| anyhow!("missing int field '{name}'"))
}

fn ch(c: &Channel) -> Value {
    Value::Channel(c.clone())
}

/// `ack ! ret`
fn ack(ctx: &mut ExecutionContext<'_>, ret: &Channel) -> anyhow::Result<()> {
    ctx.send_msg(ret, SynchMsg::Ret)?;
    Ok(())
}

/// `(v a) out ! val(n, a) | a ? ret = then`
fn offer(
    ctx: &mut ExecutionContext<'_>,
    out: &Channel,
    n: i64,
    then: Arc<dyn Process>,
) -> anyhow::Result<()> {
    let a = ctx.new_channel(&SYNCH, "ack")?;
    ctx.send_msg(out, NumberMsg::Val { n, ack: a.clone() })?;
    ctx.receive(&a, then)?;
    Ok(())
}

fn expect_ret(message: Message) -> anyhow::Result<()> {
    SynchMsg::from_message(message)?;
    Ok(())
}

// ─── Closures ─────────────────────────────────────────────────

#[derive(Debug)]
pub struct Sieve;

impl Process for Sieve {
    fn kind(&self) -> &'static str {
        "Sieve"
    }
    fn state(&self) -> Value {
        Value::Unit
    }
    fn invoke(&self, ctx: &mut ExecutionContext<'_>, _message: Message) -> anyhow::Result<()> {
        let integers = ctx.new_channel(&NUMBER_STREAM, "integers")?;
        let primes = ctx.new_channel(&NUMBER_STREAM, "primes")?;
        ctx.instance(Arc::new(Counter { out: integers.clone(), n: 2 }));
        ctx.instance(Arc::new(Head { input: integers, primes: primes.clone() }));
        ctx.instance(Arc::new(Print { input: primes }));
        Ok(())
    }
}

#[derive(Debug)]
struct Counter {
    out: Channel,
    n: i64,
}

impl Process for Counter {
    fn kind(&self) -> &'static str {
        "Counter"
    }
    fn state(&self) -> Value {
        Value::record([("out", ch(&self.out)), ("n", Value::Int(self.n))])
    }
    fn invoke(&self, ctx: &mut ExecutionContext<'_>, _message: Message) -> anyhow::Result<()> {
        let next = CounterAck { out: self.out.clone(), n: self.n };
        offer(ctx, &self.out, self.n, Arc::new(next))
    }
    fn describe(&self) -> String {
        format!("Counter({}, {})", self.out, self.n)
    }
}

#[derive(Debug)]
struct CounterAck {
    out: Channel,
    n: i64,
}

impl Process for CounterAck {
    fn kind(&self) -> &'static str {
        "CounterAck"
    }
    fn state(&self) -> Value {
        Value::record([("out", ch(&self.out)), ("n", Value::Int(self.n))])
    }
    fn invoke(&self, ctx: &mut ExecutionContext<'_>, message: Message) -> anyhow::Result<()> {
        expect_ret(message)?;
        ctx.instance(Arc::new(Counter { out: self.out.clone(), n: self.n + 1 }));
        Ok(())
    }
}

#[derive(Debug)]
struct Head {
    input: Channel,
    primes: Channel,
}

impl Process for Head {
    fn kind(&self) -> &'static str {
        "Head"
    }
    fn state(&self) -> Value {
        Value::record([("in", ch(&self.input)), ("primes", ch(&self.primes))])
    }
    fn invoke(&self, ctx: &mut ExecutionContext<'_>, _message: Message) -> anyhow::Result<()> {
        let listener = HeadListener { input: self.input.clone(), primes: self.primes.clone() };
        ctx.receive(&self.input, Arc::new(listener))?;
        Ok(())
    }
    fn describe(&self) -> String {
        format!("Head({}, {})", self.input, self.primes)
    }
}

#[derive(Debug)]
struct HeadListener {
    input: Channel,
    primes: Channel,
}

impl Process for HeadListener {
    fn kind(&self) -> &'static str {
        "HeadListener"
    }
    fn state(&self) -> Value {
        Value::record([("in", ch(&self.input)), ("primes", ch(&self.primes))])
    }
    fn invoke(&self, ctx: &mut ExecutionContext<'_>, message: Message) -> anyhow::Result<()> {
        let NumberMsg::Val { n, ack: ret } = NumberMsg::from_message(message)?;
        debug!(prime = n, "head of stream");
        let then = HeadAck {
            n,
            input: self.input.clone(),
            primes: self.primes.clone(),
            ret,
        };
        offer(ctx, &self.primes, n, Arc::new(then))
    }
}

#[derive(Debug)]
struct HeadAck {
    n: i64,
    input: Channel,
    primes: Channel,
    ret: Channel,
}

impl Process for HeadAck {
    fn kind(&self) -> &'static str {
        "HeadAck"
    }
    fn state(&self) -> Value {
        Value::record([
            ("n", Value::Int(self.n)),
            ("in", ch(&self.input)),
            ("primes", ch(&self.primes)),
            ("ret", ch(&self.ret)),
        ])
    }
    fn invoke(&self, ctx: &mut ExecutionContext<'_>, message: Message) -> anyhow::Result<()> {
        expect_ret(message)?;
        let x = ctx.new_channel(&NUMBER_STREAM, &format!("filtered by {}", self.n))?;
        ctx.instance(Arc::new(PrimeFilter {
            prime: self.n,
            input: self.input.clone(),
            out: x.clone(),
        }));
        ctx.instance(Arc::new(Head { input: x, primes: self.primes.clone() }));
        ack(ctx, &self.ret)
    }
}

#[derive(Debug)]
struct Print {
    input: Channel,
}

impl Process for Print {
    fn kind(&self) -> &'static str {
        "Print"
    }
    fn state(&self) -> Value {
        Value::record([("in", ch(&self.input))])
    }
    fn invoke(&self, ctx: &mut ExecutionContext<'_>, _message: Message) -> anyhow::Result<()> {
        ctx.serve(&self.input, Arc::new(PrintListener))?;
        Ok(())
    }
}

#[derive(Debug)]
struct PrintListener;

impl Process for PrintListener {
    fn kind(&self) -> &'static str {
        "PrintListener"
    }
    fn state(&self) -> Value {
        Value::Unit
    }
    fn invoke(&self, ctx: &mut ExecutionContext<'_>, message: Message) -> anyhow::Result<()> {
        let NumberMsg::Val { n, ack: ret } = NumberMsg::from_message(message)?;
        let sink = ctx
            .extension::<Arc<PrimeSink>>()
            .context("no PrimeSink installed")?;
        sink.emit(n);
        info!(prime = n, count = sink.count(), "PRIME");
        ack(ctx, &ret)
    }
}

#[derive(Debug)]
struct PrimeFilter {
    prime: i64,
    input: Channel,
    out: Channel,
}

impl Process for PrimeFilter {
    fn kind(&self) -> &'static str {
        "PrimeFilter"
    }
    fn state(&self) -> Value {
        Value::record([
            ("prime", Value::Int(self.prime)),
            ("in", ch(&self.input)),
            ("out", ch(&self.out)),
        ])
    }
    fn invoke(&self, ctx: &mut ExecutionContext<'_>, _message: Message) -> anyhow::Result<()> {
        let listener = FilterListener { prime: self.prime, out: self.out.clone() };
        ctx.serve(&self.input, Arc::new(listener))?;
        Ok(())
    }
    fn describe(&self) -> String {
        format!("PrimeFilter({}, {}, {})", self.prime, self.input, self.out)
    }
}

#[derive(Debug)]
struct FilterListener {
    prime: i64,
    out: Channel,
}

impl Process for FilterListener {
    fn kind(&self) -> &'static str {
        "FilterListener"
    }
    fn state(&self) -> Value {
        Value::record([("prime", Value::Int(self.prime)), ("out", ch(&self.out))])
    }
    fn invoke(&self, ctx: &mut ExecutionContext<'_>, message: Message) -> anyhow::Result<()> {
        let NumberMsg::Val { n, ack: ret } = NumberMsg::from_message(message)?;
        if n % self.prime != 0 {
            offer(ctx, &self.out, n, Arc::new(Relay { ret }))
        } else {
            ack(ctx, &ret)
        }
    }
}

/// `a ? ret = r ! ret`
#[derive(Debug)]
struct Relay {
    ret: Channel,
}

impl Process for Relay {
    fn kind(&self) -> &'static str {
        "Relay"
    }
    fn state(&self) -> Value {
        Value::record([("ret", ch(&self.ret))])
    }
    fn invoke(&self, ctx: &mut ExecutionContext<'_>, message: Message) -> anyhow::Result<()> {
        expect_ret(message)?;
        ack(ctx, &self.ret)
    }
}

// ─── Driver ───────────────────────────────────────────────────

/// Result of a sieve run.
#[derive(Debug)]
pub struct SieveRun {
    pub prime: i64,
    pub primes: Vec<i64>,
    pub cycles: u32,
    /// How many times the queue went through a write/read round trip.
    pub persisted: u32,
    pub statistics: Statistics,
    /// [`Vpu::dump_state`] at the moment the prime was found.
    pub dump: String,
}

/// Run the sieve until the `nth` prime (1-based) has been printed.
///
/// With `persist_every = Some(k)` the queue is written out and read back
/// into a fresh queue every `k` cycles.
pub fn find_nth_prime(nth: usize, persist_every: Option<u32>, config: VpuConfig) -> Result<SieveRun> {
    if nth == 0 {
        return Err(KernelError::Internal("primes are counted from 1".into()));
    }
    let resolver = Arc::new(resolver());
    let sink = PrimeSink::new();
    let mut vpu = Vpu::new(Arc::clone(&resolver), Extensions::new().with(Arc::clone(&sink)))
        .with_config(config);
    vpu.set_context(ExecutionQueue::new());
    vpu.inject(Arc::new(Sieve))?;

    let mut cycles = 0u32;
    let mut persisted = 0u32;
    while sink.count() < nth {
        if !vpu.execute()? {
            return Err(KernelError::Internal(format!(
                "sieve went idle after {} primes",
                sink.count()
            )));
        }
        cycles += 1;
        if persist_every.is_some_and(|k| k > 0 && cycles % k == 0) {
            let mut queue = vpu.take_context().ok_or(KernelError::NoContext)?;
            let bytes = queue.to_bytes()?;
            vpu.set_context(ExecutionQueue::from_bytes(&bytes, Arc::clone(&resolver))?);
            persisted += 1;
        }
    }

    let primes = sink.primes();
    let prime = primes
        .get(nth - 1)
        .copied()
        .ok_or_else(|| KernelError::Internal("prime sink lost entries".into()))?;
    Ok(SieveRun {
        prime,
        primes,
        cycles,
        persisted,
        statistics: vpu.statistics().clone(),
        dump: vpu.dump_state(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_message_decodes_arguments() {
        let ack = Channel::new(9, SYNCH.channel_type());
        let msg = NumberMsg::Val { n: 11, ack: ack.clone() }.into_message();
        assert_eq!(msg.method, "val");
        assert_eq!(NumberMsg::from_message(msg).unwrap(), NumberMsg::Val { n: 11, ack });

        let bad = Message::new("val", vec![Value::str("eleven"), Value::Unit]);
        assert!(matches!(
            NumberMsg::from_message(bad),
            Err(KernelError::ArgumentType { index: 0, .. })
        ));
    }

    #[test]
    fn first_primes() {
        let run = find_nth_prime(6, None, VpuConfig::default()).unwrap();
        assert_eq!(run.primes, vec![2, 3, 5, 7, 11, 13]);
        assert_eq!(run.prime, 13);
        assert_eq!(run.persisted, 0);
        assert_eq!(run.statistics.num_cycles, u64::from(run.cycles));
    }

    #[test]
    fn every_closure_kind_can_be_rebuilt() {
        let r = resolver();
        let c = Channel::new(1, NUMBER_STREAM.channel_type());
        let closures: Vec<Arc<dyn Process>> = vec![
            Arc::new(Sieve),
            Arc::new(Counter { out: c.clone(), n: 4 }),
            Arc::new(CounterAck { out: c.clone(), n: 4 }),
            Arc::new(Head { input: c.clone(), primes: c.clone() }),
            Arc::new(HeadListener { input: c.clone(), primes: c.clone() }),
            Arc::new(HeadAck { n: 3, input: c.clone(), primes: c.clone(), ret: c.clone() }),
            Arc::new(Print { input: c.clone() }),
            Arc::new(PrintListener),
            Arc::new(PrimeFilter { prime: 3, input: c.clone(), out: c.clone() }),
            Arc::new(FilterListener { prime: 3, out: c.clone() }),
            Arc::new(Relay { ret: c }),
        ];
        for closure in closures {
            let rebuilt = r.load(closure.kind(), &closure.state()).unwrap();
            assert_eq!(rebuilt.kind(), closure.kind());
            assert_eq!(rebuilt.state(), closure.state());
        }
    }

    #[test]
    fn rejects_zeroth_prime() {
        assert!(find_nth_prime(0, None, VpuConfig::default()).is_err());
    }
}
