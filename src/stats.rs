//! VPU bookkeeping. Diagnostic only; nothing here affects execution.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Timing of one reduction target (closure kind x method).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetTiming {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl TargetTiming {
    pub fn average(&self) -> Duration {
        average(self.total, self.count)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Statistics {
    /// Cycles that ran a reaction to completion.
    pub num_cycles: u64,
    /// Structural reductions (`instance`).
    pub num_reductions_struct: u64,
    /// Receive groups registered.
    pub num_continuations: u64,
    pub messages_sent: u64,
    pub channels_created: u64,
    /// Reactions injected from outside the VPU.
    pub run_queue_entries: u64,
    /// Wall time of whole cycles.
    pub total_run_time: Duration,
    /// Wall time spent inside closures.
    pub total_client_time: Duration,
    targets: BTreeMap<String, TargetTiming>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_cycle(&mut self, target: &str, run: Duration, client: Duration) {
        self.num_cycles += 1;
        self.total_run_time += run;
        self.total_client_time += client;
        let timing = self.targets.entry(target.to_string()).or_default();
        timing.count += 1;
        timing.total += run;
        timing.max = timing.max.max(run);
    }

    pub fn average_run_time(&self) -> Duration {
        average(self.total_run_time, self.num_cycles)
    }

    pub fn target(&self, target: &str) -> Option<&TargetTiming> {
        self.targets.get(target)
    }

    pub fn targets(&self) -> impl Iterator<Item = (&str, &TargetTiming)> {
        self.targets.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn average(total: Duration, count: u64) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(n) => total / n,
        Err(_) => Duration::from_secs_f64(total.as_secs_f64() / count as f64),
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "-- VPU STATISTICS")?;
        writeln!(f, "   numCycles            = {}", self.num_cycles)?;
        writeln!(f, "   numReductionsStruct  = {}", self.num_reductions_struct)?;
        writeln!(f, "   numContinuations     = {}", self.num_continuations)?;
        writeln!(f, "   messagesSent         = {}", self.messages_sent)?;
        writeln!(f, "   channelsCreated      = {}", self.channels_created)?;
        writeln!(f, "   runQueueEntries      = {}", self.run_queue_entries)?;
        writeln!(f, "   totalRunTime         = {:?}", self.total_run_time)?;
        writeln!(f, "   totalClientTime      = {:?}", self.total_client_time)?;
        writeln!(f, "   averageRunTime       = {:?}", self.average_run_time())?;
        for (target, t) in &self.targets {
            writeln!(
                f,
                "   {target}: count={} total={:?} avg={:?} max={:?}",
                t.count,
                t.total,
                t.average(),
                t.max
            )?;
        }
        Ok(())
    }
}
