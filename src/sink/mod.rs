/*
 * Event Sinks
 *
 * The only surface over which the simulation core communicates outward: an
 * abstract event emitter fed on every context switch, execution, idle span
 * and timer interrupt, plus the end-of-run statistics. Implementations
 * include a text writer, a binary writer with a replayer, and a fan-out
 * multiplexer.
 */

pub mod binary;
pub mod multiplexer;
pub mod text;

pub use binary::{BinaryLog, read_thread_statistics, replay};
pub use multiplexer::Multiplexer;
pub use text::{Align, TextLog};

use crate::cpu::context::Chain;
use crate::module::{ModuleId, ModuleTable};
use crate::threads::{CoreStats, ThreadKey, ThreadStatsMap, ThreadTable};
use crate::time::Time;

/// Read-only view of a CPU core handed to sinks with every event.
///
/// Exposes the core's id, its clock, and the current context chain, with
/// enough name resolution to render threads and modules.
#[derive(Clone, Copy)]
pub struct CpuView<'a> {
    pub uid: usize,
    pub current_time: Time,
    pub chain: &'a Chain,
    pub threads: &'a ThreadTable,
    pub modules: &'a ModuleTable,
}

impl<'a> CpuView<'a> {
    pub fn module_of(&self, thread: ThreadKey) -> ModuleId {
        self.threads.module_of(thread)
    }

    pub fn module_name(&self, thread: ThreadKey) -> &'a str {
        self.modules.name(self.threads.module_of(thread))
    }

    pub fn tid(&self, thread: ThreadKey) -> &'a str {
        self.threads.tid(thread)
    }
}

/// The destination of a context switch: exactly one of a split back to a
/// frame of the current chain, or a chain about to be appended.
#[derive(Debug)]
pub enum SwitchTarget<'a> {
    Split(usize),
    Append(&'a Chain),
}

/// Abstract event emitter the core reports into.
pub trait EventSink {
    /// A core was registered.
    fn init_core(&mut self, cpu: &CpuView);

    /// A context switch is about to be performed. The before/after chains
    /// are derivable from the current chain and the target.
    fn context_switch(&mut self, cpu: &CpuView, target: &SwitchTarget, cost: Time);

    /// The top thread executed for `runtime`.
    fn thread_execute(&mut self, cpu: &CpuView, runtime: Time);

    /// The top thread yielded.
    fn thread_yield(&mut self, cpu: &CpuView);

    /// The core idled for `idle_time`.
    fn cpu_idle(&mut self, cpu: &CpuView, idle_time: Time);

    /// The timer of frame `idx` fired, `delay` after its deadline.
    fn timer_interrupt(&mut self, cpu: &CpuView, idx: usize, delay: Time);

    /// End-of-run per-thread statistics.
    fn thread_statistics(&mut self, stats: &ThreadStatsMap);

    /// End-of-run per-core statistics.
    fn cpu_statistics(&mut self, stats: &[CoreStats]);
}

/// A sink that drops everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn init_core(&mut self, _cpu: &CpuView) {}
    fn context_switch(&mut self, _cpu: &CpuView, _target: &SwitchTarget, _cost: Time) {}
    fn thread_execute(&mut self, _cpu: &CpuView, _runtime: Time) {}
    fn thread_yield(&mut self, _cpu: &CpuView) {}
    fn cpu_idle(&mut self, _cpu: &CpuView, _idle_time: Time) {}
    fn timer_interrupt(&mut self, _cpu: &CpuView, _idx: usize, _delay: Time) {}
    fn thread_statistics(&mut self, _stats: &ThreadStatsMap) {}
    fn cpu_statistics(&mut self, _stats: &[CoreStats]) {}
}
