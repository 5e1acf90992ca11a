/*
 * Log Multiplexer
 *
 * Forwards events to multiple sinks. Each sink can carry an optional
 * virtual-time cutoff after which it stops recording events; statistics are
 * always forwarded.
 */

use crate::sink::{CpuView, EventSink, SwitchTarget};
use crate::threads::{CoreStats, ThreadStatsMap};
use crate::time::Time;

pub struct Multiplexer {
    sinks: Vec<(Box<dyn EventSink>, Option<Time>)>,
}

impl Multiplexer {
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Multiplexer {
        Multiplexer {
            sinks: sinks.into_iter().map(|sink| (sink, None)).collect(),
        }
    }

    /// Multiplexer with a recording cutoff per sink.
    pub fn with_timeouts(sinks: Vec<(Box<dyn EventSink>, Option<Time>)>) -> Multiplexer {
        Multiplexer { sinks }
    }

    pub fn into_sinks(self) -> Vec<Box<dyn EventSink>> {
        self.sinks.into_iter().map(|(sink, _)| sink).collect()
    }

    fn active(&mut self, now: Time) -> impl Iterator<Item = &mut Box<dyn EventSink>> {
        self.sinks
            .iter_mut()
            .filter(move |(_, timeout)| timeout.is_none_or(|cutoff| cutoff > now))
            .map(|(sink, _)| sink)
    }
}

impl EventSink for Multiplexer {
    fn init_core(&mut self, cpu: &CpuView) {
        for sink in self.active(cpu.current_time) {
            sink.init_core(cpu);
        }
    }

    fn context_switch(&mut self, cpu: &CpuView, target: &SwitchTarget, cost: Time) {
        for sink in self.active(cpu.current_time) {
            sink.context_switch(cpu, target, cost);
        }
    }

    fn thread_execute(&mut self, cpu: &CpuView, runtime: Time) {
        for sink in self.active(cpu.current_time) {
            sink.thread_execute(cpu, runtime);
        }
    }

    fn thread_yield(&mut self, cpu: &CpuView) {
        for sink in self.active(cpu.current_time) {
            sink.thread_yield(cpu);
        }
    }

    fn cpu_idle(&mut self, cpu: &CpuView, idle_time: Time) {
        for sink in self.active(cpu.current_time) {
            sink.cpu_idle(cpu, idle_time);
        }
    }

    fn timer_interrupt(&mut self, cpu: &CpuView, idx: usize, delay: Time) {
        for sink in self.active(cpu.current_time) {
            sink.timer_interrupt(cpu, idx, delay);
        }
    }

    fn thread_statistics(&mut self, stats: &ThreadStatsMap) {
        for (sink, _) in &mut self.sinks {
            sink.thread_statistics(stats);
        }
    }

    fn cpu_statistics(&mut self, stats: &[CoreStats]) {
        for (sink, _) in &mut self.sinks {
            sink.cpu_statistics(stats);
        }
    }
}
