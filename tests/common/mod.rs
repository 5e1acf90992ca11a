/*
 * Shared test support: a recording sink that captures simplified events
 * (and checks chain well-formedness on every one), plus a shareable
 * in-memory write buffer for log round-trips.
 */
#![allow(dead_code)]

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use schedtree::sink::{CpuView, EventSink, SwitchTarget};
use schedtree::threads::{CoreStats, ThreadStatsMap};
use schedtree::time::Time;

/// A simplified, comparable event.
#[derive(Debug, Clone, PartialEq)]
pub enum Ev {
    Switch {
        cost: Time,
    },
    Execute {
        module: String,
        tid: String,
        runtime: Time,
        at: Time,
    },
    Yield {
        module: String,
        tid: String,
    },
    Idle {
        span: Time,
    },
    Interrupt {
        idx: usize,
        delay: Time,
    },
}

#[derive(Default)]
pub struct Recorded {
    pub events: Vec<Ev>,
    pub thread_stats: Option<ThreadStatsMap>,
    pub cpu_stats: Vec<CoreStats>,
    pub times: Vec<Time>,
}

/// Sink recording events into a shared cell, asserting on every event that
/// the chain is well-formed: the bottom is the kernel and consecutive
/// frames are same-module-or-child.
#[derive(Clone, Default)]
pub struct RecordingSink {
    inner: Rc<RefCell<Recorded>>,
}

impl RecordingSink {
    pub fn new() -> RecordingSink {
        RecordingSink::default()
    }

    pub fn recorded(&self) -> std::cell::Ref<'_, Recorded> {
        self.inner.borrow()
    }

    /// The (module, tid, runtime) sequence of execute events.
    pub fn executions(&self) -> Vec<(String, String, Time)> {
        self.inner
            .borrow()
            .events
            .iter()
            .filter_map(|event| match event {
                Ev::Execute {
                    module,
                    tid,
                    runtime,
                    ..
                } => Some((module.clone(), tid.clone(), *runtime)),
                _ => None,
            })
            .collect()
    }

    fn check_chain(&self, cpu: &CpuView) {
        let chain = cpu.chain;
        assert!(!chain.is_empty(), "empty chain observed");

        let bottom_module = cpu.module_of(chain.bottom());
        assert_eq!(
            cpu.modules.parent(bottom_module),
            None,
            "chain bottom is not the kernel"
        );

        for pair in chain.frames().windows(2) {
            let below = cpu.module_of(pair[0].thread);
            let above = cpu.module_of(pair[1].thread);
            assert!(
                below == above || cpu.modules.is_child_of(above, below),
                "consecutive frames are neither same-module nor child"
            );
        }
    }

    fn note(&self, cpu: &CpuView, event: Ev) {
        self.check_chain(cpu);
        let mut inner = self.inner.borrow_mut();
        inner.times.push(cpu.current_time);
        inner.events.push(event);
    }

    fn top_identity(cpu: &CpuView) -> (String, String) {
        let top = cpu.chain.top();
        (cpu.module_name(top).into(), cpu.tid(top).into())
    }
}

impl EventSink for RecordingSink {
    fn init_core(&mut self, cpu: &CpuView) {
        self.check_chain(cpu);
    }

    fn context_switch(&mut self, cpu: &CpuView, _target: &SwitchTarget, cost: Time) {
        self.note(cpu, Ev::Switch { cost });
    }

    fn thread_execute(&mut self, cpu: &CpuView, runtime: Time) {
        let (module, tid) = Self::top_identity(cpu);
        let at = cpu.current_time;
        self.note(
            cpu,
            Ev::Execute {
                module,
                tid,
                runtime,
                at,
            },
        );
    }

    fn thread_yield(&mut self, cpu: &CpuView) {
        let (module, tid) = Self::top_identity(cpu);
        self.note(cpu, Ev::Yield { module, tid });
    }

    fn cpu_idle(&mut self, cpu: &CpuView, idle_time: Time) {
        self.note(cpu, Ev::Idle { span: idle_time });
    }

    fn timer_interrupt(&mut self, cpu: &CpuView, idx: usize, delay: Time) {
        self.note(cpu, Ev::Interrupt { idx, delay });
    }

    fn thread_statistics(&mut self, stats: &ThreadStatsMap) {
        self.inner.borrow_mut().thread_stats = Some(stats.clone());
    }

    fn cpu_statistics(&mut self, stats: &[CoreStats]) {
        self.inner.borrow_mut().cpu_stats = stats.to_vec();
    }
}

/// An in-memory write buffer that can be read back after the sink owning it
/// is gone.
#[derive(Clone, Default)]
pub struct SharedBuf {
    inner: Rc<RefCell<Vec<u8>>>,
}

impl SharedBuf {
    pub fn new() -> SharedBuf {
        SharedBuf::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.borrow().clone()
    }

    pub fn as_string(&self) -> String {
        String::from_utf8(self.contents()).expect("non-utf8 log output")
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
