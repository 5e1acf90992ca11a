/*
 * Thread Statistics
 *
 * Every thread records how it spent its virtual life: context-switch costs,
 * per-activation run bursts, wait gaps between becoming ready and running,
 * and the latched finish/response timestamps. Scheduler and VCPU threads
 * additionally record background time (time charged while sitting below the
 * top of the context chain).
 *
 * Collection never fails; absent optional values are reported as null.
 */

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::time::Time;

/// Live per-thread accounting, updated by the CPU callbacks.
#[derive(Debug, Clone)]
pub struct ThreadStats {
    /// Virtual time the thread completed its workload.
    pub finished_time: Option<Time>,
    /// Virtual time the response-unit budget was exhausted.
    pub response_time: Option<Time>,
    /// Context-switch cost charged per switch involving this thread.
    pub ctxsw: Vec<Time>,
    /// Run bursts, one inner list per activation.
    pub run: Vec<Vec<Time>>,
    /// Sum of all run bursts.
    pub total_run: Time,
    /// Wait gaps, one inner list per activation.
    pub wait: Vec<Vec<Time>>,
}

impl ThreadStats {
    pub fn new() -> ThreadStats {
        ThreadStats {
            finished_time: None,
            response_time: None,
            ctxsw: Vec::new(),
            run: vec![Vec::new()],
            total_run: Time::zero(),
            wait: vec![Vec::new()],
        }
    }
}

impl Default for ThreadStats {
    fn default() -> Self {
        ThreadStats::new()
    }
}

/// Background-time accounting for scheduler and VCPU threads.
#[derive(Debug, Clone)]
pub struct BgStats {
    /// Background bursts, one inner list per activation.
    pub bg_times: Vec<Vec<Time>>,
}

impl BgStats {
    pub fn new() -> BgStats {
        BgStats {
            bg_times: vec![Vec::new()],
        }
    }
}

/// Statistics map keyed by thread identity (module name, thread id).
pub type ThreadStatsMap = BTreeMap<(String, String), ThreadStatsReport>;

/// A finalized statistics record for one thread, as handed to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadStatsReport {
    pub finished_time: Option<Time>,
    pub response_time: Option<Time>,
    pub ctxsw: Vec<Time>,
    pub run: Vec<Vec<Time>>,
    pub total_run: Time,
    pub wait: Vec<Vec<Time>>,
    /// How long the thread has been ready but unscheduled at collection time.
    pub waiting: Option<Time>,
    pub remaining: Option<Time>,
    /// Background bursts; scheduler and VCPU threads only.
    pub bg: Option<Vec<Vec<Time>>>,
    /// Statistics of the scheduled threads; scheduler threads only.
    pub children: Option<ThreadStatsMap>,
    /// Statistics of the wrapped scheduler thread; VCPU threads only.
    pub scheduler: Option<ThreadStatsMap>,
}

/// Per-core time statistics as handed to sinks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoreStats {
    pub crunch_time: Time,
    pub idle_time: Time,
    pub timer_delay: Time,
    pub thread_time: Time,
    pub module_time: Time,
}
