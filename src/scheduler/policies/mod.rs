/*
 * Scheduling Policies
 *
 * Ordering disciplines over ready chains. Single is the do-nothing base
 * (at most one chain); the others are real policies.
 */

pub mod cfs;
pub mod fcfs;
pub mod mlfq;
pub mod round_robin;
pub mod sjf;

pub use cfs::Cfs;
pub use fcfs::Fcfs;
pub use mlfq::Mlfq;
pub use round_robin::round_robin;
pub use sjf::{Psjf, Sjf};

use crate::error::{SimError, SimResult};
use crate::scheduler::data::{LastChainLoc, SchedulerData};
use crate::scheduler::traits::{Policy, SchedCtx};
use crate::time::Time;

/// Base policy: schedules a single chain, errors if more are ready.
pub struct Single;

impl Policy for Single {
    fn name(&self) -> &'static str {
        "Single"
    }

    fn uses_time_slices(&self, default_time_slice: Option<Time>) -> bool {
        default_time_slice.is_some()
    }

    fn sched_loop(
        &self,
        _t: Time,
        data: &mut SchedulerData,
        _last: &LastChainLoc,
        default_time_slice: Option<Time>,
        module: &str,
        _ctx: &SchedCtx,
    ) -> SimResult<(Option<usize>, Option<Time>)> {
        match data.ready.len() {
            0 => Ok((None, default_time_slice)),
            1 => Ok((Some(0), default_time_slice)),
            ready => Err(SimError::AmbiguousDecision {
                module: module.into(),
                ready,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::context::Chain;
    use crate::module::ModuleTable;
    use crate::threads::{ThreadSpec, ThreadTable};

    #[test]
    fn test_single_rejects_multiple_chains() {
        let mut modules = ModuleTable::new();
        let kernel = modules.add_module("0", None).unwrap();
        let mut threads = ThreadTable::new();
        let a = threads.add_worker(&mut modules, kernel, ThreadSpec::default());
        let b = threads.add_worker(&mut modules, kernel, ThreadSpec::default());

        let mut data = SchedulerData::new(Single.init_data());
        data.ready.push(Chain::from_thread(a, &threads));
        data.ready.push(Chain::from_thread(b, &threads));

        let ctx = SchedCtx { threads: &threads };
        let result = Single.sched_loop(Time::zero(), &mut data, &LastChainLoc::None, None, "0", &ctx);
        assert!(matches!(result, Err(SimError::AmbiguousDecision { .. })));
    }
}
