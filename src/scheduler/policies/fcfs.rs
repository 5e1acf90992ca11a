/*
 * First-Come-First-Serve Policy
 *
 * Runs the chain that became ready first until it yields or finishes.
 * FCFS has no notion of a time slice.
 */

use crate::error::{SimError, SimResult};
use crate::scheduler::data::{LastChainLoc, SchedulerData};
use crate::scheduler::traits::{Policy, SchedCtx};
use crate::time::Time;

pub struct Fcfs;

impl Policy for Fcfs {
    fn name(&self) -> &'static str {
        "FCFS"
    }

    fn validate(&self, time_slice: Option<Time>) -> SimResult<()> {
        if time_slice.is_some() {
            return Err(SimError::TimeSliceOnFcfs);
        }
        Ok(())
    }

    fn uses_time_slices(&self, _default_time_slice: Option<Time>) -> bool {
        false
    }

    fn sched_loop(
        &self,
        _t: Time,
        data: &mut SchedulerData,
        _last: &LastChainLoc,
        default_time_slice: Option<Time>,
        _module: &str,
        _ctx: &SchedCtx,
    ) -> SimResult<(Option<usize>, Option<Time>)> {
        if data.ready.is_empty() {
            Ok((None, default_time_slice))
        } else {
            Ok((Some(0), default_time_slice))
        }
    }
}
