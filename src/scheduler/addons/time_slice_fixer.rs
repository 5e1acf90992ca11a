/*
 * Time-Slice Fixer Addon
 *
 * Overrides every time slice the policy produces with a fixed one (usually
 * none at all). This lets policies that compute slices run in places where
 * timers are unavailable, such as non-kernel modules under the kernel-only
 * timer CPU policy.
 */

use crate::scheduler::data::SchedulerData;
use crate::scheduler::traits::{Addon, SchedCtx};
use crate::time::Time;

pub struct TimeSliceFixer {
    override_time_slice: Option<Time>,
}

impl TimeSliceFixer {
    pub fn new(override_time_slice: Option<Time>) -> TimeSliceFixer {
        TimeSliceFixer {
            override_time_slice,
        }
    }
}

impl Addon for TimeSliceFixer {
    fn name(&self) -> &'static str {
        "TimeSliceFixer"
    }

    fn overrides_time_slice(&self) -> bool {
        true
    }

    fn schedule(
        &self,
        _idx: Option<usize>,
        _time_slice: Option<Time>,
        _data: &mut SchedulerData,
        _ctx: &SchedCtx,
    ) -> (bool, Option<Time>) {
        (true, self.override_time_slice)
    }
}
