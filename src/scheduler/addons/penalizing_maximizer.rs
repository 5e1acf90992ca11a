/*
 * Penalizing Maximizer Addon
 *
 * Combination of the time-slice maximizer and the penalizer: decisions are
 * repeated until their slice is used up, and chains that overran their
 * allotment sit out. The maximizer wraps the penalizer, so a repeat masks
 * the decision index from the penalizer (it already admitted it) while the
 * penalizer can still veto fresh decisions.
 */

use crate::scheduler::addons::penalizer::{PenalizerData, penalizer_schedule, penalizer_start};
use crate::scheduler::addons::time_slice_maxer::{MaxerData, maxer_repeat};
use crate::scheduler::data::{LastChainLoc, SchedulerData};
use crate::scheduler::traits::{Addon, SchedCtx};
use crate::threads::ThreadKey;
use crate::time::Time;

pub struct PenalizingMaximizer {
    override_time_slice: Option<Time>,
    maximizer_threshold: Time,
    penalizer_tolerance: Time,
}

impl PenalizingMaximizer {
    /// # Panics
    /// Panics if `maximizer_threshold` is negative or `penalizer_tolerance`
    /// is positive.
    pub fn new(
        override_time_slice: Option<Time>,
        maximizer_threshold: Time,
        penalizer_tolerance: Time,
    ) -> PenalizingMaximizer {
        assert!(
            !maximizer_threshold.is_negative(),
            "threshold must be >= 0"
        );
        assert!(
            !penalizer_tolerance.is_positive(),
            "tolerance must be <= 0"
        );
        PenalizingMaximizer {
            override_time_slice,
            maximizer_threshold,
            penalizer_tolerance,
        }
    }
}

impl Addon for PenalizingMaximizer {
    fn name(&self) -> &'static str {
        "PenalizingMaximizer"
    }

    fn overrides_time_slice(&self) -> bool {
        true
    }

    fn transmute_data(&self, data: &mut SchedulerData) {
        data.addon.maxer = Some(MaxerData::default());
        data.addon.penalizer = Some(PenalizerData::default());
    }

    fn add_thread(&self, data: &mut SchedulerData, thread: ThreadKey, ctx: &SchedCtx) {
        if !ctx.threads.is_finished(thread) {
            let penalizer = data.addon.penalizer.as_mut().expect("penalizer data missing");
            let known = penalizer.niceness.insert(thread, Time::zero());
            assert!(known.is_none(), "thread added twice");
        }
    }

    fn repeat(
        &self,
        data: &mut SchedulerData,
        prev_run_time: Option<Time>,
        done: bool,
    ) -> Option<Option<Time>> {
        maxer_repeat(self.maximizer_threshold, data, prev_run_time, done)
    }

    fn start_schedule(
        &self,
        prev_run_time: Option<Time>,
        data: &mut SchedulerData,
        last: &LastChainLoc,
        ctx: &SchedCtx,
    ) {
        penalizer_start(prev_run_time, data, last, ctx);
    }

    fn schedule(
        &self,
        idx: Option<usize>,
        time_slice: Option<Time>,
        data: &mut SchedulerData,
        ctx: &SchedCtx,
    ) -> (bool, Option<Time>) {
        // a repeated decision was already admitted; mask it from the
        // penalizer
        let repeating = idx.is_some_and(|idx| {
            data.addon
                .maxer
                .as_ref()
                .expect("maxer data missing")
                .repeat_time_slices
                .contains_key(&idx)
        });
        let inner_idx = if repeating { None } else { idx };

        let (proceed, slice) = penalizer_schedule(
            self.penalizer_tolerance,
            self.override_time_slice,
            inner_idx,
            time_slice,
            data,
            ctx,
        );

        let maxer = data.addon.maxer.as_mut().expect("maxer data missing");
        match idx {
            Some(idx) if proceed => {
                if !repeating {
                    debug_assert!(maxer.repeat_time_slices.is_empty());
                }
                maxer.repeat_time_slices.insert(idx, time_slice);
                maxer.blocked = false;
            }
            _ => {
                debug_assert!(maxer.repeat_time_slices.is_empty());
                maxer.blocked = true;
            }
        }

        (proceed, slice)
    }
}
