/*
 * Scheduler Trait Definitions
 *
 * This module separates scheduling policy from mechanism:
 *
 * - Policy: the ordering discipline over ready chains (FCFS, SJF, MLFQ, CFS)
 * - Addon: a composable overlay that re-issues or blocks decisions to shape
 *   time-slice behavior without a local timer
 *
 * The Scheduler (mechanism) drives the request protocol and calls these
 * hooks at fixed points of every scheduling round. Policies and addons keep
 * all mutable state inside the SchedulerData snapshot they are handed, so
 * decisions stay replayable under the RCU retry contract.
 */

use crate::cpu::context::Chain;
use crate::error::SimResult;
use crate::scheduler::data::{
    LastChainLoc, PolicyData, SchedulerData, base_update_ready_chains,
};
use crate::threads::{ThreadKey, ThreadTable};
use crate::time::Time;

/// Read access to the rest of the simulation for scheduling hooks.
///
/// Policies never touch thread slots directly; they query state through the
/// table, which resolves VCPU mirroring.
pub struct SchedCtx<'a> {
    pub threads: &'a ThreadTable,
}

/// Per-thread parameters for [`Scheduler::add_thread`].
///
/// [`Scheduler::add_thread`]: crate::scheduler::Scheduler::add_thread
#[derive(Debug, Clone, Copy, Default)]
pub struct AddParams {
    /// CFS weight; falls back to the scheduler's default shares.
    pub shares: Option<u64>,
}

/// A scheduling policy.
///
/// The hooks correspond to the phases of a scheduling round:
/// `update_ready_chains` (waiter promotion), `post_start` (reordering and
/// accounting after the previous decision was reclassified), `sched_loop`
/// (the decision itself).
pub trait Policy: Send {
    /// Policy name for logs.
    fn name(&self) -> &'static str;

    /// Initial policy extension of the scheduler data.
    fn init_data(&self) -> PolicyData {
        PolicyData::Queue
    }

    /// Reject unusable configurations before the world starts.
    fn validate(&self, _time_slice: Option<Time>) -> SimResult<()> {
        Ok(())
    }

    /// Whether this policy arms sub-kernel timers (and therefore needs the
    /// local-timer CPU policy unless an addon overrides its slices).
    fn uses_time_slices(&self, default_time_slice: Option<Time>) -> bool;

    /// Move threads becoming ready to the ready chains.
    fn update_ready_chains(&self, t: Time, data: &mut SchedulerData, ctx: &SchedCtx) {
        base_update_ready_chains(t, data, ctx);
    }

    /// Policy work after the previous decision was reclassified: queue
    /// rotation, priority boosting, vruntime accounting. Returns the
    /// possibly-updated location of the previous chain.
    fn post_start(
        &self,
        _t: Time,
        _prev_run_time: Option<Time>,
        _data: &mut SchedulerData,
        last: LastChainLoc,
        _ctx: &SchedCtx,
    ) -> LastChainLoc {
        last
    }

    /// Select the next chain: an index into the ready list (or `None` to
    /// idle) and a time slice.
    fn sched_loop(
        &self,
        t: Time,
        data: &mut SchedulerData,
        last: &LastChainLoc,
        default_time_slice: Option<Time>,
        module: &str,
        ctx: &SchedCtx,
    ) -> SimResult<(Option<usize>, Option<Time>)>;

    /// Ready time of the next thread to wake, for the idle wake-up timer.
    fn next_waiting_ready_time(&self, data: &SchedulerData, ctx: &SchedCtx) -> Option<Time> {
        data.waiting
            .iter()
            .filter_map(|c| ctx.threads.effective_ready_time(c.bottom()))
            .min()
    }

    /// Enqueue a new thread's chain.
    fn add_chain(
        &self,
        data: &mut SchedulerData,
        chain: Chain,
        _params: &AddParams,
        _module: &str,
        ctx: &SchedCtx,
    ) -> SimResult<()> {
        if ctx.threads.is_finished(chain.bottom()) {
            data.finished.push(chain);
        } else {
            data.waiting.push(chain);
        }
        Ok(())
    }

    /// Bottom threads of every chain this scheduler knows about.
    fn thread_keys(&self, data: &SchedulerData) -> Vec<ThreadKey> {
        data.finished
            .iter()
            .chain(data.waiting.iter())
            .chain(data.ready.iter())
            .map(Chain::bottom)
            .collect()
    }
}

/// A scheduler addon.
///
/// The scheduler calls these hooks around its own: `repeat` may short-cut a
/// round by re-issuing the previous decision, `schedule` may veto a decision
/// (forcing another round) and overrides the time slice the CPU sees.
pub trait Addon: Send {
    /// Addon name for logs.
    fn name(&self) -> &'static str;

    /// Whether the addon replaces policy time-slices, permitting slicing
    /// policies under the kernel-only timer CPU policy.
    fn overrides_time_slice(&self) -> bool {
        false
    }

    /// Mix the addon's state into the scheduler data.
    fn transmute_data(&self, _data: &mut SchedulerData) {}

    /// Called when a thread is added.
    fn add_thread(&self, _data: &mut SchedulerData, _thread: ThreadKey, _ctx: &SchedCtx) {}

    /// Decide whether to repeat the previous decision instead of scheduling.
    ///
    /// `done` reports that the previous chain finished or is no longer
    /// ready. Returns `Some(time_slice)` to repeat.
    fn repeat(
        &self,
        _data: &mut SchedulerData,
        _prev_run_time: Option<Time>,
        _done: bool,
    ) -> Option<Option<Time>> {
        None
    }

    /// Called after the round start, before the decision.
    fn start_schedule(
        &self,
        _prev_run_time: Option<Time>,
        _data: &mut SchedulerData,
        _last: &LastChainLoc,
        _ctx: &SchedCtx,
    ) {
    }

    /// Filter a decision: `(proceed, time_slice)`. Returning `proceed =
    /// false` discards the decision and forces another round.
    fn schedule(
        &self,
        _idx: Option<usize>,
        time_slice: Option<Time>,
        _data: &mut SchedulerData,
        _ctx: &SchedCtx,
    ) -> (bool, Option<Time>) {
        (true, time_slice)
    }
}
