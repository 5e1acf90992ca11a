/*
 * Scheduler Data
 *
 * Mutable scheduler state needs to be updated atomically, so it is kept in
 * one structure living inside an RCU cell: the three chain queues, the index
 * of the last decision, and whatever extra state the active policy and addon
 * mix in.
 *
 * Queue discipline after update_ready_chains(t):
 * - every chain in `waiting` has a bottom thread with ready_time > t
 * - every chain in `finished` has a finished bottom thread
 * - every chain in `ready` is neither
 */

use crate::cpu::context::Chain;
use crate::scheduler::addons::penalizer::PenalizerData;
use crate::scheduler::addons::time_slice_maxer::MaxerData;
use crate::scheduler::policies::cfs::CfsData;
use crate::scheduler::policies::mlfq::MlfqData;
use crate::scheduler::traits::SchedCtx;
use crate::time::Time;

/// Policy-specific extension of the scheduler data.
#[derive(Debug, Clone)]
pub enum PolicyData {
    /// Plain queue policies (Single, FCFS, SJF, PSJF) need nothing extra.
    Queue,
    Mlfq(MlfqData),
    Cfs(CfsData),
}

impl PolicyData {
    pub fn mlfq(&self) -> &MlfqData {
        match self {
            PolicyData::Mlfq(m) => m,
            _ => panic!("scheduler data carries no MLFQ state"),
        }
    }

    pub fn mlfq_mut(&mut self) -> &mut MlfqData {
        match self {
            PolicyData::Mlfq(m) => m,
            _ => panic!("scheduler data carries no MLFQ state"),
        }
    }

    pub fn cfs(&self) -> &CfsData {
        match self {
            PolicyData::Cfs(c) => c,
            _ => panic!("scheduler data carries no CFS state"),
        }
    }

    pub fn cfs_mut(&mut self) -> &mut CfsData {
        match self {
            PolicyData::Cfs(c) => c,
            _ => panic!("scheduler data carries no CFS state"),
        }
    }
}

/// Addon-specific extensions, mixed in by the addon's transmute hook.
#[derive(Debug, Clone, Default)]
pub struct AddonData {
    pub maxer: Option<MaxerData>,
    pub penalizer: Option<PenalizerData>,
}

/// Mutable data of one scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerData {
    /// Runnable chains; for MLFQ this is the active level's queue.
    pub ready: Vec<Chain>,
    /// Chains whose bottom thread is not yet due. For MLFQ this is a staging
    /// list flushed into the per-level waiting queues each round.
    pub waiting: Vec<Chain>,
    /// Chains whose bottom thread completed its workload.
    pub finished: Vec<Chain>,
    /// Index into `ready` of the most recent decision, if any.
    pub last_idx: Option<usize>,
    pub policy: PolicyData,
    pub addon: AddonData,
}

impl SchedulerData {
    pub fn new(policy: PolicyData) -> SchedulerData {
        SchedulerData {
            ready: Vec::new(),
            waiting: Vec::new(),
            finished: Vec::new(),
            last_idx: None,
            policy,
            addon: AddonData::default(),
        }
    }
}

/// Where the previously scheduled chain ended up after the round started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastChainLoc {
    /// No previous decision.
    None,
    /// Still ready, at this index.
    Ready(usize),
    /// Still ready, rotated to the tail of the active queue.
    ReadyTail,
    /// Still ready, at the tail of an inactive MLFQ level queue.
    ReadyLevelTail(usize),
    /// Went waiting, at the tail of the waiting list.
    WaitingTail,
    /// Went waiting, at the tail of an MLFQ level waiting queue.
    WaitingLevelTail(usize),
    /// Finished, at the tail of the finished list.
    FinishedTail,
}

/// Resolve the previously scheduled chain.
///
/// CFS re-sorts its queues after accounting, so for it the recorded indices
/// in [`CfsData`] override the location tag.
pub fn last_chain<'a>(data: &'a SchedulerData, loc: &LastChainLoc) -> Option<&'a Chain> {
    match loc {
        LastChainLoc::None => None,
        LastChainLoc::Ready(idx) => {
            if let PolicyData::Cfs(c) = &data.policy
                && let Some(ready_idx) = c.ready_idx
            {
                return data.ready.get(ready_idx);
            }
            data.ready.get(*idx)
        }
        LastChainLoc::ReadyTail => data.ready.last(),
        LastChainLoc::ReadyLevelTail(level) => data.policy.mlfq().ready_queues[*level].last(),
        LastChainLoc::WaitingTail => {
            if let PolicyData::Cfs(c) = &data.policy
                && let Some(waiting_idx) = c.waiting_idx
            {
                return data.waiting.get(waiting_idx);
            }
            data.waiting.last()
        }
        LastChainLoc::WaitingLevelTail(level) => data.policy.mlfq().waiting_queues[*level].last(),
        LastChainLoc::FinishedTail => data.finished.last(),
    }
}

/// Move every due chain of `waiting` to `ready`, preserving arrival order.
pub fn promote_due(t: Time, ready: &mut Vec<Chain>, waiting: &mut Vec<Chain>, ctx: &SchedCtx) {
    let mut i = 0;
    while i < waiting.len() {
        let bottom = waiting[i].bottom();
        let due = ctx
            .threads
            .effective_ready_time(bottom)
            .is_some_and(|ready_time| ready_time <= t);
        if due {
            let chain = waiting.remove(i);
            ready.push(chain);
        } else {
            i += 1;
        }
    }
}

/// Default update_ready_chains: promote due waiters, then check the queue
/// discipline.
pub fn base_update_ready_chains(t: Time, data: &mut SchedulerData, ctx: &SchedCtx) {
    let SchedulerData { ready, waiting, .. } = &mut *data;
    promote_due(t, ready, waiting, ctx);
    check_queues(t, data, ctx);
}

/// Queue-discipline sanity check.
pub fn check_queues(t: Time, data: &SchedulerData, ctx: &SchedCtx) {
    debug_assert!(data.ready.iter().all(|c| {
        !ctx.threads.is_finished(c.bottom())
            && ctx
                .threads
                .effective_ready_time(c.bottom())
                .is_some_and(|ready_time| ready_time <= t)
    }));
    debug_assert!(
        data.finished
            .iter()
            .all(|c| ctx.threads.is_finished(c.bottom()))
    );
}
