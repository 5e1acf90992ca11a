/*
 * Completely Fair Scheduler Policy
 *
 * Weighted fair queueing in the style of Linux's CFS. Every chain carries a
 * vruntime: its accumulated run time scaled by default_shares / shares, so
 * heavier chains age slower. Ready and waiting lists are kept sorted by
 * vruntime ascending and the head of the ready list always runs next.
 *
 * min_vruntime tracks the smallest vruntimes of the ready set; newly ready
 * chains enter at min_vruntime (neither penalty nor bonus), and a chain
 * returning from a wait is re-inserted relative to it so long sleepers do
 * not accumulate unbounded credit.
 *
 * CFS computes real time slices and therefore needs a local timer; outside
 * the kernel under the kernel-only timer policy it must be wrapped in a
 * time-slice overriding addon.
 */

use std::collections::HashMap;

use crate::cpu::context::Chain;
use crate::error::{SimError, SimResult};
use crate::scheduler::data::{
    LastChainLoc, PolicyData, SchedulerData, base_update_ready_chains,
};
use crate::scheduler::traits::{AddParams, Policy, SchedCtx};
use crate::threads::ThreadKey;
use crate::time::Time;

/// Mutable CFS state, kept in the scheduler data.
#[derive(Debug, Clone, Default)]
pub struct CfsData {
    /// Share-weighted accumulated run time; `None` until first ready.
    pub vruntimes: HashMap<ThreadKey, Option<Time>>,
    pub min_vruntime: Option<Time>,
    pub shares: HashMap<ThreadKey, u64>,
    /// Index of the previously scheduled chain after re-sorting, when it is
    /// still ready.
    pub ready_idx: Option<usize>,
    /// Index of the previously scheduled chain after re-sorting, when it
    /// went waiting.
    pub waiting_idx: Option<usize>,
}

pub struct Cfs {
    default_shares: u64,
    min_period: Time,
    min_slice: Time,
}

impl Cfs {
    /// Create a CFS policy.
    ///
    /// `default_shares` also scales vruntimes; with 0, every added thread
    /// must specify its own shares. `min_period` corresponds to Linux's
    /// sched_min_latency, `min_slice` to sched_min_granularity.
    ///
    /// # Panics
    /// Panics unless `min_period > 0` and `min_slice >= 0`.
    pub fn new(default_shares: u64, min_period: Time, min_slice: Time) -> Cfs {
        assert!(min_period.is_positive(), "min_period must be positive");
        assert!(!min_slice.is_negative(), "min_slice must not be negative");
        Cfs {
            default_shares,
            min_period,
            min_slice,
        }
    }

    /// Scaling factor for a thread's vruntime.
    fn vruntime_fact(&self, shares: u64) -> Time {
        Time::from_integer(self.default_shares as i64) / Time::from_integer(shares as i64)
    }

    /// Slice for the chain at the head of the ready list.
    fn slice_for(&self, thread: ThreadKey, ready: &[Chain], cfs: &CfsData) -> Time {
        let period = (Time::from_integer(ready.len() as i64) * self.min_slice).max(self.min_period);
        let total: u64 = ready.iter().map(|c| cfs.shares[&c.bottom()]).sum();
        let ratio = Time::from_integer(cfs.shares[&thread] as i64) / Time::from_integer(total as i64);
        period * ratio
    }

    /// Smallest vruntimes of the ready set (the two head chains suffice,
    /// the list is sorted).
    fn calc_min_vruntime(ready: &[Chain], vruntimes: &HashMap<ThreadKey, Option<Time>>) -> Option<Time> {
        let first = vruntimes[&ready.first()?.bottom()];
        match ready.get(1) {
            Some(second) => first.min(vruntimes[&second.bottom()]),
            None => first,
        }
    }

    /// Re-insert the previously scheduled chain into the waiting list,
    /// discounted by min_vruntime.
    fn update_waiting(
        waiting: &mut Vec<Chain>,
        vruntimes: &mut HashMap<ThreadKey, Option<Time>>,
        min_vruntime: Option<Time>,
    ) -> usize {
        let chain = waiting.pop().expect("previous chain went waiting");
        let bottom = chain.bottom();
        let min_vruntime = min_vruntime.expect("waiting chain ran without min_vruntime");
        let vruntime = vruntimes[&bottom].expect("waiting chain ran without vruntime") - min_vruntime;
        vruntimes.insert(bottom, Some(vruntime));

        // unscheduled threads (vruntime None) sort as infinity
        let idx = waiting.partition_point(|c| {
            vruntimes[&c.bottom()].is_some_and(|v| v <= vruntime)
        });
        waiting.insert(idx, chain);
        idx
    }

    /// Re-insert the previously scheduled chain into the ready list by
    /// vruntime, never back at the head (it cannot immediately rerun when
    /// a tie exists).
    fn update_ready(ready: &mut Vec<Chain>, vruntimes: &HashMap<ThreadKey, Option<Time>>) -> usize {
        let chain = ready.remove(0);
        let vruntime = vruntimes[&chain.bottom()].expect("ready chain without vruntime");
        let mut idx = ready.partition_point(|c| {
            vruntimes[&c.bottom()].expect("ready chain without vruntime") <= vruntime
        });
        if idx == 0 {
            // force a reschedule
            idx = 1;
        }
        let idx = idx.min(ready.len());
        ready.insert(idx, chain);
        idx
    }
}

impl Policy for Cfs {
    fn name(&self) -> &'static str {
        "CFS"
    }

    fn init_data(&self) -> PolicyData {
        PolicyData::Cfs(CfsData::default())
    }

    fn uses_time_slices(&self, _default_time_slice: Option<Time>) -> bool {
        true
    }

    fn add_chain(
        &self,
        data: &mut SchedulerData,
        chain: Chain,
        params: &AddParams,
        module: &str,
        ctx: &SchedCtx,
    ) -> SimResult<()> {
        let bottom = chain.bottom();
        let shares = params.shares.unwrap_or(self.default_shares);
        if shares == 0 {
            return Err(SimError::NonPositiveShares {
                module: module.into(),
                tid: ctx.threads.tid(bottom).into(),
            });
        }

        let cfs = data.policy.cfs_mut();
        assert!(!cfs.vruntimes.contains_key(&bottom), "thread added twice");
        cfs.vruntimes.insert(bottom, None);
        cfs.shares.insert(bottom, shares);

        if ctx.threads.is_finished(bottom) {
            data.finished.push(chain);
        } else {
            data.waiting.push(chain);
        }
        Ok(())
    }

    fn update_ready_chains(&self, t: Time, data: &mut SchedulerData, ctx: &SchedCtx) {
        let new_start = data.ready.len();
        base_update_ready_chains(t, data, ctx);

        let SchedulerData {
            ready,
            policy,
            last_idx,
            ..
        } = &mut *data;
        let cfs = policy.cfs_mut();

        let new_chains = ready.split_off(new_start);

        if cfs.min_vruntime.is_none() {
            cfs.min_vruntime = Some(t);
        }
        if new_chains.is_empty() {
            return;
        }
        let min_vruntime = cfs.min_vruntime.expect("just initialized");

        // newly ready chains enter at min_vruntime
        for chain in &new_chains {
            let vruntime = cfs
                .vruntimes
                .get_mut(&chain.bottom())
                .expect("chain was never added");
            *vruntime = Some(vruntime.unwrap_or(Time::zero()) + min_vruntime);
        }

        let mut idx = ready
            .iter()
            .position(|c| {
                cfs.vruntimes[&c.bottom()].is_some_and(|v| v > min_vruntime)
            })
            .unwrap_or(0);
        if idx == 0 && *last_idx == Some(0) {
            // the head chain is executing, insert past it
            idx = 1;
        }
        let idx = idx.min(ready.len());

        for (offset, chain) in new_chains.into_iter().enumerate() {
            ready.insert(idx + offset, chain);
        }
    }

    fn post_start(
        &self,
        _t: Time,
        prev_run_time: Option<Time>,
        data: &mut SchedulerData,
        last: LastChainLoc,
        ctx: &SchedCtx,
    ) -> LastChainLoc {
        let _ = ctx;
        let SchedulerData {
            ready,
            waiting,
            finished,
            policy,
            ..
        } = &mut *data;
        let cfs = policy.cfs_mut();

        let last_bottom = match last {
            LastChainLoc::Ready(idx) => Some(ready[idx].bottom()),
            LastChainLoc::WaitingTail => Some(waiting.last().expect("waiting chain").bottom()),
            LastChainLoc::FinishedTail => Some(finished.last().expect("finished chain").bottom()),
            _ => None,
        };

        let mut update_min_vruntime = false;
        if let Some(bottom) = last_bottom {
            let prev_run = prev_run_time.expect("chain ran without recorded run time");
            let weighted = prev_run * self.vruntime_fact(cfs.shares[&bottom]);
            let vruntime = cfs.vruntimes[&bottom].expect("ran with unset vruntime") + weighted;
            cfs.vruntimes.insert(bottom, Some(vruntime));
            update_min_vruntime = cfs.min_vruntime.is_some_and(|min| min < vruntime);
        }

        cfs.waiting_idx = if matches!(last, LastChainLoc::WaitingTail) {
            Some(Self::update_waiting(waiting, &mut cfs.vruntimes, cfs.min_vruntime))
        } else {
            None
        };

        if update_min_vruntime {
            cfs.min_vruntime = Self::calc_min_vruntime(ready, &cfs.vruntimes);
        }

        cfs.ready_idx = if let LastChainLoc::Ready(idx) = last {
            debug_assert_eq!(idx, 0);
            Some(Self::update_ready(ready, &cfs.vruntimes))
        } else {
            None
        };

        debug_assert!(cfs.ready_idx.is_none() || cfs.waiting_idx.is_none());
        last
    }

    fn sched_loop(
        &self,
        _t: Time,
        data: &mut SchedulerData,
        last: &LastChainLoc,
        _default_time_slice: Option<Time>,
        _module: &str,
        _ctx: &SchedCtx,
    ) -> SimResult<(Option<usize>, Option<Time>)> {
        let SchedulerData { ready, policy, .. } = &mut *data;
        let cfs = policy.cfs();

        if let LastChainLoc::Ready(idx) = last {
            debug_assert_eq!(*idx, 0);
            if ready.len() == 1 {
                let thread = ready[0].bottom();
                let slice = self.slice_for(thread, ready, cfs).max(self.min_slice);
                return Ok((Some(0), Some(slice)));
            }
        }

        if ready.is_empty() {
            return Ok((None, None));
        }

        let thread = ready[0].bottom();
        let mut slice = self.slice_for(thread, ready, cfs);

        // don't let vruntimes drift apart by more than the slice
        if let Some(next) = ready.get(1) {
            let fact = self.vruntime_fact(cfs.shares[&thread]);
            let vdelta = slice * fact;
            let future = cfs.vruntimes[&thread].expect("ready chain without vruntime") + vdelta;
            let future_delta =
                future - cfs.vruntimes[&next.bottom()].expect("ready chain without vruntime");
            if future_delta > slice {
                slice = slice - (vdelta - slice) / fact;
            }
        }

        Ok((Some(0), Some(slice.max(self.min_slice))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleTable;
    use crate::threads::{ThreadSpec, ThreadTable};

    fn setup(share_list: &[u64]) -> (Cfs, SchedulerData, ThreadTable, Vec<ThreadKey>) {
        let mut modules = ModuleTable::new();
        let kernel = modules.add_module("0", None).unwrap();
        let mut threads = ThreadTable::new();
        let cfs = Cfs::new(400, Time::from_integer(30), Time::from_integer(6));
        let mut data = SchedulerData::new(cfs.init_data());

        let mut keys = Vec::new();
        for &shares in share_list {
            let key = threads.add_worker(&mut modules, kernel, ThreadSpec::default());
            let ctx = SchedCtx { threads: &threads };
            cfs.add_chain(
                &mut data,
                Chain::from_thread(key, &threads),
                &AddParams {
                    shares: Some(shares),
                },
                "0",
                &ctx,
            )
            .unwrap();
            keys.push(key);
        }
        (cfs, data, threads, keys)
    }

    #[test]
    fn test_slice_split_by_shares() {
        let (cfs, mut data, threads, keys) = setup(&[1000, 250]);
        let ctx = SchedCtx { threads: &threads };
        cfs.update_ready_chains(Time::zero(), &mut data, &ctx);
        assert_eq!(data.ready.len(), 2);

        // period = max(2 * 6, 30) = 30; 1000 shares get 24, 250 get 6
        let heavy = data
            .ready
            .iter()
            .position(|c| c.bottom() == keys[0])
            .unwrap();
        assert_eq!(
            cfs.slice_for(keys[0], &data.ready, data.policy.cfs()),
            Time::from_integer(24)
        );
        assert_eq!(
            cfs.slice_for(keys[1], &data.ready, data.policy.cfs()),
            Time::from_integer(6)
        );
        let _ = heavy;
    }

    #[test]
    fn test_new_chains_enter_at_min_vruntime() {
        let (cfs, mut data, threads, keys) = setup(&[100, 100]);
        let ctx = SchedCtx { threads: &threads };
        cfs.update_ready_chains(Time::from_integer(5), &mut data, &ctx);

        let cfs_data = data.policy.cfs();
        assert_eq!(cfs_data.min_vruntime, Some(Time::from_integer(5)));
        for key in &keys {
            assert_eq!(cfs_data.vruntimes[key], Some(Time::from_integer(5)));
        }
    }

    #[test]
    fn test_zero_shares_rejected() {
        let cfs = Cfs::new(0, Time::from_integer(30), Time::from_integer(6));
        let mut modules = ModuleTable::new();
        let kernel = modules.add_module("0", None).unwrap();
        let mut threads = ThreadTable::new();
        let key = threads.add_worker(&mut modules, kernel, ThreadSpec::default());
        let mut data = SchedulerData::new(cfs.init_data());
        let ctx = SchedCtx { threads: &threads };

        let result = cfs.add_chain(
            &mut data,
            Chain::from_thread(key, &threads),
            &AddParams::default(),
            "0",
            &ctx,
        );
        assert!(matches!(result, Err(SimError::NonPositiveShares { .. })));
    }

    #[test]
    fn test_update_ready_forces_resched() {
        let (cfs, mut data, threads, keys) = setup(&[100, 100, 100]);
        let ctx = SchedCtx { threads: &threads };
        cfs.update_ready_chains(Time::zero(), &mut data, &ctx);

        // head ran for 12 units; with equal shares it must be re-inserted
        // behind at least one other chain
        data.last_idx = Some(0);
        let head = data.ready[0].bottom();
        let loc = cfs.post_start(
            Time::from_integer(12),
            Some(Time::from_integer(12)),
            &mut data,
            LastChainLoc::Ready(0),
            &ctx,
        );
        assert_eq!(loc, LastChainLoc::Ready(0));
        assert!(data.policy.cfs().ready_idx.unwrap() >= 1);
        assert_ne!(data.ready[0].bottom(), head);
        let _ = keys;
    }
}
