/*
 * Multi-Level Feedback Queue Policy
 *
 * L ready queues (low index = high priority) and L waiting queues. The
 * scheduler data's ready list always holds the active level's queue; the
 * inactive levels live in MlfqData with an empty placeholder at the active
 * slot. The waiting list is a one-element staging area, flushed into the
 * per-level waiting queues every round.
 *
 * Heuristics per round:
 * - priority boost: when the boost budget elapses, all queues flatten into
 *   level 0, rotated so the previous level's chains land first; the budget
 *   restarts carrying over any overshoot
 * - round robin: a still-ready previous chain rotates to the tail of its
 *   queue
 * - demotion: a chain that consumed its full level slice moves one level
 *   down (a no-op on the lowest level)
 */

use core::mem;

use crate::cpu::context::Chain;
use crate::error::SimResult;
use crate::scheduler::data::{
    LastChainLoc, PolicyData, SchedulerData, check_queues, promote_due,
};
use crate::scheduler::traits::{AddParams, Policy, SchedCtx};
use crate::threads::ThreadKey;
use crate::time::Time;

/// Mutable MLFQ state, kept in the scheduler data.
#[derive(Debug, Clone)]
pub struct MlfqData {
    /// Inactive ready queues; the active level's slot is an empty
    /// placeholder while its queue lives in `SchedulerData::ready`.
    pub ready_queues: Vec<Vec<Chain>>,
    pub waiting_queues: Vec<Vec<Chain>>,
    pub active_level: usize,
    /// Remaining boost budget.
    pub prio_boost_left: Option<Time>,
    pub last_prio_boost: Option<Time>,
    /// Expected completion time of the last decision's slice; demotion
    /// requires the slice to have been consumed exactly up to it.
    pub last_finish_time: Option<Time>,
}

/// Where the previous chain sits while the queues are being reshuffled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrevSlot {
    None,
    /// (level, index) in the ready queues.
    Ready(usize, usize),
    /// In the staging waiting list.
    Staging,
    /// (level) at the tail of a waiting queue.
    Waiting(usize),
    Finished,
}

pub struct Mlfq {
    level_time_slices: Vec<Option<Time>>,
    priority_boost_time: Option<Time>,
}

impl Mlfq {
    /// Create an MLFQ policy with one queue per entry of
    /// `level_time_slices`.
    ///
    /// # Panics
    /// Panics on an empty level list, a negative boost interval, or a boost
    /// interval combined with a single level (where boosting cannot have an
    /// effect).
    pub fn new(level_time_slices: Vec<Option<Time>>, priority_boost_time: Option<Time>) -> Mlfq {
        assert!(!level_time_slices.is_empty(), "MLFQ needs at least one level");
        if let Some(boost) = priority_boost_time {
            assert!(
                level_time_slices.len() != 1,
                "priority boost has no effect with a single queue"
            );
            assert!(!boost.is_negative(), "negative priority boost interval");
        }
        Mlfq {
            level_time_slices,
            priority_boost_time,
        }
    }

    /// The conventional eight levels, all sharing one time slice.
    pub fn with_default_levels(
        time_slice: Option<Time>,
        priority_boost_time: Option<Time>,
    ) -> Mlfq {
        Mlfq::new(vec![time_slice; 8], priority_boost_time)
    }

    pub fn levels(&self) -> usize {
        self.level_time_slices.len()
    }

    /// Flatten all queues into level 0 if the boost budget elapsed.
    ///
    /// Returns whether a boost happened.
    fn priority_boost(&self, m: &mut MlfqData, prev_level: usize, t: Time) -> bool {
        let Some(configured) = self.priority_boost_time else {
            return false;
        };

        let last = *m.last_prio_boost.get_or_insert(t);
        let delta = t - last;
        let left = m.prio_boost_left.expect("boost budget unset");

        let boosted = left <= delta;
        if boosted {
            for queues in [&mut m.ready_queues, &mut m.waiting_queues] {
                let levels = queues.len();
                let mut flat = Vec::new();
                // the order only really matters for the ready queues
                for level in (prev_level..levels).chain(0..prev_level) {
                    flat.append(&mut queues[level]);
                }
                queues[0] = flat;
            }
            // restart the budget, carrying over the overshoot
            m.prio_boost_left = Some(configured - (delta - left));
            log::debug!("[MLFQ] priority boost at {t}");
        } else {
            m.prio_boost_left = Some(left - delta);
        }
        m.last_prio_boost = Some(t);

        boosted
    }
}

impl Policy for Mlfq {
    fn name(&self) -> &'static str {
        "MLFQ"
    }

    fn init_data(&self) -> PolicyData {
        let levels = self.levels();
        PolicyData::Mlfq(MlfqData {
            ready_queues: vec![Vec::new(); levels],
            waiting_queues: vec![Vec::new(); levels],
            active_level: 0,
            prio_boost_left: self.priority_boost_time,
            last_prio_boost: None,
            last_finish_time: None,
        })
    }

    fn uses_time_slices(&self, _default_time_slice: Option<Time>) -> bool {
        self.level_time_slices.iter().any(Option::is_some)
    }

    fn add_chain(
        &self,
        data: &mut SchedulerData,
        chain: Chain,
        _params: &AddParams,
        _module: &str,
        ctx: &SchedCtx,
    ) -> SimResult<()> {
        // new threads enter at the highest priority
        if ctx.threads.is_finished(chain.bottom()) {
            data.finished.push(chain);
        } else {
            data.policy.mlfq_mut().waiting_queues[0].push(chain);
        }
        Ok(())
    }

    fn update_ready_chains(&self, t: Time, data: &mut SchedulerData, ctx: &SchedCtx) {
        let SchedulerData { ready, policy, .. } = &mut *data;
        let m = policy.mlfq_mut();
        for level in 0..m.ready_queues.len() {
            if level == m.active_level {
                promote_due(t, ready, &mut m.waiting_queues[level], ctx);
            } else {
                promote_due(
                    t,
                    &mut m.ready_queues[level],
                    &mut m.waiting_queues[level],
                    ctx,
                );
            }
        }
        check_queues(t, data, ctx);
    }

    fn post_start(
        &self,
        t: Time,
        prev_run_time: Option<Time>,
        data: &mut SchedulerData,
        last: LastChainLoc,
        ctx: &SchedCtx,
    ) -> LastChainLoc {
        let SchedulerData {
            ready,
            waiting,
            policy,
            ..
        } = &mut *data;
        let m = policy.mlfq_mut();

        // park the active queue so every level is addressable uniformly
        let prev_level = m.active_level;
        mem::swap(&mut m.ready_queues[prev_level], ready);
        debug_assert!(ready.is_empty());

        let mut prev = match last {
            LastChainLoc::Ready(idx) => PrevSlot::Ready(prev_level, idx),
            LastChainLoc::WaitingTail => PrevSlot::Staging,
            LastChainLoc::FinishedTail => PrevSlot::Finished,
            LastChainLoc::None => PrevSlot::None,
            other => panic!("unexpected previous-chain location {other:?}"),
        };
        let prev_has_run = prev_run_time.is_some_and(|p| p.is_positive());

        if prev_has_run
            && self.priority_boost(m, prev_level, t)
            && let PrevSlot::Ready(_, idx) = prev
        {
            // the flatten rotation put prev_level's chains first, so the
            // index within the queue is preserved
            prev = PrevSlot::Ready(0, idx);
        }

        // round robin within the level
        if let PrevSlot::Ready(level, idx) = prev {
            let queue = &mut m.ready_queues[level];
            let chain = queue.remove(idx);
            queue.push(chain);
            prev = PrevSlot::Ready(level, queue.len() - 1);
        }

        // switch to the highest-priority non-empty queue
        let mut active = m
            .ready_queues
            .iter()
            .position(|q| !q.is_empty())
            .unwrap_or(0);

        // demotion
        let prev_finished = matches!(prev, PrevSlot::Finished);
        if prev_has_run && !prev_finished && prev != PrevSlot::None {
            let prev_run = prev_run_time.expect("checked by prev_has_run");
            let allowed = self.level_time_slices[prev_level].unwrap_or(prev_run);
            let next_level = prev_level + 1;

            let consumed_slice = match m.last_finish_time {
                None => false,
                Some(last_finish) => {
                    if prev_run > allowed {
                        true
                    } else if prev_run == allowed {
                        // only demote when the slice was actually consumed,
                        // not just a prefix of it
                        let bottom = match prev {
                            PrevSlot::Ready(level, idx) => m.ready_queues[level][idx].bottom(),
                            PrevSlot::Staging => waiting.last().expect("staged chain").bottom(),
                            _ => unreachable!(),
                        };
                        ctx.threads.effective_ready_time(bottom) == Some(last_finish)
                    } else {
                        false
                    }
                }
            };

            if consumed_slice && next_level < self.levels() {
                match prev {
                    PrevSlot::Ready(level, _) => {
                        let chain = m.ready_queues[level].pop().expect("rotated chain");
                        m.ready_queues[next_level].push(chain);
                        prev = PrevSlot::Ready(next_level, m.ready_queues[next_level].len() - 1);
                        if m.ready_queues[active].is_empty() {
                            active = next_level;
                        }
                    }
                    PrevSlot::Staging => {
                        let chain = waiting.pop().expect("staged chain");
                        m.waiting_queues[next_level].push(chain);
                        prev = PrevSlot::Waiting(next_level);
                        if m.ready_queues[active].is_empty() {
                            active = (next_level..self.levels())
                                .find(|&l| !m.ready_queues[l].is_empty())
                                .unwrap_or(0);
                        }
                    }
                    _ => unreachable!(),
                }
            }
        }

        // flush the staging waiter into the previous level's waiting queue
        if !waiting.is_empty() {
            debug_assert!(matches!(prev, PrevSlot::Staging));
            let chain = waiting.pop().expect("staged chain");
            m.waiting_queues[prev_level].push(chain);
            prev = PrevSlot::Waiting(prev_level);
            debug_assert!(waiting.is_empty());
        }

        // unpark the selected queue
        m.active_level = active;
        mem::swap(&mut m.ready_queues[active], ready);

        match prev {
            PrevSlot::None => LastChainLoc::None,
            PrevSlot::Ready(level, _) if level == active => LastChainLoc::ReadyTail,
            PrevSlot::Ready(level, _) => LastChainLoc::ReadyLevelTail(level),
            PrevSlot::Waiting(level) => LastChainLoc::WaitingLevelTail(level),
            PrevSlot::Staging => LastChainLoc::WaitingTail,
            PrevSlot::Finished => LastChainLoc::FinishedTail,
        }
    }

    fn sched_loop(
        &self,
        t: Time,
        data: &mut SchedulerData,
        _last: &LastChainLoc,
        _default_time_slice: Option<Time>,
        _module: &str,
        _ctx: &SchedCtx,
    ) -> SimResult<(Option<usize>, Option<Time>)> {
        if data.ready.is_empty() {
            return Ok((None, None));
        }
        let level = data.policy.mlfq().active_level;
        let time_slice = self.level_time_slices[level];
        data.policy.mlfq_mut().last_finish_time = time_slice.map(|slice| t + slice);
        Ok((Some(0), time_slice))
    }

    fn next_waiting_ready_time(&self, data: &SchedulerData, ctx: &SchedCtx) -> Option<Time> {
        debug_assert!(data.waiting.is_empty(), "staging waiter not flushed");
        data.policy
            .mlfq()
            .waiting_queues
            .iter()
            .flatten()
            .filter_map(|c| ctx.threads.effective_ready_time(c.bottom()))
            .min()
    }

    fn thread_keys(&self, data: &SchedulerData) -> Vec<ThreadKey> {
        let m = data.policy.mlfq();
        data.finished
            .iter()
            .chain(data.waiting.iter())
            .chain(data.ready.iter())
            .chain(m.ready_queues.iter().flatten())
            .chain(m.waiting_queues.iter().flatten())
            .map(Chain::bottom)
            .collect()
    }
}
