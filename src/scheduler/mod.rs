/*
 * Scheduler Framework - Mechanism Layer
 *
 * This module implements the Scheduler, the stable mechanism that:
 * 1. Holds the active scheduling policy (Box<dyn Policy>) and optional addon
 * 2. Keeps the mutable queues in an RCU cell
 * 3. Drives the request protocol against the CPU as an explicit state
 *    machine (SchedProto), one request per step
 *
 * A scheduling round is:
 *
 *   round start   reclassify the previous decision into ready/waiting/
 *                 finished, promote due waiters, run policy and addon
 *                 start hooks
 *   decision      the policy's sched_loop picks a ready index and a slice,
 *                 the addon may veto or repeat
 *   execution     idle (optionally arming a wake-up timer), or arm the
 *                 slice timer and resume the chosen chain; the chain moves
 *                 to the CPU and is stored back when control returns
 *
 * The protocol states mirror the outstanding request, so a scheduler thread
 * frame can be suspended and resumed (or discarded and restarted under the
 * kernel-only timer policy) at any request boundary.
 */

pub mod addons;
pub mod data;
pub mod policies;
pub mod traits;

use core::mem;

use crate::cpu::context::Chain;
use crate::cpu::request::{Reply, Request};
use crate::error::SimResult;
use crate::module::{ModuleId, ModuleTable};
use crate::rcu::{Rcu, RcuCopy};
use crate::threads::{ThreadKey, ThreadStatsMap, ThreadTable};
use crate::time::Time;

pub use data::{LastChainLoc, PolicyData, SchedulerData};
pub use traits::{AddParams, Addon, Policy, SchedCtx};

/// A module's scheduler: policy + addon + RCU-protected queues.
pub struct Scheduler {
    module: ModuleId,
    module_name: String,
    /// Default time slice handed to the policy's decision hook.
    time_slice: Option<Time>,
    policy: Box<dyn Policy>,
    addon: Option<Box<dyn Addon>>,
    rcu: Rcu<SchedulerData>,
    /// Run time accumulated across repeated rounds, credited to the next
    /// full round start.
    prev_run_carry: Time,
}

/// What the scheduler's pending idle request means for its thread.
#[derive(Debug, Clone, Copy)]
pub enum NextReady {
    /// A chain was resumed; no idle pending.
    Resumed,
    /// Idling until this virtual time.
    Waiter(Time),
    /// Idling with nothing left to wake.
    NoWaiter,
}

/// Protocol position of one scheduler invocation.
///
/// Lives in the scheduler thread's frame, so a kernel restart gets a fresh
/// protocol while the scheduler's queues persist.
#[derive(Debug, Clone)]
pub struct SchedProto {
    state: ProtoState,
    pub next_ready: NextReady,
    /// prev_run_time captured at the round boundary (the reply that ended
    /// the previous round), as the round-start hooks observe it.
    round_prev_run: Option<Time>,
    /// Snapshot kept across an addon veto; the retry round reuses it
    /// instead of reclassifying again.
    saved_veto: Option<RcuCopy<SchedulerData>>,
}

#[derive(Debug, Clone, Copy)]
enum ProtoState {
    Boot,
    AtStart,
    AwaitTimerAckResume { idx: usize },
    AwaitTimerAckIdle,
    AwaitChainBack { idx: usize },
    AwaitIdle,
}

impl SchedProto {
    pub fn new() -> SchedProto {
        SchedProto {
            state: ProtoState::Boot,
            next_ready: NextReady::NoWaiter,
            round_prev_run: None,
            saved_veto: None,
        }
    }
}

impl Default for SchedProto {
    fn default() -> Self {
        SchedProto::new()
    }
}

impl Scheduler {
    /// Create a scheduler for `module`.
    pub fn new(
        module: ModuleId,
        module_name: &str,
        policy: Box<dyn Policy>,
        addon: Option<Box<dyn Addon>>,
        time_slice: Option<Time>,
    ) -> SimResult<Scheduler> {
        policy.validate(time_slice)?;

        let mut data = SchedulerData::new(policy.init_data());
        if let Some(addon) = &addon {
            addon.transmute_data(&mut data);
        }

        log::info!(
            "[Sched] module '{}' uses {}{}",
            module_name,
            policy.name(),
            addon
                .as_ref()
                .map(|a| format!(" with {}", a.name()))
                .unwrap_or_default()
        );

        Ok(Scheduler {
            module,
            module_name: module_name.into(),
            time_slice,
            policy,
            addon,
            rcu: Rcu::new(data),
            prev_run_carry: Time::zero(),
        })
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Whether running this scheduler outside the kernel requires the
    /// local-timer CPU policy.
    pub fn needs_local_timers(&self) -> bool {
        let overridden = self
            .addon
            .as_ref()
            .is_some_and(|a| a.overrides_time_slice());
        self.policy.uses_time_slices(self.time_slice) && !overridden
    }

    /// Add a thread to schedule.
    pub fn add_thread(&self, thread: ThreadKey, params: AddParams, ctx: &SchedCtx) -> SimResult<()> {
        let chain = Chain::from_thread(thread, ctx.threads);
        self.rcu.apply(|data| {
            if let Some(addon) = &self.addon {
                addon.add_thread(data, thread, ctx);
            }
            self.policy
                .add_chain(data, chain, &params, &self.module_name, ctx)
        })
    }

    /// Total number of threads, running and finished.
    pub fn num_threads(&self) -> usize {
        self.rcu.look(|data| self.policy.thread_keys(data).len())
    }

    /// Statistics of every thread this scheduler knows about.
    pub fn get_thread_statistics(
        &self,
        t: Time,
        threads: &ThreadTable,
        modules: &ModuleTable,
    ) -> ThreadStatsMap {
        let data = self.rcu.read();
        let mut map = ThreadStatsMap::new();
        for key in self.policy.thread_keys(&data) {
            let name = (
                modules.name(threads.module_of(key)).to_string(),
                threads.tid(key).to_string(),
            );
            map.insert(name, threads.report(key, t, modules));
        }
        map
    }

    // ========================================================================
    // REQUEST PROTOCOL
    // ========================================================================

    /// Feed the CPU's reply into the protocol, producing the next request.
    ///
    /// `prev_run_time` is the background time the scheduler thread
    /// accumulated while the previous request was outstanding.
    pub fn proto_step(
        &mut self,
        proto: &mut SchedProto,
        reply: Reply,
        prev_run_time: Option<Time>,
        ctx: &SchedCtx,
    ) -> SimResult<Request> {
        match proto.state {
            ProtoState::Boot => {
                proto.round_prev_run = prev_run_time;
                proto.state = ProtoState::AtStart;
                Ok(Request::current_time())
            }
            ProtoState::AtStart => {
                let t = reply.expect_time();
                self.run_round(proto, t, ctx)
            }
            ProtoState::AwaitTimerAckResume { idx } => {
                let _ = reply.expect_time();
                // the chain moves to the CPU; a parked placeholder keeps the
                // bottom thread visible for reclassification
                let chain = self.rcu.apply(|data| {
                    let bottom = data.ready[idx].bottom();
                    mem::replace(&mut data.ready[idx], Chain::parked(bottom))
                });
                proto.state = ProtoState::AwaitChainBack { idx };
                Ok(Request::resume_chain(chain))
            }
            ProtoState::AwaitTimerAckIdle => {
                let _ = reply.expect_time();
                proto.state = ProtoState::AwaitIdle;
                Ok(Request::idle())
            }
            ProtoState::AwaitChainBack { idx } => {
                let chain = reply.expect_chain();
                self.rcu.apply(|data| data.ready[idx] = chain);
                proto.round_prev_run = prev_run_time;
                proto.state = ProtoState::AtStart;
                Ok(Request::current_time())
            }
            ProtoState::AwaitIdle => {
                let _ = reply.expect_time();
                proto.round_prev_run = prev_run_time;
                proto.state = ProtoState::AtStart;
                Ok(Request::current_time())
            }
        }
    }

    /// One full scheduling round at time `t`.
    fn run_round(&mut self, proto: &mut SchedProto, t: Time, ctx: &SchedCtx) -> SimResult<Request> {
        let prev_run = proto.round_prev_run;

        // addon repeat check: re-issue the previous decision without a round
        let mut repeat: Option<(RcuCopy<SchedulerData>, Option<Time>)> = None;
        if let Some(addon) = &self.addon {
            let mut copy = self.rcu.copy();
            if let Some(last_idx) = copy.data.last_idx {
                let bottom = copy.data.ready[last_idx].bottom();
                let done = ctx.threads.is_finished(bottom)
                    || ctx
                        .threads
                        .effective_ready_time(bottom)
                        .is_some_and(|ready| ready > t);
                match addon.repeat(&mut copy.data, prev_run, done) {
                    Some(time_slice) if !done => repeat = Some((copy, time_slice)),
                    _ => {
                        // consumed repeat budgets must stick even when the
                        // repeat is declined
                        let _ = self.rcu.update(copy);
                    }
                }
            }
        }

        let (mut copy, idx, policy_slice) = match repeat {
            Some((repeat_copy, repeat_slice)) => {
                // the skipped round's run time is credited to the next full
                // one
                self.prev_run_carry += prev_run.unwrap_or(Time::zero());
                let idx = repeat_copy.data.last_idx;
                debug_assert!(idx.is_some());
                log::trace!("[Sched] '{}' repeats {:?}", self.module_name, idx);
                (repeat_copy, idx, repeat_slice)
            }
            None => {
                let prev_run_total = prev_run.map(|p| p + self.prev_run_carry);
                if prev_run.is_some() {
                    self.prev_run_carry = Time::zero();
                } else {
                    debug_assert!(self.prev_run_carry.is_zero());
                }

                self.full_round(proto, t, prev_run_total, ctx)?
            }
        };

        // addon decision filter and slice override
        let mut final_slice = policy_slice;
        if let Some(addon) = &self.addon {
            let (proceed, slice) = addon.schedule(idx, policy_slice, &mut copy.data, ctx);
            if !proceed {
                // decision blocked: keep the snapshot and run another round
                assert!(idx.is_some(), "addon vetoed an idle decision");
                copy.data.last_idx = idx;
                proto.saved_veto = Some(copy);
                proto.state = ProtoState::AtStart;
                return Ok(Request::current_time());
            }
            final_slice = slice;
        }

        // commit
        copy.data.last_idx = idx;
        let next_waiting = if idx.is_none() {
            self.policy.next_waiting_ready_time(&copy.data, ctx)
        } else {
            None
        };
        if !self.rcu.update(copy) {
            // lost the race; re-snapshot and retry
            proto.state = ProtoState::AtStart;
            return Ok(Request::current_time());
        }

        match idx {
            Some(idx) => {
                proto.next_ready = NextReady::Resumed;
                proto.state = ProtoState::AwaitTimerAckResume { idx };
                Ok(Request::timer(final_slice))
            }
            None => match next_waiting {
                Some(ready_time) => {
                    let delta = ready_time - t;
                    assert!(delta.is_positive(), "next waiter is already due");
                    proto.next_ready = NextReady::Waiter(ready_time);
                    // an addon stripping time-slices strips the wake-up too
                    let timer = if self.addon.is_some() && final_slice.is_none() {
                        None
                    } else {
                        Some(delta)
                    };
                    proto.state = ProtoState::AwaitTimerAckIdle;
                    Ok(Request::timer(timer))
                }
                None => {
                    proto.next_ready = NextReady::NoWaiter;
                    proto.state = ProtoState::AwaitIdle;
                    Ok(Request::idle())
                }
            },
        }
    }

    /// Round start + decision, without the addon repeat/veto shortcuts.
    #[allow(clippy::type_complexity)]
    fn full_round(
        &self,
        proto: &mut SchedProto,
        t: Time,
        prev_run_time: Option<Time>,
        ctx: &SchedCtx,
    ) -> SimResult<(RcuCopy<SchedulerData>, Option<usize>, Option<Time>)> {
        let mut last = LastChainLoc::None;

        let mut copy = match proto.saved_veto.take() {
            Some(mut copy) => {
                // retry after a veto: the snapshot already reflects the
                // round start, only waiter promotion is repeated
                let last_idx = copy.data.last_idx.expect("veto snapshot without decision");
                last = LastChainLoc::Ready(last_idx);
                self.policy.update_ready_chains(t, &mut copy.data, ctx);
                copy.data.last_idx = None;
                copy
            }
            None => {
                let mut copy = self.rcu.copy();

                // reclassify the previous decision by its bottom thread
                if let Some(last_idx) = copy.data.last_idx {
                    let bottom = copy.data.ready[last_idx].bottom();
                    if ctx.threads.is_finished(bottom) {
                        let chain = copy.data.ready.remove(last_idx);
                        copy.data.finished.push(chain);
                        last = LastChainLoc::FinishedTail;
                    } else if ctx
                        .threads
                        .effective_ready_time(bottom)
                        .is_some_and(|ready| ready > t)
                    {
                        let chain = copy.data.ready.remove(last_idx);
                        copy.data.waiting.push(chain);
                        last = LastChainLoc::WaitingTail;
                    } else {
                        last = LastChainLoc::Ready(last_idx);
                    }
                }

                self.policy.update_ready_chains(t, &mut copy.data, ctx);
                copy.data.last_idx = None;
                copy
            }
        };

        last = self
            .policy
            .post_start(t, prev_run_time, &mut copy.data, last, ctx);

        if let Some(addon) = &self.addon {
            addon.start_schedule(prev_run_time, &mut copy.data, &last, ctx);
        }

        let (idx, time_slice) = self.policy.sched_loop(
            t,
            &mut copy.data,
            &last,
            self.time_slice,
            &self.module_name,
            ctx,
        )?;

        log::trace!(
            "[Sched] '{}' decides {:?} slice {:?} at {}",
            self.module_name,
            idx,
            time_slice,
            t
        );

        Ok((copy, idx, time_slice))
    }
}
