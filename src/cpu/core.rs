/*
 * CPU Core
 *
 * The per-core execution engine. One step services either a pending timer
 * interrupt or drives the top frame's execution until a time-advancing
 * request (execute, idle, or a context switch).
 *
 * Context switches are atomic: their cost is charged even when it overruns
 * a pending timeout; the overrun is reported as timer delay when the
 * interrupt is serviced at the next step boundary.
 *
 * Two timer policies exist. With local timers every frame may arm its own
 * timeout and suspended chains survive intact. With kernel-only timers the
 * kernel frame holds the single timer; interrupts discard the preempted
 * chain (it is finished and rebuilt thread by thread on later descents) and
 * the kernel scheduler is restarted in place.
 */

use crate::cpu::context::Chain;
use crate::cpu::request::{Reply, Request};
use crate::error::{SimError, SimResult};
use crate::module::{ModuleId, ModuleTable};
use crate::sink::{CpuView, EventSink, SwitchTarget};
use crate::threads::{CoreStats, ThreadKey, ThreadTable};
use crate::time::Time;

/// Default cost of switching between threads of one module.
pub const THREAD_CTXSW_COST: i64 = 0;
/// Default cost of crossing a module boundary.
pub const MODULE_CTXSW_COST: i64 = 1;

/// How preemption propagates through the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPolicy {
    /// Every frame may hold its own timer.
    LocalTimers,
    /// Only the kernel frame may hold a timer; preempted chains are
    /// discarded and rebuilt by repeated descents.
    KernelOnly,
}

/// Per-core configuration.
#[derive(Debug, Clone, Copy)]
pub struct CoreParams {
    pub timer_policy: TimerPolicy,
    pub thread_ctxsw_cost: Time,
    pub module_ctxsw_cost: Time,
}

impl Default for CoreParams {
    fn default() -> Self {
        CoreParams {
            timer_policy: TimerPolicy::LocalTimers,
            thread_ctxsw_cost: Time::from_integer(THREAD_CTXSW_COST),
            module_ctxsw_cost: Time::from_integer(MODULE_CTXSW_COST),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct TimeStats {
    crunch_time: Time,
    idle_time: Time,
    timer_delay: Time,
}

#[derive(Debug, Default, Clone, Copy)]
struct CtxSwitchStats {
    thread_time: Time,
    module_time: Time,
}

/// A CPU core: the context chain it runs, its clock and its statistics.
pub struct Core {
    pub uid: usize,
    params: CoreParams,
    chain: Chain,
    current_time: Time,
    stats: TimeStats,
    ctxsw_stats: CtxSwitchStats,
}

impl Core {
    /// Create a core running `init_thread` (the kernel's scheduler thread).
    pub fn new(uid: usize, init_thread: ThreadKey, threads: &ThreadTable, params: CoreParams) -> Core {
        Core {
            uid,
            params,
            chain: Chain::from_thread(init_thread, threads),
            current_time: Time::zero(),
            stats: TimeStats::default(),
            ctxsw_stats: CtxSwitchStats::default(),
        }
    }

    pub fn current_time(&self) -> Time {
        self.current_time
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// The kernel module.
    pub fn kernel(&self, threads: &ThreadTable) -> ModuleId {
        threads.module_of(self.chain.bottom())
    }

    /// The core's accumulated statistics.
    pub fn statistics(&self) -> CoreStats {
        CoreStats {
            crunch_time: self.stats.crunch_time,
            idle_time: self.stats.idle_time,
            timer_delay: self.stats.timer_delay,
            thread_time: self.ctxsw_stats.thread_time,
            module_time: self.ctxsw_stats.module_time,
        }
    }

    fn view<'a>(&'a self, threads: &'a ThreadTable, modules: &'a ModuleTable) -> CpuView<'a> {
        CpuView {
            uid: self.uid,
            current_time: self.current_time,
            chain: &self.chain,
            threads,
            modules,
        }
    }

    /// Execute one step: anything that takes time or switches context.
    pub fn execute(
        &mut self,
        threads: &mut ThreadTable,
        modules: &ModuleTable,
        sink: &mut dyn EventSink,
    ) -> SimResult<()> {
        if let Some(next_timeout) = self.chain.next_timeout()
            && !next_timeout.is_positive()
        {
            return self.timer_interrupt(threads, modules, sink);
        }

        loop {
            let request = self.drive_top(threads)?;
            if self.handle_request(request, threads, modules, sink)? {
                return Ok(());
            }
        }
    }

    /// Resume the top frame's execution and receive one request.
    fn drive_top(&mut self, threads: &mut ThreadTable) -> SimResult<Request> {
        let current_time = self.current_time;
        let frame = self.chain.current_mut();
        let reply = if let Some(buffered) = frame.buffer.take() {
            Reply::Chain(buffered)
        } else if frame.started {
            Reply::Time(current_time)
        } else {
            frame.started = true;
            Reply::Start
        };
        let key = frame.thread;
        let mut exec = core::mem::replace(&mut frame.exec, crate::threads::ExecState::Parked);
        let result = threads.step_frame(key, &mut exec, reply);
        self.chain.current_mut().exec = exec;
        result
    }

    /// Handle a request; returns whether time was spent doing so.
    fn handle_request(
        &mut self,
        request: Request,
        threads: &mut ThreadTable,
        modules: &ModuleTable,
        sink: &mut dyn EventSink,
    ) -> SimResult<bool> {
        match request {
            Request::CurrentTime => Ok(false),
            Request::Timer(timeout) => {
                if self.params.timer_policy == TimerPolicy::KernelOnly {
                    let top = self.chain.top();
                    if threads.module_of(top) != self.kernel(threads) {
                        // only the kernel may arm a timer; clearing is a no-op
                        return match timeout {
                            None => Ok(false),
                            Some(timeout) => Err(SimError::NonKernelTimer {
                                module: modules.name(threads.module_of(top)).into(),
                                tid: threads.tid(top).into(),
                                timeout,
                            }),
                        };
                    }
                }
                self.chain.set_timer(timeout, None);
                Ok(false)
            }
            Request::Execute(amount) => {
                let time = self.calc_runtime(amount)?;
                assert!(time.is_positive(), "execute step of {time}");
                sink.thread_execute(&self.view(threads, modules), time);
                self.update_time(time);
                self.stats.crunch_time += time;
                self.chain.run_background(self.current_time, time, threads);
                threads.run_crunch(self.chain.top(), self.current_time, time);
                Ok(true)
            }
            Request::Idle => {
                sink.thread_yield(&self.view(threads, modules));
                self.switch_to_parent(threads, modules, sink)?;
                Ok(true)
            }
            Request::ResumeChain(tail) => {
                let tail = if self.params.timer_policy == TimerPolicy::KernelOnly {
                    // one thread at a time; the chain is rebuilt by descents
                    if tail.len() != 1 {
                        return Err(SimError::ResumeChainTooLong { len: tail.len() });
                    }
                    Chain::from_thread(tail.bottom(), threads)
                } else {
                    tail
                };
                self.append_chain(tail, threads, modules, sink)?;
                Ok(true)
            }
        }
    }

    /// Execution time available before the next timer.
    fn calc_runtime(&self, time: Option<Time>) -> SimResult<Time> {
        match (time, self.chain.next_timeout()) {
            (None, None) => Err(SimError::CpuHang),
            (Some(time), None) => Ok(time),
            (requested, Some(timeout)) => {
                let capped = match requested {
                    Some(time) if time <= timeout => time,
                    _ => timeout.max(Time::zero()),
                };
                Ok(capped)
            }
        }
    }

    /// Advance the clock and elapse the chain's timers.
    fn update_time(&mut self, time: Time) {
        assert!(!time.is_negative());
        self.current_time += time;
        self.chain.elapse(time);
    }

    /// Perform a context switch to a frame of the chain (split) or onto an
    /// appended chain. Returns the charged cost.
    fn context_switch(
        &mut self,
        target: SwitchTarget,
        threads: &mut ThreadTable,
        modules: &ModuleTable,
        sink: &mut dyn EventSink,
    ) -> Time {
        let thread_from = self.chain.top();
        let thread_to = match &target {
            SwitchTarget::Split(idx) => self.chain.thread_at(*idx),
            SwitchTarget::Append(tail) => tail.top(),
        };

        let cost = if threads.module_of(thread_to) == threads.module_of(thread_from) {
            let cost = self.params.thread_ctxsw_cost;
            self.ctxsw_stats.thread_time += cost;
            cost
        } else {
            let mut cost = self.params.module_ctxsw_cost;
            if !threads.is_vcpu(thread_to) {
                // a VCPU thread is a same-module entry point for the
                // scheduler it wraps
                cost += self.params.thread_ctxsw_cost;
            }
            self.ctxsw_stats.module_time += cost;
            cost
        };

        sink.context_switch(&self.view(threads, modules), &target, cost);

        match target {
            SwitchTarget::Split(idx) => {
                let prev_chain = self.chain.split(idx + 1);
                for frame in prev_chain.frames() {
                    threads.suspend(frame.thread, self.current_time);
                }
                // the displaced chain is delivered on the next resumption
                self.chain.current_mut().reply(Some(prev_chain));

                // charged regardless of the time slice: switching is atomic
                self.update_time(cost);
                self.chain.run_background(self.current_time, cost, threads);

                let top = self.chain.top();
                threads.run_ctxsw(top, self.current_time, cost);
                threads.resume(top, self.current_time, true);
            }
            SwitchTarget::Append(tail) => {
                self.update_time(cost);
                self.chain.run_background(self.current_time, cost, threads);
                threads.run_ctxsw(thread_from, self.current_time, cost);

                let appended_at = self.chain.len();
                self.chain.append_chain(tail.clone());
                for idx in appended_at..self.chain.len() {
                    threads.resume(self.chain.thread_at(idx), self.current_time, false);
                }
            }
        }

        debug_assert_ne!(thread_from, self.chain.top());
        cost
    }

    /// Return execution to the parent frame, or idle if the kernel yielded.
    fn switch_to_parent(
        &mut self,
        threads: &mut ThreadTable,
        modules: &ModuleTable,
        sink: &mut dyn EventSink,
    ) -> SimResult<()> {
        if self.chain.len() == 1 {
            // the kernel itself yielded
            let slice_left = self
                .chain
                .next_timeout()
                .ok_or(SimError::KernelIdleWithoutTimer)?;
            sink.cpu_idle(&self.view(threads, modules), slice_left);
            self.stats.idle_time += slice_left;
            self.update_time(slice_left);
        } else {
            let parent = self.chain.len() - 2;
            self.context_switch(SwitchTarget::Split(parent), threads, modules, sink);
        }

        if self.params.timer_policy == TimerPolicy::KernelOnly {
            // finish the displaced chain and collapse the reply to its
            // bottom thread, so it can be rebuilt on a later resume
            if let Some(prev_chain) = self.chain.current_mut().buffer.take() {
                prev_chain.finish(self.current_time, threads);
                let fresh = Chain::from_thread(prev_chain.bottom(), threads);
                self.chain.current_mut().reply(Some(fresh));
            }
        }

        Ok(())
    }

    /// Continue execution of another chain.
    fn append_chain(
        &mut self,
        tail: Chain,
        threads: &mut ThreadTable,
        modules: &ModuleTable,
        sink: &mut dyn EventSink,
    ) -> SimResult<()> {
        let top_module = threads.module_of(self.chain.top());
        let bottom_module = threads.module_of(tail.bottom());
        if top_module != bottom_module && !modules.is_child_of(bottom_module, top_module) {
            return Err(SimError::UnrelatedModuleResume {
                from: modules.name(top_module).into(),
                to: modules.name(bottom_module).into(),
            });
        }

        self.context_switch(SwitchTarget::Append(&tail), threads, modules, sink);
        Ok(())
    }

    /// Service an elapsed timer: report it, split back to the armed frame,
    /// clear its timer.
    fn timer_interrupt(
        &mut self,
        threads: &mut ThreadTable,
        modules: &ModuleTable,
        sink: &mut dyn EventSink,
    ) -> SimResult<()> {
        let next_timeout = self.chain.next_timeout().expect("interrupt without timer");
        assert!(!next_timeout.is_positive());

        let idx = self.chain.find_elapsed_timer();
        let delay = -next_timeout;
        sink.timer_interrupt(&self.view(threads, modules), idx, delay);
        self.stats.timer_delay += delay;

        if self.chain.len() > 1 {
            let cost = self.context_switch(SwitchTarget::Split(idx), threads, modules, sink);
            self.stats.timer_delay += cost;
        }

        self.chain.set_timer(None, None);

        if self.params.timer_policy == TimerPolicy::KernelOnly {
            // only the kernel timer may interrupt
            assert_eq!(self.chain.len(), 1, "non-kernel timer fired");

            // the preempted chain is finished so it can be restarted later
            if let Some(mut prev_chain) = self.chain.current_mut().buffer.take() {
                if prev_chain.len() > 1 {
                    if !prev_chain.current().started {
                        // an unstarted top frame never ran; just drop it
                        let _ = prev_chain.split(prev_chain.len() - 1);
                    }
                    prev_chain.finish(self.current_time, threads);
                } else if prev_chain.current().started {
                    prev_chain.finish(self.current_time, threads);
                }
            }

            // the kernel scheduler cannot express a partial suspension
            // without per-frame timers; restart it from scratch
            let key = self.chain.current().thread;
            threads.finish(key, self.current_time);
            let exec = threads.new_exec_state(key);
            let frame = self.chain.current_mut();
            frame.exec = exec;
            frame.started = false;
        }

        Ok(())
    }
}
