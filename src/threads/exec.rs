/*
 * Thread Execution State Machines
 *
 * A thread's run loop is a resumable computation: it emits one CPU request,
 * suspends, and continues when the CPU replies with the current time (or,
 * once after a context switch back, with the displaced chain). Each thread
 * kind is a small tagged state machine stepped through step_frame().
 *
 * The states mirror the request protocol positions:
 *
 *   worker:    New -> Ready -> (execute until finished) -> Done
 *   periodic:  New -> Ready <-> PostExec -> Done
 *   VCPU:      New -> Loop -> AwaitChain -> Loop
 *   scheduler: New -> Init -> Forward (the scheduler protocol takes over)
 */

use crate::cpu::request::{Reply, Request};
use crate::error::SimResult;
use crate::scheduler::{NextReady, SchedCtx, SchedProto};
use crate::threads::table::{ThreadKey, ThreadKind, ThreadTable};
use crate::time::Time;

/// Resumable execution state of one frame.
#[derive(Debug, Clone)]
pub enum ExecState {
    /// Placeholder for a chain whose real frames run on the CPU. Never
    /// stepped.
    Parked,
    Worker(WorkerExec),
    Periodic(PeriodicExec),
    SchedThread(SchedThreadExec),
    Vcpu(VcpuExec),
}

impl ExecState {
    /// Fresh execution state for a thread kind.
    pub fn new(kind: &ThreadKind) -> ExecState {
        match kind {
            ThreadKind::Worker => ExecState::Worker(WorkerExec::New),
            ThreadKind::Periodic(_) => ExecState::Periodic(PeriodicExec::New),
            ThreadKind::Scheduler(_) => ExecState::SchedThread(SchedThreadExec {
                phase: StPhase::New,
                proto: SchedProto::new(),
            }),
            ThreadKind::Vcpu(_) => ExecState::Vcpu(VcpuExec::New),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WorkerExec {
    New,
    Ready,
    Done,
}

#[derive(Debug, Clone)]
pub enum PeriodicExec {
    New,
    /// Waiting for a time reply to size and request the next burst.
    Ready,
    /// An execute request is outstanding.
    PostExec,
    Done,
}

#[derive(Debug, Clone)]
pub enum VcpuExec {
    New,
    Loop,
    AwaitChain,
}

/// Scheduler-thread execution: a thin shell around the scheduler protocol.
#[derive(Debug, Clone)]
pub struct SchedThreadExec {
    phase: StPhase,
    pub proto: SchedProto,
}

#[derive(Debug, Clone, Copy)]
enum StPhase {
    New,
    Init,
    Forward,
}

impl ThreadTable {
    /// Step the execution of `key` with the CPU's reply, producing the next
    /// request.
    pub fn step_frame(
        &mut self,
        key: ThreadKey,
        exec: &mut ExecState,
        reply: Reply,
    ) -> SimResult<Request> {
        match exec {
            ExecState::Parked => panic!("parked placeholder frame executed"),
            ExecState::Worker(state) => Ok(self.step_worker(key, state, reply)),
            ExecState::Periodic(state) => Ok(self.step_periodic(key, state, reply)),
            ExecState::Vcpu(state) => Ok(self.step_vcpu(key, state, reply)),
            ExecState::SchedThread(state) => self.step_scheduler_thread(key, state, reply),
        }
    }

    fn step_worker(&mut self, key: ThreadKey, state: &mut WorkerExec, reply: Reply) -> Request {
        match state {
            WorkerExec::New => {
                debug_assert!(matches!(reply, Reply::Start));
                self.acquire_running(key);
                *state = WorkerExec::Ready;
                Request::current_time()
            }
            WorkerExec::Ready => {
                let t = reply.expect_time();
                if self.is_finished(key) {
                    *state = WorkerExec::Done;
                    Request::idle()
                } else {
                    self.update_ready_time(key, t);
                    // run for as long as there is work; the CPU caps this
                    // against the chain's next timer
                    Request::execute(self.get(key).remaining)
                }
            }
            WorkerExec::Done => panic!("finished worker resumed"),
        }
    }

    fn step_periodic(&mut self, key: ThreadKey, state: &mut PeriodicExec, reply: Reply) -> Request {
        match state {
            PeriodicExec::New => {
                debug_assert!(matches!(reply, Reply::Start));
                self.acquire_running(key);
                *state = PeriodicExec::Ready;
                Request::current_time()
            }
            PeriodicExec::Ready => {
                let t = reply.expect_time();
                self.periodic_execute(key, state, t)
            }
            PeriodicExec::PostExec => {
                let t = reply.expect_time();
                if self.is_finished(key) {
                    *state = PeriodicExec::Done;
                    Request::idle()
                } else if self.periodic_burst_left(key) == Some(Time::zero()) {
                    // burst consumed; sleep until the next activation
                    *state = PeriodicExec::Ready;
                    Request::idle()
                } else {
                    self.periodic_execute(key, state, t)
                }
            }
            PeriodicExec::Done => panic!("finished periodic thread resumed"),
        }
    }

    /// Size the next burst and request its execution.
    fn periodic_execute(&mut self, key: ThreadKey, state: &mut PeriodicExec, t: Time) -> Request {
        assert!(!self.is_finished(key));

        let mut quota = self.periodic_quota(key, t);
        assert!(
            !quota.is_negative(),
            "periodic thread '{}' executed too much",
            self.tid(key)
        );
        // with exact time arithmetic a scheduled periodic thread always has
        // quota; zero means it was resumed before its activation
        assert!(
            quota.is_positive(),
            "periodic thread '{}' scheduled without quota",
            self.tid(key)
        );

        // executing the quota may cross an activation boundary and grow it
        loop {
            let quota_plus = self.periodic_quota(key, t + quota);
            if quota_plus > quota {
                quota = quota_plus;
            } else {
                break;
            }
        }

        self.set_periodic_burst(key, Some(quota));
        self.update_ready_time(key, t);
        *state = PeriodicExec::PostExec;
        Request::execute(Some(quota))
    }

    fn periodic_burst_left(&self, key: ThreadKey) -> Option<Time> {
        match &self.get(key).kind {
            ThreadKind::Periodic(p) => p.current_burst_left,
            _ => panic!("{key} is not a periodic thread"),
        }
    }

    fn set_periodic_burst(&mut self, key: ThreadKey, burst: Option<Time>) {
        match &mut self.get_mut(key).kind {
            ThreadKind::Periodic(p) => p.current_burst_left = burst,
            _ => panic!("{key} is not a periodic thread"),
        }
    }

    fn step_vcpu(&mut self, key: ThreadKey, state: &mut VcpuExec, reply: Reply) -> Request {
        match state {
            VcpuExec::New => {
                debug_assert!(matches!(reply, Reply::Start));
                self.acquire_running(key);
                *state = VcpuExec::Loop;
                Request::current_time()
            }
            VcpuExec::Loop => {
                let t = reply.expect_time();
                self.update_ready_time(key, t);
                let chain = self.take_vcpu_chain(key);
                *state = VcpuExec::AwaitChain;
                Request::resume_chain(chain)
            }
            VcpuExec::AwaitChain => {
                let chain = reply.expect_chain();
                self.store_vcpu_chain(key, chain);
                *state = VcpuExec::Loop;
                Request::idle()
            }
        }
    }

    fn step_scheduler_thread(
        &mut self,
        key: ThreadKey,
        state: &mut SchedThreadExec,
        reply: Reply,
    ) -> SimResult<Request> {
        match state.phase {
            StPhase::New => {
                debug_assert!(matches!(reply, Reply::Start));
                self.acquire_running(key);
                state.phase = StPhase::Init;
                Ok(Request::current_time())
            }
            StPhase::Init => {
                let t = reply.expect_time();
                // a restarted scheduler thread that already ran out of work
                // has no ready time left to synchronize
                if self.own_ready_time(key).is_some() {
                    self.update_ready_time(key, t);
                }
                state.phase = StPhase::Forward;
                self.drive_scheduler(key, state, Reply::Start)
            }
            StPhase::Forward => self.drive_scheduler(key, state, reply),
        }
    }

    /// Feed the CPU's reply into the scheduler protocol and forward its next
    /// request, intercepting idles to keep this thread's ready time in sync
    /// with the scheduler's next wake-up.
    fn drive_scheduler(
        &mut self,
        key: ThreadKey,
        state: &mut SchedThreadExec,
        reply: Reply,
    ) -> SimResult<Request> {
        // the scheduler observes the background time accumulated while its
        // previous request was outstanding as prev_run_time
        let prev_run = if matches!(reply, Reply::Start) {
            self.scheduler_slot(key).last_bg_time
        } else {
            let slot = self.scheduler_slot_mut(key);
            let prev = slot.last_bg_time;
            slot.last_bg_time = Some(Time::zero());
            prev
        };

        let mut scheduler = self.take_scheduler(key);
        let result = {
            let ctx = SchedCtx { threads: self };
            scheduler.proto_step(&mut state.proto, reply, prev_run, &ctx)
        };
        self.put_scheduler(key, scheduler);
        let request = result?;

        if matches!(request, Request::Idle) {
            match state.proto.next_ready {
                NextReady::Waiter(ready_time) => {
                    self.get_mut(key).ready_time = Some(ready_time);
                }
                NextReady::NoWaiter => {
                    // nothing will ever become ready again
                    self.end_scheduler_thread(key);
                }
                NextReady::Resumed => {
                    panic!("scheduler idled while a chain was resumed")
                }
            }
        }

        Ok(request)
    }
}
