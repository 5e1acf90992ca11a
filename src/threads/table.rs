/*
 * Thread Table
 *
 * All threads of a simulation live in one index-addressed table; context
 * chains, scheduler queues and modules refer to them by ThreadKey. The table
 * owns the per-thread state (ready time, remaining workload, statistics) and
 * implements the lifecycle callbacks the CPU delivers on every event.
 *
 * Four kinds of thread exist:
 * - worker: runs its workload down to zero, then finishes
 * - periodic: needs `burst` units of CPU every `period` units
 * - scheduler thread: drives a module's scheduler
 * - VCPU thread: a handle in the parent module pointing at a child's
 *   scheduler thread; its ready time and remaining workload are mirrored
 *   from the wrapped thread (`effective_*`), while its own ready time is
 *   kept for its own wait statistics (`own_*`)
 */

use core::fmt;

use crate::cpu::context::Chain;
use crate::error::{SimError, SimResult};
use crate::module::{ModuleId, ModuleTable};
use crate::scheduler::Scheduler;
use crate::threads::exec::ExecState;
use crate::threads::stats::{BgStats, ThreadStats, ThreadStatsMap, ThreadStatsReport};
use crate::time::Time;

/// Index of a thread in the [`ThreadTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadKey(pub usize);

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Periodic-burst bookkeeping.
#[derive(Debug)]
pub struct PeriodicData {
    pub period: Time,
    pub burst: Time,
    pub original_ready_time: Time,
    pub current_burst_left: Option<Time>,
    pub total_run_time: Time,
}

/// State owned by a scheduler thread.
pub struct SchedulerSlot {
    /// The module's scheduler. Temporarily taken out while the thread steps.
    pub scheduler: Option<Scheduler>,
    /// Background time accumulated since the last scheduler request, the
    /// `prev_run_time` the scheduler observes. `None` before the first run.
    pub last_bg_time: Option<Time>,
    pub bg: BgStats,
    /// Whether this is the kernel's scheduler thread (restarted in place
    /// under the kernel-only timer policy).
    pub is_root: bool,
}

/// State owned by a VCPU thread.
#[derive(Debug)]
pub struct VcpuSlot {
    /// The wrapped scheduler thread in the child module.
    pub child_sched: ThreadKey,
    /// The child's suspended chain between activations. `None` while the
    /// chain runs on the CPU (or after it was discarded by an interrupt
    /// under the kernel-only timer policy).
    pub chain: Option<Chain>,
    pub bg: BgStats,
}

/// Kind-specific part of a thread slot.
pub enum ThreadKind {
    Worker,
    Periodic(PeriodicData),
    Scheduler(SchedulerSlot),
    Vcpu(VcpuSlot),
}

/// One thread of the simulation.
pub struct ThreadSlot {
    pub module: ModuleId,
    pub tid: String,
    /// Virtual time the thread becomes runnable; `None` once finished.
    pub ready_time: Option<Time>,
    /// Units of work left; `None` means unbounded.
    pub remaining: Option<Time>,
    /// Units of work until the response-time metric latches.
    pub response_units: Option<Time>,
    /// Exclusion flag: the thread is on some CPU's context chain.
    pub running: bool,
    pub stats: ThreadStats,
    pub kind: ThreadKind,
}

/// All threads of a simulation, indexed by [`ThreadKey`].
#[derive(Default)]
pub struct ThreadTable {
    slots: Vec<ThreadSlot>,
}

/// Workload parameters shared by worker and periodic threads.
#[derive(Debug, Clone, Default)]
pub struct ThreadSpec {
    /// Thread id; auto-generated from the module's thread count if `None`.
    pub tid: Option<String>,
    pub ready_time: Time,
    /// `None` runs forever.
    pub units: Option<Time>,
    pub response_units: Option<Time>,
}

impl ThreadTable {
    pub fn new() -> ThreadTable {
        ThreadTable::default()
    }

    fn insert(&mut self, slot: ThreadSlot) -> ThreadKey {
        let key = ThreadKey(self.slots.len());
        self.slots.push(slot);
        key
    }

    fn validate_spec(&self, modules: &ModuleTable, module: ModuleId, spec: &ThreadSpec) {
        assert!(!spec.ready_time.is_negative(), "negative ready time");
        if let Some(units) = spec.units {
            assert!(!units.is_negative(), "negative workload");
            if let Some(response) = spec.response_units {
                assert!(
                    response <= units,
                    "response units exceed workload of a thread in '{}'",
                    modules.name(module)
                );
            }
        }
    }

    /// Generated tid for the next work thread of `module`: its thread count
    /// plus one (tid "0" is the module's scheduler thread).
    fn auto_tid(&self, modules: &mut ModuleTable, module: ModuleId) -> String {
        let m = modules.get_mut(module);
        m.num_work_threads += 1;
        m.num_work_threads.to_string()
    }

    /// Add a worker thread.
    pub fn add_worker(
        &mut self,
        modules: &mut ModuleTable,
        module: ModuleId,
        spec: ThreadSpec,
    ) -> ThreadKey {
        self.validate_spec(modules, module, &spec);
        let tid = spec
            .tid
            .clone()
            .unwrap_or_else(|| self.auto_tid(modules, module));
        log::debug!("[Threads] worker '{}|{}'", modules.name(module), tid);
        self.insert(ThreadSlot {
            module,
            tid,
            ready_time: Some(spec.ready_time),
            remaining: spec.units,
            response_units: spec.response_units,
            running: false,
            stats: ThreadStats::new(),
            kind: ThreadKind::Worker,
        })
    }

    /// Add a periodic-work thread needing `burst` units every `period`.
    pub fn add_periodic(
        &mut self,
        modules: &mut ModuleTable,
        module: ModuleId,
        spec: ThreadSpec,
        period: Time,
        burst: Time,
    ) -> SimResult<ThreadKey> {
        self.validate_spec(modules, module, &spec);
        let tid = spec
            .tid
            .clone()
            .unwrap_or_else(|| self.auto_tid(modules, module));
        if period <= burst || !burst.is_positive() {
            return Err(SimError::PeriodNotAboveBurst {
                module: modules.name(module).into(),
                tid,
                period,
                burst,
            });
        }
        log::debug!(
            "[Threads] periodic '{}|{}' period={period} burst={burst}",
            modules.name(module),
            tid
        );
        Ok(self.insert(ThreadSlot {
            module,
            tid,
            ready_time: Some(spec.ready_time),
            remaining: spec.units,
            response_units: spec.response_units,
            running: false,
            stats: ThreadStats::new(),
            kind: ThreadKind::Periodic(PeriodicData {
                period,
                burst,
                original_ready_time: spec.ready_time,
                current_burst_left: None,
                total_run_time: Time::zero(),
            }),
        }))
    }

    /// Add a module's scheduler thread (tid "0").
    pub fn add_scheduler_thread(
        &mut self,
        modules: &ModuleTable,
        module: ModuleId,
        scheduler: Scheduler,
    ) -> ThreadKey {
        self.insert(ThreadSlot {
            module,
            tid: "0".into(),
            ready_time: Some(Time::zero()),
            remaining: None,
            response_units: None,
            running: false,
            stats: ThreadStats::new(),
            kind: ThreadKind::Scheduler(SchedulerSlot {
                scheduler: Some(scheduler),
                last_bg_time: None,
                bg: BgStats::new(),
                is_root: modules.parent(module).is_none(),
            }),
        })
    }

    /// Add a VCPU thread in `module` wrapping `child_sched`.
    pub fn add_vcpu(
        &mut self,
        modules: &mut ModuleTable,
        module: ModuleId,
        tid: Option<String>,
        child_sched: ThreadKey,
    ) -> ThreadKey {
        let tid = tid.unwrap_or_else(|| self.auto_tid(modules, module));
        let ready_time = self.slots[child_sched.0].ready_time;
        log::debug!("[Threads] vcpu '{}|{}'", modules.name(module), tid);
        self.insert(ThreadSlot {
            module,
            tid,
            ready_time,
            remaining: None,
            response_units: None,
            running: false,
            stats: ThreadStats::new(),
            kind: ThreadKind::Vcpu(VcpuSlot {
                child_sched,
                chain: None,
                bg: BgStats::new(),
            }),
        })
    }

    pub fn get(&self, key: ThreadKey) -> &ThreadSlot {
        &self.slots[key.0]
    }

    pub fn get_mut(&mut self, key: ThreadKey) -> &mut ThreadSlot {
        &mut self.slots[key.0]
    }

    pub fn module_of(&self, key: ThreadKey) -> ModuleId {
        self.slots[key.0].module
    }

    pub fn tid(&self, key: ThreadKey) -> &str {
        &self.slots[key.0].tid
    }

    pub fn is_vcpu(&self, key: ThreadKey) -> bool {
        matches!(self.slots[key.0].kind, ThreadKind::Vcpu(_))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    // ========================================================================
    // EFFECTIVE STATE - what schedulers observe
    // ========================================================================

    /// Ready time as a scheduler sees it: a VCPU thread mirrors the wrapped
    /// scheduler thread.
    pub fn effective_ready_time(&self, key: ThreadKey) -> Option<Time> {
        match &self.slots[key.0].kind {
            ThreadKind::Vcpu(v) => self.slots[v.child_sched.0].ready_time,
            _ => self.slots[key.0].ready_time,
        }
    }

    /// Remaining workload as a scheduler sees it.
    pub fn effective_remaining(&self, key: ThreadKey) -> Option<Time> {
        match &self.slots[key.0].kind {
            ThreadKind::Vcpu(v) => self.slots[v.child_sched.0].remaining,
            _ => self.slots[key.0].remaining,
        }
    }

    /// The thread's own ready time, bypassing VCPU mirroring (used for the
    /// thread's own wait statistics).
    pub fn own_ready_time(&self, key: ThreadKey) -> Option<Time> {
        self.slots[key.0].ready_time
    }

    /// Whether the thread has nothing left to do.
    pub fn is_finished(&self, key: ThreadKey) -> bool {
        self.effective_remaining(key) == Some(Time::zero())
    }

    // ========================================================================
    // SCHEDULER ACCESS
    // ========================================================================

    pub(crate) fn scheduler_slot(&self, key: ThreadKey) -> &SchedulerSlot {
        match &self.slots[key.0].kind {
            ThreadKind::Scheduler(s) => s,
            _ => panic!("{key} is not a scheduler thread"),
        }
    }

    pub(crate) fn scheduler_slot_mut(&mut self, key: ThreadKey) -> &mut SchedulerSlot {
        match &mut self.slots[key.0].kind {
            ThreadKind::Scheduler(s) => s,
            _ => panic!("{key} is not a scheduler thread"),
        }
    }

    /// Borrow a scheduler thread's scheduler.
    pub fn scheduler(&self, key: ThreadKey) -> &Scheduler {
        self.scheduler_slot(key)
            .scheduler
            .as_ref()
            .expect("scheduler is taken")
    }

    /// Take the scheduler out of its slot so it can be stepped against the
    /// rest of the table. Must be paired with [`put_scheduler`].
    ///
    /// [`put_scheduler`]: ThreadTable::put_scheduler
    pub fn take_scheduler(&mut self, key: ThreadKey) -> Scheduler {
        self.scheduler_slot_mut(key)
            .scheduler
            .take()
            .expect("scheduler already taken")
    }

    pub fn put_scheduler(&mut self, key: ThreadKey, scheduler: Scheduler) {
        let slot = self.scheduler_slot_mut(key);
        assert!(slot.scheduler.is_none(), "scheduler slot occupied");
        slot.scheduler = Some(scheduler);
    }

    fn vcpu_slot_mut(&mut self, key: ThreadKey) -> &mut VcpuSlot {
        match &mut self.slots[key.0].kind {
            ThreadKind::Vcpu(v) => v,
            _ => panic!("{key} is not a VCPU thread"),
        }
    }

    /// Take the VCPU's suspended child chain, rebuilding a fresh single-frame
    /// chain if it was discarded.
    pub fn take_vcpu_chain(&mut self, key: ThreadKey) -> Chain {
        let child = match &self.slots[key.0].kind {
            ThreadKind::Vcpu(v) => v.child_sched,
            _ => panic!("{key} is not a VCPU thread"),
        };
        match self.vcpu_slot_mut(key).chain.take() {
            Some(chain) => chain,
            None => Chain::from_thread(child, self),
        }
    }

    pub fn store_vcpu_chain(&mut self, key: ThreadKey, chain: Chain) {
        self.vcpu_slot_mut(key).chain = Some(chain);
    }

    /// Fresh execution state for a thread, used when (re)starting a frame.
    pub fn new_exec_state(&self, key: ThreadKey) -> ExecState {
        ExecState::new(&self.slots[key.0].kind)
    }

    // ========================================================================
    // RUNNING FLAG
    // ========================================================================

    /// Assert the is-running exclusion flag.
    ///
    /// # Panics
    /// Panics on double acquire; a thread can be on one chain only.
    pub fn acquire_running(&mut self, key: ThreadKey) {
        let slot = &mut self.slots[key.0];
        assert!(!slot.running, "thread '{}' is already running", slot.tid);
        slot.running = true;
    }

    // ========================================================================
    // PERIODIC QUOTA
    // ========================================================================

    /// Completed activations of a periodic thread at `t`.
    fn activations(p: &PeriodicData, t: Time) -> i64 {
        ((t - p.original_ready_time) / p.period).floor() + 1
    }

    /// CPU quota of a periodic thread at `t`, bounded by its remaining
    /// workload.
    pub fn periodic_quota(&self, key: ThreadKey, t: Time) -> Time {
        let slot = &self.slots[key.0];
        let ThreadKind::Periodic(p) = &slot.kind else {
            panic!("{key} is not a periodic thread");
        };
        let quota =
            Time::from_integer(Self::activations(p, t)) * p.burst - p.total_run_time;
        match slot.remaining {
            Some(remaining) => remaining.min(quota),
            None => quota,
        }
    }

    // ========================================================================
    // LIFECYCLE CALLBACKS - delivered by the CPU
    // ========================================================================

    /// Synchronize the thread's ready time while it is executing.
    pub fn update_ready_time(&mut self, key: ThreadKey, t: Time) {
        let slot = &mut self.slots[key.0];
        match &mut slot.kind {
            ThreadKind::Periodic(p) => {
                // only jumps once the current burst is exhausted
                let burst_left = p
                    .current_burst_left
                    .expect("periodic ready-time update without a burst");
                if burst_left.is_zero() && slot.ready_time.is_some() {
                    slot.ready_time = Some(
                        Time::from_integer(Self::activations(p, t)) * p.period
                            + p.original_ready_time,
                    );
                }
            }
            _ => {
                let ready = slot.ready_time.expect("ready-time update on a finished thread");
                assert!(
                    !ready.is_negative() && ready <= t,
                    "thread '{}' ready at {ready} updated at {t}",
                    slot.tid
                );
                assert!(slot.running, "ready-time update on a suspended thread");
                slot.ready_time = Some(t);
            }
        }
    }

    /// Latch the finish state. Idempotent.
    fn end(&mut self, key: ThreadKey) {
        let slot = &mut self.slots[key.0];
        assert_eq!(slot.remaining, Some(Time::zero()));
        assert!(slot.response_units.is_none());
        if let Some(ready) = slot.ready_time.take() {
            slot.stats.finished_time = Some(ready);
        }
    }

    /// Mark a scheduler thread as out of work.
    pub fn end_scheduler_thread(&mut self, key: ThreadKey) {
        let slot = &mut self.slots[key.0];
        debug_assert!(matches!(slot.kind, ThreadKind::Scheduler(_)));
        slot.remaining = Some(Time::zero());
        self.end(key);
    }

    /// Charge `dt` of execution to the active (top) thread.
    pub fn run_crunch(&mut self, key: ThreadKey, t: Time, dt: Time) {
        let slot = &mut self.slots[key.0];
        assert!(slot.running, "crunch time charged to a suspended thread");
        assert!(
            slot.ready_time.is_some(),
            "crunch time charged to thread '{}' after it finished",
            slot.tid
        );

        slot.stats.total_run += dt;
        slot.stats.run.last_mut().expect("run bucket").push(dt);

        let ready = slot.ready_time.expect("checked above") + dt;
        assert_eq!(ready, t, "thread '{}' ran outside its ready window", slot.tid);
        slot.ready_time = Some(ready);

        if let Some(response) = slot.response_units {
            let response = response - dt;
            if !response.is_positive() {
                slot.stats.response_time = Some(t + response);
                slot.response_units = None;
            } else {
                slot.response_units = Some(response);
            }
        }

        if let Some(remaining) = slot.remaining {
            assert!(remaining >= dt, "thread '{}' executed too much", slot.tid);
            slot.remaining = Some(remaining - dt);
        }

        if let ThreadKind::Periodic(p) = &mut slot.kind {
            let burst_left = p.current_burst_left.expect("crunch without a burst");
            assert!(burst_left >= dt, "burst overrun on thread '{}'", slot.tid);
            p.current_burst_left = Some(burst_left - dt);
            p.total_run_time += dt;
        }

        if self.slots[key.0].remaining == Some(Time::zero()) {
            // the job was completed within the slice
            self.end(key);
        } else if matches!(self.slots[key.0].kind, ThreadKind::Periodic(_)) {
            self.update_ready_time(key, t);
        }
    }

    /// Charge `dt` of background time to a non-top frame's thread.
    ///
    /// # Panics
    /// Panics for worker threads; only scheduler and VCPU threads sit below
    /// the top of a chain.
    pub fn run_background(&mut self, key: ThreadKey, t: Time, dt: Time) {
        let slot = &mut self.slots[key.0];
        assert!(slot.running, "background time charged to a suspended thread");
        match &mut slot.kind {
            ThreadKind::Scheduler(s) => {
                let so_far = s.last_bg_time.unwrap_or(Time::zero());
                s.last_bg_time = Some(so_far + dt);
                s.bg.bg_times.last_mut().expect("bg bucket").push(dt);
            }
            ThreadKind::Vcpu(v) => {
                v.bg.bg_times.last_mut().expect("bg bucket").push(dt);
            }
            _ => panic!("background time charged to work thread '{}'", slot.tid),
        }
        self.update_ready_time(key, t);
    }

    /// Charge `dt` of context-switch cost to the switching thread.
    pub fn run_ctxsw(&mut self, key: ThreadKey, _t: Time, dt: Time) {
        let slot = &mut self.slots[key.0];
        if !slot.running {
            // the thread was switched to right as the timer elapsed and is
            // being switched away from again
            slot.running = true;
        }
        slot.stats.ctxsw.push(dt);
    }

    /// The thread was split off the chain and will be resumed later.
    pub fn suspend(&mut self, key: ThreadKey, t: Time) {
        let slot = &mut self.slots[key.0];
        if !slot.running {
            return;
        }
        // only record waiting time once the thread has executed
        slot.stats.wait.push(Vec::new());
        match slot.ready_time {
            Some(ready) => slot.ready_time = Some(ready.max(t)),
            None => assert!(
                slot.stats.finished_time.is_some(),
                "suspended thread '{}' has neither ready nor finished time",
                slot.tid
            ),
        }
    }

    /// The thread rejoins a chain.
    ///
    /// `returning` distinguishes control returning downward to this frame
    /// (after the frames above unwound) from the frame being appended anew.
    pub fn resume(&mut self, key: ThreadKey, t: Time, returning: bool) {
        if returning
            && let ThreadKind::Scheduler(SchedulerSlot { bg, .. })
            | ThreadKind::Vcpu(VcpuSlot { bg, .. }) = &mut self.slots[key.0].kind
        {
            bg.bg_times.push(Vec::new());
        }

        if self.is_finished(key) {
            return;
        }

        if returning {
            self.update_ready_time(key, t);
            return;
        }

        let slot = &mut self.slots[key.0];
        let ready = slot
            .ready_time
            .expect("resume of a thread with no ready time");
        if t >= ready {
            // only record waiting time for threads that were due
            slot.stats.wait.last_mut().expect("wait bucket").push(t - ready);
            slot.stats.run.push(Vec::new());
            slot.ready_time = Some(t);
        }
    }

    /// The thread leaves its chain for good (until restarted).
    pub fn finish(&mut self, key: ThreadKey, t: Time) {
        let slot = &mut self.slots[key.0];
        match &mut slot.kind {
            ThreadKind::Periodic(p) => {
                if let Some(burst_left) = p.current_burst_left {
                    if burst_left.is_zero() && slot.ready_time.is_some() {
                        slot.ready_time = Some(
                            Time::from_integer(Self::activations(p, t)) * p.period
                                + p.original_ready_time,
                        );
                    }
                }
                p.current_burst_left = None;
            }
            ThreadKind::Scheduler(s) => {
                if !s.is_root {
                    s.bg.bg_times.push(Vec::new());
                } else {
                    // the kernel scheduler thread is restarted in place and
                    // already got a fresh bucket from resume()
                    debug_assert!(s.bg.bg_times.last().is_some_and(|b| b.is_empty()));
                }
            }
            ThreadKind::Vcpu(v) => {
                v.bg.bg_times.push(Vec::new());
            }
            ThreadKind::Worker => {}
        }

        let slot = &mut self.slots[key.0];
        assert!(slot.running, "finish on a thread that is not running");
        slot.running = false;
    }

    // ========================================================================
    // STATISTICS
    // ========================================================================

    /// Collect this thread's statistics, recursing through scheduler and
    /// VCPU threads.
    pub fn report(&self, key: ThreadKey, t: Time, modules: &ModuleTable) -> ThreadStatsReport {
        let slot = &self.slots[key.0];

        let mut wait = slot.stats.wait.clone();
        if wait.last().is_some_and(|b| b.is_empty()) {
            wait.pop();
        }

        let waiting = if !self.is_finished(key) {
            // VCPU threads report their own waiting, not the child's
            self.own_ready_time(key)
                .filter(|&ready| t >= ready)
                .map(|ready| t - ready)
        } else {
            None
        };

        let (bg, children, scheduler) = match &slot.kind {
            ThreadKind::Scheduler(s) => {
                let children = s
                    .scheduler
                    .as_ref()
                    .map(|sched| sched.get_thread_statistics(t, self, modules));
                (Some(&s.bg), children, None)
            }
            ThreadKind::Vcpu(v) => {
                let child = &self.slots[v.child_sched.0];
                let mut sched_stats = ThreadStatsMap::new();
                sched_stats.insert(
                    (modules.name(child.module).into(), child.tid.clone()),
                    self.report(v.child_sched, t, modules),
                );
                (Some(&v.bg), None, Some(sched_stats))
            }
            _ => (None, None, None),
        };

        let bg = bg.map(|bg| {
            let mut bg_times = bg.bg_times.clone();
            if bg_times.last().is_some_and(|b| b.is_empty()) {
                bg_times.pop();
            }
            bg_times
        });

        ThreadStatsReport {
            finished_time: slot.stats.finished_time,
            response_time: slot.stats.response_time,
            ctxsw: slot.stats.ctxsw.clone(),
            run: slot.stats.run.clone(),
            total_run: slot.stats.total_run,
            wait,
            waiting,
            remaining: self.effective_remaining(key),
            bg,
            children,
            scheduler,
        }
    }
}
