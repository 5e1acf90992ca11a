/*
 * World
 *
 * The outer simulation driver: owns the module and thread tables, the
 * single CPU core and the event sink, validates the configuration, steps
 * the core until the caller's time cutoff and emits the final statistics.
 */

use crate::cpu::{Core, CoreParams, TimerPolicy};
use crate::error::{SimError, SimResult};
use crate::hierarchy::HierarchyBuilder;
use crate::module::{ModuleId, ModuleTable};
use crate::sink::{CpuView, EventSink};
use crate::threads::{CoreStats, ThreadStatsMap, ThreadTable};
use crate::time::Time;

pub struct World {
    modules: ModuleTable,
    threads: ThreadTable,
    kernel: ModuleId,
    cores: Vec<Core>,
    sink: Box<dyn EventSink>,
}

impl World {
    /// Create a world over a finished hierarchy.
    ///
    /// Configuration errors (unsupported core count, a sub-kernel scheduler
    /// arming timers under the kernel-only timer policy) abort here, before
    /// any step runs.
    pub fn new(
        cores: usize,
        hierarchy: HierarchyBuilder,
        sink: Box<dyn EventSink>,
        params: CoreParams,
    ) -> SimResult<World> {
        if cores != 1 {
            // supporting this will take turning the step loop into
            // per-core coroutines
            return Err(SimError::UnsupportedCoreCount(cores));
        }

        let (modules, threads, kernel) = hierarchy.finish()?;

        if params.timer_policy == TimerPolicy::KernelOnly {
            for module in modules.ids() {
                if module == kernel {
                    continue;
                }
                let scheduler = threads.scheduler(modules.sched_thread(module));
                if scheduler.needs_local_timers() {
                    return Err(SimError::TimerPolicyConflict {
                        module: modules.name(module).into(),
                    });
                }
            }
        }

        let core = Core::new(0, modules.sched_thread(kernel), &threads, params);
        log::info!(
            "[World] single core, kernel '{}', {} modules, {} threads",
            modules.name(kernel),
            modules.len(),
            threads.len()
        );

        let mut world = World {
            modules,
            threads,
            kernel,
            cores: vec![core],
            sink,
        };
        for core in &world.cores {
            world.sink.init_core(&CpuView {
                uid: core.uid,
                current_time: core.current_time(),
                chain: core.chain(),
                threads: &world.threads,
                modules: &world.modules,
            });
        }
        Ok(world)
    }

    pub fn kernel(&self) -> ModuleId {
        self.kernel
    }

    pub fn modules(&self) -> &ModuleTable {
        &self.modules
    }

    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    pub fn current_time(&self) -> Time {
        self.cores[0].current_time()
    }

    /// Execute one step and return the core's new virtual time.
    pub fn step(&mut self) -> SimResult<Time> {
        let core = &mut self.cores[0];
        core.execute(&mut self.threads, &self.modules, self.sink.as_mut())?;
        Ok(core.current_time())
    }

    /// Step until virtual time passes `limit`.
    pub fn run_until(&mut self, limit: Time) -> SimResult<Time> {
        loop {
            let now = self.step()?;
            if now > limit {
                return Ok(now);
            }
        }
    }

    /// Per-thread statistics, rooted at the kernel's scheduler thread.
    pub fn thread_statistics(&self) -> ThreadStatsMap {
        let now = self.current_time();
        let sched_thread = self.modules.sched_thread(self.kernel);
        let mut map = ThreadStatsMap::new();
        map.insert(
            (
                self.modules.name(self.kernel).to_string(),
                self.threads.tid(sched_thread).to_string(),
            ),
            self.threads.report(sched_thread, now, &self.modules),
        );
        map
    }

    /// Per-core statistics.
    pub fn cpu_statistics(&self) -> Vec<CoreStats> {
        self.cores.iter().map(Core::statistics).collect()
    }

    /// Emit the end-of-run statistics into the sink.
    pub fn log_statistics(&mut self) {
        let thread_stats = self.thread_statistics();
        let cpu_stats = self.cpu_statistics();
        self.sink.thread_statistics(&thread_stats);
        self.sink.cpu_statistics(&cpu_stats);
    }

    /// Consume the world, returning its sink.
    pub fn into_sink(self) -> Box<dyn EventSink> {
        self.sink
    }
}
