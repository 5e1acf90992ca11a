/*
 * schedtree - a discrete-event simulator for hierarchical CPU schedulers.
 *
 * The simulator models a tree of scheduling domains ("modules"): a kernel
 * module at the root, child modules each owning their own scheduler and
 * threads. Synthetic workloads (one-shot, periodic and forever-running
 * threads) are played against configurable policies (round-robin, SJF,
 * PSJF, FCFS, MLFQ, CFS) and composable addons that shape time-slice
 * behavior. The output is a stream of time-ordered events and end-of-run
 * statistics per thread and per CPU.
 *
 * Virtual time is exact: every duration is a rational number, so repeated
 * fractional slices (CFS) never drift.
 *
 * A minimal run:
 *
 *   use schedtree::hierarchy::{HierarchyBuilder, SchedulerSetup};
 *   use schedtree::scheduler::policies::round_robin;
 *   use schedtree::sink::NullSink;
 *   use schedtree::threads::ThreadSpec;
 *   use schedtree::time::Time;
 *   use schedtree::world::World;
 *
 *   let mut builder = HierarchyBuilder::new(SchedulerSetup::new(
 *       round_robin(Some(Time::from_integer(10))),
 *   ))?;
 *   let kernel = builder.kernel();
 *   builder.add_worker(kernel, ThreadSpec {
 *       units: Some(Time::from_integer(25)),
 *       ..ThreadSpec::default()
 *   })?;
 *   let mut world = World::new(1, builder, Box::new(NullSink), Default::default())?;
 *   while world.step()? <= Time::from_integer(400) {}
 */

pub mod cpu;
pub mod error;
pub mod hierarchy;
pub mod module;
pub mod rcu;
pub mod scheduler;
pub mod sink;
pub mod threads;
pub mod time;
pub mod utils;
pub mod world;

pub use cpu::{Core, CoreParams, TimerPolicy};
pub use error::{SimError, SimResult};
pub use hierarchy::{HierarchyBuilder, SchedulerSetup};
pub use module::{ModuleId, ModuleTable};
pub use scheduler::{AddParams, Scheduler};
pub use threads::{ThreadKey, ThreadSpec, ThreadTable};
pub use time::Time;
pub use world::World;
