/*
 * Hierarchy Builder
 *
 * Assembles static module hierarchies: a kernel module at the root, child
 * modules with their own schedulers, work threads, and the VCPU bridges
 * that let a parent schedule its children. The builder owns the module and
 * thread tables until finish() hands them to the world.
 *
 * The hierarchy is fixed for the whole run; modules cannot be added while
 * the simulation steps.
 */

use crate::error::SimResult;
use crate::module::{ModuleId, ModuleTable};
use crate::scheduler::{AddParams, Addon, Policy, SchedCtx, Scheduler};
use crate::threads::{ThreadKey, ThreadSpec, ThreadTable};
use crate::time::Time;

/// Configuration of one module's scheduler.
pub struct SchedulerSetup {
    policy: Box<dyn Policy>,
    addon: Option<Box<dyn Addon>>,
    time_slice: Option<Time>,
}

impl SchedulerSetup {
    pub fn new(policy: impl Policy + 'static) -> SchedulerSetup {
        SchedulerSetup {
            policy: Box::new(policy),
            addon: None,
            time_slice: None,
        }
    }

    /// Default time slice handed to the policy.
    pub fn time_slice(mut self, time_slice: Time) -> SchedulerSetup {
        self.time_slice = Some(time_slice);
        self
    }

    pub fn addon(mut self, addon: impl Addon + 'static) -> SchedulerSetup {
        self.addon = Some(Box::new(addon));
        self
    }

    fn build(self, module: ModuleId, name: &str) -> SimResult<Scheduler> {
        Scheduler::new(module, name, self.policy, self.addon, self.time_slice)
    }
}

/// Builder for static hierarchies.
pub struct HierarchyBuilder {
    modules: ModuleTable,
    threads: ThreadTable,
    kernel: ModuleId,
    /// (parent, child, vcpu parameters) for VCPUs not yet created.
    pending_vcpus: Vec<(ModuleId, ModuleId, AddParams)>,
}

impl HierarchyBuilder {
    /// Create a hierarchy with a kernel module named "0".
    pub fn new(kernel_scheduler: SchedulerSetup) -> SimResult<HierarchyBuilder> {
        HierarchyBuilder::with_kernel_name("0", kernel_scheduler)
    }

    pub fn with_kernel_name(
        name: &str,
        kernel_scheduler: SchedulerSetup,
    ) -> SimResult<HierarchyBuilder> {
        let mut builder = HierarchyBuilder {
            modules: ModuleTable::new(),
            threads: ThreadTable::new(),
            kernel: ModuleId(0),
            pending_vcpus: Vec::new(),
        };
        builder.kernel = builder.create_module(name, None, kernel_scheduler)?;
        Ok(builder)
    }

    pub fn kernel(&self) -> ModuleId {
        self.kernel
    }

    fn create_module(
        &mut self,
        name: &str,
        parent: Option<ModuleId>,
        setup: SchedulerSetup,
    ) -> SimResult<ModuleId> {
        let id = self.modules.add_module(name, parent)?;
        let scheduler = setup.build(id, name)?;
        let sched_thread = self
            .threads
            .add_scheduler_thread(&self.modules, id, scheduler);
        self.modules.get_mut(id).sched_thread = Some(sched_thread);
        Ok(id)
    }

    /// Attach a child module. The name is auto-generated ("<parent>.<n>")
    /// when `None`. One VCPU for it is created on [`add_vcpus`].
    ///
    /// [`add_vcpus`]: HierarchyBuilder::add_vcpus
    pub fn add_module(
        &mut self,
        parent: ModuleId,
        name: Option<&str>,
        setup: SchedulerSetup,
    ) -> SimResult<ModuleId> {
        self.add_module_with_params(parent, name, setup, AddParams::default())
    }

    /// Attach a child module whose VCPU carries scheduling parameters
    /// (e.g. CFS shares in the parent).
    pub fn add_module_with_params(
        &mut self,
        parent: ModuleId,
        name: Option<&str>,
        setup: SchedulerSetup,
        vcpu_params: AddParams,
    ) -> SimResult<ModuleId> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.modules.auto_child_name(parent),
        };
        let child = self.create_module(&name, Some(parent), setup)?;
        self.pending_vcpus.push((parent, child, vcpu_params));
        Ok(child)
    }

    /// Hand a new thread to its module's scheduler.
    fn enqueue(&mut self, module: ModuleId, thread: ThreadKey, params: AddParams) -> SimResult<()> {
        let sched_thread = self.modules.sched_thread(module);
        let scheduler = self.threads.take_scheduler(sched_thread);
        let result = {
            let ctx = SchedCtx {
                threads: &self.threads,
            };
            scheduler.add_thread(thread, params, &ctx)
        };
        self.threads.put_scheduler(sched_thread, scheduler);
        result
    }

    /// Add a worker thread.
    pub fn add_worker(&mut self, module: ModuleId, spec: ThreadSpec) -> SimResult<ThreadKey> {
        self.add_worker_with_params(module, spec, AddParams::default())
    }

    pub fn add_worker_with_params(
        &mut self,
        module: ModuleId,
        spec: ThreadSpec,
        params: AddParams,
    ) -> SimResult<ThreadKey> {
        let key = self.threads.add_worker(&mut self.modules, module, spec);
        self.enqueue(module, key, params)?;
        Ok(key)
    }

    /// Add a periodic-work thread.
    pub fn add_periodic(
        &mut self,
        module: ModuleId,
        spec: ThreadSpec,
        period: Time,
        burst: Time,
    ) -> SimResult<ThreadKey> {
        self.add_periodic_with_params(module, spec, period, burst, AddParams::default())
    }

    pub fn add_periodic_with_params(
        &mut self,
        module: ModuleId,
        spec: ThreadSpec,
        period: Time,
        burst: Time,
        params: AddParams,
    ) -> SimResult<ThreadKey> {
        let key = self
            .threads
            .add_periodic(&mut self.modules, module, spec, period, burst)?;
        self.enqueue(module, key, params)?;
        Ok(key)
    }

    /// Create the VCPUs for all attached children.
    ///
    /// VCPUs can be created incrementally while attaching modules; usually
    /// this is called once per module after its work threads, so thread ids
    /// stay stable.
    pub fn add_vcpus(&mut self) -> SimResult<()> {
        for (parent, child, params) in std::mem::take(&mut self.pending_vcpus) {
            let child_sched = self.modules.register_vcpu(child);
            let vcpu = self
                .threads
                .add_vcpu(&mut self.modules, parent, None, child_sched);
            self.enqueue(parent, vcpu, params)?;
        }
        Ok(())
    }

    /// Finalize the hierarchy.
    pub fn finish(mut self) -> SimResult<(ModuleTable, ThreadTable, ModuleId)> {
        self.add_vcpus()?;
        Ok((self.modules, self.threads, self.kernel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::policies::round_robin;

    #[test]
    fn test_builds_nested_hierarchy() {
        let mut builder = HierarchyBuilder::new(
            SchedulerSetup::new(round_robin(Some(Time::from_integer(10)))),
        )
        .unwrap();
        let kernel = builder.kernel();

        builder
            .add_worker(
                kernel,
                ThreadSpec {
                    units: Some(Time::from_integer(50)),
                    ..ThreadSpec::default()
                },
            )
            .unwrap();

        let child = builder
            .add_module(
                kernel,
                None,
                SchedulerSetup::new(round_robin(Some(Time::from_integer(10)))),
            )
            .unwrap();
        builder
            .add_worker(
                child,
                ThreadSpec {
                    units: Some(Time::from_integer(25)),
                    ..ThreadSpec::default()
                },
            )
            .unwrap();

        let (modules, threads, kernel) = builder.finish().unwrap();
        assert_eq!(modules.name(child), "0.0");
        assert_eq!(modules.len(), 2);
        // kernel: scheduler thread + worker + vcpu; child: scheduler + worker
        assert_eq!(threads.len(), 5);
        assert_eq!(modules.parent(child), Some(kernel));
    }
}
