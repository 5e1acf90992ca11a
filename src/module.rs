/*
 * Module Table
 *
 * A module is a named node in the scheduling hierarchy: the kernel at the
 * root, child modules below, each owning a scheduler (driven by a scheduler
 * thread) and a set of work threads.
 *
 * Modules, threads and scheduler threads reference each other cyclically
 * (a VCPU thread in the parent points at the child's scheduler thread, which
 * lives inside the child). Ownership therefore lives in index-addressed
 * tables and all cross-references are plain indices.
 */

use core::fmt;

use crate::error::{SimError, SimResult};
use crate::threads::ThreadKey;

/// Index of a module in the [`ModuleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(pub usize);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Module({})", self.0)
    }
}

/// One node of the hierarchy.
#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub parent: Option<ModuleId>,
    /// The scheduler thread driving this module's scheduler.
    /// Set right after creation, once the thread slot exists.
    pub sched_thread: Option<ThreadKey>,
    pub children: Vec<ModuleId>,
    /// Number of work threads added so far, for automatic thread naming.
    pub num_work_threads: usize,
    /// Number of VCPU registrations, for sanity checks.
    pub num_vcpus: usize,
}

/// All modules of a simulation, indexed by [`ModuleId`].
#[derive(Debug, Default)]
pub struct ModuleTable {
    modules: Vec<Module>,
}

impl ModuleTable {
    pub fn new() -> ModuleTable {
        ModuleTable::default()
    }

    /// Add a module under `parent` (`None` for the kernel).
    ///
    /// Names identify modules in logs and statistics and must be unique.
    pub fn add_module(&mut self, name: &str, parent: Option<ModuleId>) -> SimResult<ModuleId> {
        if self.modules.iter().any(|m| m.name == name) {
            return Err(SimError::DuplicateModuleName(name.into()));
        }

        let id = ModuleId(self.modules.len());
        self.modules.push(Module {
            name: name.into(),
            parent,
            sched_thread: None,
            children: Vec::new(),
            num_work_threads: 0,
            num_vcpus: 0,
        });
        if let Some(parent) = parent {
            self.modules[parent.0].children.push(id);
        }

        log::debug!("[Module] created '{}' ({})", name, id);
        Ok(id)
    }

    pub fn get(&self, id: ModuleId) -> &Module {
        &self.modules[id.0]
    }

    pub fn get_mut(&mut self, id: ModuleId) -> &mut Module {
        &mut self.modules[id.0]
    }

    pub fn name(&self, id: ModuleId) -> &str {
        &self.modules[id.0].name
    }

    pub fn parent(&self, id: ModuleId) -> Option<ModuleId> {
        self.modules[id.0].parent
    }

    pub fn num_children(&self, id: ModuleId) -> usize {
        self.modules[id.0].children.len()
    }

    /// Auto-generated name for the next child of `parent`: "<parent>.<n>".
    pub fn auto_child_name(&self, parent: ModuleId) -> String {
        format!("{}.{}", self.name(parent), self.num_children(parent))
    }

    /// The scheduler thread of a module.
    ///
    /// # Panics
    /// Panics if the module was created outside the hierarchy builder and
    /// never wired up.
    pub fn sched_thread(&self, id: ModuleId) -> ThreadKey {
        self.modules[id.0]
            .sched_thread
            .unwrap_or_else(|| panic!("module '{}' has no scheduler thread", self.name(id)))
    }

    /// Register a VCPU of the parent for `child`.
    ///
    /// Returns the child's scheduler thread, which the VCPU thread wraps.
    pub fn register_vcpu(&mut self, child: ModuleId) -> ThreadKey {
        self.modules[child.0].num_vcpus += 1;
        self.sched_thread(child)
    }

    /// Whether `child` is a direct child of `parent`.
    pub fn is_child_of(&self, child: ModuleId, parent: ModuleId) -> bool {
        self.parent(child) == Some(parent)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ModuleId> + use<> {
        (0..self.modules.len()).map(ModuleId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy_naming() {
        let mut table = ModuleTable::new();
        let kernel = table.add_module("0", None).unwrap();
        assert_eq!(table.auto_child_name(kernel), "0.0");

        let child = table.add_module("0.0", Some(kernel)).unwrap();
        assert_eq!(table.auto_child_name(kernel), "0.1");
        assert!(table.is_child_of(child, kernel));
        assert_eq!(table.parent(kernel), None);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut table = ModuleTable::new();
        table.add_module("0", None).unwrap();
        assert!(matches!(
            table.add_module("0", None),
            Err(SimError::DuplicateModuleName(_))
        ));
    }
}
