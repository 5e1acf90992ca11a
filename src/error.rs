/*
 * Simulation Error Taxonomy
 *
 * Two classes of fatal failure are reported as values:
 *
 * - Configuration errors: detected while building the hierarchy or the
 *   world, before any step runs.
 * - Protocol errors: a thread or scheduler issued a request the CPU cannot
 *   honor (e.g. unbounded execution without any timer armed).
 *
 * Invariant violations (corrupted queues, double-acquire of a thread's
 * running flag, appending to a chain with an elapsed timer) are bugs, not
 * states, and panic with a diagnostic instead.
 *
 * RCU compare-and-swap misses are not errors; callers re-snapshot and retry.
 */

use thiserror::Error;

use crate::time::Time;

/// Fatal simulation errors.
#[derive(Debug, Error)]
pub enum SimError {
    // ==================== configuration ====================
    /// PeriodicWork requires `period > burst > 0`.
    #[error("periodic thread '{module}|{tid}': burst {burst} must be positive and below period {period}")]
    PeriodNotAboveBurst {
        module: String,
        tid: String,
        period: Time,
        burst: Time,
    },

    /// CFS shares must be positive for every thread.
    #[error("thread '{module}|{tid}' added with non-positive shares")]
    NonPositiveShares { module: String, tid: String },

    /// FCFS has no notion of a time slice.
    #[error("FCFS does not use a time-slice")]
    TimeSliceOnFcfs,

    /// Module names identify nodes and must be unique.
    #[error("module name '{0}' is already in use")]
    DuplicateModuleName(String),

    /// Only single-core worlds are supported.
    #[error("does not support more than 1 core yet ({0} requested)")]
    UnsupportedCoreCount(usize),

    /// A sub-kernel scheduler would arm timers the CPU policy forbids.
    #[error(
        "module '{module}' schedules with time-slices, which the kernel-only \
         timer policy forbids outside the kernel; wrap it in a time-slice \
         fixer addon"
    )]
    TimerPolicyConflict { module: String },

    // ==================== protocol ====================
    /// Unbounded execute with no timer anywhere in the chain.
    #[error("CPU hang due to unyielding execution without set timer")]
    CpuHang,

    /// The kernel idled without a wake-up timer armed.
    #[error("kernel cannot yield without timeout")]
    KernelIdleWithoutTimer,

    /// A non-kernel frame set a timer under the kernel-only timer policy.
    #[error("received timer request for {timeout} from non-kernel thread {module}|{tid}")]
    NonKernelTimer {
        module: String,
        tid: String,
        timeout: Time,
    },

    /// resume_chain whose bottom is neither same-module nor child-module.
    #[error("switching thread to unrelated module '{to}' from '{from}'")]
    UnrelatedModuleResume { from: String, to: String },

    /// The kernel-only timer policy resumes exactly one thread at a time.
    #[error("resume of a chain of {len} frames under the kernel-only timer policy")]
    ResumeChainTooLong { len: usize },

    /// The base scheduler can only order a single chain.
    #[error("scheduler for module '{module}' cannot make scheduling decision ({ready} chains ready)")]
    AmbiguousDecision { module: String, ready: usize },
}

/// Shorthand for results carrying a [`SimError`].
pub type SimResult<T> = Result<T, SimError>;
