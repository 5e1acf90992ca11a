/*
 * Penalizer Addon
 *
 * Tracks how much longer each chain ran than its allotted time slice as a
 * non-positive "niceness". When the policy selects a chain whose niceness
 * is below the tolerance while a less penalized alternative is ready, the
 * decision is blocked and the scheduler runs another round; the blocked
 * chain sits out until the others caught up or the policy insists on it.
 *
 * Niceness values are renormalized so the maximum is always zero.
 */

use std::collections::HashMap;

use crate::cpu::context::Chain;
use crate::scheduler::data::{self, LastChainLoc, SchedulerData};
use crate::scheduler::traits::{Addon, SchedCtx};
use crate::threads::ThreadKey;
use crate::time::Time;

/// Mutable penalizer state, mixed into the scheduler data.
#[derive(Debug, Clone, Default)]
pub struct PenalizerData {
    /// Accumulated overrun per thread, always <= 0.
    pub niceness: HashMap<ThreadKey, Time>,
    /// Threads currently blocked from being scheduled.
    pub sat_out_threads: Vec<ThreadKey>,
    /// The slice the policy allotted to the admitted decision.
    pub last_time_slice: Option<Time>,
}

pub struct Penalizer {
    override_time_slice: Option<Time>,
    tolerance: Time,
}

impl Penalizer {
    /// Create a penalizer blocking chains whose niceness drops below
    /// `tolerance`.
    ///
    /// # Panics
    /// Panics if `tolerance` is positive; niceness never is.
    pub fn new(override_time_slice: Option<Time>, tolerance: Time) -> Penalizer {
        assert!(!tolerance.is_positive(), "tolerance must be <= 0");
        Penalizer {
            override_time_slice,
            tolerance,
        }
    }
}

/// Niceness accounting at round start (shared with the penalizing
/// maximizer).
pub(crate) fn penalizer_start(
    prev_run_time: Option<Time>,
    data: &mut SchedulerData,
    last: &LastChainLoc,
    ctx: &SchedCtx,
) {
    let last_bottom = data::last_chain(data, last).map(Chain::bottom);
    let penalizer = data.addon.penalizer.as_mut().expect("penalizer data missing");

    // the niceness level everything is renormalized against
    let mut reference = Time::zero();

    if let Some(bottom) = last_bottom
        && !penalizer.sat_out_threads.contains(&bottom)
    {
        if ctx.threads.is_finished(bottom) {
            let gone = penalizer.niceness.remove(&bottom);
            if gone.is_some_and(|n| !n.is_negative()) && !penalizer.niceness.is_empty() {
                reference = max_niceness(&penalizer.niceness);
            }
        } else {
            match (penalizer.last_time_slice, prev_run_time) {
                (Some(allotted), Some(prev_run)) if prev_run.is_positive() => {
                    let delta = allotted - prev_run;
                    let niceness = penalizer
                        .niceness
                        .get_mut(&bottom)
                        .expect("scheduled thread without niceness");
                    if delta.is_negative() {
                        *niceness += delta;
                    }
                    reference = *niceness;
                }
                (_, Some(prev_run)) if prev_run.is_zero() => {
                    // ran for nothing: probably blocked by another addon
                    penalizer.sat_out_threads.push(bottom);
                }
                _ => {}
            }
        }
        penalizer.last_time_slice = None;
    }

    // once another chain has run, credit the sat-out threads its run time
    if !penalizer.sat_out_threads.is_empty()
        && let Some(bottom) = last_bottom
        && penalizer.sat_out_threads.last() != Some(&bottom)
        && prev_run_time.is_some_and(|p| p.is_positive())
    {
        let prev_run = prev_run_time.expect("checked above");
        for thread in penalizer.sat_out_threads.clone() {
            let niceness = penalizer
                .niceness
                .get_mut(&thread)
                .expect("sat-out thread without niceness");
            if niceness.is_negative() {
                *niceness += (-*niceness).min(prev_run);
                reference = reference.max(*niceness);
            }
        }
        penalizer.sat_out_threads.clear();
    }

    // shift back so the maximum niceness is zero
    if reference.is_negative() && !penalizer.niceness.is_empty() {
        let shift = max_niceness(&penalizer.niceness);
        for niceness in penalizer.niceness.values_mut() {
            *niceness -= shift;
        }
    }
    debug_assert!(penalizer.niceness.values().all(|n| !n.is_positive()));
    debug_assert!(
        penalizer.niceness.is_empty()
            || penalizer.niceness.values().any(|n| n.is_zero())
    );
}

/// Decision filter (shared with the penalizing maximizer).
pub(crate) fn penalizer_schedule(
    tolerance: Time,
    override_time_slice: Option<Time>,
    idx: Option<usize>,
    time_slice: Option<Time>,
    data: &mut SchedulerData,
    _ctx: &SchedCtx,
) -> (bool, Option<Time>) {
    let Some(idx) = idx else {
        return (true, override_time_slice);
    };

    let bottom = data.ready[idx].bottom();
    let alternatives = data.ready.len() > 1;
    let penalizer = data.addon.penalizer.as_mut().expect("penalizer data missing");

    if penalizer.sat_out_threads.contains(&bottom) {
        // the policy insists on a thread we wanted to stall: let it run
        penalizer.sat_out_threads.clear();
    } else if alternatives && penalizer.niceness[&bottom] < tolerance {
        penalizer.sat_out_threads.push(bottom);
        penalizer.last_time_slice = None;
        return (false, None);
    }

    penalizer.last_time_slice = time_slice;
    (true, override_time_slice)
}

fn max_niceness(niceness: &HashMap<ThreadKey, Time>) -> Time {
    niceness
        .values()
        .copied()
        .max()
        .expect("empty niceness map")
}

impl Addon for Penalizer {
    fn name(&self) -> &'static str {
        "Penalizer"
    }

    fn overrides_time_slice(&self) -> bool {
        true
    }

    fn transmute_data(&self, data: &mut SchedulerData) {
        data.addon.penalizer = Some(PenalizerData::default());
    }

    fn add_thread(&self, data: &mut SchedulerData, thread: ThreadKey, ctx: &SchedCtx) {
        if !ctx.threads.is_finished(thread) {
            let penalizer = data.addon.penalizer.as_mut().expect("penalizer data missing");
            let known = penalizer.niceness.insert(thread, Time::zero());
            assert!(known.is_none(), "thread added twice");
        }
    }

    fn start_schedule(
        &self,
        prev_run_time: Option<Time>,
        data: &mut SchedulerData,
        last: &LastChainLoc,
        ctx: &SchedCtx,
    ) {
        penalizer_start(prev_run_time, data, last, ctx);
    }

    fn schedule(
        &self,
        idx: Option<usize>,
        time_slice: Option<Time>,
        data: &mut SchedulerData,
        ctx: &SchedCtx,
    ) -> (bool, Option<Time>) {
        penalizer_schedule(
            self.tolerance,
            self.override_time_slice,
            idx,
            time_slice,
            data,
            ctx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::context::Chain;
    use crate::module::ModuleTable;
    use crate::scheduler::PolicyData;
    use crate::threads::{ThreadSpec, ThreadTable};

    fn setup(workers: usize) -> (SchedulerData, ThreadTable, Vec<ThreadKey>) {
        let mut modules = ModuleTable::new();
        let kernel = modules.add_module("0", None).unwrap();
        let mut threads = ThreadTable::new();
        let mut data = SchedulerData::new(PolicyData::Queue);
        data.addon.penalizer = Some(PenalizerData::default());

        let mut keys = Vec::new();
        for _ in 0..workers {
            let key = threads.add_worker(
                &mut modules,
                kernel,
                ThreadSpec {
                    units: Some(Time::from_integer(100)),
                    ..ThreadSpec::default()
                },
            );
            data.addon
                .penalizer
                .as_mut()
                .unwrap()
                .niceness
                .insert(key, Time::zero());
            data.ready.push(Chain::from_thread(key, &threads));
            keys.push(key);
        }
        (data, threads, keys)
    }

    #[test]
    fn test_overrun_accrues_niceness() {
        let (mut data, threads, keys) = setup(2);
        let ctx = SchedCtx { threads: &threads };

        // the chain was allotted 9 units but ran 11
        data.addon.penalizer.as_mut().unwrap().last_time_slice = Some(Time::from_integer(9));
        penalizer_start(
            Some(Time::from_integer(11)),
            &mut data,
            &LastChainLoc::Ready(0),
            &ctx,
        );

        let penalizer = data.addon.penalizer.as_ref().unwrap();
        assert_eq!(penalizer.niceness[&keys[0]], Time::from_integer(-2));
        assert_eq!(penalizer.niceness[&keys[1]], Time::zero());
    }

    #[test]
    fn test_penalized_pick_is_blocked() {
        let (mut data, threads, keys) = setup(2);
        let ctx = SchedCtx { threads: &threads };
        data.addon
            .penalizer
            .as_mut()
            .unwrap()
            .niceness
            .insert(keys[0], Time::from_integer(-2));

        let (proceed, _) = penalizer_schedule(Time::zero(), None, Some(0), None, &mut data, &ctx);
        assert!(!proceed);
        assert_eq!(
            data.addon.penalizer.as_ref().unwrap().sat_out_threads,
            vec![keys[0]]
        );

        // picking it again lets it run
        let (proceed, _) = penalizer_schedule(Time::zero(), None, Some(0), None, &mut data, &ctx);
        assert!(proceed);
        assert!(data.addon.penalizer.as_ref().unwrap().sat_out_threads.is_empty());
    }

    #[test]
    fn test_no_block_without_alternatives() {
        let (mut data, threads, keys) = setup(1);
        let ctx = SchedCtx { threads: &threads };
        data.addon
            .penalizer
            .as_mut()
            .unwrap()
            .niceness
            .insert(keys[0], Time::from_integer(-5));

        let (proceed, _) = penalizer_schedule(Time::zero(), None, Some(0), None, &mut data, &ctx);
        assert!(proceed);
    }

    #[test]
    fn test_sat_out_release_credits_run_time() {
        let (mut data, threads, keys) = setup(2);
        let ctx = SchedCtx { threads: &threads };
        {
            let penalizer = data.addon.penalizer.as_mut().unwrap();
            penalizer.niceness.insert(keys[0], Time::from_integer(-2));
            penalizer.sat_out_threads.push(keys[0]);
            penalizer.last_time_slice = Some(Time::from_integer(9));
        }

        // the other chain (index 1 after the veto retry rotated it to the
        // head) ran for its full 9 units
        data.ready.swap(0, 1);
        penalizer_start(
            Some(Time::from_integer(9)),
            &mut data,
            &LastChainLoc::Ready(0),
            &ctx,
        );

        let penalizer = data.addon.penalizer.as_ref().unwrap();
        assert!(penalizer.sat_out_threads.is_empty());
        assert_eq!(penalizer.niceness[&keys[0]], Time::zero());
    }
}
