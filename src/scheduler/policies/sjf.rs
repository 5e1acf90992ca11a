/*
 * Shortest-Job-First Policies
 *
 * SJF keeps the ready list sorted by remaining workload ascending, so the
 * FCFS-style head pick always selects the shortest job. Unbounded threads
 * sort last; ties keep arrival order.
 *
 * PSJF adds preemption: if a waiting thread with less remaining work than
 * the current head will arrive, the slice is shortened to its arrival so
 * the scheduler re-enters in time.
 */

use crate::cpu::context::Chain;
use crate::error::{SimError, SimResult};
use crate::scheduler::data::{LastChainLoc, SchedulerData, base_update_ready_chains};
use crate::scheduler::traits::{Policy, SchedCtx};
use crate::threads::ThreadKey;
use crate::time::Time;

pub struct Sjf;

/// Sorted insertion of freshly ready chains.
///
/// Shared by SJF and PSJF: the base promotion appends new chains at the
/// ready tail; they are re-inserted in ascending order of remaining work,
/// before any unbounded chain, with finished ones diverted.
fn sorted_update_ready_chains(t: Time, data: &mut SchedulerData, ctx: &SchedCtx) {
    let new_start = data.ready.len();
    base_update_ready_chains(t, data, ctx);
    let new_chains = data.ready.split_off(new_start);

    let remaining = |key: ThreadKey| ctx.threads.effective_remaining(key);

    let mut finite: Vec<Chain> = Vec::new();
    for chain in new_chains {
        let bottom = chain.bottom();
        if ctx.threads.is_finished(bottom) {
            data.finished.push(chain);
        } else if remaining(bottom).is_none() {
            // unbounded threads run last
            data.ready.push(chain);
        } else {
            finite.push(chain);
        }
    }
    finite.sort_by_key(|c| remaining(c.bottom()));

    // end of the finite prefix of the ready list
    let mut finite_end = data
        .ready
        .iter()
        .position(|c| remaining(c.bottom()).is_none())
        .unwrap_or(data.ready.len());

    for chain in finite {
        let work = remaining(chain.bottom());
        let idx = data.ready[..finite_end].partition_point(|c| remaining(c.bottom()) <= work);
        data.ready.insert(idx, chain);
        finite_end += 1;
    }
}

fn head_pick(
    data: &SchedulerData,
    default_time_slice: Option<Time>,
) -> (Option<usize>, Option<Time>) {
    if data.ready.is_empty() {
        (None, default_time_slice)
    } else {
        (Some(0), default_time_slice)
    }
}

impl Policy for Sjf {
    fn name(&self) -> &'static str {
        "SJF"
    }

    fn validate(&self, time_slice: Option<Time>) -> SimResult<()> {
        if time_slice.is_some() {
            return Err(SimError::TimeSliceOnFcfs);
        }
        Ok(())
    }

    fn uses_time_slices(&self, _default_time_slice: Option<Time>) -> bool {
        false
    }

    fn update_ready_chains(&self, t: Time, data: &mut SchedulerData, ctx: &SchedCtx) {
        sorted_update_ready_chains(t, data, ctx);
    }

    fn sched_loop(
        &self,
        _t: Time,
        data: &mut SchedulerData,
        _last: &LastChainLoc,
        default_time_slice: Option<Time>,
        _module: &str,
        _ctx: &SchedCtx,
    ) -> SimResult<(Option<usize>, Option<Time>)> {
        Ok(head_pick(data, default_time_slice))
    }
}

/// Preemptive shortest job first.
///
/// Only sets up preemption on reschedule: threads added in between are
/// regarded on the next reschedule but never cause immediate preemption.
pub struct Psjf;

impl Policy for Psjf {
    fn name(&self) -> &'static str {
        "PSJF"
    }

    fn validate(&self, time_slice: Option<Time>) -> SimResult<()> {
        if time_slice.is_some() {
            return Err(SimError::TimeSliceOnFcfs);
        }
        Ok(())
    }

    fn uses_time_slices(&self, _default_time_slice: Option<Time>) -> bool {
        // arms arrival timers
        true
    }

    fn update_ready_chains(&self, t: Time, data: &mut SchedulerData, ctx: &SchedCtx) {
        sorted_update_ready_chains(t, data, ctx);
    }

    fn sched_loop(
        &self,
        t: Time,
        data: &mut SchedulerData,
        _last: &LastChainLoc,
        default_time_slice: Option<Time>,
        _module: &str,
        ctx: &SchedCtx,
    ) -> SimResult<(Option<usize>, Option<Time>)> {
        let (idx, mut time_slice) = head_pick(data, default_time_slice);

        if let Some(head) = idx {
            debug_assert_eq!(head, 0);
            // find the next arrival (ties broken by remaining work)
            let mut next: Option<ThreadKey> = None;
            for chain in &data.waiting {
                let bottom = chain.bottom();
                let better = match next {
                    None => true,
                    Some(best) => {
                        let (rb, rn) = (
                            ctx.threads.effective_ready_time(bottom),
                            ctx.threads.effective_ready_time(best),
                        );
                        rb < rn
                            || (rb == rn
                                && cmp_remaining(
                                    ctx.threads.effective_remaining(bottom),
                                    ctx.threads.effective_remaining(best),
                                ))
                    }
                };
                if better {
                    next = Some(bottom);
                }
            }

            if let Some(next) = next {
                let next_remaining = ctx.threads.effective_remaining(next);
                let head_remaining = ctx.threads.effective_remaining(data.ready[0].bottom());
                let preempts = match (next_remaining, head_remaining) {
                    (Some(n), Some(h)) => n < h,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if preempts {
                    let arrival = ctx
                        .threads
                        .effective_ready_time(next)
                        .expect("waiting thread without ready time");
                    let slice = arrival - t;
                    assert!(slice.is_positive(), "preempting arrival is already due");
                    time_slice = Some(slice);
                }
            }
        }

        Ok((idx, time_slice))
    }
}

/// `a < b` with `None` as infinity.
fn cmp_remaining(a: Option<Time>, b: Option<Time>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a < b,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleTable;
    use crate::threads::{ThreadSpec, ThreadTable};

    fn worker(
        modules: &mut ModuleTable,
        threads: &mut ThreadTable,
        module: crate::module::ModuleId,
        ready_time: i64,
        units: Option<i64>,
    ) -> ThreadKey {
        threads.add_worker(
            modules,
            module,
            ThreadSpec {
                ready_time: Time::from_integer(ready_time),
                units: units.map(Time::from_integer),
                ..ThreadSpec::default()
            },
        )
    }

    #[test]
    fn test_ready_sorted_by_remaining() {
        let mut modules = ModuleTable::new();
        let kernel = modules.add_module("0", None).unwrap();
        let mut threads = ThreadTable::new();

        let long = worker(&mut modules, &mut threads, kernel, 0, Some(30));
        let short = worker(&mut modules, &mut threads, kernel, 0, Some(5));
        let endless = worker(&mut modules, &mut threads, kernel, 0, None);
        let medium = worker(&mut modules, &mut threads, kernel, 0, Some(10));

        let mut data = SchedulerData::new(Sjf.init_data());
        for key in [long, short, endless, medium] {
            data.waiting.push(Chain::from_thread(key, &threads));
        }

        let ctx = SchedCtx { threads: &threads };
        Sjf.update_ready_chains(Time::zero(), &mut data, &ctx);

        let order: Vec<ThreadKey> = data.ready.iter().map(Chain::bottom).collect();
        assert_eq!(order, vec![short, medium, long, endless]);
    }

    #[test]
    fn test_equal_remaining_keeps_arrival_order() {
        let mut modules = ModuleTable::new();
        let kernel = modules.add_module("0", None).unwrap();
        let mut threads = ThreadTable::new();

        let first = worker(&mut modules, &mut threads, kernel, 0, Some(10));
        let second = worker(&mut modules, &mut threads, kernel, 0, Some(10));

        let mut data = SchedulerData::new(Sjf.init_data());
        data.waiting.push(Chain::from_thread(first, &threads));
        data.waiting.push(Chain::from_thread(second, &threads));

        let ctx = SchedCtx { threads: &threads };
        Sjf.update_ready_chains(Time::zero(), &mut data, &ctx);

        let order: Vec<ThreadKey> = data.ready.iter().map(Chain::bottom).collect();
        assert_eq!(order, vec![first, second]);
    }

    #[test]
    fn test_psjf_shortens_slice_for_shorter_arrival() {
        let mut modules = ModuleTable::new();
        let kernel = modules.add_module("0", None).unwrap();
        let mut threads = ThreadTable::new();

        let running = worker(&mut modules, &mut threads, kernel, 0, Some(100));
        let arrival = worker(&mut modules, &mut threads, kernel, 7, Some(3));

        let mut data = SchedulerData::new(Psjf.init_data());
        data.waiting.push(Chain::from_thread(running, &threads));
        data.waiting.push(Chain::from_thread(arrival, &threads));

        let ctx = SchedCtx { threads: &threads };
        Psjf.update_ready_chains(Time::zero(), &mut data, &ctx);
        assert_eq!(data.ready.len(), 1);

        let (idx, slice) = Psjf
            .sched_loop(Time::zero(), &mut data, &LastChainLoc::None, None, "0", &ctx)
            .unwrap();
        assert_eq!(idx, Some(0));
        assert_eq!(slice, Some(Time::from_integer(7)));
    }
}
