/*
 * Universal invariants, checked over randomized workloads and chain
 * shapes.
 */

mod common;

use common::RecordingSink;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use schedtree::cpu::context::Chain;
use schedtree::cpu::CoreParams;
use schedtree::error::SimError;
use schedtree::hierarchy::{HierarchyBuilder, SchedulerSetup};
use schedtree::scheduler::policies::{Mlfq, round_robin};
use schedtree::threads::{ThreadKey, ThreadSpec, ThreadStatsMap, ThreadStatsReport};
use schedtree::time::Time;
use schedtree::world::World;

fn t(units: i64) -> Time {
    Time::from_integer(units)
}

/// A chain of parked frames with the given timeouts.
fn chain_with_timeouts(timeouts: &[Option<i64>]) -> Chain {
    let mut chain = Chain::parked(ThreadKey(0));
    for _ in 1..timeouts.len() {
        chain.append_chain(Chain::parked(ThreadKey(0)));
    }
    for (idx, timeout) in timeouts.iter().enumerate() {
        chain.set_timer(timeout.map(Time::from_integer), Some(idx));
    }
    chain
}

fn frame_timeouts(chain: &Chain) -> Vec<Option<Time>> {
    chain.frames().iter().map(|f| f.timeout).collect()
}

fn collect_reports(stats: &ThreadStatsMap, out: &mut Vec<((String, String), ThreadStatsReport)>) {
    for (key, report) in stats {
        out.push((key.clone(), report.clone()));
        for nested in [&report.children, &report.scheduler].into_iter().flatten() {
            collect_reports(nested, out);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // split then append restores the chain, timers included
    #[test]
    fn prop_split_append_roundtrip(
        timeouts in prop::collection::vec(prop::option::of(1i64..100), 2..6),
        split in 1usize..5,
    ) {
        prop_assume!(split < timeouts.len());

        let mut chain = chain_with_timeouts(&timeouts);
        let before = frame_timeouts(&chain);
        let next_before = chain.next_timeout();

        let tail = chain.split(split);
        chain.append_chain(tail);

        prop_assert_eq!(frame_timeouts(&chain), before);
        prop_assert_eq!(chain.next_timeout(), next_before);
    }

    // set_timer(t) then elapse(d) equals elapse(d) then set_timer(t - d)
    #[test]
    fn prop_elapse_set_timer_commute(
        base in prop::collection::vec(prop::option::of(20i64..100), 1..5),
        timer in 10i64..80,
        delta in 1i64..10,
    ) {
        let mut a = chain_with_timeouts(&base);
        a.set_timer(Some(t(timer)), None);
        a.elapse(t(delta));

        let mut b = chain_with_timeouts(&base);
        b.elapse(t(delta));
        b.set_timer(Some(t(timer - delta)), None);

        prop_assert_eq!(frame_timeouts(&a), frame_timeouts(&b));
        prop_assert_eq!(a.next_timeout(), b.next_timeout());
    }

    // time moves forward, and every unit of it lands in exactly one of the
    // crunch/idle/ctxsw buckets
    #[test]
    fn prop_time_monotone_and_conserved(
        kernel_units in prop::collection::vec(1i64..40, 1..4),
        child_units in prop::collection::vec(1i64..40, 1..4),
        slice in 3i64..12,
    ) {
        let sink = RecordingSink::new();
        let mut builder =
            HierarchyBuilder::new(SchedulerSetup::new(round_robin(Some(t(slice))))).unwrap();
        let kernel = builder.kernel();
        for units in &kernel_units {
            builder.add_worker(kernel, ThreadSpec {
                units: Some(t(*units)),
                ..ThreadSpec::default()
            }).unwrap();
        }
        let child = builder
            .add_module(kernel, None, SchedulerSetup::new(round_robin(Some(t(slice)))))
            .unwrap();
        for units in &child_units {
            builder.add_worker(child, ThreadSpec {
                units: Some(t(*units)),
                ..ThreadSpec::default()
            }).unwrap();
        }

        let mut world =
            World::new(1, builder, Box::new(sink.clone()), CoreParams::default()).unwrap();

        let mut now = Time::zero();
        let final_time = loop {
            match world.step() {
                Ok(stepped) => {
                    prop_assert!(stepped >= now, "time went backwards");
                    now = stepped;
                    if stepped > t(2000) {
                        break stepped;
                    }
                }
                Err(SimError::KernelIdleWithoutTimer) => break now,
                Err(error) => return Err(TestCaseError::fail(format!("{error}"))),
            }
        };

        let stats = world.cpu_statistics()[0];
        let accounted =
            stats.crunch_time + stats.idle_time + stats.thread_time + stats.module_time;
        prop_assert_eq!(accounted, final_time);

        // all the work was delivered
        let total: Time = kernel_units.iter().chain(child_units.iter()).map(|&u| t(u)).sum();
        prop_assert_eq!(stats.crunch_time, total);
    }

    // finish finality: a finished thread ran exactly its workload and its
    // ready time never comes back
    #[test]
    fn prop_finish_finality(
        units in prop::collection::vec(1i64..30, 1..5),
        slice in 2i64..10,
    ) {
        let mut builder =
            HierarchyBuilder::new(SchedulerSetup::new(round_robin(Some(t(slice))))).unwrap();
        let kernel = builder.kernel();
        for u in &units {
            builder.add_worker(kernel, ThreadSpec {
                units: Some(t(*u)),
                ..ThreadSpec::default()
            }).unwrap();
        }
        let mut world = World::new(
            1,
            builder,
            Box::new(RecordingSink::new()),
            CoreParams::default(),
        ).unwrap();

        loop {
            match world.step() {
                Ok(now) if now > t(2000) => break,
                Ok(_) => {}
                Err(SimError::KernelIdleWithoutTimer) => break,
                Err(error) => return Err(TestCaseError::fail(format!("{error}"))),
            }
        }

        let mut reports = Vec::new();
        collect_reports(&world.thread_statistics(), &mut reports);
        for ((module, tid), report) in reports {
            if module == "0" && tid != "0" {
                let index: usize = tid.parse().unwrap();
                prop_assert_eq!(report.remaining, Some(Time::zero()));
                prop_assert_eq!(report.total_run, t(units[index - 1]));
                let run_sum: Time = report.run.iter().flatten().copied().sum();
                prop_assert_eq!(run_sum, report.total_run);
                prop_assert!(report.finished_time.is_some());
                prop_assert!(report.waiting.is_none());
            }
        }
    }
}

// round-robin fairness: with a stable ready set of n chains, each chain
// runs exactly once per n consecutive slices
#[test]
fn test_round_robin_cycles() {
    let sink = RecordingSink::new();
    let mut builder =
        HierarchyBuilder::new(SchedulerSetup::new(round_robin(Some(t(5))))).unwrap();
    let kernel = builder.kernel();
    for _ in 0..3 {
        builder
            .add_worker(
                kernel,
                ThreadSpec {
                    units: Some(t(50)),
                    ..ThreadSpec::default()
                },
            )
            .unwrap();
    }

    let mut world = World::new(1, builder, Box::new(sink.clone()), CoreParams::default()).unwrap();
    let _ = world.run_until(t(140));

    let order: Vec<String> = sink.executions().into_iter().map(|(_, tid, _)| tid).collect();
    // 50 units at 5 per slice and 3 threads: at least 8 full cycles
    assert!(order.len() >= 24);
    for cycle in order.chunks(3).take(8) {
        let mut sorted = cycle.to_vec();
        sorted.sort();
        assert_eq!(sorted, vec!["1", "2", "3"], "uneven cycle {cycle:?}");
    }
}

// MLFQ demotion and priority boost: a chain that consumes its level slice
// drops a level; the boost lifts it back up
#[test]
fn test_mlfq_demotion_and_boost() {
    let sink = RecordingSink::new();
    let mut builder = HierarchyBuilder::new(SchedulerSetup::new(Mlfq::new(
        vec![Some(t(2)), Some(t(4))],
        Some(t(30)),
    )))
    .unwrap();
    let kernel = builder.kernel();
    builder
        .add_worker(
            kernel,
            ThreadSpec {
                units: Some(t(60)),
                ..ThreadSpec::default()
            },
        )
        .unwrap();

    let mut world = World::new(1, builder, Box::new(sink.clone()), CoreParams::default()).unwrap();
    let _ = world.run_until(t(50));

    let runs: Vec<Time> = sink
        .executions()
        .into_iter()
        .map(|(_, _, runtime)| runtime)
        .collect();

    // level 0 slice first, then demoted to the 4-unit level
    assert_eq!(runs[0], t(2));
    assert_eq!(runs[1], t(4));
    assert_eq!(runs[2], t(4));

    // after the 30-unit boost interval the chain runs at level 0 again
    let recorded = sink.recorded();
    let boosted = recorded
        .events
        .iter()
        .zip(recorded.times.iter())
        .any(|(event, at)| {
            matches!(event, common::Ev::Execute { runtime, .. } if *runtime == t(2))
                && *at >= t(30)
        });
    assert!(boosted, "no level-0 slice after the boost interval: {runs:?}");
}
