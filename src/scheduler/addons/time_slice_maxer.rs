/*
 * Time-Slice Maximizer Addon
 *
 * Repeats the scheduler's decision until the selected chain has run for at
 * least `time_slice - threshold` units (or finished), absorbing short
 * preemptions. The policy's slice is remembered per decision index and the
 * leftover shrinks with every repeated round.
 */

use std::collections::HashMap;

use crate::scheduler::data::SchedulerData;
use crate::scheduler::traits::{Addon, SchedCtx};
use crate::time::Time;

/// Mutable maximizer state, mixed into the scheduler data.
#[derive(Debug, Clone, Default)]
pub struct MaxerData {
    /// Leftover slice per decision index. `None` repeats without bound.
    pub repeat_time_slices: HashMap<usize, Option<Time>>,
    /// The last decision was discarded; nothing to repeat.
    pub blocked: bool,
}

pub struct TimeSliceMaxer {
    override_time_slice: Option<Time>,
    threshold: Time,
}

impl TimeSliceMaxer {
    /// # Panics
    /// Panics if `threshold` is negative.
    pub fn new(override_time_slice: Option<Time>, threshold: Time) -> TimeSliceMaxer {
        assert!(!threshold.is_negative(), "threshold must be >= 0");
        TimeSliceMaxer {
            override_time_slice,
            threshold,
        }
    }
}

/// Shared repeat logic (also used by the penalizing maximizer).
pub(crate) fn maxer_repeat(
    threshold: Time,
    data: &mut SchedulerData,
    prev_run_time: Option<Time>,
    done: bool,
) -> Option<Option<Time>> {
    let last_idx = data.last_idx?;
    let maxer = data.addon.maxer.as_mut().expect("maxer data missing");

    if maxer.blocked {
        debug_assert!(maxer.repeat_time_slices.is_empty());
        return None;
    }
    if done {
        maxer.repeat_time_slices.remove(&last_idx);
        return None;
    }

    match *maxer.repeat_time_slices.get(&last_idx)? {
        // an unbounded slice is never used up
        None => Some(None),
        Some(slice) => {
            let leftover = slice - prev_run_time.unwrap_or(Time::zero());
            if leftover > threshold {
                maxer.repeat_time_slices.insert(last_idx, Some(leftover));
                Some(Some(leftover))
            } else {
                maxer.repeat_time_slices.remove(&last_idx);
                None
            }
        }
    }
}

impl Addon for TimeSliceMaxer {
    fn name(&self) -> &'static str {
        "TimeSliceMaxer"
    }

    fn overrides_time_slice(&self) -> bool {
        true
    }

    fn transmute_data(&self, data: &mut SchedulerData) {
        data.addon.maxer = Some(MaxerData::default());
    }

    fn repeat(
        &self,
        data: &mut SchedulerData,
        prev_run_time: Option<Time>,
        done: bool,
    ) -> Option<Option<Time>> {
        maxer_repeat(self.threshold, data, prev_run_time, done)
    }

    fn schedule(
        &self,
        idx: Option<usize>,
        time_slice: Option<Time>,
        data: &mut SchedulerData,
        _ctx: &SchedCtx,
    ) -> (bool, Option<Time>) {
        let maxer = data.addon.maxer.as_mut().expect("maxer data missing");
        match idx {
            Some(idx) => {
                if !maxer.repeat_time_slices.contains_key(&idx) {
                    debug_assert!(maxer.repeat_time_slices.is_empty());
                }
                maxer.repeat_time_slices.insert(idx, time_slice);
                maxer.blocked = false;
            }
            None => {
                debug_assert!(maxer.repeat_time_slices.is_empty());
                maxer.blocked = true;
            }
        }
        (true, self.override_time_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::PolicyData;

    fn data_with_decision(idx: usize, slice: Option<i64>) -> SchedulerData {
        let mut data = SchedulerData::new(PolicyData::Queue);
        data.addon.maxer = Some(MaxerData::default());
        data.last_idx = Some(idx);
        data.addon
            .maxer
            .as_mut()
            .unwrap()
            .repeat_time_slices
            .insert(idx, slice.map(Time::from_integer));
        data
    }

    #[test]
    fn test_repeat_consumes_slice() {
        let mut data = data_with_decision(0, Some(10));

        // ran 4 of 10 units: repeat with the leftover 6
        let repeat = maxer_repeat(
            Time::zero(),
            &mut data,
            Some(Time::from_integer(4)),
            false,
        );
        assert_eq!(repeat, Some(Some(Time::from_integer(6))));

        // another 6 units exhaust the slice
        let repeat = maxer_repeat(
            Time::zero(),
            &mut data,
            Some(Time::from_integer(6)),
            false,
        );
        assert_eq!(repeat, None);
        assert!(
            data.addon
                .maxer
                .as_ref()
                .unwrap()
                .repeat_time_slices
                .is_empty()
        );
    }

    #[test]
    fn test_no_repeat_when_done() {
        let mut data = data_with_decision(0, Some(10));
        let repeat = maxer_repeat(
            Time::zero(),
            &mut data,
            Some(Time::from_integer(1)),
            true,
        );
        assert_eq!(repeat, None);
        assert!(
            data.addon
                .maxer
                .as_ref()
                .unwrap()
                .repeat_time_slices
                .is_empty()
        );
    }

    #[test]
    fn test_threshold_stops_small_leftovers() {
        let mut data = data_with_decision(0, Some(10));
        // leftover 2 does not exceed threshold 2: stop repeating
        let repeat = maxer_repeat(
            Time::from_integer(2),
            &mut data,
            Some(Time::from_integer(8)),
            false,
        );
        assert_eq!(repeat, None);
    }
}
