/*
 * Round-Robin Policy
 *
 * MLFQ already does round robin on its active queue, so round robin is
 * simply MLFQ with a single level and no priority boost.
 */

use crate::scheduler::policies::mlfq::Mlfq;
use crate::time::Time;

/// A round-robin policy with the given time slice.
pub fn round_robin(time_slice: Option<Time>) -> Mlfq {
    Mlfq::new(vec![time_slice], None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::traits::Policy;

    #[test]
    fn test_single_level() {
        let rr = round_robin(Some(Time::from_integer(10)));
        assert_eq!(rr.levels(), 1);
        assert!(rr.uses_time_slices(None));

        let rr = round_robin(None);
        assert!(!rr.uses_time_slices(None));
    }
}
