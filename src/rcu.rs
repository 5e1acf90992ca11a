/*
 * RCU Cell
 *
 * Every scheduler keeps its mutable state (ready/waiting/finished queues and
 * policy bookkeeping) in one of these cells. Readers take a snapshot copy,
 * mutate it freely, and compare-and-swap it back; a version stamp detects
 * concurrent updates. Under the current single-threaded world the swap never
 * fails, but callers are written against the retry contract so a multi-CPU
 * world can extend the protocol without touching them.
 *
 * The interior is a spin::Mutex: updates are short and never block on I/O.
 */

use spin::Mutex;

struct Inner<T> {
    uid: u64,
    data: T,
}

/// Snapshot-copy + compare-and-swap container.
pub struct Rcu<T: Clone> {
    inner: Mutex<Inner<T>>,
}

/// A stamped snapshot of RCU data.
///
/// The contained [`data`](RcuCopy::data) can be freely modified and written
/// back via [`Rcu::update`].
#[derive(Debug, Clone)]
pub struct RcuCopy<T> {
    uid: u64,
    pub data: T,
}

impl<T: Clone> Rcu<T> {
    /// Create a cell around `data`.
    pub fn new(data: T) -> Rcu<T> {
        Rcu {
            inner: Mutex::new(Inner { uid: 0, data }),
        }
    }

    /// Obtain a stamped snapshot of the contained data.
    pub fn copy(&self) -> RcuCopy<T> {
        let inner = self.inner.lock();
        RcuCopy {
            uid: inner.uid,
            data: inner.data.clone(),
        }
    }

    /// Return a snapshot of the contained data without the stamp.
    pub fn read(&self) -> T {
        self.inner.lock().data.clone()
    }

    /// Write a snapshot back.
    ///
    /// Succeeds iff the cell was not updated since the snapshot was taken.
    /// On failure the caller should take a fresh copy, reapply its
    /// modifications and try again.
    pub fn update(&self, new: RcuCopy<T>) -> bool {
        let mut inner = self.inner.lock();
        if inner.uid != new.uid {
            return false;
        }
        inner.data = new.data;
        inner.uid = inner.uid.wrapping_add(1);
        true
    }

    /// Apply an exclusive in-place transformation.
    pub fn apply<R>(&self, updater: impl FnOnce(&mut T) -> R) -> R {
        let mut inner = self.inner.lock();
        let ret = updater(&mut inner.data);
        inner.uid = inner.uid.wrapping_add(1);
        ret
    }

    /// Apply a read-only view function.
    pub fn look<R>(&self, looker: impl FnOnce(&T) -> R) -> R {
        looker(&self.inner.lock().data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_update() {
        let rcu = Rcu::new(vec![1, 2, 3]);

        let mut copy = rcu.copy();
        copy.data.push(4);
        assert!(rcu.update(copy));
        assert_eq!(rcu.read(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_stale_copy_rejected() {
        let rcu = Rcu::new(0u32);

        let stale = rcu.copy();
        let mut fresh = rcu.copy();
        fresh.data = 1;
        assert!(rcu.update(fresh));

        // the earlier stamp no longer matches
        assert!(!rcu.update(stale));
        assert_eq!(rcu.read(), 1);
    }

    #[test]
    fn test_apply_and_look() {
        let rcu = Rcu::new(10u32);
        rcu.apply(|v| *v += 5);
        assert_eq!(rcu.look(|v| *v), 15);

        // apply bumps the stamp, invalidating snapshots taken before
        let copy = rcu.copy();
        rcu.apply(|v| *v += 1);
        assert!(!rcu.update(copy));
    }
}
