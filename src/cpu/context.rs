/*
 * Context Frames and Chains
 *
 * A frame is one entry of the nested-scheduler stack on a CPU: the thread,
 * its resumable execution state, a per-frame timer and a one-slot reply
 * buffer. A chain is the bottom-to-top stack of frames for one scheduling
 * path; the bottom of the CPU's chain is always the kernel's scheduler
 * thread.
 *
 * The chain keeps the index of the frame holding the smallest non-null
 * timeout (ties broken towards the bottom) up to date across every mutation,
 * so the CPU can answer "when does the next timer fire" in O(1).
 *
 * Chains are owned values here: when a scheduler hands a chain to the CPU to
 * run, the chain moves out of the scheduler's queue and a parked single-frame
 * placeholder (preserving the bottom thread for reclassification) stands in
 * until the chain is handed back.
 */

use crate::threads::{ExecState, ThreadKey, ThreadTable};
use crate::time::Time;

/// One entry of a context chain.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The thread this frame executes.
    pub thread: ThreadKey,
    /// Resumable execution state of the thread's run loop.
    pub exec: ExecState,
    /// Whether the execution state has been stepped at least once.
    pub started: bool,
    /// Local timer of this frame; `None` means unarmed.
    pub timeout: Option<Time>,
    /// One-slot reply buffer, used to inject a displaced chain into a
    /// just-switched-to frame.
    pub buffer: Option<Chain>,
}

impl Frame {
    /// Create a fresh frame for `thread`.
    pub fn new(thread: ThreadKey, exec: ExecState) -> Frame {
        Frame {
            thread,
            exec,
            started: false,
            timeout: None,
            buffer: None,
        }
    }

    /// Inject a reply for the next resumption.
    ///
    /// # Panics
    /// Panics when overwriting a pending reply (clearing is always allowed)
    /// or when replying to a frame that never ran.
    pub fn reply(&mut self, chain: Option<Chain>) {
        assert!(self.started, "can't reply to a just-started context");
        assert!(
            self.buffer.is_none() || chain.is_none(),
            "cannot overwrite reply"
        );
        self.buffer = chain;
    }
}

/// The stack of frames for a scheduling chain.
///
/// May be a partial chain, i.e. the bottom is not necessarily the kernel.
#[derive(Debug, Clone)]
pub struct Chain {
    frames: Vec<Frame>,
    /// Index of the frame with the smallest non-null timeout, if any.
    next_timeout_idx: Option<usize>,
}

impl Chain {
    /// Create a chain from a single frame.
    pub fn from_frame(frame: Frame) -> Chain {
        Chain {
            frames: vec![frame],
            next_timeout_idx: None,
        }
    }

    /// Create a chain with a fresh frame for `thread`.
    pub fn from_thread(thread: ThreadKey, threads: &ThreadTable) -> Chain {
        Chain::from_frame(Frame::new(thread, threads.new_exec_state(thread)))
    }

    /// Create a parked placeholder chain for `bottom`.
    ///
    /// Parked chains hold a queue slot while the real chain runs on the CPU;
    /// they are never executed.
    pub fn parked(bottom: ThreadKey) -> Chain {
        Chain::from_frame(Frame::new(bottom, ExecState::Parked))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The current (top) frame.
    pub fn current(&self) -> &Frame {
        self.frames.last().expect("empty chain")
    }

    pub fn current_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("empty chain")
    }

    /// The bottom thread.
    pub fn bottom(&self) -> ThreadKey {
        self.frames[0].thread
    }

    /// The top thread.
    pub fn top(&self) -> ThreadKey {
        self.current().thread
    }

    /// The thread at `idx`, bottom first.
    pub fn thread_at(&self, idx: usize) -> ThreadKey {
        self.frames[idx].thread
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut [Frame] {
        &mut self.frames
    }

    /// The next timeout in the chain, if any frame has a timer armed.
    pub fn next_timeout(&self) -> Option<Time> {
        self.next_timeout_idx.map(|idx| {
            self.frames[idx]
                .timeout
                .expect("next_timeout_idx points at an unarmed frame")
        })
    }

    /// Recompute the cached index of the smallest timeout.
    fn refresh_timeout(&mut self) {
        let mut best: Option<(Time, usize)> = None;
        for (idx, frame) in self.frames.iter().enumerate() {
            if let Some(timeout) = frame.timeout {
                // strict comparison keeps the lowest index on ties
                if best.is_none_or(|(t, _)| timeout < t) {
                    best = Some((timeout, idx));
                }
            }
        }
        self.next_timeout_idx = best.map(|(_, idx)| idx);
    }

    /// Append another chain on top.
    ///
    /// Timer state of the appended frames is preserved.
    pub fn append_chain(&mut self, tail: Chain) {
        if let (Some(tail_timeout), tail_idx) = (tail.next_timeout(), tail.next_timeout_idx) {
            let own = self.next_timeout();
            if own.is_none_or(|t| tail_timeout < t) {
                self.next_timeout_idx = Some(tail_idx.expect("tail timeout without index") + self.len());
            }
        }
        self.frames.extend(tail.frames);
    }

    /// Set the timeout of the frame at `idx` (the top when `None`).
    pub fn set_timer(&mut self, timeout: Option<Time>, idx: Option<usize>) {
        let idx = idx.unwrap_or(self.frames.len() - 1);
        self.frames[idx].timeout = timeout;
        self.refresh_timeout();
    }

    /// Elapse all timers in the chain by `time`.
    ///
    /// If the chain's next timeout has already elapsed (a context switch
    /// overran it), only the frames up to and including that one are charged;
    /// deeper timers stay frozen until the interrupt is serviced.
    pub fn elapse(&mut self, time: Time) {
        let Some(timeout_idx) = self.next_timeout_idx else {
            // no time to count down then
            return;
        };
        assert!(!self.frames.is_empty());

        let elapsed = !self.next_timeout().expect("armed chain").is_positive();

        for (idx, frame) in self.frames.iter_mut().enumerate().take(timeout_idx + 1) {
            if let Some(timeout) = &mut frame.timeout {
                assert!(timeout.is_positive() || idx == timeout_idx);
                *timeout -= time;
            }
        }

        if elapsed {
            return;
        }

        for frame in self.frames.iter_mut().skip(timeout_idx + 1) {
            if let Some(timeout) = &mut frame.timeout {
                assert!(timeout.is_positive());
                *timeout -= time;
            }
        }
    }

    /// Index of the first elapsed timer.
    ///
    /// # Panics
    /// Panics if no timer has elapsed.
    pub fn find_elapsed_timer(&self) -> usize {
        assert!(
            self.next_timeout().is_some_and(|t| !t.is_positive()),
            "no elapsed timer in the chain"
        );
        self.next_timeout_idx.expect("checked above")
    }

    /// Split the chain in two at `idx`.
    ///
    /// The instance keeps the frames up to and excluding `idx`; the tail is
    /// returned with its timer bookkeeping intact.
    pub fn split(&mut self, idx: usize) -> Chain {
        assert!(idx > 0 && idx <= self.len(), "index for split is out of bounds");

        let tail_timeout_idx = self
            .next_timeout_idx
            .filter(|&nti| idx <= nti)
            .map(|nti| nti - idx);

        let tail = Chain {
            frames: self.frames.split_off(idx),
            next_timeout_idx: tail_timeout_idx,
        };

        if tail_timeout_idx.is_some() {
            self.refresh_timeout();
        }

        tail
    }

    /// Call `finish` on every thread in the chain.
    pub fn finish(&self, current_time: Time, threads: &mut ThreadTable) {
        for frame in &self.frames {
            threads.finish(frame.thread, current_time);
        }
    }

    /// Charge `time` as background to every frame except the top.
    pub fn run_background(&self, current_time: Time, time: Time, threads: &mut ThreadTable) {
        for frame in &self.frames[..self.frames.len().saturating_sub(1)] {
            threads.run_background(frame.thread, current_time, time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_of(timeouts: &[Option<i64>]) -> Chain {
        let mut frames = Vec::new();
        for timeout in timeouts {
            let mut frame = Frame::new(ThreadKey(0), ExecState::Parked);
            frame.timeout = timeout.map(Time::from_integer);
            frames.push(frame);
        }
        let mut chain = Chain {
            frames,
            next_timeout_idx: None,
        };
        chain.refresh_timeout();
        chain
    }

    #[test]
    fn test_next_timeout_tie_break() {
        let chain = chain_of(&[Some(5), None, Some(5), Some(7)]);
        assert_eq!(chain.next_timeout_idx, Some(0));
        assert_eq!(chain.next_timeout(), Some(Time::from_integer(5)));
    }

    #[test]
    fn test_elapse_counts_all_armed_frames() {
        let mut chain = chain_of(&[Some(10), None, Some(4)]);
        chain.elapse(Time::from_integer(3));
        assert_eq!(chain.frames()[0].timeout, Some(Time::from_integer(7)));
        assert_eq!(chain.frames()[2].timeout, Some(Time::from_integer(1)));
        assert_eq!(chain.next_timeout(), Some(Time::from_integer(1)));
    }

    #[test]
    fn test_elapse_freezes_past_elapsed_timer() {
        let mut chain = chain_of(&[Some(-1), Some(4)]);
        // frame 0 already elapsed; charging more must not touch frame 1
        chain.elapse(Time::from_integer(2));
        assert_eq!(chain.frames()[0].timeout, Some(Time::from_integer(-3)));
        assert_eq!(chain.frames()[1].timeout, Some(Time::from_integer(4)));
    }

    #[test]
    fn test_split_and_append_roundtrip() {
        let mut chain = chain_of(&[Some(10), Some(3), Some(8)]);
        let tail = chain.split(1);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.next_timeout(), Some(Time::from_integer(10)));
        assert_eq!(tail.len(), 2);
        assert_eq!(tail.next_timeout(), Some(Time::from_integer(3)));

        chain.append_chain(tail);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.next_timeout_idx, Some(1));
        assert_eq!(chain.next_timeout(), Some(Time::from_integer(3)));
    }

    #[test]
    fn test_set_timer_then_elapse_commutes() {
        // set_timer(t); elapse(d) == elapse(d); set_timer(t - d) for d < t
        let mut a = chain_of(&[Some(10), None]);
        a.set_timer(Some(Time::from_integer(6)), None);
        a.elapse(Time::from_integer(2));

        let mut b = chain_of(&[Some(10), None]);
        b.elapse(Time::from_integer(2));
        b.set_timer(Some(Time::from_integer(4)), None);

        assert_eq!(a.frames()[1].timeout, b.frames()[1].timeout);
        assert_eq!(a.next_timeout(), b.next_timeout());
    }

    #[test]
    fn test_find_elapsed_timer() {
        let mut chain = chain_of(&[Some(2), Some(1)]);
        chain.elapse(Time::from_integer(1));
        assert_eq!(chain.find_elapsed_timer(), 1);
    }
}
