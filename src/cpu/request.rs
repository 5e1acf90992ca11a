/*
 * CPU Request Protocol
 *
 * A running thread communicates with its CPU only through requests. The CPU
 * answers every request: usually with the current virtual time, and exactly
 * once after a context switch back with the chain that was displaced.
 */

use crate::cpu::context::Chain;
use crate::time::Time;

/// A request to the CPU.
#[derive(Debug)]
pub enum Request {
    /// Ask for the current virtual time. Costs nothing.
    CurrentTime,
    /// Run for up to the given span, `None` meaning "as long as possible".
    /// Execution is always also bounded by the next timer in the chain.
    Execute(Option<Time>),
    /// Yield the top frame; unwind one level.
    Idle,
    /// Arm (or with `None` clear) the current frame's timer.
    Timer(Option<Time>),
    /// Push a chain onto the current chain and continue in its top frame.
    ResumeChain(Chain),
}

impl Request {
    /// Request to get the current time.
    pub fn current_time() -> Request {
        Request::CurrentTime
    }

    /// Request to spend some time executing.
    ///
    /// # Panics
    /// Panics if `amount` is not positive.
    pub fn execute(amount: Option<Time>) -> Request {
        if let Some(amount) = amount {
            assert!(amount.is_positive(), "execute request for {amount} units");
        }
        Request::Execute(amount)
    }

    /// Request to idle.
    pub fn idle() -> Request {
        Request::Idle
    }

    /// Request to set a timer for the current context.
    ///
    /// # Panics
    /// Panics if `timeout` is not positive.
    pub fn timer(timeout: Option<Time>) -> Request {
        if let Some(timeout) = timeout {
            assert!(timeout.is_positive(), "timer request for {timeout} units");
        }
        Request::Timer(timeout)
    }

    /// Request to resume a chain.
    ///
    /// # Panics
    /// Panics if the chain is empty.
    pub fn resume_chain(chain: Chain) -> Request {
        assert!(!chain.is_empty(), "resume of an empty chain");
        Request::ResumeChain(chain)
    }

    /// Whether servicing this request advances virtual time (or switches
    /// context, which is equivalent for the step loop).
    pub fn advances_time(&self) -> bool {
        matches!(
            self,
            Request::Execute(_) | Request::Idle | Request::ResumeChain(_)
        )
    }
}

/// The CPU's answer to a request, fed into the next resumption of the
/// thread's execution state machine.
#[derive(Debug)]
pub enum Reply {
    /// First activation of a frame; nothing to deliver yet.
    Start,
    /// The current virtual time.
    Time(Time),
    /// A displaced previous chain, delivered through the frame's reply
    /// buffer right after a context switch back to it.
    Chain(Chain),
}

impl Reply {
    /// The carried time.
    ///
    /// # Panics
    /// Panics if the reply is not a time: the state machine and the CPU
    /// disagree about the protocol position, which is a bug.
    pub fn expect_time(self) -> Time {
        match self {
            Reply::Time(t) => t,
            other => panic!("expected a time reply, got {other:?}"),
        }
    }

    /// The carried chain.
    ///
    /// # Panics
    /// Panics if the reply carries no chain.
    pub fn expect_chain(self) -> Chain {
        match self {
            Reply::Chain(chain) => chain,
            other => panic!("expected a chain reply, got {other:?}"),
        }
    }
}
