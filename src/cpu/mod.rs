/*
 * CPU
 *
 * The simulation kernel proper: the request protocol between threads and
 * their core, the context chains modelling nested scheduler invocations,
 * and the per-core execution engine.
 */

pub mod context;
pub mod core;
pub mod request;

pub use context::{Chain, Frame};
pub use request::{Reply, Request};
pub use self::core::{Core, CoreParams, MODULE_CTXSW_COST, THREAD_CTXSW_COST, TimerPolicy};
