//! Uthread layer, event channel, and backing-thread pool (spec.md §4 components 4-6).
//!
//! This crate is usable on its own (as `lineup` is, in the teacher repo, independent of
//! any particular kernel) — it only knows about stackful coroutines, TLS, and how to
//! bounce a blocking call off a worker thread. The `lithe` crate builds the `Task`
//! abstraction, hijacking, and the scheduler tree on top of it.

mod context;
mod event;
mod pool;
mod stack;

pub use context::{
    in_uthread_context, reserve_tls, uthread_yield, RunResult, ThreadId, Uthread, YieldCallback,
    UTHREAD_TLS_LAYOUT,
};
pub use event::{EventChannel, EventChannels, SyscallEvent, SyscallToken};
pub use pool::{BackingJob, BackingPool};
pub use stack::UthreadStack;
