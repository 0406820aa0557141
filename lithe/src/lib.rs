//! A harmonised, hierarchical user-level scheduling substrate.
//!
//! A process embeds this crate by calling [`lithe_init`] once, registering a root
//! second-level scheduler (2LS) with [`lithe_sched_enter`], and requesting vcores with
//! [`lithe_vcore_request`]. A 2LS implements [`SchedFuncs`] and builds tasks on top of
//! [`Task`]; [`syscall`] is the async-syscall wrapper every task-level blocking call goes
//! through.
//!
//! Layered on [`lithe_vcore`] (the physical vcore pool), [`lithe_uthread`] (stackful
//! coroutines, the event channel, the backing-thread pool), and [`lithe_alarm`] (one-shot
//! timers); [`lithe_sync`] and [`lithe_tls`] are the primitives everything above them is
//! built from.

mod config;
mod dispatch;
mod error;
mod sched;
mod task;

pub mod syscall;

pub use config::{LitheConfig, DEFAULT_TASK_STACK_SIZE};
pub use dispatch::{
    disable_notifs, enable_notifs, lithe_init, lithe_sched_current, lithe_sched_enter,
    lithe_sched_exit, lithe_set_alarm, lithe_shutdown, lithe_task_create, lithe_task_block,
    lithe_task_exit, lithe_task_run, lithe_task_self, lithe_task_unblock, lithe_task_yield,
    lithe_vcore_grant, lithe_vcore_request, lithe_vcore_yield, notifs_enabled,
};
pub use error::LitheError;
pub use sched::{Sched, SchedFuncs};
pub use task::{Task, TaskHandle};

pub use lithe_alarm::AlarmHandle;
pub use lithe_vcore::{in_vcore_context, vcore_id, VcoreId};
