//! Async syscall wrapper (spec.md §4 component 10 / §4.9).
//!
//! The template every task-level blocking call goes through: attempt `nonblock_fn` inline;
//! if it reports [`io::ErrorKind::WouldBlock`], package `block_fn` into a job for a backing
//! thread, tell the owning 2LS via [`crate::sched::SchedFuncs::thread_blockon_sysc`], and
//! suspend the task until the result posts back through this vcore's event channel (drained
//! by the dispatcher between steps). Neither closure's errors are translated — same as
//! spec.md's component 10.

use crate::dispatch;
use crate::task::TaskHandle;
use lithe_uthread::BackingJob;
use lithe_vcore::vcore_id;
use std::io;

/// Run a syscall that might block, as a `(nonblock_fn, block_fn)` pair (spec.md §4.9).
///
/// `nonblock_fn` runs once, inline, on the calling task; a genuinely non-blocking attempt
/// (e.g. against an fd in non-blocking mode). Anything other than
/// [`io::ErrorKind::WouldBlock`] — success or a real error — returns immediately.
///
/// On `WouldBlock`, `block_fn` — a separate, genuinely blocking version of the same
/// operation (e.g. the same fd switched to blocking mode, or a blocking variant of the
/// call) — is handed to the backing-thread pool and the task suspends. Before that handoff,
/// the owning 2LS is notified via `thread_blockon_sysc`; the task is only ever marked
/// runnable again afterwards, so it can never observe the result before that notification
/// has happened.
///
/// # Panics
/// If called outside task context, or if the task resumes without a result having been
/// posted (a dispatcher bug, not a caller error).
pub fn blocking_syscall<N, B>(nonblock_fn: N, block_fn: B) -> io::Result<usize>
where
    N: FnOnce() -> io::Result<usize>,
    B: FnOnce() -> io::Result<usize> + Send + 'static,
{
    match nonblock_fn() {
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
        other => return other,
    }

    let task_ptr =
        dispatch::current_task_ptr().expect("blocking_syscall must run in task context");
    let origin_vcore = vcore_id().0;
    let token = task_ptr as usize;

    unsafe { (*task_ptr).sysc.result.set(None) };

    crate::task::suspend_current(Some(move || {
        let owner = unsafe { (*task_ptr).owner() };
        if !owner.is_null() {
            let sched = unsafe { &*owner };
            sched
                .funcs
                .thread_blockon_sysc(sched, TaskHandle(task_ptr));
        }

        dispatch::runtime().pool.submit(BackingJob {
            origin_vcore,
            token,
            run: Box::new(block_fn),
        });
    }));

    unsafe { (*task_ptr).sysc.result.take() }
        .expect("blocking_syscall resumed without a posted result")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_success_skips_the_backing_pool() {
        let result = blocking_syscall(|| Ok(7), || unreachable!("block_fn should not run"));
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn immediate_non_would_block_error_propagates() {
        let result = blocking_syscall(
            || Err(io::Error::from(io::ErrorKind::PermissionDenied)),
            || unreachable!("block_fn should not run"),
        );
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::PermissionDenied);
    }
}
