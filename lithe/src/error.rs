//! Error taxonomy (spec.md §7).
//!
//! Precondition violations (wrong context, base-scheduler misuse) are programming bugs in
//! a 2LS and abort the process via `panic!` rather than being represented here — there is
//! no meaningful recovery with a corrupted scheduler tree. `LitheError` only carries the
//! category spec.md says should propagate as a return code: resource exhaustion.
//! `blocking_syscall` itself returns `io::Result` directly, per spec.md §4.9's "the wrapper
//! does not translate errors" — there is no `LitheError` variant standing in for a syscall
//! failure, since doing so would be exactly that translation.

use custom_error::custom_error;

custom_error! {
    #[derive(Clone)]
    pub LitheError

    TaskAllocation{requested_stack: usize} = "failed to allocate a task with a {requested_stack}-byte stack",
    SchedAllocation = "failed to allocate scheduler node internal data",
}
