//! Sched tree (spec.md §4 component 8, data model `Sched`).
//!
//! Parent/child pointers are resolved the way spec.md's design notes suggest: a node is a
//! stable, heap-allocated, never-moved address (`Box::into_raw` on enter, `Box::from_raw`
//! on exit), the parent link is a non-owning raw pointer, and "children" collapses to a
//! single spinlock-guarded optional child pointer, since spec.md's own invariant — "each
//! node has zero or one child currently entered" — means the fuller intrusive list the
//! locking-discipline section alludes to never needs more than one slot in practice.

use crate::error::LitheError;
use crate::task::{Task, TaskHandle};
use lithe_sync::{AtomicCounter, SpinMutex};
use std::ptr;

/// The 2LS callback table (spec.md §4.8). A 2LS implements this once for its own runtime
/// state (`Self` is typically the 2LS's scheduler struct) and hands an instance to
/// [`crate::lithe_sched_enter`].
pub trait SchedFuncs: Send + Sync {
    /// Decide how to satisfy a request for `k` more vcores directed at this node (`me`):
    /// grant from vcores this scheduler already holds idle, or relay upward by calling
    /// `me.parent().funcs.vcore_request(parent, k)`. Runs in vcore context.
    fn vcore_request(&self, me: &Sched, k: usize) -> usize;

    /// Must run a task, grant to a child, or yield before returning — spec.md's "never
    /// return" contract is a usage discipline here, not an enforced `-> !`: falling off
    /// the end without doing one of those three leaves the vcore idle until the next
    /// external event, which is a 2LS bug but not unsound.
    fn vcore_enter(&self, me: &Sched);

    /// A child yielded a vcore back; typically re-grant it or yield it further up.
    fn vcore_return(&self, me: &Sched, child: &Sched);

    fn child_entered(&self, me: &Sched, child: &Sched);
    fn child_exited(&self, me: &Sched, child: &Sched);

    fn task_create(&self, me: &Sched, udata: usize) -> Result<Box<Task>, LitheError>;
    fn task_destroy(&self, me: &Sched, task: Box<Task>);
    fn task_runnable(&self, me: &Sched, task: TaskHandle);
    fn task_yield(&self, me: &Sched, task: TaskHandle);

    /// Notifies the 2LS that `task` is about to be handed to a backing thread for a
    /// blocking syscall (spec.md §4.9's "informs the 2LS via `thread_blockon_sysc`").
    /// Purely informational — `task_runnable` is what actually makes the task runnable
    /// again once the syscall completes — so the default is a no-op for 2LSes that don't
    /// care to track it.
    fn thread_blockon_sysc(&self, _me: &Sched, _task: TaskHandle) {}
}

pub(crate) struct Idata {
    pub(crate) vcores: AtomicCounter,
    pub(crate) parent: *const Sched,
    /// The task in the parent from which `lithe_sched_enter` occurred; `lithe_sched_exit`
    /// resumes it. Null (never read) for the base scheduler.
    pub(crate) parent_task: *mut Task,
    pub(crate) child: SpinMutex<*const Sched>,
}

/// A node in the scheduler tree.
pub struct Sched {
    pub funcs: Box<dyn SchedFuncs>,
    pub(crate) idata: Box<Idata>,
}

unsafe impl Send for Sched {}
unsafe impl Sync for Sched {}

impl Sched {
    pub(crate) fn new_child(
        funcs: Box<dyn SchedFuncs>,
        parent: *const Sched,
        parent_task: *mut Task,
    ) -> Box<Sched> {
        Box::new(Sched {
            funcs,
            idata: Box::new(Idata {
                vcores: AtomicCounter::new(0),
                parent,
                parent_task,
                child: SpinMutex::new(ptr::null()),
            }),
        })
    }

    pub fn vcores(&self) -> usize {
        self.idata.vcores.read()
    }

    pub fn parent(&self) -> Option<&Sched> {
        if self.idata.parent.is_null() {
            None
        } else {
            Some(unsafe { &*self.idata.parent })
        }
    }

    fn child_ptr(&self) -> *const Sched {
        *self.idata.child.lock()
    }

    pub fn child(&self) -> Option<&Sched> {
        let p = self.child_ptr();
        if p.is_null() {
            None
        } else {
            Some(unsafe { &*p })
        }
    }

    pub(crate) fn set_child(&self, child: *const Sched) {
        *self.idata.child.lock() = child;
    }

    pub(crate) fn clear_child(&self) {
        *self.idata.child.lock() = ptr::null();
    }
}

/// The base scheduler: spec.md §3's sentinel, §6's "only fixed protocol."
///
/// Grants every incoming vcore to the single registered root child; refuses to ever have
/// tasks of its own; tracks exactly one root via `child_entered`/`child_exited`.
pub(crate) struct BaseFuncs;

impl SchedFuncs for BaseFuncs {
    fn vcore_request(&self, _me: &Sched, k: usize) -> usize {
        crate::dispatch::runtime().vcores.request(k)
    }

    fn vcore_enter(&self, me: &Sched) {
        match me.child() {
            Some(child) => {
                log::debug!("base: granting vcore to root 2LS");
                crate::dispatch::grant_vcore(child);
            }
            None => {
                log::debug!("base: no root registered, parking vcore");
                crate::dispatch::request_park();
            }
        }
    }

    fn vcore_return(&self, _me: &Sched, _child: &Sched) {
        log::debug!("base: vcore returned from root, parking it");
        crate::dispatch::request_park();
    }

    fn child_entered(&self, _me: &Sched, child: &Sched) {
        log::info!("base: root 2LS registered");
        assert!(
            ROOT_ENTERED.lock_and_check(),
            "base scheduler misuse: a second root entered while one was already registered"
        );
        let _ = child;
    }

    fn child_exited(&self, _me: &Sched, _child: &Sched) {
        log::info!("base: root 2LS unregistered");
        ROOT_ENTERED.clear();
    }

    fn task_create(&self, _me: &Sched, _udata: usize) -> Result<Box<Task>, LitheError> {
        panic!("base scheduler misuse: base never creates tasks")
    }

    fn task_destroy(&self, _me: &Sched, _task: Box<Task>) {
        panic!("base scheduler misuse: base never destroys tasks")
    }

    fn task_runnable(&self, _me: &Sched, _task: TaskHandle) {
        panic!("base scheduler misuse: base has no tasks to make runnable")
    }

    fn task_yield(&self, _me: &Sched, _task: TaskHandle) {
        panic!("base scheduler misuse: base has no tasks to yield")
    }
}

/// Tracks the single-root invariant (spec.md testable property 2) independent of the
/// `child` pointer itself, which is cleared and set across the exact same calls — this
/// exists purely so `child_entered` can assert "at most one child of base" even in the
/// brief window where `set_child`/`clear_child` and this bookkeeping aren't the same
/// atomic step.
struct RootGuard(SpinMutex<bool>);

impl RootGuard {
    const fn new() -> Self {
        RootGuard(SpinMutex::new(false))
    }

    fn lock_and_check(&self) -> bool {
        let mut entered = self.0.lock();
        if *entered {
            false
        } else {
            *entered = true;
            true
        }
    }

    fn clear(&self) {
        *self.0.lock() = false;
    }
}

static ROOT_ENTERED: RootGuard = RootGuard::new();

pub(crate) fn new_base() -> Sched {
    Sched {
        funcs: Box::new(BaseFuncs),
        idata: Box::new(Idata {
            vcores: AtomicCounter::new(0),
            parent: ptr::null(),
            parent_task: ptr::null_mut(),
            child: SpinMutex::new(ptr::null()),
        }),
    }
}
