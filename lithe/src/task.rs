//! Task layer (spec.md §4 component 9, data model `Task`).
//!
//! A `Task` owns a [`lithe_uthread::Uthread`] plus the bookkeeping spec.md's data model
//! calls for: the `finished` flag `lithe_task_exit` sets (read by the yield-callback to
//! decide destroy vs. a normal 2LS `task_yield`), the pending-syscall slot the syscall
//! wrapper (§4.9) uses to hand a completed result back to its caller, and the owning
//! `Sched` node the dispatcher needs to know which 2LS to notify on completion or wakeup.
//!
//! The uthread is boxed rather than inlined. A hijack (§4.4/§4.5) relocates a task's
//! uthread to a different `Task` wrapper *while that uthread's generator is still
//! mid-resume, several stack frames below us* — moving the inline struct would tear the
//! memory a live `&mut` inside `Uthread::run` still points at. Boxing makes the move a
//! single pointer swap that never touches the uthread's own heap allocation.

use crate::error::LitheError;
use crate::sched::Sched;
use lithe_uthread::{uthread_yield, RunResult, ThreadId, Uthread, YieldCallback};
use std::cell::Cell;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_TASK_ID: AtomicUsize = AtomicUsize::new(1);

/// Bookkeeping for one in-flight async syscall a task is waiting on (spec.md §4.9).
pub struct SyscallSlot {
    pub result: Cell<Option<io::Result<usize>>>,
}

impl Default for SyscallSlot {
    fn default() -> Self {
        SyscallSlot {
            result: Cell::new(None),
        }
    }
}

/// `lithe_task_t`: a uthread plus the state the core layers on top of it.
///
/// `uthread` is `None` exactly while this `Task` has been hijacked out from under (its
/// generator and stack moved to a different `Task` — see [`Task::hijack_out`]) and nothing
/// has hijacked a replacement back in yet. A task in that state is never scheduled; only
/// `lithe_sched_enter`/`lithe_sched_exit` ever observe it.
pub struct Task {
    uthread: Option<Box<Uthread>>,
    /// Set by `lithe_task_exit`; read by the dispatcher's yield-callback to decide
    /// destroy vs. a normal 2LS `task_yield` callback.
    pub(crate) finished: Cell<bool>,
    pub(crate) sysc: SyscallSlot,
    /// Nested disable count for asynchronous notifications (spec.md §5: "suppressed by
    /// default"); see [`crate::disable_notifs`] / [`crate::enable_notifs`].
    pub(crate) notif_disable_count: Cell<u32>,
    /// Set when a completion event arrived while notifications were disabled; consumed by
    /// `enable_notifs` to self-notify on the count-to-zero transition (SPEC_FULL.md §12).
    pub(crate) pending_notif: Cell<bool>,
    /// The `Sched` this task belongs to, set once by whichever 2LS creates (or hijack
    /// receives) it. Lets the dispatcher route completion/wakeup events to the right
    /// `task_destroy`/`task_runnable` without every caller threading a `&Sched` through.
    owner: Cell<*const Sched>,
}

/// A stable, `Copy` handle to a [`Task`] — the address the core and 2LS pass around.
/// Never dereferenced across a task's destruction; the 2LS is responsible for not handing
/// a handle to anything after `task_destroy` runs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskHandle(pub(crate) *mut Task);

unsafe impl Send for TaskHandle {}

impl TaskHandle {
    /// # Safety
    /// The task this handle names must still be alive (not yet passed to `task_destroy`).
    pub unsafe fn as_ref(&self) -> &Task {
        &*self.0
    }
}

impl Task {
    /// Build a new task on top of a fresh uthread stack. This is what a 2LS's
    /// `task_create` callback calls to actually allocate the `Task` it returns —
    /// spec.md's "`task_create` is delegated to the current 2LS so the 2LS owns stack and
    /// TLS layout" (§4.2).
    pub fn new<F>(stack_size: usize, tls_capacity: usize, f: F) -> Result<Box<Task>, LitheError>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = ThreadId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
        // Stack allocation is the only fallible step here; a real allocator-backed 2LS
        // would propagate its own `AllocError` through this path.
        let uthread = unsafe { Uthread::new(id, stack_size, tls_capacity, f) };
        // spec.md §5: notifications are suppressed by default, overridable via
        // `LitheConfig::notifs_enabled_by_default`.
        let starts_disabled = !crate::dispatch::runtime().config.notifs_enabled_by_default;
        Ok(Box::new(Task {
            uthread: Some(Box::new(uthread)),
            finished: Cell::new(false),
            sysc: SyscallSlot::default(),
            notif_disable_count: Cell::new(if starts_disabled { 1 } else { 0 }),
            pending_notif: Cell::new(false),
            owner: Cell::new(ptr::null()),
        }))
    }

    /// An empty shell with no uthread of its own, ready to receive one via
    /// [`Task::hijack_in`]. Used only by the sched-enter/exit hijack machinery
    /// (spec.md §4.4/§4.5) — never handed to a 2LS's `task_create`.
    pub(crate) fn shell() -> Box<Task> {
        Box::new(Task {
            uthread: None,
            finished: Cell::new(false),
            sysc: SyscallSlot::default(),
            notif_disable_count: Cell::new(0),
            pending_notif: Cell::new(false),
            owner: Cell::new(ptr::null()),
        })
    }

    pub(crate) fn owner(&self) -> *const Sched {
        self.owner.get()
    }

    pub(crate) fn set_owner(&self, sched: *const Sched) {
        self.owner.set(sched);
    }

    /// Move this task's uthread out, leaving `self` an empty shell. This is the "same
    /// stack, different identity" half of a task hijack: the physical stack and saved
    /// machine state are relocated to a different `Task` object by moving a single heap
    /// pointer, never by copying or touching the uthread's own allocation.
    ///
    /// # Safety
    /// Must only be called on a task that is not concurrently being resumed by anything
    /// other than the call chain currently performing the hijack (the dispatcher's
    /// single-uthread-per-vcore discipline guarantees this in practice).
    pub(crate) unsafe fn hijack_out(&mut self) -> Box<Uthread> {
        self.uthread
            .take()
            .expect("hijacking out a task with no uthread (already hijacked or never set)")
    }

    /// Move a previously hijacked-out uthread into this (empty) task.
    ///
    /// # Safety
    /// `self` must currently hold no uthread.
    pub(crate) unsafe fn hijack_in(&mut self, uthread: Box<Uthread>) {
        assert!(
            self.uthread.is_none(),
            "hijacking into a task that already owns a uthread"
        );
        self.uthread = Some(uthread);
    }

    pub fn id(&self) -> ThreadId {
        self.uthread
            .as_ref()
            .expect("Task::id called on a hijacked-out task")
            .id
    }

    pub(crate) fn run(&mut self) -> RunResult {
        // Raw pointer into the *boxed* uthread's heap allocation, not into `self`: a
        // hijack triggered from inside this very call moves `self.uthread` (the Option
        // slot sitting in `self`), but never the heap memory this pointer targets, so the
        // reference `Uthread::run` holds across the resume stays valid throughout.
        let uthread: *mut Uthread = &mut **self
            .uthread
            .as_mut()
            .expect("Task::run called on a hijacked-out task");
        unsafe { (*uthread).run() }
    }

    /// `lithe_task_gettls`.
    ///
    /// # Safety
    /// `var` must have been reserved against this task's TLS layout and the task must not
    /// be concurrently running elsewhere.
    pub unsafe fn gettls<T: Copy>(&self, var: lithe_tls::TlsVar<T>) -> T {
        self.uthread
            .as_ref()
            .expect("gettls on a hijacked-out task")
            .get_tls_var(var)
    }

    /// `lithe_task_settls`.
    ///
    /// # Safety
    /// See [`Task::gettls`].
    pub unsafe fn settls<T: Copy>(&mut self, var: lithe_tls::TlsVar<T>, value: T) {
        self.uthread
            .as_mut()
            .expect("settls on a hijacked-out task")
            .set_tls_var(var, value);
    }
}

/// The task currently running on this vcore, if any. Distinct from `current_sched`'s
/// vcore-local slot because a task, unlike a scheduler, is addressed by raw pointer rather
/// than a typed hook table — see `dispatch::RUNNING_TASK`.
pub(crate) fn suspend_current<F>(cb: Option<F>)
where
    F: FnOnce() + Send + 'static,
{
    let boxed: Option<YieldCallback> = cb.map(|f| Box::new(f) as YieldCallback);
    uthread_yield(boxed);
}
