//! The dispatcher (spec.md §4.1): global runtime state, the per-vcore priority loop, and
//! every sched-tree/task protocol function a 2LS calls into.
//!
//! Spec.md's entry priority — resume a current uthread, else start a waiting task, else
//! run a pending yield-callback ("next_func"), else call the current scheduler's
//! `vcore_enter` — is the [`step`] function below. "Must not return" for `vcore_enter` is
//! a usage discipline (see `sched.rs`), satisfied here by looping: a callback that wants
//! to hand the vcore further down just changes `current_sched` (or `next_task`,
//! `next_func`) and returns; [`step`] notices on its next iteration instead of recursing.

use crate::config::LitheConfig;
use crate::error::LitheError;
use crate::sched::{self, Sched};
use crate::task::{Task, TaskHandle};
use lithe_alarm::AlarmHandle;
use lithe_uthread::{uthread_yield, BackingPool, EventChannels, RunResult};
use lithe_vcore::{in_vcore_context, VcoreId, VcorePool, DEFAULT_VCORE_TLS_CAPACITY};
use lithe_tls::TlsVar;
use spin::RwLock;
use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

/// Everything the dispatcher needs that outlives any single vcore or task: the physical
/// vcore pool, the syscall-completion event channels, the backing-thread pool, and the
/// three vcore-local TLS slots spec.md's design notes call out (`current_sched`,
/// `next_task`; `next_func` instead lives in a native `thread_local!` below, since it is
/// not `Copy`).
pub struct Runtime {
    pub(crate) vcores: VcorePool,
    pub(crate) events: Arc<EventChannels>,
    pub(crate) pool: BackingPool,
    pub(crate) config: LitheConfig,
    base: *const Sched,
    tls_current_sched: TlsVar<*const Sched>,
    tls_next_task: TlsVar<*mut Task>,
}

// Safety: every field is either `Sync` itself or a raw pointer to heap state that outlives
// the runtime and is only ever mutated through the narrow, serialising accessors below.
unsafe impl Send for Runtime {}
unsafe impl Sync for Runtime {}

lazy_static::lazy_static! {
    static ref RUNTIME: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);
}

thread_local! {
    /// A boxed closure to run once, in vcore context, before anything else — spec.md's
    /// "next_func" slot. Not `Copy`, so it lives in native TLS rather than the
    /// `lithe_vcore` facility the `Copy` slots use.
    static NEXT_FUNC: RefCell<Option<Box<dyn FnOnce() + Send>>> = RefCell::new(None);
    /// The task currently resumed on this OS thread, if any. Consulted by
    /// `current_task_ptr` — everything that needs "am I running as a task, and which one"
    /// reads this rather than threading a handle through every call.
    static RUNNING_TASK: Cell<*mut Task> = Cell::new(ptr::null_mut());
    /// Set by [`request_park`] to tell this vcore's dispatch loop to let its `EntryFn`
    /// return, handing the physical vcore back to the pool (spec.md's "external
    /// vcore-yield").
    static PARK_REQUESTED: Cell<bool> = Cell::new(false);
}

pub(crate) fn runtime() -> Arc<Runtime> {
    RUNTIME
        .read()
        .clone()
        .expect("lithe: runtime not initialized; call lithe_init() first")
}

/// Bring the substrate up: size the vcore pool, the backing-thread pool, and the event
/// channels from `config`, and register the dispatcher's upcall with the vcore layer.
/// Must be called exactly once, before `lithe_sched_enter`.
pub fn lithe_init(config: LitheConfig) {
    let mut guard = RUNTIME.write();
    assert!(guard.is_none(), "lithe: lithe_init called more than once");

    let max_vcores = config.max_vcores;
    let events = Arc::new(EventChannels::new(max_vcores));
    let pool = BackingPool::new(config.backing_threads, events.clone());
    let vcores = VcorePool::new(max_vcores, DEFAULT_VCORE_TLS_CAPACITY, vcore_entry_upcall);

    let tls_current_sched = vcores.reserve_tls::<*const Sched>();
    let tls_next_task = vcores.reserve_tls::<*mut Task>();

    let base = Box::into_raw(Box::new(sched::new_base()));

    *guard = Some(Arc::new(Runtime {
        vcores,
        events,
        pool,
        config,
        base,
        tls_current_sched,
        tls_next_task,
    }));
    log::info!("lithe: runtime initialized with {} vcores", max_vcores);
}

/// Tear the substrate down: parks every vcore OS thread. Exists for clean test teardown,
/// not part of spec.md's protocol surface.
pub fn lithe_shutdown() {
    let mut guard = RUNTIME.write();
    if let Some(rt) = guard.take() {
        rt.vcores.shutdown();
        rt.pool.shutdown();
    }
}

pub(crate) fn current_task_ptr() -> Option<*mut Task> {
    let p = RUNNING_TASK.with(|c| c.get());
    if p.is_null() {
        None
    } else {
        Some(p)
    }
}

fn set_next_func<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    NEXT_FUNC.with(|c| *c.borrow_mut() = Some(Box::new(f)));
}

/// The single upcall the vcore layer invokes on every grant, re-grant, or wake (spec.md
/// §4.1). Transitions `current_sched` onto the base scheduler — every physical grant
/// enters the system through it — then loops [`step`] until something asks to park.
fn vcore_entry_upcall(id: VcoreId) {
    let rt = runtime();
    rt.vcores.set_tls_var(rt.tls_current_sched, rt.base);
    unsafe { (*rt.base).idata.vcores.fetch_add(1) };

    PARK_REQUESTED.with(|c| c.set(false));
    loop {
        if PARK_REQUESTED.with(|c| c.get()) {
            log::debug!("vcore {}: parking", id.0);
            return;
        }
        step(&rt, id);
    }
}

/// Spec.md §4.1's priority order: resume a current uthread; else start a waiting task;
/// else run a pending yield-callback; else call the current scheduler's `vcore_enter`.
fn step(rt: &Runtime, id: VcoreId) {
    drain_events(rt, id);

    // spec.md's "current_uthread" and "next_task" priority slots collapse into one here:
    // nothing in this design ever auto-resumes a suspended task (a 2LS must explicitly
    // call `lithe_task_run` again, from its `task_yield`/`task_runnable` callback), so a
    // single "the task to resume next" slot serves both steps of the priority order.
    if let Some(task_ptr) = take_tls_task(rt, rt.tls_next_task) {
        run_task(task_ptr);
        return;
    }
    if let Some(f) = NEXT_FUNC.with(|c| c.borrow_mut().take()) {
        f();
        return;
    }

    let sched_ptr = rt.vcores.get_tls_var(rt.tls_current_sched);
    debug_assert!(!sched_ptr.is_null());
    let sched = unsafe { &*sched_ptr };
    sched.funcs.vcore_enter(sched);
}

fn take_tls_task(rt: &Runtime, var: TlsVar<*mut Task>) -> Option<*mut Task> {
    let p = rt.vcores.get_tls_var(var);
    if p.is_null() {
        None
    } else {
        rt.vcores.set_tls_var(var, ptr::null_mut());
        Some(p)
    }
}

/// Resume `task_ptr`, then act on what it reported: a finished task (naturally, or via
/// `lithe_task_exit`'s `finished` flag) is torn down through its owner's `task_destroy`; a
/// task that yielded with a callback hands control to that callback; a bare suspend does
/// nothing further this step.
fn run_task(task_ptr: *mut Task) {
    RUNNING_TASK.with(|c| c.set(task_ptr));
    let result = unsafe { (*task_ptr).run() };
    RUNNING_TASK.with(|c| c.set(ptr::null_mut()));

    let explicitly_finished = unsafe { (*task_ptr).finished.get() };
    match result {
        RunResult::Finished => destroy_task(task_ptr),
        _ if explicitly_finished => destroy_task(task_ptr),
        RunResult::Suspended(Some(cb)) => cb(),
        RunResult::Suspended(None) => {}
    }
}

fn destroy_task(task_ptr: *mut Task) {
    let owner = unsafe { (*task_ptr).owner() };
    let boxed = unsafe { Box::from_raw(task_ptr) };
    if owner.is_null() {
        // A hijack shell that finished without ever being handed to a 2LS; nothing to
        // notify (this should not happen in practice — shells are always hijacked into).
        return;
    }
    let sched = unsafe { &*owner };
    sched.funcs.task_destroy(sched, boxed);
}

fn drain_events(rt: &Runtime, id: VcoreId) {
    for event in rt.events.drain(id.0) {
        let task_ptr = event.token as *mut Task;
        unsafe { (*task_ptr).sysc.result.set(Some(event.result)) };

        // A task with notifications disabled (SPEC_FULL.md §12) still gets its result
        // posted above, but the wakeup itself is deferred until `enable_notifs` observes
        // `pending_notif` on the count-to-zero transition.
        if unsafe { (*task_ptr).notif_disable_count.get() } > 0 {
            unsafe { (*task_ptr).pending_notif.set(true) };
            continue;
        }

        let owner = unsafe { (*task_ptr).owner() };
        if !owner.is_null() {
            let sched = unsafe { &*owner };
            sched.funcs.task_runnable(sched, TaskHandle(task_ptr));
        }
    }
}

/// Hand the currently-entered vcore to `child`, a direct child of the current scheduler.
pub(crate) fn grant_vcore(child: &Sched) {
    let rt = runtime();
    let from_ptr = rt.vcores.get_tls_var(rt.tls_current_sched);
    if !from_ptr.is_null() {
        unsafe { (*from_ptr).idata.vcores.fetch_sub(1) };
    }
    rt.vcores.set_tls_var(rt.tls_current_sched, child as *const Sched);
    child.idata.vcores.fetch_add(1);
}

/// Ask this vcore's dispatch loop to park (hand the physical vcore back to the pool) once
/// the current `step` returns.
pub(crate) fn request_park() {
    let rt = runtime();
    unsafe { (*rt.base).idata.vcores.fetch_sub(1) };
    PARK_REQUESTED.with(|c| c.set(true));
}

// --- Public protocol surface -------------------------------------------------------

/// `lithe_sched_current`: the scheduler whose code is running on this vcore right now.
///
/// # Panics
/// Outside vcore context.
pub fn lithe_sched_current() -> &'static Sched {
    let rt = runtime();
    let p = rt.vcores.get_tls_var(rt.tls_current_sched);
    assert!(!p.is_null(), "lithe_sched_current called before any vcore entered");
    unsafe { &*p }
}

/// Register a new scheduler as a child of whatever is current. Called from program
/// context (no task running yet — this becomes the root 2LS, parented directly under the
/// base scheduler) or from inside a running task (a nested nested scheduler, performing
/// the full hijack protocol of spec.md §4.4).
pub fn lithe_sched_enter(funcs: Box<dyn sched::SchedFuncs>) -> Result<(), LitheError> {
    if in_vcore_context() {
        if let Some(parent_task_ptr) = current_task_ptr() {
            return sched_enter_hijack(funcs, parent_task_ptr);
        }
    }
    sched_enter_root(funcs);
    Ok(())
}

fn sched_enter_root(funcs: Box<dyn sched::SchedFuncs>) {
    let rt = runtime();
    let base = rt.base;
    let child = Box::into_raw(Sched::new_child(funcs, base, ptr::null_mut()));
    unsafe {
        (*base).set_child(child);
        (*base).funcs.child_entered(&*base, &*child);
    }
    log::info!("lithe: root scheduler registered");
}

fn sched_enter_hijack(
    funcs: Box<dyn sched::SchedFuncs>,
    parent_task_ptr: *mut Task,
) -> Result<(), LitheError> {
    let rt = runtime();
    let parent_sched_ptr = rt.vcores.get_tls_var(rt.tls_current_sched);

    let child_sched_ptr: *const Sched =
        Box::into_raw(Sched::new_child(funcs, parent_sched_ptr, parent_task_ptr));
    let child_task_ptr: *mut Task = Box::into_raw(Task::shell());
    unsafe { (*child_task_ptr).set_owner(child_sched_ptr) };

    // Relocate the running generator onto `child_task` before suspending — see
    // `Task::hijack_out`'s note on why this is sound despite running mid-resume.
    let uthread = unsafe { (*parent_task_ptr).hijack_out() };
    unsafe { (*child_task_ptr).hijack_in(uthread) };

    set_next_func(move || {
        resume_sched_enter(parent_sched_ptr, parent_task_ptr, child_sched_ptr, child_task_ptr);
    });

    uthread_yield(None);
    // Resumed here as `child_task`, now running under `child`. `lithe_sched_current()`
    // reflects the new scheduler and `lithe_task_self()` names the new identity.
    Ok(())
}

fn resume_sched_enter(
    parent_sched_ptr: *const Sched,
    parent_task_ptr: *mut Task,
    child_sched_ptr: *const Sched,
    child_task_ptr: *mut Task,
) {
    let rt = runtime();
    let parent = unsafe { &*parent_sched_ptr };
    let child = unsafe { &*child_sched_ptr };

    parent.set_child(child_sched_ptr);
    parent.idata.vcores.fetch_sub(1);
    rt.vcores.set_tls_var(rt.tls_current_sched, child_sched_ptr);
    child.idata.vcores.fetch_add(1);
    parent.funcs.child_entered(parent, child);

    rt.vcores.set_tls_var(rt.tls_next_task, child_task_ptr);
    let _ = parent_task_ptr; // parked inside `child.idata.parent_task`, resumed by sched_exit
}

/// Exit the current (non-base) scheduler, hijacking back into the task that entered it.
/// Busy-waits (spec.md §4.5) until this is the last vcore inside the current scheduler.
pub fn lithe_sched_exit() {
    let rt = runtime();
    let me_ptr = rt.vcores.get_tls_var(rt.tls_current_sched);
    let me = unsafe { &*me_ptr };
    let parent_ptr = me.idata.parent;
    assert!(!parent_ptr.is_null(), "lithe_sched_exit called on the base scheduler");
    let parent_task_ptr = me.idata.parent_task;
    assert!(
        !parent_task_ptr.is_null(),
        "lithe_sched_exit: no parent task recorded to hijack back into"
    );
    let child_task_ptr = current_task_ptr().expect("lithe_sched_exit requires task context");

    while me.idata.vcores.read() > 1 {
        lithe_sync::cpu_relax();
    }

    set_next_func(move || {
        resume_sched_exit(me_ptr, child_task_ptr, parent_ptr, parent_task_ptr);
    });

    let uthread = unsafe { (*child_task_ptr).hijack_out() };
    unsafe { (*parent_task_ptr).hijack_in(uthread) };

    uthread_yield(None);
}

fn resume_sched_exit(
    child_sched_ptr: *const Sched,
    child_task_ptr: *mut Task,
    parent_sched_ptr: *const Sched,
    parent_task_ptr: *mut Task,
) {
    let rt = runtime();
    let parent = unsafe { &*parent_sched_ptr };

    // `tls_current_sched` must already name `parent` before `child_exited` runs: that
    // callback is documented to support calling `lithe_sched_current()` from inside it, and
    // it should observe the scheduler it is being told about taking over, not the one that
    // just exited (mirrors `resume_sched_enter`'s ordering relative to `child_entered`).
    rt.vcores.set_tls_var(rt.tls_current_sched, parent_sched_ptr);
    parent.idata.vcores.fetch_add(1);

    unsafe {
        let child_box = Box::from_raw(child_sched_ptr as *mut Sched);
        child_box.idata.vcores.fetch_sub(1);
        parent.funcs.child_exited(parent, &*child_box);
        drop(Box::from_raw(child_task_ptr));
        drop(child_box);
    }
    parent.clear_child();

    rt.vcores.set_tls_var(rt.tls_next_task, parent_task_ptr);
}

/// `lithe_vcore_grant`: hand the currently-entered vcore to one of this scheduler's own
/// children (nested-scheduler vcore provisioning).
pub fn lithe_vcore_grant(child: &Sched) {
    let me = lithe_sched_current();
    debug_assert!(
        child
            .parent()
            .map(|p| ptr::eq(p, me))
            .unwrap_or(false),
        "lithe_vcore_grant: child's parent is not the current scheduler"
    );
    grant_vcore(child);
}

/// `lithe_vcore_yield`: give the currently-entered vcore back to the parent scheduler.
pub fn lithe_vcore_yield() {
    let me = lithe_sched_current();
    let parent = me
        .parent()
        .expect("lithe_vcore_yield called on the base scheduler");
    me.idata.vcores.fetch_sub(1);
    let rt = runtime();
    rt.vcores.set_tls_var(rt.tls_current_sched, parent as *const Sched);
    parent.idata.vcores.fetch_add(1);
    parent.funcs.vcore_return(parent, me);
}

/// `lithe_vcore_request`: ask for `k` more vcores. From program context (before any
/// scheduler has entered a vcore) this reaches the physical pool directly; from inside a
/// running 2LS it relays to the parent, walking up to the base scheduler, which is the
/// terminus that actually calls [`lithe_vcore::VcorePool::request`].
pub fn lithe_vcore_request(k: usize) -> usize {
    if !in_vcore_context() {
        return runtime().vcores.request(k);
    }
    let me = lithe_sched_current();
    match me.parent() {
        Some(parent) => parent.funcs.vcore_request(parent, k),
        None => runtime().vcores.request(k),
    }
}

/// `lithe_task_create`: delegate to `sched`'s own `task_create` (so the 2LS controls
/// stack size, TLS layout, and entry closure), then register the core's bookkeeping
/// (owner) and hand back a stable handle.
pub fn lithe_task_create(sched: &Sched, udata: usize) -> Result<TaskHandle, LitheError> {
    let task = sched.funcs.task_create(sched, udata)?;
    task.set_owner(sched as *const Sched);
    let ptr = Box::into_raw(task);
    Ok(TaskHandle(ptr))
}

/// `lithe_task_run`: make `task` the one resumed next on this vcore.
pub fn lithe_task_run(task: TaskHandle) {
    let rt = runtime();
    rt.vcores.set_tls_var(rt.tls_next_task, task.0);
}

/// `lithe_task_yield`: cooperatively suspend the running task and notify its owning
/// scheduler's `task_yield`.
///
/// # Panics
/// Outside task context.
pub fn lithe_task_yield() {
    let task_ptr = current_task_ptr().expect("lithe_task_yield called outside task context");
    crate::task::suspend_current(Some(move || {
        let owner = unsafe { (*task_ptr).owner() };
        let sched = unsafe { &*owner };
        sched.funcs.task_yield(sched, TaskHandle(task_ptr));
    }));
}

/// `lithe_task_block(func, arg)`: suspend the running task and, once it has actually
/// suspended, invoke `func(current_task, arg)` in vcore context — the hook primitives like
/// a 2LS's own mutex use to stash the now-blocked task's handle somewhere another task can
/// find it. Control does not return to the caller until something calls
/// [`lithe_task_unblock`] on it.
///
/// # Panics
/// Outside task context.
pub fn lithe_task_block<F, A>(func: F, arg: A)
where
    F: FnOnce(TaskHandle, A) + Send + 'static,
    A: Send + 'static,
{
    let task_ptr = current_task_ptr().expect("lithe_task_block called outside task context");
    crate::task::suspend_current(Some(move || {
        func(TaskHandle(task_ptr), arg);
    }));
}

/// `lithe_task_unblock`: make a previously-blocked task runnable again by delegating to
/// its owner's `task_runnable`.
pub fn lithe_task_unblock(task: TaskHandle) {
    let owner = unsafe { task.as_ref().owner() };
    assert!(!owner.is_null(), "lithe_task_unblock: task has no owner");
    let sched = unsafe { &*owner };
    sched.funcs.task_runnable(sched, task);
}

/// `lithe_task_exit`: mark the running task finished and suspend. The dispatcher observes
/// `finished` on the next resume attempt and tears the task down instead of running it
/// again — a usage discipline, not an enforced `-> !`, matching `vcore_enter`'s contract.
///
/// # Panics
/// Outside task context.
pub fn lithe_task_exit() -> ! {
    let task_ptr = current_task_ptr().expect("lithe_task_exit called outside task context");
    unsafe { (*task_ptr).finished.set(true) };
    crate::task::suspend_current::<fn()>(None);
    unreachable!("lithe_task_exit: task resumed after being marked finished")
}

/// `lithe_task_self`: a handle to the task currently running on this vcore.
///
/// # Panics
/// Outside task context.
pub fn lithe_task_self() -> TaskHandle {
    TaskHandle(current_task_ptr().expect("lithe_task_self called outside task context"))
}

/// `uth_disable_notifs`: suppress asynchronous wakeups for the running task (SPEC_FULL.md
/// §12). Nestable; `enable_notifs` undoes exactly one level.
pub fn disable_notifs() {
    if let Some(p) = current_task_ptr() {
        unsafe {
            let t = &*p;
            t.notif_disable_count.set(t.notif_disable_count.get() + 1);
        }
    }
}

/// `uth_enable_notifs`: undo one [`disable_notifs`] level. On the transition to fully
/// enabled, re-checks for an event that arrived while suppressed and self-notifies
/// (SPEC_FULL.md §12, mirroring the original's nested disable/enable in `uthread.h`).
pub fn enable_notifs() {
    if let Some(p) = current_task_ptr() {
        let became_enabled = unsafe {
            let t = &*p;
            let n = t.notif_disable_count.get();
            if n == 0 {
                false
            } else {
                t.notif_disable_count.set(n - 1);
                n == 1
            }
        };
        if became_enabled {
            let pending = unsafe {
                let t = &*p;
                if t.pending_notif.get() {
                    t.pending_notif.set(false);
                    true
                } else {
                    false
                }
            };
            if pending {
                let owner = unsafe { (*p).owner() };
                if !owner.is_null() {
                    let sched = unsafe { &*owner };
                    sched.funcs.task_runnable(sched, TaskHandle(p));
                }
            }
        }
    }
}

pub fn notifs_enabled() -> bool {
    current_task_ptr()
        .map(|p| unsafe { (*p).notif_disable_count.get() == 0 })
        .unwrap_or(true)
}

/// Arm a one-shot alarm on the shared alarm service (spec.md §4.10 / SPEC_FULL.md §12's
/// `set_awaiter_inc` rearm path is exposed directly on the returned handle).
pub fn lithe_set_alarm<F>(delay: Duration, callback: F) -> AlarmHandle
where
    F: FnOnce() + Send + 'static,
{
    lithe_alarm::set_alarm(delay, callback)
}
