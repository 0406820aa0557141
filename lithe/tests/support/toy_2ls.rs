//! A minimal in-tree 2LS used only to drive the end-to-end scenario tests (SPEC_FULL.md
//! §11.4) without standing up a full parallel runtime of its own. Round-robins runnable
//! tasks one vcore-entry at a time; relays every vcore request straight to its parent; lazily
//! creates its initial task set the first time it is entered, since `lithe_sched_enter`'s
//! root path runs from program context and has no `&Sched` to hand `lithe_task_create` yet.

use lithe::{
    lithe_task_create, lithe_task_run, lithe_vcore_grant, lithe_vcore_yield, LitheError, Sched,
    SchedFuncs, Task, TaskHandle,
};
use lithe_sync::SpinMutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

type Pending = SpinMutex<Vec<Option<Box<dyn FnOnce() + Send>>>>;

pub struct ToyScheduler {
    pending_fns: Pending,
    runnable: SpinMutex<VecDeque<TaskHandle>>,
    bootstrapped: AtomicBool,
    pub destroyed: AtomicUsize,
    blockon_count: AtomicUsize,
}

impl ToyScheduler {
    /// A scheduler with no initial tasks; callers add work with `spawn` (from inside a task
    /// that already has a `&Sched`, e.g. a nested scheduler's first task).
    pub fn new() -> Arc<Self> {
        Self::with_initial_tasks(Vec::new())
    }

    /// A scheduler whose initial task set is created lazily on its first `vcore_enter` —
    /// the pattern a real 2LS uses to bootstrap its own root task(s).
    pub fn with_initial_tasks(fns: Vec<Box<dyn FnOnce() + Send>>) -> Arc<Self> {
        Arc::new(ToyScheduler {
            pending_fns: SpinMutex::new(fns.into_iter().map(Some).collect()),
            runnable: SpinMutex::new(VecDeque::new()),
            bootstrapped: AtomicBool::new(false),
            destroyed: AtomicUsize::new(0),
            blockon_count: AtomicUsize::new(0),
        })
    }

    /// Create a task running `f` on `sched` (the `Sched` node this `ToyScheduler` instance
    /// backs) and mark it runnable immediately. Must run in a context that already holds a
    /// `&Sched` for this scheduler (typically `lithe_sched_current()` from inside one of its
    /// own tasks).
    pub fn spawn(&self, sched: &Sched, f: impl FnOnce() + Send + 'static) -> TaskHandle {
        let idx = {
            let mut slots = self.pending_fns.lock();
            slots.push(Some(Box::new(f)));
            slots.len() - 1
        };
        let handle = lithe_task_create(sched, idx).expect("toy task_create failed");
        self.runnable.lock().push_back(handle);
        handle
    }

    pub fn runnable_count(&self) -> usize {
        self.runnable.lock().len()
    }

    pub fn destroyed_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn blockon_count(&self) -> usize {
        self.blockon_count.load(Ordering::SeqCst)
    }

    fn bootstrap(&self, me: &Sched) {
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            return;
        }
        let n = self.pending_fns.lock().len();
        for idx in 0..n {
            let handle = lithe_task_create(me, idx).expect("toy task_create failed");
            self.runnable.lock().push_back(handle);
        }
    }
}

/// Implemented on `Arc<ToyScheduler>` rather than `ToyScheduler` directly so a test can
/// hand one clone to `lithe_sched_enter` as the trait object while keeping another to call
/// `spawn`/`runnable_count` on directly.
impl SchedFuncs for Arc<ToyScheduler> {
    fn vcore_request(&self, me: &Sched, k: usize) -> usize {
        match me.parent() {
            Some(parent) => parent.funcs.vcore_request(parent, k),
            None => 0,
        }
    }

    fn vcore_enter(&self, me: &Sched) {
        self.bootstrap(me);
        match self.runnable.lock().pop_front() {
            Some(handle) => lithe_task_run(handle),
            None => lithe_vcore_yield(),
        }
    }

    fn vcore_return(&self, _me: &Sched, _child: &Sched) {
        unreachable!("toy scheduler never grants to children of its own");
    }

    fn child_entered(&self, _me: &Sched, _child: &Sched) {}
    fn child_exited(&self, _me: &Sched, _child: &Sched) {}

    fn task_create(&self, _me: &Sched, udata: usize) -> Result<Box<Task>, LitheError> {
        let f = self.pending_fns.lock()[udata]
            .take()
            .expect("toy task_create: slot already consumed");
        Task::new(lithe::DEFAULT_TASK_STACK_SIZE, 0, f)
    }

    fn task_destroy(&self, _me: &Sched, task: Box<Task>) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        drop(task);
    }

    fn task_runnable(&self, _me: &Sched, task: TaskHandle) {
        self.runnable.lock().push_back(task);
    }

    fn task_yield(&self, _me: &Sched, task: TaskHandle) {
        self.runnable.lock().push_back(task);
    }

    fn thread_blockon_sysc(&self, _me: &Sched, _task: TaskHandle) {
        self.blockon_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// A 2LS with exactly one bootstrap task and no tasks of its own thereafter: every
/// `vcore_enter` once that task has registered a child scheduler (via `lithe_sched_enter`)
/// grants the vcore straight to it (spec.md §4.6), and every vcore the child later yields
/// back is passed on up to base rather than re-granted — the "grant loop" of S2.
pub struct GrantingScheduler {
    bootstrap_fn: SpinMutex<Option<Box<dyn FnOnce() + Send>>>,
    bootstrapped: AtomicBool,
    runnable: SpinMutex<VecDeque<TaskHandle>>,
    /// `base`'s address, recorded from `me.parent()` the first time this scheduler is
    /// entered, purely so the test driver can read `base`'s vcore count after the fact —
    /// not part of the production API, a test-only back door.
    base_ptr: AtomicUsize,
}

impl GrantingScheduler {
    pub fn new(bootstrap: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(GrantingScheduler {
            bootstrap_fn: SpinMutex::new(Some(Box::new(bootstrap))),
            bootstrapped: AtomicBool::new(false),
            runnable: SpinMutex::new(VecDeque::new()),
            base_ptr: AtomicUsize::new(0),
        })
    }

    /// `base.idata.vcores` as of the last read, once this scheduler has been entered at
    /// least once (`None` before that).
    pub fn base_vcores(&self) -> Option<usize> {
        let p = self.base_ptr.load(Ordering::SeqCst);
        if p == 0 {
            None
        } else {
            Some(unsafe { (*(p as *const Sched)).vcores() })
        }
    }

    fn bootstrap(&self, me: &Sched) {
        if let Some(parent) = me.parent() {
            let _ = self.base_ptr.compare_exchange(
                0,
                parent as *const Sched as usize,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = lithe_task_create(me, 0).expect("granting scheduler task_create failed");
        self.runnable.lock().push_back(handle);
    }
}

impl SchedFuncs for Arc<GrantingScheduler> {
    fn vcore_request(&self, me: &Sched, k: usize) -> usize {
        match me.parent() {
            Some(parent) => parent.funcs.vcore_request(parent, k),
            None => 0,
        }
    }

    fn vcore_enter(&self, me: &Sched) {
        self.bootstrap(me);
        if let Some(child) = me.child() {
            lithe_vcore_grant(child);
            return;
        }
        match self.runnable.lock().pop_front() {
            Some(handle) => lithe_task_run(handle),
            None => lithe_vcore_yield(),
        }
    }

    fn vcore_return(&self, _me: &Sched, _child: &Sched) {
        // Nothing of our own wants this vcore back; hand it further up the chain.
        lithe_vcore_yield();
    }

    fn child_entered(&self, _me: &Sched, _child: &Sched) {}
    fn child_exited(&self, _me: &Sched, _child: &Sched) {}

    fn task_create(&self, _me: &Sched, _udata: usize) -> Result<Box<Task>, LitheError> {
        let f = self
            .bootstrap_fn
            .lock()
            .take()
            .expect("granting scheduler: bootstrap already consumed");
        Task::new(lithe::DEFAULT_TASK_STACK_SIZE, 0, f)
    }

    fn task_destroy(&self, _me: &Sched, task: Box<Task>) {
        drop(task);
    }

    fn task_runnable(&self, _me: &Sched, task: TaskHandle) {
        self.runnable.lock().push_back(task);
    }

    fn task_yield(&self, _me: &Sched, task: TaskHandle) {
        self.runnable.lock().push_back(task);
    }
}
