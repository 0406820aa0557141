//! Task context object, run/swap/yield, and the `schedule_ops` hook table (spec.md §4
//! component 4).
//!
//! A uthread is a stackful coroutine: on top of [`fringe::Generator`] we keep a small
//! thread-local "TCB" (thread control block) that lets code running *inside* the
//! coroutine find its own [`fringe::Yielder`] again without threading it through every
//! call — exactly the trick the teacher's `lineup::threads::Thread::new` uses (`tls2`'s
//! `ThreadControlBlock` stashes the yielder so `uthread_yield` can find it from anywhere on
//! the stack).

use crate::stack::UthreadStack;
use fringe::generator::Generator;
use lithe_tls::{TlsBlock, TlsLayout, TlsVar};
use std::cell::Cell;
use std::fmt;

/// Identifies a uthread. Stable for the uthread's lifetime; never reused while any
/// reference to the uthread (e.g. a 2LS ready queue entry) might still exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uthread#{}", self.0)
    }
}

/// A boxed closure run in *vcore context* (no uthread current) immediately after its
/// owning uthread suspends. This is the "yield callback" spec.md §4.3 describes: "the
/// yield-callback mechanism is how user code hands an arbitrary fn+arg to the dispatcher."
pub type YieldCallback = Box<dyn FnOnce() + Send + 'static>;

/// What a resumed generator handed back to its caller.
pub(crate) enum Yielded {
    /// The uthread's entry function returned; it is done and holds no more state.
    Finished,
    /// The uthread called `uthread_yield`. `save` mirrors whether the caller asked for
    /// the suspended state to be kept resumable (it always is, here, but the flag
    /// documents the spec.md distinction between a true suspend and `lithe_task_exit`,
    /// which yields without saving by immediately marking itself `Finished` instead).
    Suspended(Option<YieldCallback>),
}

type Runnable<'a> = Generator<'a, (), Yielded, fringe::SliceStack<'static>>;

struct Tcb {
    yielder: *const fringe::generator::Yielder<(), Yielded>,
}

thread_local! {
    /// The currently-running uthread's TCB, valid only while inside a resumed generator.
    /// Exactly one uthread ever runs per OS thread (one vcore, cooperative scheduling), so
    /// a single cell suffices — no stack of TCBs needed.
    static CURRENT_TCB: Cell<Option<Tcb>> = Cell::new(None);
}

/// A uthread: saved machine state (via the generator), its stack, and its TLS block.
pub struct Uthread {
    pub id: ThreadId,
    stack: UthreadStack,
    tls: TlsBlock,
    generator: Option<Runnable<'static>>,
    finished: bool,
}

impl fmt::Debug for Uthread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uthread({})", self.id)
    }
}

/// Shared TLS layout every uthread's block is sized against. Reserve slots with
/// [`reserve_tls`] before creating any uthreads that use them.
pub static UTHREAD_TLS_LAYOUT: TlsLayout = TlsLayout::new(512);

/// `uthread_init`: reserve a typed TLS slot shared by every uthread this process creates.
/// The 2LS calls this once per slot it needs, at startup, before any `uthread_create`.
pub fn reserve_tls<T>() -> TlsVar<T> {
    UTHREAD_TLS_LAYOUT.reserve()
}

impl Uthread {
    /// `uthread_create` + `init_uthread_stack` + `init_uthread_entry` collapsed into one
    /// call: fringe's `Generator::unsafe_new` takes stack, entry, and argument together,
    /// so there is no useful seam between "allocate the stack" and "install the entry
    /// point" the way there is in the original's split C API.
    ///
    /// # Safety
    /// `f` must not unwind across the coroutine boundary (panics inside `f` abort the
    /// process instead, see [`Uthread::run`]).
    pub unsafe fn new<F>(id: ThreadId, stack_size: usize, tls_capacity: usize, f: F) -> Uthread
    where
        F: FnOnce() + Send + 'static,
    {
        let mut stack = UthreadStack::new(stack_size);
        let slice_stack = stack.as_slice_stack();
        let generator = Generator::unsafe_new(slice_stack, move |yielder, ()| {
            CURRENT_TCB.with(|tcb| {
                tcb.set(Some(Tcb {
                    yielder: yielder as *const _,
                }))
            });

            f();

            CURRENT_TCB.with(|tcb| tcb.set(None));
            Yielded::Finished
        });

        Uthread {
            id,
            stack,
            tls: TlsBlock::new(tls_capacity),
            generator: Some(generator),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn stack_size(&self) -> usize {
        self.stack.size()
    }

    /// Read a TLS variable out of this uthread's block (`uthread_get_tls_var`).
    ///
    /// # Safety
    /// `var` must come from [`reserve_tls`] and this uthread must not be concurrently
    /// resuming on another OS thread (the 2LS's own locking discipline guarantees this).
    pub unsafe fn get_tls_var<T: Copy>(&self, var: TlsVar<T>) -> T {
        self.tls.get(var)
    }

    /// Write a TLS variable into this uthread's block (`uthread_set_tls_var`).
    ///
    /// # Safety
    /// See [`Uthread::get_tls_var`].
    pub unsafe fn set_tls_var<T: Copy>(&mut self, var: TlsVar<T>, value: T) {
        self.tls.set(var, value);
    }

    /// `run_uthread`: resume this uthread from wherever it last suspended (or start it, on
    /// the first call). Must be called from vcore context — i.e. not from inside another
    /// running uthread.
    pub fn run(&mut self) -> RunResult {
        debug_assert!(!self.finished, "resumed a finished uthread");
        let generator = self
            .generator
            .as_mut()
            .expect("uthread generator missing: already destroyed?");

        match generator.resume(()) {
            Some(Yielded::Finished) => {
                self.finished = true;
                log::debug!("{} finished", self.id);
                RunResult::Finished
            }
            Some(Yielded::Suspended(cb)) => {
                log::debug!("{} suspended", self.id);
                RunResult::Suspended(cb)
            }
            None => {
                // The generator panicked internally; fringe surfaces that as a resume
                // returning `None`. There is no well-defined scheduler state to resume
                // into, so this is a precondition violation per spec.md §7.
                panic!("uthread {} panicked without unwinding out", self.id);
            }
        }
    }
}

/// What [`Uthread::run`] observed.
pub enum RunResult {
    Finished,
    Suspended(Option<YieldCallback>),
}

/// `uthread_yield(save, cb, arg)`: suspend the calling uthread, handing `cb` to whichever
/// vcore-context code resumes next. Must be called from *inside* a running uthread.
///
/// `save` is always honored here (the suspended generator state is always resumable); a
/// uthread that wants to discard itself instead calls code that lets its entry closure
/// simply return, which this module reports as `RunResult::Finished`.
///
/// # Panics
/// If called outside uthread context (no current TCB).
pub fn uthread_yield(cb: Option<YieldCallback>) {
    log::trace!("uthread_yield (callback = {})", cb.is_some());
    CURRENT_TCB.with(|tcb| {
        let current = tcb
            .take()
            .expect("uthread_yield called outside uthread context");
        // Safety: the yielder is only valid while this generator invocation is on the
        // stack, which it is — we are executing inside it right now.
        let yielder = unsafe { &*current.yielder };
        tcb.set(Some(current));
        yielder.suspend(Yielded::Suspended(cb));
    });
}

/// `in_uthread_context`-style helper used internally by the syscall wrapper and by tests
/// to assert they are (or are not) running inside a coroutine.
pub fn in_uthread_context() -> bool {
    CURRENT_TCB.with(|tcb| {
        let was = tcb.take();
        let is_some = was.is_some();
        tcb.set(was);
        is_some
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn run_to_completion_without_yielding() {
        init();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let mut u = unsafe { Uthread::new(ThreadId(1), 64 * 1024, 64, move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        }) };

        match u.run() {
            RunResult::Finished => {}
            RunResult::Suspended(_) => panic!("expected immediate completion"),
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(u.is_finished());
    }

    #[test]
    fn yield_then_resume_runs_to_completion() {
        init();
        let steps = Arc::new(AtomicUsize::new(0));
        let steps2 = steps.clone();
        let mut u = unsafe { Uthread::new(ThreadId(2), 64 * 1024, 64, move || {
            steps2.fetch_add(1, Ordering::SeqCst);
            uthread_yield(None);
            steps2.fetch_add(1, Ordering::SeqCst);
            uthread_yield(None);
            steps2.fetch_add(1, Ordering::SeqCst);
        }) };

        assert!(matches!(u.run(), RunResult::Suspended(None)));
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert!(matches!(u.run(), RunResult::Suspended(None)));
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert!(matches!(u.run(), RunResult::Finished));
        assert_eq!(steps.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn yield_callback_is_delivered_once() {
        init();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let mut u = unsafe { Uthread::new(ThreadId(3), 64 * 1024, 64, move || {
            let fired3 = fired2.clone();
            uthread_yield(Some(Box::new(move || {
                fired3.fetch_add(1, Ordering::SeqCst);
            })));
        }) };

        match u.run() {
            RunResult::Suspended(Some(cb)) => {
                assert_eq!(fired.load(Ordering::SeqCst), 0);
                cb();
                assert_eq!(fired.load(Ordering::SeqCst), 1);
            }
            _ => panic!("expected a callback"),
        }
        assert!(matches!(u.run(), RunResult::Finished));
    }

    #[test]
    fn tls_round_trips_across_yields() {
        init();
        let var: TlsVar<u32> = reserve_tls();
        let mut u = unsafe { Uthread::new(ThreadId(4), 64 * 1024, UTHREAD_TLS_LAYOUT.capacity(), move || {
            uthread_yield(None);
        }) };
        unsafe { u.set_tls_var(var, 99) };
        assert!(matches!(u.run(), RunResult::Suspended(None)));
        assert_eq!(unsafe { u.get_tls_var(var) }, 99);
        assert!(matches!(u.run(), RunResult::Finished));
    }
}
