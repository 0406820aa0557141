//! Atomics and spinlock primitives (spec.md §4 component 1).
//!
//! Everything above this crate in the Lithe workspace (`lithe-vcore`, `lithe-uthread`,
//! `lithe` itself) treats these as the lowest layer: a test-and-set spinlock for the
//! handful of node-local critical sections (`Sched.lock`, the alarm's waiter lock), a
//! fetch-add counter for vcore conservation bookkeeping, and `cpu_relax` for the
//! drain/busy-wait loops in `lithe_sched_exit` and the alarm worker.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crossbeam_utils::CachePadded;

/// Spin, yielding the physical core to a sibling hyperthread if the ISA supports it.
///
/// This is the `cpu_relax()` spec.md calls out in §4.5 and §4.10's busy-wait loops.
#[inline(always)]
pub fn cpu_relax() {
    core::hint::spin_loop();
}

/// A test-and-set spinlock.
///
/// Matches the locking discipline in spec.md §5: short critical sections only (the
/// `Sched.children` list, `state`, `next`/`prev`, and the alarm's global waiter state).
/// Never held across a yield or a context switch.
#[derive(Debug, Default)]
pub struct Spinlock {
    locked: AtomicBool,
}

impl Spinlock {
    pub const fn new() -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, spinning with `cpu_relax` between attempts.
    pub fn lock(&self) -> SpinlockGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                cpu_relax();
            }
        }
        SpinlockGuard { lock: self }
    }

    /// Non-blocking acquire; returns `None` if already held.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinlockGuard { lock: self })
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// RAII guard returned by [`Spinlock::lock`]; releases on drop.
pub struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// A spinlock-guarded value, for the node-local critical sections spec.md's locking
/// discipline calls out (`Sched.children`, `state`, `next`/`prev`; the alarm's waiter
/// state). Thin wrapper over [`Spinlock`] plus the protected value, since most callers
/// want "lock, touch a field, unlock" rather than a bare lock.
#[derive(Debug, Default)]
pub struct SpinMutex<T> {
    lock: Spinlock,
    value: core::cell::UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        SpinMutex {
            lock: Spinlock::new(),
            value: core::cell::UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        let guard = self.lock.lock();
        SpinMutexGuard {
            _lock: guard,
            value: &self.value,
        }
    }
}

pub struct SpinMutexGuard<'a, T> {
    _lock: SpinlockGuard<'a>,
    value: &'a core::cell::UnsafeCell<T>,
}

impl<T> core::ops::Deref for SpinMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.value.get() }
    }
}

impl<T> core::ops::DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.value.get() }
    }
}

/// A cache-line padded atomic counter, used wherever spec.md requires "atomic count of
/// vcores currently inside this node" (`Sched.idata.vcores`) to be updated only via
/// fetch-add and read with a coherent load (never torn, never under the spinlock).
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: CachePadded<AtomicUsize>,
}

impl AtomicCounter {
    pub const fn new(initial: usize) -> Self {
        AtomicCounter {
            value: CachePadded::new(AtomicUsize::new(initial)),
        }
    }

    /// Atomic fetch-add; returns the value *before* the add, as `fetch_add` conventionally
    /// does, so callers that want the post-add value write `counter.fetch_add(1) + 1`.
    #[inline]
    pub fn fetch_add(&self, delta: usize) -> usize {
        self.value.fetch_add(delta, Ordering::SeqCst)
    }

    #[inline]
    pub fn fetch_sub(&self, delta: usize) -> usize {
        self.value.fetch_sub(delta, Ordering::SeqCst)
    }

    /// Coherent read: a full `SeqCst` load, not a relaxed peek. Used by the drain
    /// busy-wait in `lithe_sched_exit` (spec.md §4.5) which must observe a fresh value on
    /// every iteration.
    #[inline]
    pub fn read(&self) -> usize {
        self.value.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set(&self, value: usize) {
        self.value.store(value, Ordering::SeqCst);
    }
}
