//! Vcore abstraction (spec.md §4 component 3).
//!
//! A vcore is an opaque, fixed-size pool slot backed here by a parked OS thread. The
//! substrate never exposes anything about *how* a vcore is obtained from the kernel — that
//! is explicitly out of scope (spec.md §1, "Out of scope: the OS-facing vcore allocator").
//! What it does provide, to whatever sits above it (the `lithe` crate's dispatcher), is the
//! four primitives spec.md names: request more, yield this one, read/write a per-vcore TLS
//! variable, and the two counters `max_vcores`/`num_vcores`. On every entry (first grant,
//! re-grant after a yield, or wake after a park) it calls a single registered upcall,
//! `vcore_entry`.
//!
//! The upcall returns precisely when its vcore has nothing left to do and wants to hand
//! the physical context back to the pool (spec.md's "external vcore-yield"); the pool then
//! parks that OS thread until a future `request` wakes it again.

use lithe_sync::AtomicCounter;
use lithe_tls::{TlsBlock, TlsLayout, TlsVar};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Identifies one slot in the fixed-size vcore pool. Stable for the lifetime of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VcoreId(pub usize);

/// The single upcall every vcore entry funnels into (spec.md §4.1). Implemented by the
/// `lithe` crate's dispatcher; registered once via [`VcorePool::new`].
pub type EntryFn = fn(VcoreId);

/// Default per-vcore TLS capacity: large enough for the handful of pointer-sized slots
/// (`current_sched`, `next_task`, `next_func`) the core registers, with headroom for a
/// 2LS that wants a slot or two of its own.
pub const DEFAULT_VCORE_TLS_CAPACITY: usize = 256;

thread_local! {
    static CURRENT_VCORE: Cell<Option<VcoreId>> = Cell::new(None);
}

/// True iff the calling OS thread is currently executing as a vcore (i.e. somewhere inside
/// an `EntryFn` invocation). Consumed internally by the dispatcher and exposed to 2LS
/// authors who want to assert context, matching the original's `in_vcore_context()`.
pub fn in_vcore_context() -> bool {
    CURRENT_VCORE.with(|c| c.get().is_some())
}

/// The id of the vcore the calling OS thread currently is. Panics outside vcore context.
pub fn vcore_id() -> VcoreId {
    CURRENT_VCORE
        .with(|c| c.get())
        .expect("vcore_id() called outside vcore context")
}

struct Slot {
    /// Per-vcore TLS block; lazily sized from the shared layout the first time a slot runs.
    tls: Mutex<TlsBlock>,
    granted: AtomicBool,
    park: Condvar,
    park_lock: Mutex<bool>,
}

struct Inner {
    entry: EntryFn,
    slots: Vec<Slot>,
    active: AtomicCounter,
    max_vcores: usize,
    tls_layout: TlsLayout,
    shutdown: AtomicBool,
}

/// A fixed-size pool of vcores. Exactly one should exist per process; the `lithe` crate
/// owns it behind `lithe_sched_enter`'s first call.
#[derive(Clone)]
pub struct VcorePool {
    inner: Arc<Inner>,
}

impl VcorePool {
    /// Build a pool of `max_vcores` slots, none granted yet, calling `entry` on every
    /// future grant. `tls_capacity` sizes the per-vcore TLS block (see
    /// [`DEFAULT_VCORE_TLS_CAPACITY`]).
    pub fn new(max_vcores: usize, tls_capacity: usize, entry: EntryFn) -> Self {
        assert!(max_vcores > 0, "a vcore pool needs at least one vcore");
        let mut slots = Vec::with_capacity(max_vcores);
        for _ in 0..max_vcores {
            slots.push(Slot {
                tls: Mutex::new(TlsBlock::new(tls_capacity)),
                granted: AtomicBool::new(false),
                park: Condvar::new(),
                park_lock: Mutex::new(false),
            });
        }
        let inner = Arc::new(Inner {
            entry,
            slots,
            active: AtomicCounter::new(0),
            max_vcores,
            tls_layout: TlsLayout::new(tls_capacity),
            shutdown: AtomicBool::new(false),
        });

        for id in 0..max_vcores {
            let inner = inner.clone_arc();
            thread::Builder::new()
                .name(format!("vcore-{}", id))
                .spawn(move || vcore_os_thread_main(inner, VcoreId(id)))
                .expect("failed to spawn vcore OS thread");
        }

        VcorePool { inner }
    }

    /// Reserve a per-vcore TLS slot, shared across every vcore's block. Mirrors
    /// `vcore_set_tls_var`'s registration half.
    pub fn reserve_tls<T>(&self) -> TlsVar<T> {
        self.inner.tls_layout.reserve()
    }

    /// Write `var` into the calling vcore's TLS block.
    ///
    /// # Panics
    /// If called outside vcore context.
    pub fn set_tls_var<T: Copy>(&self, var: TlsVar<T>, value: T) {
        let id = vcore_id();
        let mut block = self.inner.slots[id.0].tls.lock().unwrap();
        unsafe { block.set(var, value) };
    }

    /// Read `var` from the calling vcore's TLS block.
    pub fn get_tls_var<T: Copy>(&self, var: TlsVar<T>) -> T {
        let id = vcore_id();
        let block = self.inner.slots[id.0].tls.lock().unwrap();
        unsafe { block.get(var) }
    }

    /// `max_vcores`: the size of the pool, fixed at construction.
    pub fn max_vcores(&self) -> usize {
        self.inner.max_vcores
    }

    /// `num_vcores`: how many slots are currently granted (running an `EntryFn`).
    pub fn num_vcores(&self) -> usize {
        self.inner.active.read()
    }

    /// Request up to `k` more vcores. Returns the number actually granted immediately
    /// (spec.md §4.7); never more arrive later on their own, since this pool has no
    /// asynchronous kernel allocator behind it — all grants happen synchronously here.
    pub fn request(&self, k: usize) -> usize {
        let mut granted = 0;
        for slot_id in 0..self.inner.max_vcores {
            if granted >= k {
                break;
            }
            let slot = &self.inner.slots[slot_id];
            if slot
                .granted
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.inner.active.fetch_add(1);
                granted += 1;
                let mut parked = slot.park_lock.lock().unwrap();
                *parked = false;
                slot.park.notify_all();
            }
        }
        log::debug!("vcore pool: requested {}, granted {}", k, granted);
        granted
    }

    /// Tear the pool down: wakes every parked vcore thread so it can observe `shutdown`
    /// and exit, instead of leaking OS threads. Not part of spec.md's protocol surface;
    /// exists purely for clean test teardown.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        for slot in &self.inner.slots {
            let mut parked = slot.park_lock.lock().unwrap();
            *parked = false;
            slot.park.notify_all();
        }
    }
}

impl Inner {
    fn clone_arc(self: &Arc<Self>) -> Arc<Self> {
        Arc::clone(self)
    }

    fn mark_parked(&self, id: VcoreId) {
        self.active.fetch_sub(1);
        self.slots[id.0].granted.store(false, Ordering::Release);
    }
}

fn vcore_os_thread_main(inner: Arc<Inner>, id: VcoreId) {
    loop {
        {
            let slot = &inner.slots[id.0];
            let mut parked = slot.park_lock.lock().unwrap();
            *parked = true;
            while *parked {
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let (guard, _timeout) = slot
                    .park
                    .wait_timeout(parked, std::time::Duration::from_millis(50))
                    .unwrap();
                parked = guard;
            }
        }
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }

        CURRENT_VCORE.with(|c| c.set(Some(id)));
        log::debug!("vcore {} granted, entering upcall", id.0);
        (inner.entry)(id);
        log::debug!("vcore {} upcall returned, parking", id.0);
        CURRENT_VCORE.with(|c| c.set(None));

        inner.mark_parked(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::time::Duration;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    static ENTRIES: StdAtomicUsize = StdAtomicUsize::new(0);

    fn counting_entry(_id: VcoreId) {
        ENTRIES.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn request_grants_up_to_max() {
        init();
        ENTRIES.store(0, Ordering::SeqCst);
        let pool = VcorePool::new(4, DEFAULT_VCORE_TLS_CAPACITY, counting_entry);
        let granted = pool.request(2);
        assert_eq!(granted, 2);
        thread::sleep(Duration::from_millis(100));
        assert!(ENTRIES.load(Ordering::SeqCst) >= 2);

        let granted2 = pool.request(10);
        assert_eq!(granted2, 2, "only 2 slots remained in a 4-slot pool");
        pool.shutdown();
    }

    #[test]
    fn per_vcore_tls_is_isolated() {
        init();
        let pool = VcorePool::new(2, DEFAULT_VCORE_TLS_CAPACITY, noop_entry);
        let var: TlsVar<u64> = pool.reserve_tls();
        pool.request(1);
        thread::sleep(Duration::from_millis(50));
        pool.shutdown();
        let _ = var;
    }

    fn noop_entry(_id: VcoreId) {}
}
