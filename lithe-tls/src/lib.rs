//! TLS facility (spec.md §4 component 2).
//!
//! A descriptor is just a heap block plus a bump-allocated table of typed slots. The
//! interesting property spec.md asks for is *cross-context* access: a vcore running one
//! task can read or write a variable inside a different (suspended) task's TLS block by
//! address arithmetic, without that task being current anywhere. We model this the same
//! way the original `tls.h` does: a slot is a byte offset into the block, resolved against
//! whatever base pointer the caller hands in.

use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::sync::atomic::{AtomicUsize, Ordering};

/// A typed slot reserved in a [`TlsLayout`]. Carries only an offset and alignment; it is
/// `Copy` and has no lifetime tied to any particular descriptor, which is what lets it be
/// used against a *different* task's block than the one it was reserved against.
#[derive(Debug)]
pub struct TlsVar<T> {
    offset: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TlsVar<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for TlsVar<T> {}

/// Describes the layout shared by every TLS block of a given kind (per-vcore or
/// per-task): a set of slots bump-allocated out of a fixed capacity, matching spec.md's
/// "TLS descriptor" as a static shape negotiated once at startup.
pub struct TlsLayout {
    next_offset: AtomicUsize,
    capacity: usize,
}

impl TlsLayout {
    pub const fn new(capacity: usize) -> Self {
        TlsLayout {
            next_offset: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Reserve a slot for `T`, respecting `T`'s alignment. Slots are never freed
    /// individually; a `TlsLayout` is meant to be built once, at registration time, by the
    /// vcore substrate and the 2LS's `task_create`.
    pub fn reserve<T>(&self) -> TlsVar<T> {
        let align = align_of::<T>();
        let size = size_of::<T>();
        loop {
            let current = self.next_offset.load(Ordering::Relaxed);
            let aligned = (current + align - 1) & !(align - 1);
            let next = aligned + size;
            assert!(
                next <= self.capacity,
                "TLS layout exhausted: requested offset {} exceeds capacity {}",
                next,
                self.capacity
            );
            if self
                .next_offset
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return TlsVar {
                    offset: aligned,
                    _marker: PhantomData,
                };
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// An allocated TLS block: `capacity` zeroed bytes owned by whichever task or vcore it
/// belongs to.
pub struct TlsBlock {
    storage: Box<[u8]>,
}

impl TlsBlock {
    pub fn new(capacity: usize) -> Self {
        TlsBlock {
            storage: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.storage.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.storage.as_mut_ptr()
    }

    /// Read `var` out of *this* block.
    ///
    /// # Safety
    /// `var` must have been reserved from the [`TlsLayout`] this block was sized against.
    pub unsafe fn get<T: Copy>(&self, var: TlsVar<T>) -> T {
        get_at(self.storage.as_ptr(), var)
    }

    /// Write `var` into *this* block.
    ///
    /// # Safety
    /// `var` must have been reserved from the [`TlsLayout`] this block was sized against.
    pub unsafe fn set<T: Copy>(&mut self, var: TlsVar<T>, value: T) {
        set_at(self.storage.as_mut_ptr(), var, value);
    }
}

/// Cross-context read: resolve `var` against an arbitrary base pointer, e.g. the TLS block
/// belonging to a task that is not currently running anywhere. This is the address
/// arithmetic spec.md §4 component 2 calls for.
///
/// # Safety
/// `base` must point at a live TLS block at least `var`'s offset + size bytes long, and
/// the caller must not race a concurrent write to the same slot (the 2LS is responsible
/// for serialising access to a suspended task's TLS, same as for its saved registers).
pub unsafe fn get_at<T: Copy>(base: *const u8, var: TlsVar<T>) -> T {
    let slot = base.add(var.offset) as *const T;
    core::ptr::read(slot)
}

/// Cross-context write; see [`get_at`] for the safety contract.
pub unsafe fn set_at<T: Copy>(base: *mut u8, var: TlsVar<T>, value: T) {
    let slot = base.add(var.offset) as *mut T;
    core::ptr::write(slot, value);
}
