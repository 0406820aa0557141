//! The stack half of a uthread's saved state (spec.md §3 `Task` data model: "Embeds a
//! uthread (saved user context, stack, TLS descriptor)").
//!
//! We back every uthread stack with a heap allocation the `Task` owns for its whole
//! lifetime, mirroring spec.md §5's `dynamic_stack` flag: the 2LS's `task_create` asks for
//! a stack of a given size and this crate, not the 2LS, frees it on `task_destroy`.

use fringe::SliceStack;

/// An owned uthread stack. `fringe::Generator` wants a `Stack` impl with a `'static`
/// lifetime; since `UthreadStack` itself outlives the `Generator` built on top of it (the
/// `Task` that owns both is destroyed only after the generator has either run to
/// completion or been abandoned, never concurrently with a resume), we hand the generator
/// a `'static`-erased slice and rely on that ordering rather than the borrow checker here.
pub struct UthreadStack {
    storage: Box<[u8]>,
}

impl UthreadStack {
    pub fn new(size: usize) -> Self {
        assert!(size >= 4096, "uthread stack must be at least one page");
        UthreadStack {
            storage: vec![0u8; size].into_boxed_slice(),
        }
    }

    pub fn size(&self) -> usize {
        self.storage.len()
    }

    /// Borrow this stack as the `Stack` fringe's `Generator` needs.
    ///
    /// # Safety
    /// The returned `SliceStack` must not outlive `self`; callers (this crate's
    /// `Uthread::new`) uphold that by constructing the generator and the stack together
    /// and dropping both at the same time.
    pub(crate) unsafe fn as_slice_stack(&mut self) -> SliceStack<'static> {
        let slice: &'static mut [u8] = core::mem::transmute(&mut self.storage[..]);
        SliceStack(slice)
    }
}
