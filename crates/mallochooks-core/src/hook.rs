//! The hook-link protocol.
//!
//! A chain is a nesting of links, outermost first, each owning its `next`.
//! Every link implements the same five operations (plus the usable-size
//! query), may rewrite parameters, and must delegate to `next` with the same
//! operation. The innermost link is the terminal (see [`crate::terminal`]),
//! which reaches the real allocator. Order is fixed by the type that spells
//! the chain, e.g. `EventLink<Recorder, RoundUp<Terminal>>`.

use std::ffi::c_void;

/// Alignment implied by `malloc`, `calloc` and `realloc`.
pub const PTR_ALIGN: usize = size_of::<*const c_void>();

/// Return address of the code that called an allocator entry point.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Caller(usize);

impl Caller {
    /// Attribution unavailable.
    pub const UNKNOWN: Self = Self(0);

    #[must_use]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }

    #[must_use]
    pub fn as_ptr(self) -> *const c_void {
        self.0 as *const c_void
    }
}

/// One interceptor in a hook chain.
///
/// # Safety
///
/// Implementations must return pointers obeying the C allocator contract for
/// the requested size and alignment, and must accept in `free`/`realloc` every
/// non-null pointer they (or their `next`) handed out.
pub unsafe trait HookLink: Sync {
    /// Propagate process initialization down the chain.
    fn init(&self);

    /// # Safety
    /// Allocator contract of `malloc`.
    unsafe fn malloc(&self, size: usize, caller: Caller) -> *mut c_void;

    /// # Safety
    /// `ptr` is null or live and issued by this chain.
    unsafe fn free(&self, ptr: *mut c_void, caller: Caller);

    /// # Safety
    /// `ptr` is null or live and issued by this chain.
    unsafe fn realloc(&self, ptr: *mut c_void, size: usize, caller: Caller) -> *mut c_void;

    /// # Safety
    /// `alignment` is a power of two.
    unsafe fn memalign(&self, alignment: usize, size: usize, caller: Caller) -> *mut c_void;

    /// Current capacity of a live block; 0 for null.
    ///
    /// # Safety
    /// `ptr` is null or live and issued by this chain.
    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize;
}

// SAFETY: forwards every operation unchanged.
unsafe impl<L: HookLink + ?Sized> HookLink for &L {
    fn init(&self) {
        (**self).init();
    }

    unsafe fn malloc(&self, size: usize, caller: Caller) -> *mut c_void {
        unsafe { (**self).malloc(size, caller) }
    }

    unsafe fn free(&self, ptr: *mut c_void, caller: Caller) {
        unsafe { (**self).free(ptr, caller) }
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize, caller: Caller) -> *mut c_void {
        unsafe { (**self).realloc(ptr, size, caller) }
    }

    unsafe fn memalign(&self, alignment: usize, size: usize, caller: Caller) -> *mut c_void {
        unsafe { (**self).memalign(alignment, size, caller) }
    }

    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
        unsafe { (**self).usable_size(ptr) }
    }
}
