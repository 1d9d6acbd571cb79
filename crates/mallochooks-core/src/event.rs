//! Event layer: pre/post observation around every hooked operation.
//!
//! [`AllocEvents`] is the surface instrumentation actually writes against;
//! [`EventLink`] is the hook link that fires it. `realloc` is split into
//! three disjoint cases and each fires exactly its own event pair:
//!
//! | request              | behaves as | events                          |
//! |----------------------|------------|---------------------------------|
//! | `realloc(NULL, n)`   | `malloc`   | `pre_alloc` / `post_successful_alloc` |
//! | `realloc(p, 0)`      | `free`     | `pre_nonnull_free` / `post_nonnull_free` |
//! | `realloc(p, n)`      | resize     | `pre_nonnull_nonzero_realloc`, `pre_alloc` / `post_nonnull_nonzero_realloc` |

use std::ffi::c_void;

use crate::hook::{Caller, HookLink, PTR_ALIGN};
use crate::hook_trace;

/// Size, alignment and attribution of one allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub size: usize,
    pub alignment: usize,
    pub caller: Caller,
}

/// A completed `realloc(p, n)` with non-null `p` and non-zero `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resize {
    pub old_ptr: *mut c_void,
    /// Null when the underlying resize failed and `old_ptr` is untouched.
    pub new_ptr: *mut c_void,
    /// Usable size of `old_ptr` captured before delegating.
    pub old_usable: usize,
    pub requested_size: usize,
    /// Size actually passed down the chain.
    pub modified_size: usize,
    pub caller: Caller,
}

/// Instrumentation callbacks. Every method defaults to doing nothing.
///
/// Callbacks run with the reentrancy flag held, so any allocation they make
/// is served by the private path and never re-enters this layer.
pub trait AllocEvents: Sync {
    fn post_init(&self) {}

    /// May enlarge `size` (and, for `memalign`, change `alignment`) before
    /// the request is delegated. For the fixed-alignment family the alignment
    /// must come back unchanged.
    fn pre_alloc(&self, _size: &mut usize, _alignment: &mut usize, _caller: Caller) {}

    fn post_successful_alloc(&self, _ptr: *mut c_void, _modified: AllocRequest, _requested: AllocRequest) {}

    fn pre_nonnull_free(&self, _ptr: *mut c_void, _usable_size: usize) {}

    fn post_nonnull_free(&self, _ptr: *mut c_void) {}

    /// May enlarge `size` before a true resize is delegated. `pre_alloc`
    /// runs right after it on the same size.
    fn pre_nonnull_nonzero_realloc(
        &self,
        _ptr: *mut c_void,
        _size: &mut usize,
        _old_usable: usize,
        _caller: Caller,
    ) {
    }

    fn post_nonnull_nonzero_realloc(&self, _resize: Resize) {}
}

/// Consumer that observes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvents;

impl AllocEvents for NoEvents {}

/// Consumer that writes one trace record per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tracer;

impl AllocEvents for Tracer {
    fn post_init(&self) {
        hook_trace!("init");
    }

    fn post_successful_alloc(&self, ptr: *mut c_void, modified: AllocRequest, requested: AllocRequest) {
        hook_trace!(
            "alloc {:p} size {} (requested {}) align {} caller {:#x}",
            ptr,
            modified.size,
            requested.size,
            modified.alignment,
            requested.caller.addr()
        );
    }

    fn pre_nonnull_free(&self, ptr: *mut c_void, usable_size: usize) {
        hook_trace!("free {:p} usable {}", ptr, usable_size);
    }

    fn post_nonnull_nonzero_realloc(&self, resize: Resize) {
        hook_trace!(
            "realloc {:p} -> {:p} size {} (old usable {}) caller {:#x}",
            resize.old_ptr,
            resize.new_ptr,
            resize.modified_size,
            resize.old_usable,
            resize.caller.addr()
        );
    }
}

impl<E: AllocEvents + ?Sized> AllocEvents for &E {
    fn post_init(&self) {
        (**self).post_init();
    }

    fn pre_alloc(&self, size: &mut usize, alignment: &mut usize, caller: Caller) {
        (**self).pre_alloc(size, alignment, caller);
    }

    fn post_successful_alloc(&self, ptr: *mut c_void, modified: AllocRequest, requested: AllocRequest) {
        (**self).post_successful_alloc(ptr, modified, requested);
    }

    fn pre_nonnull_free(&self, ptr: *mut c_void, usable_size: usize) {
        (**self).pre_nonnull_free(ptr, usable_size);
    }

    fn post_nonnull_free(&self, ptr: *mut c_void) {
        (**self).post_nonnull_free(ptr);
    }

    fn pre_nonnull_nonzero_realloc(
        &self,
        ptr: *mut c_void,
        size: &mut usize,
        old_usable: usize,
        caller: Caller,
    ) {
        (**self).pre_nonnull_nonzero_realloc(ptr, size, old_usable, caller);
    }

    fn post_nonnull_nonzero_realloc(&self, resize: Resize) {
        (**self).post_nonnull_nonzero_realloc(resize);
    }
}

/// Two consumers, notified in order (`.0` first).
impl<A: AllocEvents, B: AllocEvents> AllocEvents for (A, B) {
    fn post_init(&self) {
        self.0.post_init();
        self.1.post_init();
    }

    fn pre_alloc(&self, size: &mut usize, alignment: &mut usize, caller: Caller) {
        self.0.pre_alloc(size, alignment, caller);
        self.1.pre_alloc(size, alignment, caller);
    }

    fn post_successful_alloc(&self, ptr: *mut c_void, modified: AllocRequest, requested: AllocRequest) {
        self.0.post_successful_alloc(ptr, modified, requested);
        self.1.post_successful_alloc(ptr, modified, requested);
    }

    fn pre_nonnull_free(&self, ptr: *mut c_void, usable_size: usize) {
        self.0.pre_nonnull_free(ptr, usable_size);
        self.1.pre_nonnull_free(ptr, usable_size);
    }

    fn post_nonnull_free(&self, ptr: *mut c_void) {
        self.0.post_nonnull_free(ptr);
        self.1.post_nonnull_free(ptr);
    }

    fn pre_nonnull_nonzero_realloc(
        &self,
        ptr: *mut c_void,
        size: &mut usize,
        old_usable: usize,
        caller: Caller,
    ) {
        self.0.pre_nonnull_nonzero_realloc(ptr, size, old_usable, caller);
        self.1.pre_nonnull_nonzero_realloc(ptr, size, old_usable, caller);
    }

    fn post_nonnull_nonzero_realloc(&self, resize: Resize) {
        self.0.post_nonnull_nonzero_realloc(resize);
        self.1.post_nonnull_nonzero_realloc(resize);
    }
}

/// Hook link that fires `E`'s callbacks around every operation of `N`.
pub struct EventLink<E, N> {
    events: E,
    next: N,
}

impl<E, N> EventLink<E, N> {
    pub const fn new(events: E, next: N) -> Self {
        Self { events, next }
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    pub fn next(&self) -> &N {
        &self.next
    }

    /// Run `pre_alloc` for the fixed-alignment family.
    fn fixed_alignment_request(&self, size: usize, caller: Caller) -> (AllocRequest, AllocRequest)
    where
        E: AllocEvents,
    {
        let requested = AllocRequest {
            size,
            alignment: PTR_ALIGN,
            caller,
        };
        let mut modified = requested;
        self.events
            .pre_alloc(&mut modified.size, &mut modified.alignment, caller);
        assert_eq!(
            modified.alignment, PTR_ALIGN,
            "pre_alloc changed the alignment of a pointer-aligned request"
        );
        (requested, modified)
    }
}

// SAFETY: every pointer returned comes from `next`, passed through unchanged.
unsafe impl<E: AllocEvents, N: HookLink> HookLink for EventLink<E, N> {
    fn init(&self) {
        self.events.post_init();
        self.next.init();
    }

    unsafe fn malloc(&self, size: usize, caller: Caller) -> *mut c_void {
        let (requested, modified) = self.fixed_alignment_request(size, caller);
        let ptr = unsafe { self.next.malloc(modified.size, caller) };
        if !ptr.is_null() {
            self.events.post_successful_alloc(ptr, modified, requested);
        }
        ptr
    }

    unsafe fn free(&self, ptr: *mut c_void, caller: Caller) {
        if ptr.is_null() {
            return;
        }
        // The usable size is unrecoverable once the block is gone.
        let usable = unsafe { self.next.usable_size(ptr) };
        self.events.pre_nonnull_free(ptr, usable);
        unsafe { self.next.free(ptr, caller) };
        self.events.post_nonnull_free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize, caller: Caller) -> *mut c_void {
        if ptr.is_null() {
            let (requested, modified) = self.fixed_alignment_request(size, caller);
            let fresh = unsafe { self.next.realloc(ptr, modified.size, caller) };
            if !fresh.is_null() {
                self.events.post_successful_alloc(fresh, modified, requested);
            }
            return fresh;
        }

        if size == 0 {
            let usable = unsafe { self.next.usable_size(ptr) };
            self.events.pre_nonnull_free(ptr, usable);
            unsafe { self.next.free(ptr, caller) };
            self.events.post_nonnull_free(ptr);
            return std::ptr::null_mut();
        }

        let old_usable = unsafe { self.next.usable_size(ptr) };
        let mut modified_size = size;
        self.events
            .pre_nonnull_nonzero_realloc(ptr, &mut modified_size, old_usable, caller);
        assert!(
            modified_size != 0,
            "pre_nonnull_nonzero_realloc turned a resize into a free"
        );
        // The resized block must carry whatever pre_alloc reserves on malloc.
        let mut alignment = PTR_ALIGN;
        self.events
            .pre_alloc(&mut modified_size, &mut alignment, caller);
        assert_eq!(
            alignment, PTR_ALIGN,
            "pre_alloc changed the alignment of a pointer-aligned request"
        );
        let new_ptr = unsafe { self.next.realloc(ptr, modified_size, caller) };
        self.events.post_nonnull_nonzero_realloc(Resize {
            old_ptr: ptr,
            new_ptr,
            old_usable,
            requested_size: size,
            modified_size,
            caller,
        });
        new_ptr
    }

    unsafe fn memalign(&self, alignment: usize, size: usize, caller: Caller) -> *mut c_void {
        let requested = AllocRequest {
            size,
            alignment,
            caller,
        };
        let mut modified = requested;
        self.events
            .pre_alloc(&mut modified.size, &mut modified.alignment, caller);
        assert!(
            modified.alignment.is_power_of_two(),
            "pre_alloc produced a non power of two alignment"
        );
        let ptr = unsafe { self.next.memalign(modified.alignment, modified.size, caller) };
        if !ptr.is_null() {
            self.events.post_successful_alloc(ptr, modified, requested);
        }
        ptr
    }

    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
        unsafe { self.next.usable_size(ptr) }
    }
}
