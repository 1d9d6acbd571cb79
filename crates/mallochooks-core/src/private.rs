//! Private allocation path.
//!
//! Calls that must bypass instrumentation (reentrant, self and loader calls)
//! are served here. Functionally this is the terminal link plus an in-band
//! header, which gives the capability the dispatcher needs: [`owns`] tells
//! whether a pointer was issued privately, so its `free`/`realloc` can be
//! routed back here regardless of who makes them.
//!
//! Layout of a private block (`offset` >= header size, `user` aligned):
//!
//! ```text
//! raw                              user - 24   user - 8   user
//! |<----------- padding ---------->| size | offset | tag  | payload ...
//! ```
//!
//! The tag is `TAG_MAGIC ^ user`, so a stale or foreign word matching it by
//! accident is vanishingly unlikely. [`owns`] only reads the word at
//! `user - 8`, which every allocator in scope keeps mapped.
//!
//! [`owns`]: PrivateHeap::owns

use std::ffi::c_void;
use std::ptr;

use crate::hook::{Caller, HookLink, PTR_ALIGN};

const TAG_MAGIC: usize = 0x7072_6976_6d61_6c6c_u64 as usize;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct PrivateHeader {
    size: usize,
    offset: usize,
    tag: usize,
}

const HEADER_SIZE: usize = size_of::<PrivateHeader>();

/// Alignment every private block guarantees (`max_align_t`).
const MIN_ALIGN: usize = 16;

#[inline]
fn header_of(user: *mut c_void) -> *mut PrivateHeader {
    (user as usize - HEADER_SIZE) as *mut PrivateHeader
}

pub struct PrivateHeap<T> {
    inner: T,
}

impl<T> PrivateHeap<T> {
    pub const fn new(inner: T) -> Self {
        Self { inner }
    }

    /// The untagged allocator underneath.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Whether `ptr` is a live block issued by this heap.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by some allocator in the
    /// process (so that the word in front of it is readable).
    #[must_use]
    pub unsafe fn owns(&self, ptr: *const c_void) -> bool {
        let addr = ptr as usize;
        if addr < HEADER_SIZE || addr % PTR_ALIGN != 0 {
            return false;
        }
        // SAFETY: caller guarantees the preceding word is mapped.
        let tag = unsafe { ptr::read((addr - PTR_ALIGN) as *const usize) };
        tag == TAG_MAGIC ^ addr
    }
}

impl<T: HookLink> PrivateHeap<T> {
    unsafe fn allocate(&self, alignment: usize, size: usize, caller: Caller) -> *mut c_void {
        let alignment = alignment.max(MIN_ALIGN);
        let offset = HEADER_SIZE.next_multiple_of(alignment);
        let Some(total) = size.checked_add(offset) else {
            return ptr::null_mut();
        };
        let raw = if alignment <= MIN_ALIGN {
            unsafe { self.inner.malloc(total, caller) }
        } else {
            unsafe { self.inner.memalign(alignment, total, caller) }
        };
        if raw.is_null() {
            return raw;
        }
        let user = (raw as usize + offset) as *mut c_void;
        // SAFETY: `offset >= HEADER_SIZE`, so the header lies inside the block.
        unsafe {
            ptr::write(
                header_of(user),
                PrivateHeader {
                    size,
                    offset,
                    tag: TAG_MAGIC ^ user as usize,
                },
            );
        }
        user
    }

    unsafe fn header(&self, user: *mut c_void) -> PrivateHeader {
        // SAFETY: caller checked `owns(user)`.
        unsafe { ptr::read(header_of(user)) }
    }
}

// SAFETY: every returned block is carved from an `inner` allocation large
// enough for header, padding and payload, and aligned as requested.
unsafe impl<T: HookLink> HookLink for PrivateHeap<T> {
    fn init(&self) {
        self.inner.init();
    }

    unsafe fn malloc(&self, size: usize, caller: Caller) -> *mut c_void {
        unsafe { self.allocate(MIN_ALIGN, size, caller) }
    }

    unsafe fn free(&self, ptr: *mut c_void, caller: Caller) {
        if ptr.is_null() {
            return;
        }
        let header = unsafe { self.header(ptr) };
        // Scrub the tag so a stale pointer is no longer recognised.
        unsafe { (*header_of(ptr)).tag = 0 };
        let raw = (ptr as usize - header.offset) as *mut c_void;
        unsafe { self.inner.free(raw, caller) };
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize, caller: Caller) -> *mut c_void {
        if ptr.is_null() {
            return unsafe { self.malloc(size, caller) };
        }
        if size == 0 {
            unsafe { self.free(ptr, caller) };
            return ptr::null_mut();
        }
        let header = unsafe { self.header(ptr) };
        let fresh = unsafe { self.malloc(size, caller) };
        if fresh.is_null() {
            return fresh;
        }
        // SAFETY: distinct live blocks, each at least `min(old, new)` bytes.
        unsafe {
            ptr::copy_nonoverlapping(ptr.cast::<u8>(), fresh.cast::<u8>(), header.size.min(size));
            self.free(ptr, caller);
        }
        fresh
    }

    unsafe fn memalign(&self, alignment: usize, size: usize, caller: Caller) -> *mut c_void {
        unsafe { self.allocate(alignment, size, caller) }
    }

    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
        if ptr.is_null() {
            return 0;
        }
        unsafe { self.header(ptr) }.size
    }
}
