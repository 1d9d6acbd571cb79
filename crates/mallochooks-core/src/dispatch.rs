//! Per-call routing between the hook chain and the private path.
//!
//! ```text
//! entry --> reentrant? ----------------------------> private path
//!       \-> self / loader / libdl caller? ---------> private path
//!       \-> free/realloc of a privately owned ptr -> private path
//!       \-> otherwise ------------------------------> hook chain
//! ```
//!
//! The reentrancy flag stays set for the whole call on either path, so
//! allocations made underneath (symbol lookup, event consumers, the loader
//! formatting an error) are recognised as reentrant.
//!
//! `calloc` and `posix_memalign` are synthesized here from `malloc` and
//! `memalign` so that both paths share one definition of their semantics.

use std::ffi::{c_int, c_void};
use std::ptr;

use crate::error::HookError;
use crate::guard::{self, ActiveGuard};
use crate::hook::{Caller, HookLink, PTR_ALIGN};
use crate::private::PrivateHeap;
use crate::ranges::Classify;

/// Which path a call takes, holding the reentrancy flag where we set it.
enum Route {
    Hooked(ActiveGuard),
    /// `None` when an outer frame on this thread already holds the flag.
    Private(Option<ActiveGuard>),
}

/// Validate a `posix_memalign` alignment.
pub fn check_alignment(alignment: usize) -> Result<usize, HookError> {
    if !alignment.is_power_of_two() || !alignment.is_multiple_of(PTR_ALIGN) {
        return Err(HookError::InvalidAlignment(alignment));
    }
    Ok(alignment)
}

/// Round a `memalign` alignment up to a power of two, as glibc does. Only an
/// alignment with no representable power of two above it is rejected.
pub fn round_alignment(alignment: usize) -> Result<usize, HookError> {
    alignment
        .max(1)
        .checked_next_power_of_two()
        .ok_or(HookError::InvalidAlignment(alignment))
}

/// `nmemb * size`, or the overflow error `calloc` reports.
pub fn checked_extent(nmemb: usize, size: usize) -> Result<usize, HookError> {
    nmemb
        .checked_mul(size)
        .ok_or(HookError::SizeOverflow { nmemb, size })
}

fn set_errno(value: c_int) {
    // SAFETY: __errno_location returns this thread's errno slot.
    unsafe { *libc::__errno_location() = value };
}

pub struct Dispatcher<C, T, K> {
    chain: C,
    private: PrivateHeap<T>,
    classifier: K,
}

impl<C, T, K> Dispatcher<C, T, K> {
    pub const fn new(chain: C, private: PrivateHeap<T>, classifier: K) -> Self {
        Self {
            chain,
            private,
            classifier,
        }
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    pub fn private(&self) -> &PrivateHeap<T> {
        &self.private
    }
}

impl<C: HookLink, T: HookLink, K: Classify> Dispatcher<C, T, K> {
    fn route(&self, caller: Caller) -> Route {
        let Some(active) = guard::enter() else {
            return Route::Private(None);
        };
        if self.classifier.classify(caller.addr()).bypasses_hooks() {
            Route::Private(Some(active))
        } else {
            Route::Hooked(active)
        }
    }

    /// Run the chain's `init` with the reentrancy flag held.
    pub fn init(&self) {
        let _active = guard::enter();
        self.chain.init();
    }

    /// # Safety
    /// C `malloc` contract.
    pub unsafe fn malloc(&self, size: usize, caller: Caller) -> *mut c_void {
        match self.route(caller) {
            Route::Hooked(_active) => unsafe { self.chain.malloc(size, caller) },
            Route::Private(_active) => unsafe { self.private.malloc(size, caller) },
        }
    }

    /// # Safety
    /// C `free` contract.
    pub unsafe fn free(&self, ptr: *mut c_void, caller: Caller) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: `ptr` came from some allocator in the process.
        if unsafe { self.private.owns(ptr) } {
            let _active = guard::enter();
            return unsafe { self.private.free(ptr, caller) };
        }
        match self.route(caller) {
            Route::Hooked(_active) => unsafe { self.chain.free(ptr, caller) },
            // A classified caller freeing a chain-issued block still fires its
            // free events, so consumers never lose track of a live block.
            Route::Private(Some(_active)) => unsafe { self.chain.free(ptr, caller) },
            // Nested inside a hooked call: no second round of events.
            Route::Private(None) => unsafe { self.private.inner().free(ptr, caller) },
        }
    }

    /// # Safety
    /// C `realloc` contract.
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize, caller: Caller) -> *mut c_void {
        if ptr.is_null() {
            return match self.route(caller) {
                Route::Hooked(_active) => unsafe { self.chain.realloc(ptr, size, caller) },
                Route::Private(_active) => unsafe { self.private.realloc(ptr, size, caller) },
            };
        }
        // SAFETY: `ptr` came from some allocator in the process.
        if unsafe { self.private.owns(ptr) } {
            let _active = guard::enter();
            return unsafe { self.private.realloc(ptr, size, caller) };
        }
        match self.route(caller) {
            Route::Hooked(_active) => unsafe { self.chain.realloc(ptr, size, caller) },
            Route::Private(Some(_active)) => unsafe { self.chain.realloc(ptr, size, caller) },
            Route::Private(None) => unsafe { self.private.inner().realloc(ptr, size, caller) },
        }
    }

    /// # Safety
    /// C `memalign` contract.
    pub unsafe fn memalign(&self, alignment: usize, size: usize, caller: Caller) -> *mut c_void {
        let alignment = match round_alignment(alignment) {
            Ok(alignment) => alignment,
            Err(err) => {
                set_errno(err.errno());
                return ptr::null_mut();
            }
        };
        match self.route(caller) {
            Route::Hooked(_active) => unsafe { self.chain.memalign(alignment, size, caller) },
            Route::Private(_active) => unsafe { self.private.memalign(alignment, size, caller) },
        }
    }

    /// `malloc` plus a zero-fill of the full `nmemb * size` extent.
    ///
    /// # Safety
    /// C `calloc` contract.
    pub unsafe fn calloc(&self, nmemb: usize, size: usize, caller: Caller) -> *mut c_void {
        let total = match checked_extent(nmemb, size) {
            Ok(total) => total,
            Err(err) => {
                set_errno(err.errno());
                return ptr::null_mut();
            }
        };
        let ptr = unsafe { self.malloc(total, caller) };
        if !ptr.is_null() {
            // SAFETY: the block holds at least `total` bytes.
            unsafe { ptr::write_bytes(ptr.cast::<u8>(), 0, total) };
        }
        ptr
    }

    /// `memalign` with POSIX error reporting.
    ///
    /// # Safety
    /// `memptr` must be valid for a pointer-sized write.
    pub unsafe fn posix_memalign(
        &self,
        memptr: *mut *mut c_void,
        alignment: usize,
        size: usize,
        caller: Caller,
    ) -> c_int {
        let alignment = match check_alignment(alignment) {
            Ok(alignment) => alignment,
            Err(err) => return err.errno(),
        };
        let ptr = unsafe { self.memalign(alignment, size, caller) };
        if ptr.is_null() {
            return libc::ENOMEM;
        }
        // SAFETY: caller guarantees `memptr` is writable.
        unsafe { *memptr = ptr };
        0
    }

    /// Usable size of any block this process's allocators issued. Fires no events.
    ///
    /// # Safety
    /// `ptr` is null or live.
    pub unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let _active = guard::enter();
        // SAFETY: `ptr` came from some allocator in the process.
        if unsafe { self.private.owns(ptr) } {
            unsafe { self.private.usable_size(ptr) }
        } else {
            unsafe { self.chain.usable_size(ptr) }
        }
    }
}
