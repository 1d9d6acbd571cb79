//! Where each strategy finds the allocator it wraps.
//!
//! * preload: our own `malloc` shadows the real one, so the next definition
//!   in search order is looked up with `dlsym(RTLD_NEXT, ..)`.
//! * wrap: the link step aliases `__real_malloc` to the original.
//! * hook-vars: nothing was renamed; the ordinary libc functions are the
//!   underlying allocator as long as the previous hooks are restored around
//!   the call.

use mallochooks_core::{Symbol, SymbolSource};

#[cfg(feature = "preload")]
pub type ActiveSource = DlsymSource;
#[cfg(feature = "wrap")]
pub type ActiveSource = WrapSource;
#[cfg(feature = "hook-vars")]
pub type ActiveSource = LibcSource;

/// The `RTLD_NEXT` definitions after this object.
#[derive(Debug, Default, Clone, Copy)]
pub struct DlsymSource;

impl SymbolSource for DlsymSource {
    fn lookup(&self, symbol: Symbol) -> Option<usize> {
        // SAFETY: the name is a NUL-terminated static string.
        let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, symbol.c_name().as_ptr()) };
        if addr.is_null() {
            // SAFETY: dlerror returns null or a thread-local C string.
            let reason = unsafe { libc::dlerror() };
            if !reason.is_null() {
                // SAFETY: checked non-null above.
                let reason = unsafe { std::ffi::CStr::from_ptr(reason) };
                mallochooks_core::hook_debug!(
                    "dlsym({symbol}) failed: {}",
                    reason.to_str().unwrap_or("<non-utf8 dlerror>")
                );
            }
            return None;
        }
        Some(addr as usize)
    }
}

#[cfg(feature = "wrap")]
unsafe extern "C" {
    fn __real_malloc(size: usize) -> *mut std::ffi::c_void;
    fn __real_free(ptr: *mut std::ffi::c_void);
    fn __real_realloc(ptr: *mut std::ffi::c_void, size: usize) -> *mut std::ffi::c_void;
    fn __real_calloc(nmemb: usize, size: usize) -> *mut std::ffi::c_void;
    fn __real_memalign(alignment: usize, size: usize) -> *mut std::ffi::c_void;
    fn __real_posix_memalign(
        memptr: *mut *mut std::ffi::c_void,
        alignment: usize,
        size: usize,
    ) -> std::ffi::c_int;
    fn __real_malloc_usable_size(ptr: *mut std::ffi::c_void) -> usize;
}

/// Link-time `__real_*` aliases. Never fails.
#[cfg(feature = "wrap")]
#[derive(Debug, Default, Clone, Copy)]
pub struct WrapSource;

#[cfg(feature = "wrap")]
impl SymbolSource for WrapSource {
    fn lookup(&self, symbol: Symbol) -> Option<usize> {
        Some(match symbol {
            Symbol::Malloc => __real_malloc as usize,
            Symbol::Free => __real_free as usize,
            Symbol::Realloc => __real_realloc as usize,
            Symbol::Calloc => __real_calloc as usize,
            Symbol::Memalign => __real_memalign as usize,
            Symbol::PosixMemalign => __real_posix_memalign as usize,
            Symbol::UsableSize => __real_malloc_usable_size as usize,
        })
    }
}

/// The libc allocator functions themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcSource;

impl SymbolSource for LibcSource {
    fn lookup(&self, symbol: Symbol) -> Option<usize> {
        Some(match symbol {
            Symbol::Malloc => libc::malloc as usize,
            Symbol::Free => libc::free as usize,
            Symbol::Realloc => libc::realloc as usize,
            Symbol::Calloc => libc::calloc as usize,
            Symbol::Memalign => libc::memalign as usize,
            Symbol::PosixMemalign => libc::posix_memalign as usize,
            Symbol::UsableSize => libc::malloc_usable_size as usize,
        })
    }
}
