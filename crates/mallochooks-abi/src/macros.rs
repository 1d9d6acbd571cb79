//! Helper macros for the exported entry points.

/// Return address of the current function, as a [`Caller`].
///
/// Reads the saved return address out of the frame record, so it must be
/// expanded directly inside the exported entry point. Without forced frame
/// pointers (see `build.rs`) or on other architectures it yields
/// [`Caller::UNKNOWN`], which classifies as an ordinary program caller.
///
/// [`Caller`]: mallochooks_core::Caller
/// [`Caller::UNKNOWN`]: mallochooks_core::Caller::UNKNOWN
#[allow(unused_macros)]
macro_rules! return_address {
    () => {{
        #[cfg(all(mallochooks_frame_pointers, target_arch = "x86_64"))]
        let addr: usize = {
            let ra: usize;
            // SAFETY: rbp is this frame's base; the return address sits one
            // word above it.
            unsafe {
                ::core::arch::asm!(
                    "mov {ra}, [rbp + 8]",
                    ra = out(reg) ra,
                    options(nostack, readonly, preserves_flags),
                );
            }
            ra
        };
        #[cfg(all(mallochooks_frame_pointers, target_arch = "aarch64"))]
        let addr: usize = {
            let ra: usize;
            // SAFETY: x29 points at the frame record {fp, lr}.
            unsafe {
                ::core::arch::asm!(
                    "ldr {ra}, [x29, #8]",
                    ra = out(reg) ra,
                    options(nostack, readonly, preserves_flags),
                );
            }
            ra
        };
        #[cfg(not(all(
            mallochooks_frame_pointers,
            any(target_arch = "x86_64", target_arch = "aarch64")
        )))]
        let addr: usize = 0;
        ::mallochooks_core::Caller::new(addr)
    }};
}

/// Generate the seven allocator entry points under the given symbol names,
/// each forwarding to the process-wide dispatcher with its caller address.
///
/// ```ignore
/// allocator_entry_points! {
///     malloc = __wrap_malloc,
///     free = __wrap_free,
///     ...
/// }
/// ```
#[allow(unused_macros)]
macro_rules! allocator_entry_points {
    (
        malloc = $malloc:ident,
        free = $free:ident,
        realloc = $realloc:ident,
        calloc = $calloc:ident,
        memalign = $memalign:ident,
        posix_memalign = $posix_memalign:ident,
        usable_size = $usable_size:ident $(,)?
    ) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $malloc(size: usize) -> *mut ::std::ffi::c_void {
            let caller = return_address!();
            unsafe { $crate::state::DISPATCH.malloc(size, caller) }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $free(ptr: *mut ::std::ffi::c_void) {
            let caller = return_address!();
            unsafe { $crate::state::DISPATCH.free(ptr, caller) }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $realloc(
            ptr: *mut ::std::ffi::c_void,
            size: usize,
        ) -> *mut ::std::ffi::c_void {
            let caller = return_address!();
            unsafe { $crate::state::DISPATCH.realloc(ptr, size, caller) }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $calloc(nmemb: usize, size: usize) -> *mut ::std::ffi::c_void {
            let caller = return_address!();
            unsafe { $crate::state::DISPATCH.calloc(nmemb, size, caller) }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $memalign(alignment: usize, size: usize) -> *mut ::std::ffi::c_void {
            let caller = return_address!();
            unsafe { $crate::state::DISPATCH.memalign(alignment, size, caller) }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $posix_memalign(
            memptr: *mut *mut ::std::ffi::c_void,
            alignment: usize,
            size: usize,
        ) -> ::std::ffi::c_int {
            let caller = return_address!();
            unsafe { $crate::state::DISPATCH.posix_memalign(memptr, alignment, size, caller) }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $usable_size(ptr: *mut ::std::ffi::c_void) -> usize {
            unsafe { $crate::state::DISPATCH.usable_size(ptr) }
        }
    };
}
