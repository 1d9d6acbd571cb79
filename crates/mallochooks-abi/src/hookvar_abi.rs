//! Hook-variable substitution through glibc's `__malloc_hook` family.
//!
//! glibc consults these variables on every call into its allocator; when
//! set, the hook receives the call together with the caller's return
//! address. Each of our hooks restores whatever was installed before us for
//! the duration of the call, so the terminal link's ordinary `malloc` goes
//! to glibc (or to the previous layer's hook) instead of back to us.
//!
//! glibc removed the variables from its public API in 2.34; the versioned
//! references below only link against the compat symbols of older releases.

use std::ffi::c_void;

use mallochooks_core::hookvars::{
    FreeHookFn, HookTable, HookVars, MallocHookFn, MemalignHookFn, ReallocHookFn, SwapState,
};
use mallochooks_core::{Caller, hook_warn};

use crate::state::DISPATCH;

#[cfg(not(all(target_arch = "x86_64", target_env = "gnu")))]
compile_error!("the `hook-vars` strategy needs x86_64 glibc");

unsafe extern "C" {
    #[link_name = "__malloc_hook@GLIBC_2.2.5"]
    static mut GLIBC_MALLOC_HOOK: Option<MallocHookFn>;
    #[link_name = "__free_hook@GLIBC_2.2.5"]
    static mut GLIBC_FREE_HOOK: Option<FreeHookFn>;
    #[link_name = "__realloc_hook@GLIBC_2.2.5"]
    static mut GLIBC_REALLOC_HOOK: Option<ReallocHookFn>;
    #[link_name = "__memalign_hook@GLIBC_2.2.5"]
    static mut GLIBC_MEMALIGN_HOOK: Option<MemalignHookFn>;
}

/// The four glibc variables.
pub struct GlibcHookVars;

// SAFETY: `write` stores exactly the given pointers.
unsafe impl HookVars for GlibcHookVars {
    fn read(&self) -> HookTable {
        // SAFETY: plain word-sized loads of glibc's variables.
        unsafe {
            HookTable {
                malloc: (&raw const GLIBC_MALLOC_HOOK).read_volatile(),
                free: (&raw const GLIBC_FREE_HOOK).read_volatile(),
                realloc: (&raw const GLIBC_REALLOC_HOOK).read_volatile(),
                memalign: (&raw const GLIBC_MEMALIGN_HOOK).read_volatile(),
            }
        }
    }

    fn write(&self, table: HookTable) {
        // SAFETY: plain word-sized stores; glibc reads each slot once per call.
        unsafe {
            (&raw mut GLIBC_MALLOC_HOOK).write_volatile(table.malloc);
            (&raw mut GLIBC_FREE_HOOK).write_volatile(table.free);
            (&raw mut GLIBC_REALLOC_HOOK).write_volatile(table.realloc);
            (&raw mut GLIBC_MEMALIGN_HOOK).write_volatile(table.memalign);
        }
    }
}

const OURS: HookTable = HookTable {
    malloc: Some(malloc_hook),
    free: Some(free_hook),
    realloc: Some(realloc_hook),
    memalign: Some(memalign_hook),
};

pub static SWAP: SwapState<GlibcHookVars> = SwapState::new(GlibcHookVars, OURS);

/// Save the current hooks and install ours. Called once from the constructor.
pub fn install() {
    SWAP.install();
    hook_warn!(
        "hook-variable interception installed; the hooks are process-wide, so \
         other threads may make unhooked calls while one thread passes through"
    );
}

unsafe extern "C" fn malloc_hook(size: usize, caller: *const c_void) -> *mut c_void {
    let _pass = SWAP.passthrough();
    unsafe { DISPATCH.malloc(size, Caller::new(caller as usize)) }
}

unsafe extern "C" fn free_hook(ptr: *mut c_void, caller: *const c_void) {
    let _pass = SWAP.passthrough();
    unsafe { DISPATCH.free(ptr, Caller::new(caller as usize)) }
}

unsafe extern "C" fn realloc_hook(ptr: *mut c_void, size: usize, caller: *const c_void) -> *mut c_void {
    let _pass = SWAP.passthrough();
    unsafe { DISPATCH.realloc(ptr, size, Caller::new(caller as usize)) }
}

unsafe extern "C" fn memalign_hook(alignment: usize, size: usize, caller: *const c_void) -> *mut c_void {
    let _pass = SWAP.passthrough();
    unsafe { DISPATCH.memalign(alignment, size, Caller::new(caller as usize)) }
}
