//! Hook-variable interception end to end: an emulated host allocator that
//! consults its hook variables, a previously installed layer, and our hooks
//! feeding the dispatcher through `SwapState::passthrough`.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use mallochooks_core::hookvars::{HookTable, HookVars, SwapState};
use mallochooks_core::{
    AllocEvents, AllocRequest, Caller, CodeRanges, Dispatcher, EventLink, HookLink, PrivateHeap,
};
use parking_lot::Mutex;

const PROGRAM: usize = 0x9000_0000;

struct HostVars(Mutex<HookTable>);

unsafe impl HookVars for HostVars {
    fn read(&self) -> HookTable {
        *self.0.lock()
    }

    fn write(&self, table: HookTable) {
        *self.0.lock() = table;
    }
}

/// Host `malloc`: calls the installed hook if there is one.
unsafe fn host_malloc(size: usize) -> *mut c_void {
    match SWAP.vars().read().malloc {
        Some(hook) => unsafe { hook(size, PROGRAM as *const c_void) },
        None => unsafe { libc::malloc(size) },
    }
}

unsafe fn host_free(ptr: *mut c_void) {
    match SWAP.vars().read().free {
        Some(hook) => unsafe { hook(ptr, PROGRAM as *const c_void) },
        None => unsafe { libc::free(ptr) },
    }
}

static PREVIOUS_MALLOCS: AtomicUsize = AtomicUsize::new(0);
static PREVIOUS_FREES: AtomicUsize = AtomicUsize::new(0);

/// A layer that was installed before ours.
unsafe extern "C" fn previous_malloc(size: usize, _caller: *const c_void) -> *mut c_void {
    PREVIOUS_MALLOCS.fetch_add(1, Ordering::Relaxed);
    unsafe { libc::malloc(size) }
}

unsafe extern "C" fn previous_free(ptr: *mut c_void, _caller: *const c_void) {
    PREVIOUS_FREES.fetch_add(1, Ordering::Relaxed);
    unsafe { libc::free(ptr) }
}

const PREVIOUS: HookTable = HookTable {
    malloc: Some(previous_malloc),
    free: Some(previous_free),
    ..HookTable::EMPTY
};

unsafe extern "C" fn malloc_hook(size: usize, caller: *const c_void) -> *mut c_void {
    let _pass = SWAP.passthrough();
    unsafe { DISPATCH.malloc(size, Caller::new(caller as usize)) }
}

unsafe extern "C" fn free_hook(ptr: *mut c_void, caller: *const c_void) {
    let _pass = SWAP.passthrough();
    unsafe { DISPATCH.free(ptr, Caller::new(caller as usize)) }
}

const OURS: HookTable = HookTable {
    malloc: Some(malloc_hook),
    free: Some(free_hook),
    ..HookTable::EMPTY
};

static SWAP: SwapState<HostVars> =
    SwapState::new(HostVars(parking_lot::const_mutex(PREVIOUS)), OURS);

static SAW_OUR_HOOKS: AtomicBool = AtomicBool::new(false);

/// Terminal that calls the host functions, as glibc's plain `malloc` would be.
struct HostLink;

unsafe impl HookLink for HostLink {
    fn init(&self) {}

    unsafe fn malloc(&self, size: usize, _caller: Caller) -> *mut c_void {
        if SWAP.vars().read() == OURS {
            SAW_OUR_HOOKS.store(true, Ordering::Relaxed);
        }
        unsafe { host_malloc(size) }
    }

    unsafe fn free(&self, ptr: *mut c_void, _caller: Caller) {
        if SWAP.vars().read() == OURS {
            SAW_OUR_HOOKS.store(true, Ordering::Relaxed);
        }
        unsafe { host_free(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize, _caller: Caller) -> *mut c_void {
        unsafe { libc::realloc(ptr, size) }
    }

    unsafe fn memalign(&self, alignment: usize, size: usize, _caller: Caller) -> *mut c_void {
        unsafe { libc::memalign(alignment, size) }
    }

    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
        unsafe { libc::malloc_usable_size(ptr) }
    }
}

struct Count {
    allocs: AtomicUsize,
    frees: AtomicUsize,
    last_caller: AtomicUsize,
}

impl AllocEvents for Count {
    fn post_successful_alloc(&self, _ptr: *mut c_void, _modified: AllocRequest, requested: AllocRequest) {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        self.last_caller
            .store(requested.caller.addr(), Ordering::Relaxed);
    }

    fn post_nonnull_free(&self, _ptr: *mut c_void) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }
}

static DISPATCH: Dispatcher<EventLink<Count, HostLink>, HostLink, CodeRanges> = Dispatcher::new(
    EventLink::new(
        Count {
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            last_caller: AtomicUsize::new(0),
        },
        HostLink,
    ),
    PrivateHeap::new(HostLink),
    CodeRanges {
        self_code: None,
        loader: None,
        loader_helper: None,
    },
);

#[test]
fn hooked_calls_reach_the_chain_and_pass_through_to_the_previous_layer() {
    SWAP.install();
    assert_eq!(SWAP.vars().read(), OURS);
    assert_eq!(SWAP.underlying(), PREVIOUS);

    let events = DISPATCH.chain().events();
    unsafe {
        let p = host_malloc(40);
        assert!(!p.is_null());
        assert_eq!(events.allocs.load(Ordering::Relaxed), 1);
        assert_eq!(events.last_caller.load(Ordering::Relaxed), PROGRAM);
        assert_eq!(PREVIOUS_MALLOCS.load(Ordering::Relaxed), 1);
        assert_eq!(SWAP.vars().read(), OURS);

        host_free(p);
        assert_eq!(events.frees.load(Ordering::Relaxed), 1);
        assert_eq!(PREVIOUS_FREES.load(Ordering::Relaxed), 1);
    }
    assert!(!SAW_OUR_HOOKS.load(Ordering::Relaxed), "passthrough left our hooks installed");
    assert_eq!(SWAP.vars().read(), OURS);
    assert_eq!(SWAP.underlying(), PREVIOUS);
}
