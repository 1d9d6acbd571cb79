//! Routing against code ranges discovered from this very test binary.

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use mallochooks_core::{
    AllocEvents, AllocRequest, Caller, CodeRangeRegistry, Dispatcher, EventLink, HookLink,
    PrivateHeap,
};

struct SystemLink;

unsafe impl HookLink for SystemLink {
    fn init(&self) {}

    unsafe fn malloc(&self, size: usize, _caller: Caller) -> *mut c_void {
        unsafe { libc::malloc(size) }
    }

    unsafe fn free(&self, ptr: *mut c_void, _caller: Caller) {
        unsafe { libc::free(ptr) }
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

#[derive(Default)]
struct Count {
    allocs: AtomicUsize,
    frees: AtomicUsize,
}

impl AllocEvents for Count {
    fn post_successful_alloc(&self, _ptr: *mut c_void, _modified: AllocRequest, _requested: AllocRequest) {
        self.allocs.fetch_add(1, Ordering::Relaxed);
    }

    fn post_nonnull_free(&self, _ptr: *mut c_void) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }
}

type Live = Dispatcher<EventLink<Count, SystemLink>, SystemLink, CodeRangeRegistry>;

fn dispatcher(registry: CodeRangeRegistry) -> Live {
    Dispatcher::new(
        EventLink::new(Count::default(), SystemLink),
        PrivateHeap::new(SystemLink),
        registry,
    )
}

#[inline(never)]
fn program_code() {}

fn in_binary_caller() -> Caller {
    Caller::new(program_code as usize + 1)
}

#[test]
fn statically_linked_program_calls_reach_the_chain() {
    let d = dispatcher(CodeRangeRegistry::without_self_calls());
    unsafe {
        let p = d.malloc(32, in_binary_caller());
        assert!(!p.is_null());
        assert!(!d.private().owns(p));
        assert_eq!(d.chain().events().allocs.load(Ordering::Relaxed), 1);

        let q = d.realloc(p, 64, in_binary_caller());
        assert!(!d.private().owns(q));
        d.free(q, in_binary_caller());
        assert_eq!(d.chain().events().frees.load(Ordering::Relaxed), 1);
    }
}

#[test]
fn own_object_calls_take_the_private_path() {
    let d = dispatcher(CodeRangeRegistry::new());
    unsafe {
        let p = d.malloc(32, in_binary_caller());
        assert!(!p.is_null());
        assert!(d.private().owns(p));
        d.free(p, in_binary_caller());
    }
    let events = d.chain().events();
    assert_eq!(events.allocs.load(Ordering::Relaxed), 0);
    assert_eq!(events.frees.load(Ordering::Relaxed), 0);
}

#[test]
fn loader_calls_stay_private_in_both_modes() {
    for registry in [CodeRangeRegistry::new(), CodeRangeRegistry::without_self_calls()] {
        let Some(loader) = registry.get().and_then(|ranges| ranges.loader) else {
            // Fully static binaries have no separate loader object.
            return;
        };
        let d = dispatcher(registry);
        unsafe {
            let p = d.malloc(48, Caller::new(loader.base));
            assert!(d.private().owns(p));
            d.free(p, Caller::new(loader.base));
        }
        assert_eq!(d.chain().events().allocs.load(Ordering::Relaxed), 0);
    }
}
