//! Terminal link: the end of every chain.
//!
//! Calls through to the resolved underlying allocator, or serves the request
//! from the bootstrap arena while the resolver is unresolved, resolving or
//! failed. Arena chunks are recognised by address, so they are routed
//! correctly even after the real allocator becomes reachable.

use std::ffi::c_void;
use std::ptr;

use crate::arena::BootstrapArena;
use crate::hook::{Caller, HookLink, PTR_ALIGN};
use crate::hook_debug;
use crate::resolver::{Resolver, SymbolSource, UnderlyingBinding};

pub struct Terminal<'a, S, const N: usize> {
    resolver: &'a Resolver<S>,
    arena: &'a BootstrapArena<N>,
}

impl<'a, S, const N: usize> Terminal<'a, S, N> {
    pub const fn new(resolver: &'a Resolver<S>, arena: &'a BootstrapArena<N>) -> Self {
        Self { resolver, arena }
    }

    pub fn resolver(&self) -> &'a Resolver<S> {
        self.resolver
    }

    pub fn arena(&self) -> &'a BootstrapArena<N> {
        self.arena
    }
}

impl<S: SymbolSource, const N: usize> Terminal<'_, S, N> {
    unsafe fn aligned_from(binding: &UnderlyingBinding, alignment: usize, size: usize) -> *mut c_void {
        if let Some(memalign) = binding.memalign {
            return unsafe { memalign(alignment, size) };
        }
        // posix_memalign wants a pointer-size multiple.
        let alignment = alignment.max(PTR_ALIGN);
        let mut out = ptr::null_mut();
        match unsafe { (binding.posix_memalign)(&mut out, alignment, size) } {
            0 => out,
            _ => ptr::null_mut(),
        }
    }

    /// Move an arena chunk to a fresh allocation. The arena copy is abandoned.
    unsafe fn grow_out_of_arena(&self, ptr: *mut c_void, size: usize, caller: Caller) -> *mut c_void {
        // SAFETY: `ptr` is an arena chunk start.
        let old = unsafe { self.arena.usable_size(ptr) }.unwrap_or(0);
        let fresh = unsafe { self.malloc(size, caller) };
        if !fresh.is_null() {
            // SAFETY: both blocks are at least `min(old, size)` bytes and distinct.
            unsafe { ptr::copy_nonoverlapping(ptr.cast::<u8>(), fresh.cast::<u8>(), old.min(size)) };
        }
        fresh
    }
}

// SAFETY: results come either from the underlying allocator or from the arena,
// both of which honour size and alignment.
unsafe impl<S: SymbolSource, const N: usize> HookLink for Terminal<'_, S, N> {
    fn init(&self) {
        // Failure is logged by the resolver and degrades to the arena.
        let _ = self.resolver.resolve();
    }

    unsafe fn malloc(&self, size: usize, _caller: Caller) -> *mut c_void {
        match self.resolver.binding() {
            Some(binding) => unsafe { (binding.malloc)(size) },
            None => self.arena.allocate(size, PTR_ALIGN),
        }
    }

    unsafe fn free(&self, ptr: *mut c_void, _caller: Caller) {
        if ptr.is_null() || self.arena.contains(ptr) {
            return;
        }
        match self.resolver.binding() {
            Some(binding) => unsafe { (binding.free)(ptr) },
            None => hook_debug!("leaking {ptr:p}: underlying free unavailable"),
        }
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize, caller: Caller) -> *mut c_void {
        if ptr.is_null() {
            return unsafe { self.malloc(size, caller) };
        }
        if size == 0 {
            unsafe { self.free(ptr, caller) };
            return ptr::null_mut();
        }
        if self.arena.contains(ptr) {
            return unsafe { self.grow_out_of_arena(ptr, size, caller) };
        }
        match self.resolver.binding() {
            Some(binding) => unsafe { (binding.realloc)(ptr, size) },
            None => ptr::null_mut(),
        }
    }

    unsafe fn memalign(&self, alignment: usize, size: usize, _caller: Caller) -> *mut c_void {
        match self.resolver.binding() {
            Some(binding) => unsafe { Self::aligned_from(&binding, alignment, size) },
            None => self.arena.allocate(size, alignment),
        }
    }

    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
        if ptr.is_null() {
            return 0;
        }
        // SAFETY: an in-arena pointer is an arena chunk start.
        if let Some(size) = unsafe { self.arena.usable_size(ptr) } {
            return size;
        }
        match self.resolver.binding() {
            Some(binding) => unsafe { (binding.usable_size)(ptr) },
            None => 0,
        }
    }
}
