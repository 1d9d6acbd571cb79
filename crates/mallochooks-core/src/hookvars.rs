//! Global hook-variable substitution state.
//!
//! Some allocators expose process-wide function-pointer variables (glibc's
//! `__malloc_hook` family) that, when set, receive every call. This strategy
//! saves whatever is installed, installs its own functions, and around each
//! call into the next layer temporarily restores the saved pointers so that
//! layer's own allocations are not re-hooked:
//!
//! ```text
//! install():      underlying := vars;  vars := ours
//! passthrough():  vars := underlying
//!   ... call into the next layer ...
//! drop guard:     underlying := vars;  vars := ours
//! ```
//!
//! The variables are shared by every thread. While one thread sits inside a
//! passthrough, another thread's allocation sees the restored pointers and
//! goes unhooked. That race is inherent to the technique; preload or wrap
//! interception does not have it.

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

pub type MallocHookFn = unsafe extern "C" fn(usize, *const c_void) -> *mut c_void;
pub type FreeHookFn = unsafe extern "C" fn(*mut c_void, *const c_void);
pub type ReallocHookFn = unsafe extern "C" fn(*mut c_void, usize, *const c_void) -> *mut c_void;
pub type MemalignHookFn = unsafe extern "C" fn(usize, usize, *const c_void) -> *mut c_void;

/// One value of the four hook variables. `None` is an empty slot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HookTable {
    pub malloc: Option<MallocHookFn>,
    pub free: Option<FreeHookFn>,
    pub realloc: Option<ReallocHookFn>,
    pub memalign: Option<MemalignHookFn>,
}

impl HookTable {
    pub const EMPTY: Self = Self {
        malloc: None,
        free: None,
        realloc: None,
        memalign: None,
    };
}

/// Access to the allocator's hook variables.
///
/// # Safety
///
/// `write` must store exactly the given pointers; the allocator will call them.
pub unsafe trait HookVars: Sync {
    fn read(&self) -> HookTable;
    fn write(&self, table: HookTable);
}

/// A saved [`HookTable`], stored without locks (the variables themselves are
/// unsynchronized, so a lock here would buy nothing).
struct SavedTable {
    malloc: AtomicUsize,
    free: AtomicUsize,
    realloc: AtomicUsize,
    memalign: AtomicUsize,
}

macro_rules! load_fn {
    ($slot:expr, $ty:ty) => {
        match $slot.load(Ordering::Acquire) {
            0 => None,
            // SAFETY: only ever stored from an `Option<$ty>` of the same slot.
            addr => Some(unsafe { std::mem::transmute::<usize, $ty>(addr) }),
        }
    };
}

impl SavedTable {
    const fn new() -> Self {
        Self {
            malloc: AtomicUsize::new(0),
            free: AtomicUsize::new(0),
            realloc: AtomicUsize::new(0),
            memalign: AtomicUsize::new(0),
        }
    }

    fn load(&self) -> HookTable {
        HookTable {
            malloc: load_fn!(self.malloc, MallocHookFn),
            free: load_fn!(self.free, FreeHookFn),
            realloc: load_fn!(self.realloc, ReallocHookFn),
            memalign: load_fn!(self.memalign, MemalignHookFn),
        }
    }

    fn store(&self, table: HookTable) {
        self.malloc
            .store(table.malloc.map_or(0, |f| f as usize), Ordering::Release);
        self.free
            .store(table.free.map_or(0, |f| f as usize), Ordering::Release);
        self.realloc
            .store(table.realloc.map_or(0, |f| f as usize), Ordering::Release);
        self.memalign
            .store(table.memalign.map_or(0, |f| f as usize), Ordering::Release);
    }
}

/// Save/restore state for one set of hook variables.
pub struct SwapState<V> {
    vars: V,
    ours: HookTable,
    underlying: SavedTable,
}

impl<V> SwapState<V> {
    pub const fn new(vars: V, ours: HookTable) -> Self {
        Self {
            vars,
            ours,
            underlying: SavedTable::new(),
        }
    }

    /// What the previous layer had installed, as last observed.
    pub fn underlying(&self) -> HookTable {
        self.underlying.load()
    }

    pub fn vars(&self) -> &V {
        &self.vars
    }
}

impl<V: HookVars> SwapState<V> {
    /// Save the currently installed hooks and install ours.
    pub fn install(&self) {
        let current = self.vars.read();
        if current != self.ours {
            self.underlying.store(current);
        }
        self.vars.write(self.ours);
    }

    /// Restore the underlying hooks until the guard drops.
    pub fn passthrough(&self) -> PassthroughGuard<'_, V> {
        self.vars.write(self.underlying.load());
        PassthroughGuard { state: self }
    }
}

/// Reinstalls our hooks on drop, first re-saving whatever the underlying
/// layer left installed (it may have swapped its own hooks meanwhile).
#[must_use = "our hooks are reinstalled as soon as the guard is dropped"]
pub struct PassthroughGuard<'a, V: HookVars> {
    state: &'a SwapState<V>,
}

impl<V: HookVars> Drop for PassthroughGuard<'_, V> {
    fn drop(&mut self) {
        self.state.install();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FakeVars(Mutex<HookTable>);

    unsafe impl HookVars for FakeVars {
        fn read(&self) -> HookTable {
            *self.0.lock()
        }

        fn write(&self, table: HookTable) {
            *self.0.lock() = table;
        }
    }

    unsafe extern "C" fn ours_malloc(_: usize, _: *const c_void) -> *mut c_void {
        std::ptr::null_mut()
    }

    unsafe extern "C" fn ours_free(_: *mut c_void, _: *const c_void) {}

    unsafe extern "C" fn theirs_malloc(_: usize, _: *const c_void) -> *mut c_void {
        std::ptr::dangling_mut::<u8>().wrapping_add(1).cast()
    }

    unsafe extern "C" fn theirs_malloc_v2(_: usize, _: *const c_void) -> *mut c_void {
        std::ptr::dangling_mut::<u8>().wrapping_add(2).cast()
    }

    fn ours() -> HookTable {
        HookTable {
            malloc: Some(ours_malloc),
            free: Some(ours_free),
            ..HookTable::EMPTY
        }
    }

    #[test]
    fn install_saves_previous_layer() {
        let previous = HookTable {
            malloc: Some(theirs_malloc),
            ..HookTable::EMPTY
        };
        let swap = SwapState::new(FakeVars(Mutex::new(previous)), ours());
        swap.install();
        assert_eq!(swap.vars().read(), ours());
        assert_eq!(swap.underlying(), previous);
    }

    #[test]
    fn passthrough_restores_then_reinstalls() {
        let swap = SwapState::new(FakeVars(Mutex::new(HookTable::EMPTY)), ours());
        swap.install();
        {
            let _pass = swap.passthrough();
            assert_eq!(swap.vars().read(), HookTable::EMPTY);
        }
        assert_eq!(swap.vars().read(), ours());
        assert_eq!(swap.underlying(), HookTable::EMPTY);
    }

    #[test]
    fn underlying_changes_during_passthrough_are_kept() {
        let swap = SwapState::new(FakeVars(Mutex::new(HookTable::EMPTY)), ours());
        swap.install();
        {
            let _pass = swap.passthrough();
            // The inner layer installs a hook of its own mid-call.
            swap.vars().write(HookTable {
                malloc: Some(theirs_malloc_v2),
                ..HookTable::EMPTY
            });
        }
        assert_eq!(swap.vars().read(), ours());
        assert_eq!(swap.underlying().malloc, Some(theirs_malloc_v2 as MallocHookFn));
    }

    #[test]
    fn reinstalling_does_not_save_ourselves() {
        let swap = SwapState::new(FakeVars(Mutex::new(HookTable::EMPTY)), ours());
        swap.install();
        swap.install();
        assert_eq!(swap.underlying(), HookTable::EMPTY);
    }
}
