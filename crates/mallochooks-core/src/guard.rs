//! Per-thread "hook machinery active" flag.
//!
//! Set for the duration of every call that reaches the dispatcher; a call
//! arriving while it is already set is reentrant (the resolver's own symbol
//! lookup allocating, an event consumer allocating) and must bypass the hook
//! chain. The flag is thread-local so that one thread's in-flight call never
//! makes a sibling thread's call look reentrant.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static HOOK_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Clears the active flag when dropped. Not `Send`: the flag is per-thread.
#[must_use = "the flag is cleared as soon as the guard is dropped"]
pub struct ActiveGuard {
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let _ = HOOK_ACTIVE.try_with(|active| active.set(false));
    }
}

/// Set the flag, or return `None` if this thread is already inside the
/// machinery. A thread whose TLS is being torn down is treated as reentrant.
#[inline]
pub fn enter() -> Option<ActiveGuard> {
    HOOK_ACTIVE
        .try_with(|active| {
            if active.replace(true) {
                None
            } else {
                Some(ActiveGuard {
                    _thread_bound: PhantomData,
                })
            }
        })
        .ok()
        .flatten()
}

#[inline]
#[must_use]
pub fn is_active() -> bool {
    HOOK_ACTIVE.try_with(Cell::get).unwrap_or(true)
}
