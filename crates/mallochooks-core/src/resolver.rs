//! Underlying-allocator resolution.
//!
//! The real allocator family is located lazily through a [`SymbolSource`]
//! (dynamic lookup for preload, the linker's `__real_*` aliases for wrap, the
//! plain libc entry points for hook-variable substitution) and latched:
//!
//! ```text
//! unresolved --claim--> resolving --+--> resolved   (immutable thereafter)
//!      ^                            |
//!      +---------- retry() -------- +--> failed
//! ```
//!
//! Only the caller that wins the `unresolved -> resolving` CAS runs the
//! lookups. Everyone else, including reentrant calls made *by* the lookup,
//! sees "not resolved" and is served from the bootstrap arena.

use std::ffi::{CStr, c_int, c_void};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::error::HookError;
use crate::{hook_debug, hook_error};

pub type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
pub type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
pub type MemalignFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
pub type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> c_int;
pub type UsableSizeFn = unsafe extern "C" fn(*mut c_void) -> usize;

/// One entry point of the underlying allocator family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Symbol {
    Malloc = 0,
    Free = 1,
    Realloc = 2,
    Calloc = 3,
    Memalign = 4,
    PosixMemalign = 5,
    UsableSize = 6,
}

impl Symbol {
    pub const COUNT: usize = 7;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Malloc,
        Self::Free,
        Self::Realloc,
        Self::Calloc,
        Self::Memalign,
        Self::PosixMemalign,
        Self::UsableSize,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Malloc => "malloc",
            Self::Free => "free",
            Self::Realloc => "realloc",
            Self::Calloc => "calloc",
            Self::Memalign => "memalign",
            Self::PosixMemalign => "posix_memalign",
            Self::UsableSize => "malloc_usable_size",
        }
    }

    #[must_use]
    pub const fn c_name(self) -> &'static CStr {
        match self {
            Self::Malloc => c"malloc",
            Self::Free => c"free",
            Self::Realloc => c"realloc",
            Self::Calloc => c"calloc",
            Self::Memalign => c"memalign",
            Self::PosixMemalign => c"posix_memalign",
            Self::UsableSize => c"malloc_usable_size",
        }
    }

    /// `memalign` is not exported by every allocator; plain malloc/free
    /// callers never need it.
    #[must_use]
    pub const fn required(self) -> bool {
        !matches!(self, Self::Memalign)
    }

    const fn from_index(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Malloc),
            1 => Some(Self::Free),
            2 => Some(Self::Realloc),
            3 => Some(Self::Calloc),
            4 => Some(Self::Memalign),
            5 => Some(Self::PosixMemalign),
            6 => Some(Self::UsableSize),
            _ => None,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the real allocator's entry points come from.
pub trait SymbolSource: Sync {
    /// Address of `symbol`, or `None` if it cannot be found.
    fn lookup(&self, symbol: Symbol) -> Option<usize>;
}

/// The resolved allocator family. Immutable once built.
#[derive(Clone, Copy)]
pub struct UnderlyingBinding {
    pub malloc: MallocFn,
    pub free: FreeFn,
    pub realloc: ReallocFn,
    pub calloc: CallocFn,
    pub memalign: Option<MemalignFn>,
    pub posix_memalign: PosixMemalignFn,
    pub usable_size: UsableSizeFn,
}

impl fmt::Debug for UnderlyingBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnderlyingBinding")
            .field("malloc", &(self.malloc as usize as *const c_void))
            .field("free", &(self.free as usize as *const c_void))
            .field("memalign", &self.memalign.map(|m| m as usize as *const c_void))
            .finish_non_exhaustive()
    }
}

impl UnderlyingBinding {
    /// Build a binding from raw addresses, indexed by `Symbol as usize`
    /// (0 meaning absent).
    ///
    /// # Safety
    ///
    /// Every non-zero address must be the entry point of a function with the
    /// signature the matching [`Symbol`] names.
    pub unsafe fn from_addresses(addrs: &[usize; Symbol::COUNT]) -> Result<Self, HookError> {
        if let Some(missing) = Symbol::ALL
            .into_iter()
            .find(|s| s.required() && addrs[*s as usize] == 0)
        {
            return Err(HookError::MissingSymbol(missing));
        }
        let at = |s: Symbol| addrs[s as usize];
        // SAFETY: caller guarantees each non-zero address has the right
        // signature; required ones were checked non-zero above.
        unsafe {
            Ok(Self {
                malloc: std::mem::transmute::<usize, MallocFn>(at(Symbol::Malloc)),
                free: std::mem::transmute::<usize, FreeFn>(at(Symbol::Free)),
                realloc: std::mem::transmute::<usize, ReallocFn>(at(Symbol::Realloc)),
                calloc: std::mem::transmute::<usize, CallocFn>(at(Symbol::Calloc)),
                memalign: match at(Symbol::Memalign) {
                    0 => None,
                    addr => Some(std::mem::transmute::<usize, MemalignFn>(addr)),
                },
                posix_memalign: std::mem::transmute::<usize, PosixMemalignFn>(at(
                    Symbol::PosixMemalign,
                )),
                usable_size: std::mem::transmute::<usize, UsableSizeFn>(at(Symbol::UsableSize)),
            })
        }
    }
}

/// Observable resolver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveState {
    Unresolved,
    Resolving,
    Resolved,
    Failed,
}

const STATE_UNRESOLVED: u8 = 0;
const STATE_RESOLVING: u8 = 1;
const STATE_RESOLVED: u8 = 2;
const STATE_FAILED: u8 = 3;

const NO_MISSING: u8 = u8::MAX;

/// Latched resolver for one [`SymbolSource`].
pub struct Resolver<S> {
    source: S,
    state: AtomicU8,
    missing: AtomicU8,
    slots: [AtomicUsize; Symbol::COUNT],
}

impl<S> Resolver<S> {
    pub const fn new(source: S) -> Self {
        Self {
            source,
            state: AtomicU8::new(STATE_UNRESOLVED),
            missing: AtomicU8::new(NO_MISSING),
            slots: [const { AtomicUsize::new(0) }; Symbol::COUNT],
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    #[must_use]
    pub fn state(&self) -> ResolveState {
        match self.state.load(Ordering::Acquire) {
            STATE_RESOLVING => ResolveState::Resolving,
            STATE_RESOLVED => ResolveState::Resolved,
            STATE_FAILED => ResolveState::Failed,
            _ => ResolveState::Unresolved,
        }
    }

    /// The binding if resolution already completed; never starts it.
    #[must_use]
    pub fn resolved(&self) -> Option<UnderlyingBinding> {
        if self.state.load(Ordering::Acquire) != STATE_RESOLVED {
            return None;
        }
        self.load_binding().ok()
    }

    fn load_binding(&self) -> Result<UnderlyingBinding, HookError> {
        let addrs: [usize; Symbol::COUNT] =
            std::array::from_fn(|i| self.slots[i].load(Ordering::Relaxed));
        // SAFETY: slots are only populated from the source's lookups, whose
        // addresses name the matching allocator functions.
        unsafe { UnderlyingBinding::from_addresses(&addrs) }
    }

    /// Allow another attempt after a failure. Returns whether this caller
    /// moved the state from `failed` back to `unresolved`.
    pub fn retry(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_FAILED,
                STATE_UNRESOLVED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    fn latched_failure(&self) -> HookError {
        Symbol::from_index(self.missing.load(Ordering::Relaxed))
            .map_or(HookError::ResolutionInProgress, HookError::MissingSymbol)
    }
}

impl<S: SymbolSource> Resolver<S> {
    /// Resolve if nobody has tried yet, then return the binding if available.
    #[must_use]
    pub fn binding(&self) -> Option<UnderlyingBinding> {
        match self.state.load(Ordering::Acquire) {
            STATE_RESOLVED => self.load_binding().ok(),
            STATE_UNRESOLVED => self.resolve().ok(),
            _ => None,
        }
    }

    /// Drive the state machine. Exactly one caller performs the lookups;
    /// concurrent and reentrant callers get `ResolutionInProgress`, and a
    /// latched failure reports the symbol that was missing.
    pub fn resolve(&self) -> Result<UnderlyingBinding, HookError> {
        match self.state.load(Ordering::Acquire) {
            STATE_RESOLVED => return self.load_binding(),
            STATE_RESOLVING => return Err(HookError::ResolutionInProgress),
            STATE_FAILED => return Err(self.latched_failure()),
            _ => {}
        }
        if let Err(observed) = self.state.compare_exchange(
            STATE_UNRESOLVED,
            STATE_RESOLVING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return match observed {
                STATE_RESOLVED => self.load_binding(),
                STATE_FAILED => Err(self.latched_failure()),
                _ => Err(HookError::ResolutionInProgress),
            };
        }

        let mut addrs = [0usize; Symbol::COUNT];
        for symbol in Symbol::ALL {
            let addr = self.source.lookup(symbol).unwrap_or(0);
            if addr == 0 && symbol.required() {
                self.missing.store(symbol as u8, Ordering::Relaxed);
                self.state.store(STATE_FAILED, Ordering::Release);
                let err = HookError::MissingSymbol(symbol);
                hook_error!("{err}; serving allocations from the bootstrap arena");
                return Err(err);
            }
            if addr == 0 {
                hook_debug!("optional symbol `{symbol}` not found");
            }
            addrs[symbol as usize] = addr;
        }
        for (slot, addr) in self.slots.iter().zip(addrs) {
            slot.store(addr, Ordering::Relaxed);
        }
        self.missing.store(NO_MISSING, Ordering::Relaxed);
        self.state.store(STATE_RESOLVED, Ordering::Release);

        // SAFETY: see `load_binding`.
        let binding = unsafe { UnderlyingBinding::from_addresses(&addrs) }?;
        hook_debug!("underlying allocator resolved: {binding:?}");
        Ok(binding)
    }
}
