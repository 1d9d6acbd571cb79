//! Caller classification by code range.
//!
//! A call whose return address lies in this module's own code, in the dynamic
//! loader, or in the loader's helper library (`libdl`) must not enter the
//! instrumented path. The ranges are derived once from the loaded-object list
//! (`dl_iterate_phdr`) and cached for the life of the process.

use std::cell::UnsafeCell;
use std::ffi::{CStr, c_int, c_void};
use std::sync::atomic::{AtomicU8, Ordering};

use crate::hook_debug;

/// Half-open address range `[base, limit)` covering a module's executable segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRange {
    pub base: usize,
    pub limit: usize,
}

impl CodeRange {
    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.limit
    }

    fn merge(this: Option<Self>, other: Self) -> Option<Self> {
        Some(match this {
            None => other,
            Some(r) => Self {
                base: r.base.min(other.base),
                limit: r.limit.max(other.limit),
            },
        })
    }
}

/// Where an allocator call came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerClass {
    /// Ordinary program code: takes the instrumented path.
    Foreign,
    /// This interception module's own code.
    SelfCall,
    /// The dynamic loader (`ld-linux*`, `ld-musl*`, `ld.so`).
    Loader,
    /// The loader's helper library (`libdl`).
    LoaderHelper,
}

impl CallerClass {
    #[must_use]
    pub const fn bypasses_hooks(self) -> bool {
        !matches!(self, Self::Foreign)
    }
}

/// Decides the [`CallerClass`] of a return address.
pub trait Classify {
    fn classify(&self, addr: usize) -> CallerClass;
}

/// Classify a loaded object by its path name.
#[must_use]
pub fn classify_object_name(name: &[u8]) -> Option<CallerClass> {
    let file = match name.iter().rposition(|&b| b == b'/') {
        Some(i) => &name[i + 1..],
        None => name,
    };
    const LOADER_PREFIXES: [&[u8]; 4] = [b"ld-linux", b"ld-musl", b"ld.so", b"ld64.so"];
    if LOADER_PREFIXES.iter().any(|prefix| file.starts_with(prefix)) {
        Some(CallerClass::Loader)
    } else if file.starts_with(b"libdl.") || file.starts_with(b"libdl-") {
        Some(CallerClass::LoaderHelper)
    } else {
        None
    }
}

/// Snapshot of the three interesting code ranges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeRanges {
    pub self_code: Option<CodeRange>,
    pub loader: Option<CodeRange>,
    pub loader_helper: Option<CodeRange>,
}

struct Discovery {
    anchor: usize,
    ranges: CodeRanges,
}

unsafe extern "C" fn visit_object(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    // SAFETY: dl_iterate_phdr hands us a valid info record and passes our
    // `Discovery` back untouched.
    let (info, discovery) = unsafe { (&*info, &mut *data.cast::<Discovery>()) };

    let mut exec: Option<CodeRange> = None;
    let mut holds_anchor = false;
    if !info.dlpi_phdr.is_null() {
        // SAFETY: dlpi_phdr points at dlpi_phnum program headers.
        let headers =
            unsafe { std::slice::from_raw_parts(info.dlpi_phdr, usize::from(info.dlpi_phnum)) };
        for ph in headers.iter().filter(|ph| ph.p_type == libc::PT_LOAD) {
            let start = (info.dlpi_addr as usize).wrapping_add(ph.p_vaddr as usize);
            let segment = CodeRange {
                base: start,
                limit: start.wrapping_add(ph.p_memsz as usize),
            };
            if segment.contains(discovery.anchor) {
                holds_anchor = true;
            }
            if ph.p_flags & libc::PF_X != 0 {
                exec = CodeRange::merge(exec, segment);
            }
        }
    }
    let Some(exec) = exec else {
        return 0;
    };

    let ranges = &mut discovery.ranges;
    if holds_anchor {
        ranges.self_code = CodeRange::merge(ranges.self_code, exec);
    } else if !info.dlpi_name.is_null() {
        // SAFETY: non-null dlpi_name is a NUL-terminated path.
        let name = unsafe { CStr::from_ptr(info.dlpi_name) };
        match classify_object_name(name.to_bytes()) {
            Some(CallerClass::Loader) => ranges.loader = CodeRange::merge(ranges.loader, exec),
            Some(CallerClass::LoaderHelper) => {
                ranges.loader_helper = CodeRange::merge(ranges.loader_helper, exec);
            }
            _ => {}
        }
    }
    0
}

impl CodeRanges {
    /// Walk the loaded-object list. The object containing `anchor` is "self".
    #[must_use]
    pub fn discover(anchor: usize) -> Self {
        let mut discovery = Discovery {
            anchor,
            ranges: Self::default(),
        };
        // SAFETY: the callback only reads loader-provided records and writes
        // through the `Discovery` pointer we pass, which outlives the call.
        unsafe {
            libc::dl_iterate_phdr(
                Some(visit_object),
                (&raw mut discovery).cast::<c_void>(),
            );
        }
        discovery.ranges
    }

    /// Discover with this crate's own code as the anchor.
    #[must_use]
    pub fn discover_self() -> Self {
        Self::discover(Self::discover_self as usize)
    }
}

impl Classify for CodeRanges {
    fn classify(&self, addr: usize) -> CallerClass {
        let hit = |r: Option<CodeRange>| r.is_some_and(|r| r.contains(addr));
        if hit(self.self_code) {
            CallerClass::SelfCall
        } else if hit(self.loader) {
            CallerClass::Loader
        } else if hit(self.loader_helper) {
            CallerClass::LoaderHelper
        } else {
            CallerClass::Foreign
        }
    }
}

const RANGES_UNRESOLVED: u8 = 0;
const RANGES_RESOLVING: u8 = 1;
const RANGES_READY: u8 = 2;

/// Lazily discovered, process-wide [`CodeRanges`].
///
/// Discovery runs once, on the first classification. Calls that arrive while
/// discovery is in flight are classified `Foreign`; they are necessarily from
/// other threads, since discovery runs with the reentrancy flag held.
///
/// A registry built with [`without_self_calls`](Self::without_self_calls)
/// never reports [`CallerClass::SelfCall`]. That is the mode for code linked
/// statically into the program, where "the object holding this crate" is the
/// program itself.
pub struct CodeRangeRegistry {
    state: AtomicU8,
    self_calls: bool,
    ranges: UnsafeCell<CodeRanges>,
}

// SAFETY: `ranges` is written once before `state` is published as READY with
// Release ordering, and only read after an Acquire load observes READY.
unsafe impl Sync for CodeRangeRegistry {}

impl CodeRangeRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_self_calls(true)
    }

    /// Loader and `libdl` classification only.
    #[must_use]
    pub const fn without_self_calls() -> Self {
        Self::with_self_calls(false)
    }

    const fn with_self_calls(self_calls: bool) -> Self {
        Self {
            state: AtomicU8::new(RANGES_UNRESOLVED),
            self_calls,
            ranges: UnsafeCell::new(CodeRanges {
                self_code: None,
                loader: None,
                loader_helper: None,
            }),
        }
    }

    #[must_use]
    pub const fn classifies_self_calls(&self) -> bool {
        self.self_calls
    }

    /// The cached ranges, discovering them if nobody has yet.
    pub fn get(&self) -> Option<CodeRanges> {
        match self.state.load(Ordering::Acquire) {
            // SAFETY: READY is only published after the final write.
            RANGES_READY => return Some(unsafe { *self.ranges.get() }),
            RANGES_RESOLVING => return None,
            _ => {}
        }
        if self
            .state
            .compare_exchange(
                RANGES_UNRESOLVED,
                RANGES_RESOLVING,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return None;
        }
        let mut ranges = CodeRanges::discover_self();
        if !self.self_calls {
            ranges.self_code = None;
        }
        hook_debug!(
            "code ranges: self={:x?} loader={:x?} libdl={:x?}",
            ranges.self_code,
            ranges.loader,
            ranges.loader_helper
        );
        // SAFETY: we won the CAS; no reader looks at `ranges` until READY.
        unsafe { *self.ranges.get() = ranges };
        self.state.store(RANGES_READY, Ordering::Release);
        Some(ranges)
    }
}

impl Default for CodeRangeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Classify for CodeRangeRegistry {
    fn classify(&self, addr: usize) -> CallerClass {
        self.get()
            .map_or(CallerClass::Foreign, |ranges| ranges.classify(addr))
    }
}

impl<T: Classify + ?Sized> Classify for &T {
    fn classify(&self, addr: usize) -> CallerClass {
        (**self).classify(addr)
    }
}
