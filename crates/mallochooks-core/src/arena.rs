//! Bootstrap arena: a non-reclaiming bump allocator over static storage.
//!
//! Serves every request made before the underlying allocator is reachable,
//! including requests issued by the symbol lookup itself. Each chunk is
//! preceded by a [`ChunkHeader`] recording its size, so usable-size queries
//! work without side tables and ownership is a plain address-range test.
//!
//! The cursor advances with a compare-and-swap so that threads racing during
//! startup never receive overlapping chunks. `free` never reclaims.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::HookError;
use crate::hook_warn;

/// Minimum alignment of every chunk (matches `max_align_t` on LP64).
pub const ARENA_MIN_ALIGN: usize = 16;

/// In-band header immediately preceding each chunk.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ChunkHeader {
    /// Requested size in bytes.
    size: usize,
    /// Offset of the chunk's first reserved byte within the arena.
    start: usize,
}

const HEADER_SIZE: usize = size_of::<ChunkHeader>();

#[repr(C, align(16))]
struct Storage<const N: usize>([u8; N]);

pub struct BootstrapArena<const N: usize> {
    storage: UnsafeCell<Storage<N>>,
    cursor: AtomicUsize,
    exhaustion_reported: AtomicBool,
}

// SAFETY: chunk ranges are handed out exactly once through the CAS on
// `cursor`; no two callers ever write the same bytes.
unsafe impl<const N: usize> Sync for BootstrapArena<N> {}

#[inline]
const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

impl<const N: usize> BootstrapArena<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            storage: UnsafeCell::new(Storage([0; N])),
            cursor: AtomicUsize::new(0),
            exhaustion_reported: AtomicBool::new(false),
        }
    }

    #[inline]
    fn base(&self) -> usize {
        self.storage.get() as usize
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Bytes consumed so far, headers and padding included.
    #[must_use]
    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        N - self.used()
    }

    /// Whether `ptr` lies inside the arena's storage.
    #[inline]
    #[must_use]
    pub fn contains(&self, ptr: *const c_void) -> bool {
        let addr = ptr as usize;
        let base = self.base();
        addr >= base && addr < base + N
    }

    /// Carve a chunk of `size` bytes aligned to `align` (a power of two).
    pub fn try_allocate(&self, size: usize, align: usize) -> Result<*mut c_void, HookError> {
        if !align.is_power_of_two() {
            return Err(HookError::InvalidAlignment(align));
        }
        let align = align.max(ARENA_MIN_ALIGN);
        let base = self.base();
        let mut current = self.cursor.load(Ordering::Relaxed);
        loop {
            let exhausted = HookError::ArenaExhausted {
                requested: size,
                remaining: N - current,
            };
            let user = align_up(base + current + HEADER_SIZE, align).ok_or(exhausted)?;
            let end = size
                .max(1)
                .checked_add(user - base)
                .and_then(|end| align_up(end, ARENA_MIN_ALIGN))
                .ok_or(exhausted)?;
            if end > N {
                return Err(exhausted);
            }
            match self.cursor.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let header = ChunkHeader {
                        size,
                        start: current,
                    };
                    // SAFETY: [current, end) now belongs exclusively to this
                    // call and `user - HEADER_SIZE >= base + current`.
                    unsafe {
                        ptr::write((user - HEADER_SIZE) as *mut ChunkHeader, header);
                    }
                    return Ok(user as *mut c_void);
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Like [`try_allocate`](Self::try_allocate) but with allocator
    /// conventions: failure is a NULL return. The first exhaustion is logged.
    pub fn allocate(&self, size: usize, align: usize) -> *mut c_void {
        match self.try_allocate(size, align) {
            Ok(p) => p,
            Err(err) => {
                if matches!(err, HookError::ArenaExhausted { .. })
                    && !self.exhaustion_reported.swap(true, Ordering::Relaxed)
                {
                    hook_warn!("{err}");
                }
                ptr::null_mut()
            }
        }
    }

    /// Size recorded for an arena chunk, or `None` if `ptr` is not ours.
    ///
    /// # Safety
    ///
    /// If `ptr` lies inside the arena it must be a pointer previously
    /// returned by this arena.
    #[must_use]
    pub unsafe fn usable_size(&self, ptr: *const c_void) -> Option<usize> {
        if !self.contains(ptr) {
            return None;
        }
        // SAFETY: caller guarantees `ptr` is a chunk start, which always has
        // a header directly in front of it.
        let header = unsafe { ptr::read((ptr as usize - HEADER_SIZE) as *const ChunkHeader) };
        Some(header.size)
    }
}

impl<const N: usize> Default for BootstrapArena<N> {
    fn default() -> Self {
        Self::new()
    }
}
