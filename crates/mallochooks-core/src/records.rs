//! Linked allocation-record list for out-of-process inspection.
//!
//! A versioned data contract: `#[repr(C)]` nodes `{ begin, size, next }`
//! forming a singly linked list whose head lives in an `AtomicPtr` the
//! boundary crate exports under a well-known symbol. All mutation happens
//! under the list's own mutex; the head is published with Release ordering.
//!
//! [`RecordList`] is an [`AllocEvents`] consumer: records are inserted on
//! successful allocation, dropped on free and moved on resize. Nodes are
//! allocated with the global allocator while the reentrancy flag is held, so
//! under interposition they come from the private path.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::Mutex;

use crate::event::{AllocEvents, AllocRequest, Resize};

/// Version of the node layout below.
pub const RECORD_LAYOUT_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug)]
pub struct AllocRecord {
    pub begin: *mut c_void,
    pub size: usize,
    pub next: *mut AllocRecord,
}

/// Counters maintained alongside the list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecordStats {
    /// Records currently linked.
    pub live: usize,
    /// Records ever inserted.
    pub recorded: u64,
    /// Bytes across every record ever inserted.
    pub recorded_bytes: u64,
}

impl RecordStats {
    #[must_use]
    pub fn average_alloc_size(&self) -> u64 {
        self.recorded_bytes.checked_div(self.recorded).unwrap_or(0)
    }
}

pub struct RecordList<'a> {
    head: &'a AtomicPtr<AllocRecord>,
    stats: Mutex<RecordStats>,
}

impl<'a> RecordList<'a> {
    pub const fn new(head: &'a AtomicPtr<AllocRecord>) -> Self {
        Self {
            head,
            stats: parking_lot::const_mutex(RecordStats {
                live: 0,
                recorded: 0,
                recorded_bytes: 0,
            }),
        }
    }

    #[must_use]
    pub fn stats(&self) -> RecordStats {
        *self.stats.lock()
    }

    pub fn insert(&self, begin: *mut c_void, size: usize) {
        let mut stats = self.stats.lock();
        let node = Box::into_raw(Box::new(AllocRecord {
            begin,
            size,
            next: self.head.load(Ordering::Relaxed),
        }));
        self.head.store(node, Ordering::Release);
        stats.live += 1;
        stats.recorded += 1;
        stats.recorded_bytes += size as u64;
    }

    /// Unlink the record for `begin`. Returns whether one existed.
    pub fn remove(&self, begin: *mut c_void) -> bool {
        let mut stats = self.stats.lock();
        // SAFETY: the list is only mutated under `stats`, which we hold.
        let Some(node) = (unsafe { self.unlink(begin) }) else {
            return false;
        };
        // SAFETY: nodes are created by Box::into_raw in `insert`.
        drop(unsafe { Box::from_raw(node) });
        stats.live -= 1;
        true
    }

    /// Point the record for `old` at `new` with a new size.
    pub fn relocate(&self, old: *mut c_void, new: *mut c_void, size: usize) -> bool {
        let _stats = self.stats.lock();
        let mut cur = self.head.load(Ordering::Relaxed);
        while !cur.is_null() {
            // SAFETY: linked nodes stay valid while the lock is held.
            let node = unsafe { &mut *cur };
            if node.begin == old {
                node.begin = new;
                node.size = size;
                return true;
            }
            cur = node.next;
        }
        false
    }

    /// Call `f` for every record, newest first.
    pub fn for_each(&self, mut f: impl FnMut(&AllocRecord)) {
        let _stats = self.stats.lock();
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: linked nodes stay valid while the lock is held.
            let node = unsafe { &*cur };
            f(node);
            cur = node.next;
        }
    }

    /// # Safety
    /// Caller holds `stats`.
    unsafe fn unlink(&self, begin: *mut c_void) -> Option<*mut AllocRecord> {
        let mut prev: *mut AllocRecord = ptr::null_mut();
        let mut cur = self.head.load(Ordering::Relaxed);
        while !cur.is_null() {
            // SAFETY: linked nodes stay valid while the lock is held.
            let node = unsafe { &*cur };
            if node.begin == begin {
                if prev.is_null() {
                    self.head.store(node.next, Ordering::Release);
                } else {
                    // SAFETY: `prev` is a linked node.
                    unsafe { (*prev).next = node.next };
                }
                return Some(cur);
            }
            prev = cur;
            cur = node.next;
        }
        None
    }
}

impl Drop for RecordList<'_> {
    fn drop(&mut self) {
        let mut cur = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        while !cur.is_null() {
            // SAFETY: nodes are created by Box::into_raw in `insert`, and we
            // have exclusive access.
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next;
        }
    }
}

impl AllocEvents for RecordList<'_> {
    fn post_successful_alloc(&self, ptr: *mut c_void, modified: AllocRequest, _requested: AllocRequest) {
        self.insert(ptr, modified.size);
    }

    fn pre_nonnull_free(&self, ptr: *mut c_void, _usable_size: usize) {
        self.remove(ptr);
    }

    fn post_nonnull_nonzero_realloc(&self, resize: Resize) {
        if !resize.new_ptr.is_null() {
            self.relocate(resize.old_ptr, resize.new_ptr, resize.modified_size);
        }
    }
}
