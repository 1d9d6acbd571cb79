//! Process-wide interception state.
//!
//! Everything here is a `static` with a `const` initializer: the allocator
//! entry points can be called before any constructor has run (by the loader,
//! or by an earlier library's constructor), so nothing may depend on lazy
//! initialization that itself allocates.

use std::sync::atomic::{AtomicBool, Ordering};

use mallochooks_core::guard;
use mallochooks_core::{
    BootstrapArena, CodeRangeRegistry, Dispatcher, EventLink, PrivateHeap, Resolver, Terminal,
    Tracer, hook_debug,
};

use crate::symbols::ActiveSource;

/// Bootstrap arena capacity.
pub const ARENA_CAPACITY: usize = 10 << 20;

pub static ARENA: BootstrapArena<ARENA_CAPACITY> = BootstrapArena::new();
pub static RESOLVER: Resolver<ActiveSource> = Resolver::new(ActiveSource {});
/// Under `wrap` this crate is linked into the program, so every program call
/// would look like a self call.
#[cfg(feature = "wrap")]
pub static RANGES: CodeRangeRegistry = CodeRangeRegistry::without_self_calls();
#[cfg(not(feature = "wrap"))]
pub static RANGES: CodeRangeRegistry = CodeRangeRegistry::new();

pub type ActiveTerminal = Terminal<'static, ActiveSource, ARENA_CAPACITY>;

#[cfg(feature = "records")]
mod records {
    use std::ptr;
    use std::sync::atomic::AtomicPtr;

    use mallochooks_core::records::RECORD_LAYOUT_VERSION;
    use mallochooks_core::{AllocRecord, RecordList};

    /// Head of the allocation-record list, for out-of-process inspection.
    #[allow(non_upper_case_globals)]
    #[unsafe(no_mangle)]
    pub static __mallochooks_alloc_list_head: AtomicPtr<AllocRecord> =
        AtomicPtr::new(ptr::null_mut());

    /// Layout version of the nodes behind `__mallochooks_alloc_list_head`.
    #[allow(non_upper_case_globals)]
    #[unsafe(no_mangle)]
    pub static __mallochooks_alloc_list_version: u32 = RECORD_LAYOUT_VERSION;

    pub static RECORDS: RecordList<'static> = RecordList::new(&__mallochooks_alloc_list_head);
}

#[cfg(feature = "records")]
pub use records::{RECORDS, __mallochooks_alloc_list_head};

#[cfg(feature = "records")]
pub type Consumers = (Tracer, &'static mallochooks_core::RecordList<'static>);
#[cfg(not(feature = "records"))]
pub type Consumers = Tracer;

pub type Chain = EventLink<Consumers, ActiveTerminal>;
pub type Dispatch = Dispatcher<Chain, ActiveTerminal, &'static CodeRangeRegistry>;

macro_rules! dispatcher {
    ($consumers:expr) => {
        Dispatcher::new(
            EventLink::new($consumers, Terminal::new(&RESOLVER, &ARENA)),
            PrivateHeap::new(Terminal::new(&RESOLVER, &ARENA)),
            &RANGES,
        )
    };
}

#[cfg(feature = "records")]
pub static DISPATCH: Dispatch = dispatcher!((Tracer, &RECORDS));
#[cfg(not(feature = "records"))]
pub static DISPATCH: Dispatch = dispatcher!(Tracer);

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// One-time initialization: resolve the underlying allocator, run the
/// consumers' `post_init` and discover the code ranges. Idempotent.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return;
    }
    DISPATCH.init();
    let _active = guard::enter();
    if RANGES.get().is_none() {
        hook_debug!("code-range discovery already in progress");
    }
}

#[must_use]
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}
