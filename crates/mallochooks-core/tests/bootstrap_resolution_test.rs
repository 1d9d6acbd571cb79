//! Underlying-allocator resolution and the bootstrap arena behind it.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use mallochooks_core::{
    BootstrapArena, Caller, HookError, HookLink, ResolveState, Resolver, Symbol, SymbolSource,
    Terminal,
};

fn system_symbol(symbol: Symbol) -> usize {
    match symbol {
        Symbol::Malloc => libc::malloc as usize,
        Symbol::Free => libc::free as usize,
        Symbol::Realloc => libc::realloc as usize,
        Symbol::Calloc => libc::calloc as usize,
        Symbol::Memalign => libc::memalign as usize,
        Symbol::PosixMemalign => libc::posix_memalign as usize,
        Symbol::UsableSize => libc::malloc_usable_size as usize,
    }
}

/// System symbols, minus whichever are switched off, counting lookups.
struct ScriptedSource {
    hide_free: AtomicBool,
    hide_memalign: bool,
    lookups: AtomicUsize,
}

impl ScriptedSource {
    fn new(hide_free: bool, hide_memalign: bool) -> Self {
        Self {
            hide_free: AtomicBool::new(hide_free),
            hide_memalign,
            lookups: AtomicUsize::new(0),
        }
    }
}

impl SymbolSource for ScriptedSource {
    fn lookup(&self, symbol: Symbol) -> Option<usize> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        match symbol {
            Symbol::Free if self.hide_free.load(Ordering::SeqCst) => None,
            Symbol::Memalign if self.hide_memalign => None,
            _ => Some(system_symbol(symbol)),
        }
    }
}

#[test]
fn missing_required_symbol_latches_failure() {
    let arena = BootstrapArena::<4096>::new();
    let resolver = Resolver::new(ScriptedSource::new(true, false));
    let terminal = Terminal::new(&resolver, &arena);

    assert_eq!(resolver.resolve().unwrap_err(), HookError::MissingSymbol(Symbol::Free));
    assert_eq!(resolver.state(), ResolveState::Failed);
    let lookups = resolver.source().lookups.load(Ordering::SeqCst);

    // Later calls neither retry the lookup nor fail the allocation.
    assert_eq!(resolver.resolve().unwrap_err(), HookError::MissingSymbol(Symbol::Free));
    assert!(resolver.binding().is_none());
    unsafe {
        let p = terminal.malloc(64, Caller::UNKNOWN);
        assert!(arena.contains(p));
        assert_eq!(terminal.usable_size(p), 64);
        terminal.free(p, Caller::UNKNOWN);
    }
    assert_eq!(resolver.source().lookups.load(Ordering::SeqCst), lookups);
}

#[test]
fn retry_rearms_a_failed_resolver() {
    let resolver = Resolver::new(ScriptedSource::new(true, false));
    assert!(!resolver.retry(), "nothing to retry before the first attempt");
    assert!(resolver.resolve().is_err());

    resolver.source().hide_free.store(false, Ordering::SeqCst);
    assert!(resolver.retry());
    assert_eq!(resolver.state(), ResolveState::Unresolved);
    let binding = resolver.binding().expect("resolves on demand after retry");
    assert_eq!(binding.free as usize, libc::free as usize);
    assert_eq!(resolver.state(), ResolveState::Resolved);
    assert!(!resolver.retry(), "a resolved binding is final");
}

#[test]
fn memalign_is_optional() {
    let arena = BootstrapArena::<4096>::new();
    let resolver = Resolver::new(ScriptedSource::new(false, true));
    let terminal = Terminal::new(&resolver, &arena);

    let binding = resolver.resolve().expect("memalign is not required");
    assert!(binding.memalign.is_none());
    unsafe {
        // Falls back to posix_memalign, never to the arena.
        let p = terminal.memalign(256, 100, Caller::UNKNOWN);
        assert!(!p.is_null());
        assert!(!arena.contains(p));
        assert_eq!(p as usize % 256, 0);
        terminal.free(p, Caller::UNKNOWN);
    }
    assert_eq!(arena.used(), 0);
}

#[test]
fn resolved_state_is_not_entered_by_a_peek() {
    let resolver = Resolver::new(ScriptedSource::new(false, false));
    assert!(resolver.resolved().is_none());
    assert_eq!(resolver.state(), ResolveState::Unresolved);
    assert_eq!(resolver.source().lookups.load(Ordering::SeqCst), 0);

    assert!(resolver.binding().is_some());
    assert!(resolver.resolved().is_some());
    assert_eq!(resolver.source().lookups.load(Ordering::SeqCst), Symbol::COUNT);
}

#[test]
fn arena_exhaustion_returns_null() {
    let arena = BootstrapArena::<256>::new();
    let resolver = Resolver::new(ScriptedSource::new(true, false));
    let terminal = Terminal::new(&resolver, &arena);
    let mut served = 0;
    unsafe {
        loop {
            let p = terminal.malloc(16, Caller::UNKNOWN);
            if p.is_null() {
                break;
            }
            assert!(arena.contains(p));
            served += 1;
            assert!(served <= 16, "arena never ran out");
        }
        assert!(served > 0);
        // Exhaustion is sticky and the cursor never passes capacity.
        assert!(terminal.malloc(1, Caller::UNKNOWN).is_null());
        assert!(terminal.memalign(64, 1, Caller::UNKNOWN).is_null());
    }
    assert!(arena.used() <= arena.capacity());
}

#[test]
fn concurrent_first_calls_resolve_once() {
    static SHARED_ARENA: BootstrapArena<{ 64 << 10 }> = BootstrapArena::new();
    static SHARED: Resolver<Slow> = Resolver::new(Slow(AtomicUsize::new(0)));

    struct Slow(AtomicUsize);

    impl SymbolSource for Slow {
        fn lookup(&self, symbol: Symbol) -> Option<usize> {
            self.0.fetch_add(1, Ordering::SeqCst);
            std::thread::yield_now();
            Some(system_symbol(symbol))
        }
    }

    let terminal = Terminal::new(&SHARED, &SHARED_ARENA);
    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| unsafe {
                for _ in 0..64 {
                    let p = terminal.malloc(32, Caller::UNKNOWN);
                    assert!(!p.is_null());
                    p.cast::<u8>().write_bytes(0xab, 32);
                    terminal.free(p, Caller::UNKNOWN);
                }
            });
        }
    });
    assert_eq!(SHARED.state(), ResolveState::Resolved);
    assert_eq!(SHARED.source().0.load(Ordering::SeqCst), Symbol::COUNT);
}

/// A lookup that itself allocates, as `dlsym` may when formatting an error.
struct AllocatingSource;

static ARENA: BootstrapArena<4096> = BootstrapArena::new();
static RESOLVER: Resolver<AllocatingSource> = Resolver::new(AllocatingSource);
static TERMINAL: Terminal<'static, AllocatingSource, 4096> = Terminal::new(&RESOLVER, &ARENA);
static NESTED: AtomicUsize = AtomicUsize::new(0);

impl SymbolSource for AllocatingSource {
    fn lookup(&self, symbol: Symbol) -> Option<usize> {
        if symbol == Symbol::Malloc {
            let p = unsafe { TERMINAL.malloc(48, Caller::UNKNOWN) };
            NESTED.store(p as usize, Ordering::SeqCst);
        }
        Some(system_symbol(symbol))
    }
}

#[test]
fn allocation_during_resolution_is_served_by_the_arena() {
    TERMINAL.init();
    assert_eq!(RESOLVER.state(), ResolveState::Resolved);

    let nested = NESTED.load(Ordering::SeqCst) as *mut c_void;
    assert!(!nested.is_null());
    assert!(ARENA.contains(nested));
    unsafe {
        assert_eq!(TERMINAL.usable_size(nested), 48);
        // Growing the early chunk moves it to the real allocator.
        nested.cast::<u8>().write_bytes(7, 48);
        let moved = TERMINAL.realloc(nested, 4096, Caller::UNKNOWN);
        assert!(!ARENA.contains(moved));
        assert!(std::slice::from_raw_parts(moved.cast::<u8>(), 48).iter().all(|&b| b == 7));
        TERMINAL.free(moved, Caller::UNKNOWN);
    }
}
