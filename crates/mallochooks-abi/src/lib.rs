// Every export takes raw pointers straight from C callers and follows the C
// allocator contract, so per-function safety docs would only restate it.
#![allow(clippy::missing_safety_doc)]
//! # mallochooks-abi
//!
//! extern "C" boundary for `mallochooks-core`. Builds a `cdylib` for
//! `LD_PRELOAD`, plus `rlib`/`staticlib` for static linking.
//!
//! # Strategies
//!
//! Exactly one cargo feature selects how calls reach the dispatcher:
//!
//! | feature | entry points | underlying allocator |
//! |---|---|---|
//! | `preload` (default) | `malloc`, `free`, ... | `dlsym(RTLD_NEXT, ..)` |
//! | `wrap` | `__wrap_malloc`, ... | `__real_malloc`, ... |
//! | `hook-vars` | glibc `__malloc_hook` family | the ordinary libc functions |
//!
//! `wrap` needs the final link to pass `--wrap=` for `malloc`, `free`,
//! `realloc`, `calloc`, `memalign`, `posix_memalign` and
//! `malloc_usable_size`. `hook-vars` only works against glibc older than
//! 2.34, which still consults the hook variables, and shares them racily
//! between threads.
//!
//! # Architecture
//!
//! ```text
//! C caller -> entry point (this crate) -> Dispatcher -> hook chain -> Terminal
//!                                                    \-> private path
//! ```
//!
//! With the `records` feature (default) the chain carries an allocation-record
//! consumer whose list head is exported as `__mallochooks_alloc_list_head`.

#[cfg(any(
    all(feature = "preload", feature = "wrap"),
    all(feature = "preload", feature = "hook-vars"),
    all(feature = "wrap", feature = "hook-vars"),
))]
compile_error!("enable exactly one of the `preload`, `wrap` and `hook-vars` features");

#[cfg(not(any(feature = "preload", feature = "wrap", feature = "hook-vars")))]
compile_error!("enable one of the `preload`, `wrap` and `hook-vars` features");

#[macro_use]
mod macros;

pub mod state;
pub mod symbols;

// Gated behind cfg(not(test)): these export malloc, free and friends, which
// would replace the allocator of the test binary itself.
#[cfg(all(feature = "hook-vars", not(test)))]
pub mod hookvar_abi;
#[cfg(not(test))]
mod init;
#[cfg(all(feature = "preload", not(test)))]
pub mod preload_abi;
#[cfg(all(feature = "wrap", not(test)))]
pub mod wrap_abi;
