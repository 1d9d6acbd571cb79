//! # mallochooks-core
//!
//! Allocator interception without touching allocator internals or callers.
//!
//! This crate holds everything that does not itself export C symbols; the
//! `mallochooks-abi` crate instantiates it as process-wide statics behind one
//! of three interception strategies.
//!
//! ## Architecture
//!
//! ```text
//! caller --> strategy entry point (preload | wrap | hook variables)
//!              |
//!              v
//!          Dispatcher --- reentrant / self / loader caller ---> PrivateHeap
//!              |                                                   |
//!              v                                                   |
//!          EventLink (pre/post callbacks)                          |
//!              |                                                   |
//!              v                                                   v
//!          ... further HookLinks ... --> Terminal --> Resolver --> real allocator
//!                                                 \-> BootstrapArena (until resolved)
//! ```
//!
//! Logging is non-allocating ([`log`]); the only runtime knob is
//! `MALLOCHOOKS_LOG` ([`config`]).

pub mod arena;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod guard;
pub mod hook;
pub mod hookvars;
pub mod log;
pub mod private;
pub mod ranges;
pub mod records;
pub mod resolver;
pub mod terminal;

pub use arena::BootstrapArena;
pub use dispatch::Dispatcher;
pub use error::HookError;
pub use event::{AllocEvents, AllocRequest, EventLink, NoEvents, Resize, Tracer};
pub use hook::{Caller, HookLink, PTR_ALIGN};
pub use private::PrivateHeap;
pub use ranges::{CallerClass, Classify, CodeRange, CodeRangeRegistry, CodeRanges};
pub use records::{AllocRecord, RecordList};
pub use resolver::{ResolveState, Resolver, Symbol, SymbolSource, UnderlyingBinding};
pub use terminal::Terminal;
