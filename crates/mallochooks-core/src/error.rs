//! Recoverable failure conditions of the interception core.
//!
//! None of these ever reach a C caller as a Rust value: the boundary maps them
//! onto the allocator conventions (NULL, `EINVAL`, `ENOMEM`).

use std::ffi::c_int;

use thiserror::Error;

use crate::resolver::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("underlying allocator symbol `{0}` could not be resolved")]
    MissingSymbol(Symbol),
    #[error("underlying allocator resolution already in progress")]
    ResolutionInProgress,
    #[error("bootstrap arena exhausted: requested {requested} bytes, {remaining} remaining")]
    ArenaExhausted { requested: usize, remaining: usize },
    #[error("alignment {0} is not a power of two multiple of the pointer size")]
    InvalidAlignment(usize),
    #[error("allocation size overflows: {nmemb} * {size}")]
    SizeOverflow { nmemb: usize, size: usize },
}

impl HookError {
    /// The errno value a C caller observes for this condition.
    #[must_use]
    pub const fn errno(&self) -> c_int {
        match self {
            Self::InvalidAlignment(_) => libc::EINVAL,
            _ => libc::ENOMEM,
        }
    }
}
