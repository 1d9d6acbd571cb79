//! Runtime configuration.
//!
//! The only runtime knob is the diagnostic verbosity, taken from the
//! `MALLOCHOOKS_LOG` environment variable:
//! - `off`: silent.
//! - `error`: resolution failures only.
//! - `warn` (default): also arena exhaustion and strategy hazards.
//! - `info`, `debug`: startup progress (resolution, code ranges).
//! - `trace`: one line per hooked allocator call.
//!
//! Everything else (interception strategy, chain composition) is fixed at
//! build time.

use std::ffi::CStr;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::log::LogLevel;

/// Environment variable read once per process.
pub const LOG_ENV: &CStr = c"MALLOCHOOKS_LOG";

// Atomic cache: 0=unresolved, 1..=6 = LogLevel discriminant + 1, 255=resolving.
// The variable is read while the allocator itself may be half-initialized, so
// this is a non-blocking state machine rather than a OnceLock: a reentrant
// read during resolution observes RESOLVING and gets the default.
static CACHED_LEVEL: AtomicU8 = AtomicU8::new(0);

const LEVEL_UNRESOLVED: u8 = 0;
const LEVEL_RESOLVING: u8 = 255;

fn level_to_u8(level: LogLevel) -> u8 {
    level as u8 + 1
}

fn u8_to_level(v: u8) -> LogLevel {
    LogLevel::from_index(v.wrapping_sub(1)).unwrap_or_default()
}

/// Parse a level name (case-insensitive). Unknown names map to the default.
#[must_use]
pub fn parse_log_level(raw: &[u8]) -> LogLevel {
    let mut lowered = [0u8; 8];
    if raw.len() > lowered.len() {
        return LogLevel::default();
    }
    for (dst, src) in lowered.iter_mut().zip(raw) {
        *dst = src.to_ascii_lowercase();
    }
    match &lowered[..raw.len()] {
        b"off" | b"none" | b"0" => LogLevel::Off,
        b"error" => LogLevel::Error,
        b"warn" | b"warning" => LogLevel::Warn,
        b"info" => LogLevel::Info,
        b"debug" => LogLevel::Debug,
        b"trace" | b"all" => LogLevel::Trace,
        _ => LogLevel::default(),
    }
}

fn read_env_level() -> LogLevel {
    // SAFETY: getenv does not allocate; the returned pointer is either null
    // or a NUL-terminated string owned by the environment block.
    let raw = unsafe { libc::getenv(LOG_ENV.as_ptr()) };
    if raw.is_null() {
        return LogLevel::default();
    }
    // SAFETY: non-null getenv result is NUL-terminated.
    let value = unsafe { CStr::from_ptr(raw) };
    parse_log_level(value.to_bytes())
}

/// The configured log level (reads the environment on first call, cached thereafter).
#[must_use]
pub fn log_level() -> LogLevel {
    let cached = CACHED_LEVEL.load(Ordering::Relaxed);

    // Fast path: already resolved.
    if cached != LEVEL_UNRESOLVED && cached != LEVEL_RESOLVING {
        return u8_to_level(cached);
    }

    if cached == LEVEL_RESOLVING {
        return LogLevel::default();
    }

    if CACHED_LEVEL
        .compare_exchange(
            LEVEL_UNRESOLVED,
            LEVEL_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_LEVEL.load(Ordering::Relaxed);
        return if v != LEVEL_UNRESOLVED && v != LEVEL_RESOLVING {
            u8_to_level(v)
        } else {
            LogLevel::default()
        };
    }

    let level = read_env_level();
    CACHED_LEVEL.store(level_to_u8(level), Ordering::Release);
    level
}
