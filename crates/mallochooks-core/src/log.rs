//! Non-allocating diagnostics on stderr.
//!
//! Records are formatted into a fixed stack buffer and emitted with a single
//! `write(2)` on fd 2. Nothing here may call the allocator: these macros run
//! inside `malloc` itself, possibly before the underlying allocator has been
//! located. Lines longer than the buffer are truncated.

use std::fmt;

use crate::config;

const LINE_CAPACITY: usize = 512;

/// Diagnostic verbosity, ordered from quietest to loudest.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    #[default]
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    #[must_use]
    pub const fn from_index(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Off),
            1 => Some(Self::Error),
            2 => Some(Self::Warn),
            3 => Some(Self::Info),
            4 => Some(Self::Debug),
            5 => Some(Self::Trace),
            _ => None,
        }
    }
}

/// Whether a record at `level` would be emitted.
#[inline]
#[must_use]
pub fn enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= config::log_level()
}

/// Fixed-capacity line buffer implementing `fmt::Write`. Overflow truncates.
pub struct LineBuffer {
    buf: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buf: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        let room = LINE_CAPACITY - self.len;
        let n = bytes.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
    }

    /// Terminate the line, overwriting the last byte when full.
    fn finish_line(&mut self) {
        if self.len == LINE_CAPACITY {
            self.buf[LINE_CAPACITY - 1] = b'\n';
        } else {
            self.buf[self.len] = b'\n';
            self.len += 1;
        }
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_bytes(s.as_bytes());
        Ok(())
    }
}

/// Format `mallochooks[<level>]: <args>` into `line`.
pub fn format_record(line: &mut LineBuffer, level: LogLevel, args: fmt::Arguments<'_>) {
    use fmt::Write as _;
    let _ = write!(line, "mallochooks[{}]: ", level.as_str());
    let _ = line.write_fmt(args);
    line.finish_line();
}

/// Emit one record. Prefer the `hook_*!` macros, which check the level first.
pub fn write_record(level: LogLevel, args: fmt::Arguments<'_>) {
    let mut line = LineBuffer::new();
    format_record(&mut line, level, args);
    let bytes = line.as_bytes();
    // SAFETY: the buffer is valid for `bytes.len()` bytes; a short or failed
    // write to stderr is ignored.
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
    }
}

#[macro_export]
macro_rules! hook_log {
    ($level:expr, $($arg:tt)+) => {{
        let level = $level;
        if $crate::log::enabled(level) {
            $crate::log::write_record(level, format_args!($($arg)+));
        }
    }};
}

#[macro_export]
macro_rules! hook_error {
    ($($arg:tt)+) => { $crate::hook_log!($crate::log::LogLevel::Error, $($arg)+) };
}

#[macro_export]
macro_rules! hook_warn {
    ($($arg:tt)+) => { $crate::hook_log!($crate::log::LogLevel::Warn, $($arg)+) };
}

#[macro_export]
macro_rules! hook_info {
    ($($arg:tt)+) => { $crate::hook_log!($crate::log::LogLevel::Info, $($arg)+) };
}

#[macro_export]
macro_rules! hook_debug {
    ($($arg:tt)+) => { $crate::hook_log!($crate::log::LogLevel::Debug, $($arg)+) };
}

#[macro_export]
macro_rules! hook_trace {
    ($($arg:tt)+) => { $crate::hook_log!($crate::log::LogLevel::Trace, $($arg)+) };
}
