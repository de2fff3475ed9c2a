//! Leveled stderr logging for the runtime
//!
//! Kernel-printk-style macros: cheap, lock-per-line, no global subscriber.
//! A fiber runtime cannot log through machinery that might itself block or
//! allocate while a context switch is in flight, so output goes straight to
//! a locked stderr handle.
//!
//! # Environment variables
//!
//! - `WEFT_LOG_LEVEL` — off|error|warn|info|debug|trace (or 0-5), default info
//! - `WEFT_LOG_FLUSH` — flush stderr after every line (useful around crashes)

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::env::env_get_bool;

/// Log levels, in increasing verbosity
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Off => "",
            Level::Error => "[ERROR]",
            Level::Warn => "[WARN ]",
            Level::Info => "[INFO ]",
            Level::Debug => "[DEBUG]",
            Level::Trace => "[TRACE]",
        }
    }

    fn parse(s: &str) -> Option<Level> {
        Some(match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Level::Off,
            "error" | "1" => Level::Error,
            "warn" | "2" => Level::Warn,
            "info" | "3" => Level::Info,
            "debug" | "4" => Level::Debug,
            "trace" | "5" => Level::Trace,
            _ => return None,
        })
    }
}

static LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static FLUSH: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize from the environment. Runs once; later calls are no-ops.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Ok(v) = std::env::var("WEFT_LOG_LEVEL") {
        if let Some(level) = Level::parse(&v) {
            LEVEL.store(level as u8, Ordering::Relaxed);
        }
    }
    FLUSH.store(env_get_bool("WEFT_LOG_FLUSH", false), Ordering::Relaxed);
}

/// Override the level programmatically
pub fn set_level(level: Level) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Check whether a level is currently enabled
#[inline]
pub fn enabled(level: Level) -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    level as u8 <= LEVEL.load(Ordering::Relaxed)
}

/// Internal: write one tagged line under the stderr lock
#[doc(hidden)]
pub fn log_at(level: Level, args: std::fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = write!(out, "{} ", level.tag());
    let _ = out.write_fmt(args);
    let _ = out.write_all(b"\n");
    if FLUSH.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

/// Error level log
#[macro_export]
macro_rules! werror {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::Level::Error, format_args!($($arg)*))
    };
}

/// Warning level log
#[macro_export]
macro_rules! wwarn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::Level::Warn, format_args!($($arg)*))
    };
}

/// Info level log
#[macro_export]
macro_rules! winfo {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::Level::Info, format_args!($($arg)*))
    };
}

/// Debug level log
#[macro_export]
macro_rules! wdebug {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::Level::Debug, format_args!($($arg)*))
    };
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! wtrace {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::Level::Trace, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Warn < Level::Info);
        assert!(Level::Info < Level::Debug);
        assert!(Level::Debug < Level::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(Level::parse("debug"), Some(Level::Debug));
        assert_eq!(Level::parse("2"), Some(Level::Warn));
        assert_eq!(Level::parse("bogus"), None);
    }

    #[test]
    fn test_macros_compile() {
        set_level(Level::Off);
        werror!("error {}", 1);
        wwarn!("warn");
        winfo!("info");
        wdebug!("debug");
        wtrace!("trace");
    }
}
