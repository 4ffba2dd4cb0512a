// src/logging.rs
//
// Timestamped logging, adapted from the teacher's `tlog!` (same
// `HH:MM:SS.mmm` stderr-prefix shape) to honor `Settings.log_level`
// filtering the way the original firmware's `Logger` module
// (original_source/src/Logger.cpp) gates Debug/Info/Warn/Error output.
// No file logging here — this is a long-running daemon, not a desktop app
// writing session reports, so output goes to stderr only.

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::settings::LogLevel;

static CURRENT_LEVEL: AtomicU8 = AtomicU8::new(1); // Info by default
static INIT: OnceCell<()> = OnceCell::new();

fn level_rank(level: LogLevel) -> u8 {
    match level {
        LogLevel::Debug => 0,
        LogLevel::Info => 1,
        LogLevel::Warn => 2,
        LogLevel::Error => 3,
    }
}

/// Sets the minimum level that `tlog!` will emit. Called once at startup
/// from the loaded `Settings` snapshot.
pub fn set_level(level: LogLevel) {
    CURRENT_LEVEL.store(level_rank(level), Ordering::Relaxed);
    let _ = INIT.set(());
}

#[doc(hidden)]
pub fn enabled(level: LogLevel) -> bool {
    level_rank(level) >= CURRENT_LEVEL.load(Ordering::Relaxed)
}

/// Timestamped logging macro. First argument is a `LogLevel` variant;
/// messages below the currently configured level are suppressed.
macro_rules! tlog {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::logging::enabled($level) {
            eprintln!(
                "{} {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                format_args!($($arg)*)
            );
        }
    }};
}

macro_rules! tlog_debug {
    ($($arg:tt)*) => { tlog!($crate::settings::LogLevel::Debug, $($arg)*) };
}

macro_rules! tlog_info {
    ($($arg:tt)*) => { tlog!($crate::settings::LogLevel::Info, $($arg)*) };
}

macro_rules! tlog_warn {
    ($($arg:tt)*) => { tlog!($crate::settings::LogLevel::Warn, $($arg)*) };
}

macro_rules! tlog_error {
    ($($arg:tt)*) => { tlog!($crate::settings::LogLevel::Error, $($arg)*) };
}

pub use tlog;
pub use tlog_debug;
pub use tlog_error;
pub use tlog_info;
pub use tlog_warn;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warn_and_error_always_pass_at_info_level() {
        set_level(LogLevel::Info);
        assert!(!enabled(LogLevel::Debug));
        assert!(enabled(LogLevel::Info));
        assert!(enabled(LogLevel::Warn));
        assert!(enabled(LogLevel::Error));
    }

    #[test]
    fn debug_level_permits_everything() {
        set_level(LogLevel::Debug);
        assert!(enabled(LogLevel::Debug));
    }
}
