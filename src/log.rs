//! Minimal level-filtered diagnostic logger.
//!
//! There's no `log`/`env_logger` dependency here on purpose: the set of
//! levels and call sites is small and fixed, and a couple of macros plus a
//! global atomic are simpler than wiring up a logging facade for a single
//! binary.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
#[repr(usize)]
pub enum LogLevel {
    LogFatal = 0,
    LogError = 1,
    LogWarn = 2,
    LogInfo = 3,
    LogDebug = 4,
}

pub use LogLevel::*;

impl LogLevel {
    fn name(self) -> &'static str {
        match self {
            LogFatal => "FATAL",
            LogError => "ERROR",
            LogWarn => "WARN",
            LogInfo => "INFO",
            LogDebug => "DEBUG",
        }
    }

    fn from_str(s: &str) -> Option<LogLevel> {
        match s.to_ascii_lowercase().as_str() {
            "fatal" => Some(LogFatal),
            "error" => Some(LogError),
            "warn" | "warning" => Some(LogWarn),
            "info" => Some(LogInfo),
            "debug" | "trace" => Some(LogDebug),
            _ => None,
        }
    }
}

static CURRENT_LEVEL: AtomicUsize = AtomicUsize::new(LogWarn as usize);

/// Reads `CSTRACE_LOG` once at first use and stores the resulting level.
/// Call explicitly from `main` before anything else logs, and again to
/// apply `--verbose`.
pub fn init_from_env() {
    if let Ok(val) = std::env::var("CSTRACE_LOG") {
        if let Some(level) = LogLevel::from_str(&val) {
            set_level(level);
        }
    }
}

/// Raises verbosity by `steps` levels above the current floor, capped at
/// `LogDebug`. Used to implement `--verbose=N`.
pub fn raise_verbosity(steps: u32) {
    let current = CURRENT_LEVEL.load(Ordering::Relaxed);
    let raised = current.saturating_add(steps as usize).min(LogDebug as usize);
    CURRENT_LEVEL.store(raised, Ordering::Relaxed);
}

pub fn set_level(level: LogLevel) {
    CURRENT_LEVEL.store(level as usize, Ordering::Relaxed);
}

pub fn enabled(level: LogLevel) -> bool {
    (level as usize) <= CURRENT_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn write_line(level: LogLevel, file: &str, line: u32, args: std::fmt::Arguments) {
    use std::io::Write;
    if !enabled(level) {
        return;
    }
    let mut stderr = std::io::stderr();
    if level <= LogError {
        let _ = write!(stderr, "[{}] {}:{} ", level.name(), file, line);
    } else {
        let _ = write!(stderr, "[{}] ", level.name());
    }
    let _ = stderr.write_fmt(args);
    let _ = stderr.write_all(b"\n");
}

/// Logs a message at the given level if it's enabled, e.g.
/// `log!(LogWarn, "sink wrapped, {} bytes lost", n)`.
#[macro_export]
macro_rules! log {
    ($level:expr, $($args:tt)*) => {
        $crate::log::write_line($level, file!(), line!(), format_args!($($args)*))
    };
}

/// Logs at `LogFatal`, prints a backtrace, and aborts the process. Reserved
/// for invariant violations outside the locked `Shared` region (inside the
/// lock we always return a `Result` instead).
#[macro_export]
macro_rules! fatal {
    ($($args:tt)*) => {{
        $crate::log!($crate::log::LogFatal, $($args)*);
        $crate::log::abort_with_backtrace();
    }};
}

pub fn abort_with_backtrace() -> ! {
    let bt = backtrace::Backtrace::new();
    eprintln!("=== backtrace ===\n{:?}=== end backtrace ===", bt);
    std::process::abort();
}
