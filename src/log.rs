//! File logging for cadre runs.
//!
//! Log levels:
//! - ERROR: a run or task could not proceed
//! - WARN: recoverable trouble (store writes, breaker soft thresholds, retries)
//! - INFO: run, batch and task lifecycle
//! - DEBUG: gate waits, state transitions, verdict parsing
//! - TRACE: admission bookkeeping and raw agent payload sizes
//!
//! Debug mode is enabled with `--debug` or `CADRE_DEBUG=1`. Output goes to
//! `~/.cadre/cadre.log` unless `CADRE_LOG` names another file. Nothing is
//! written before `init_with_debug` runs, so library users and tests stay quiet.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
/// Serializes appends so lines from concurrent tasks never interleave.
static WRITE_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name as accepted in `CADRE_DEBUG` (e.g. `trace`).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" | "1" | "true" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

/// Default log file, `~/.cadre/cadre.log`.
pub fn default_log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".cadre").join("cadre.log"))
}

/// Initialize logging with explicit debug mode setting.
///
/// `CADRE_DEBUG` may name a level (`trace`, `debug`, ...) and takes
/// precedence over the flag when it is more verbose.
pub fn init_with_debug(debug: bool) {
    let flag_level = if debug { LogLevel::Debug } else { LogLevel::Info };
    let env_level = std::env::var("CADRE_DEBUG")
        .ok()
        .and_then(|v| LogLevel::parse(&v));
    let level = match env_level {
        Some(env) if env > flag_level => env,
        _ => flag_level,
    };
    set_level(level);

    let path = std::env::var_os("CADRE_LOG")
        .map(PathBuf::from)
        .or_else(default_log_path);
    if let Some(path) = path {
        init_file(&path);
    }
}

/// Route log output to `path`, truncating it. Only the first call wins.
pub fn init_file(path: &Path) {
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    let _ = std::fs::write(path, "");
    LOG_PATH.set(path.to_path_buf()).ok();
}

pub fn is_debug() -> bool {
    get_level() >= LogLevel::Debug
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }

    if let Some(path) = LOG_PATH.get() {
        let _guard = WRITE_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), msg);
        }
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// Log at INFO level.
#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Log at DEBUG level (only when debug mode is enabled).
#[macro_export]
macro_rules! clog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
