//! Leveled logging routed to a sink installed by the host application.
//!
//! Nothing is printed by default. The host installs a callback through
//! `SniffleSetLogSink` (logcat on Android, `os_log` on Apple platforms,
//! stderr in the standalone runner) and picks a minimum level and the
//! breadcrumb categories it wants to see.

use crate::ffi::SniffleLogSink;
use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

type LogCallback = unsafe extern "C" fn(
    level: *const c_char,
    message: *const c_char,
    breadcrumbs: u32,
    context: *mut c_void,
);

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

pub fn install_sink(sink: Option<&SniffleLogSink>, level: Option<&str>) -> Result<(), &'static str> {
    LOGGER.install_sink(sink, level)
}

pub fn set_breadcrumb_mask(mask: u32) {
    LOGGER.set_breadcrumb_mask(mask);
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BreadcrumbFlags: u32 {
        const DEVICE   = 0b0000_0001;
        const DNS      = 0b0000_0010;
        const UPSTREAM = 0b0000_0100;
        const REWRITE  = 0b0000_1000;
        const FFI      = 0b0001_0000;
        const PACKET   = 0b0010_0000;
        const ALL      = u32::MAX;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "error" | "err" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" | "dbg" | "trace" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Clone, Copy)]
struct LogSinkInner {
    callback: LogCallback,
    context: *mut c_void,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

// The host guarantees the callback and its context are usable from any thread.
unsafe impl Send for LogSinkInner {}
unsafe impl Sync for LogSinkInner {}

struct LogManager {
    sink: Mutex<Option<LogSinkInner>>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            prefix: format!("[sniffle-p{}]", std::process::id()),
        }
    }

    fn install_sink(
        &self,
        sink: Option<&SniffleLogSink>,
        level: Option<&str>,
    ) -> Result<(), &'static str> {
        let mut guard = self.sink.lock();
        let Some(sink) = sink else {
            *guard = None;
            return Ok(());
        };
        let callback = sink.log.ok_or("log callback missing")?;
        *guard = Some(LogSinkInner {
            callback,
            context: sink.context,
            breadcrumbs: BreadcrumbFlags::from_bits_truncate(sink.enabled_breadcrumbs),
            min_level: level.map(LogLevel::parse).unwrap_or(LogLevel::Info),
        });
        Ok(())
    }

    fn set_breadcrumb_mask(&self, mask: u32) {
        if let Some(inner) = self.sink.lock().as_mut() {
            inner.breadcrumbs = BreadcrumbFlags::from_bits_truncate(mask);
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        if !message.is_empty() {
            self.dispatch(level, BreadcrumbFlags::empty(), message);
        }
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if !message.is_empty() && !flag.is_empty() {
            self.dispatch(LogLevel::Debug, flag, message);
        }
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        let Some(inner) = *self.sink.lock() else {
            return;
        };
        if breadcrumbs.is_empty() {
            if level > inner.min_level {
                return;
            }
        } else if !inner.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let formatted = if breadcrumbs.is_empty() {
            format!("{} {}", self.prefix, message)
        } else {
            format!("{} [{}] {}", self.prefix, label_for(breadcrumbs), message)
        };
        let (Ok(level_c), Ok(message_c)) = (CString::new(level.as_str()), CString::new(formatted))
        else {
            return;
        };
        unsafe {
            (inner.callback)(
                level_c.as_ptr(),
                message_c.as_ptr(),
                breadcrumbs.bits(),
                inner.context,
            );
        }
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::DNS) {
        "DNS"
    } else if flags.contains(BreadcrumbFlags::UPSTREAM) {
        "UPSTREAM"
    } else if flags.contains(BreadcrumbFlags::REWRITE) {
        "REWRITE"
    } else if flags.contains(BreadcrumbFlags::DEVICE) {
        "DEVICE"
    } else if flags.contains(BreadcrumbFlags::FFI) {
        "FFI"
    } else if flags.contains(BreadcrumbFlags::PACKET) {
        "PACKET"
    } else {
        "LOG"
    }
}

// ============================================================================
// Rate-limited error logging
// ============================================================================
// A resolver outage or an app hammering a bad name can fail every query for
// a while. Each category gets at most one line per interval.

const RATE_LIMIT_INTERVAL_MS: u64 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Question section could not be decoded.
    MalformedQuery,
    /// Timeout or socket failure talking to the resolver.
    UpstreamFailure,
    /// Answer could not be wrapped into a reply frame.
    RewriteFailure,
    /// Writing a reply to the tun failed.
    InterfaceWrite,
    /// Too many forwards in flight.
    CapacityExhausted,
    /// Host callback misbehaved.
    CallbackError,
}

impl ErrorCategory {
    const COUNT: usize = 6;

    fn index(self) -> usize {
        match self {
            Self::MalformedQuery => 0,
            Self::UpstreamFailure => 1,
            Self::RewriteFailure => 2,
            Self::InterfaceWrite => 3,
            Self::CapacityExhausted => 4,
            Self::CallbackError => 5,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::MalformedQuery => "MALFORMED_QUERY",
            Self::UpstreamFailure => "UPSTREAM_FAILURE",
            Self::RewriteFailure => "REWRITE_FAILURE",
            Self::InterfaceWrite => "INTERFACE_WRITE",
            Self::CapacityExhausted => "CAPACITY_EXHAUSTED",
            Self::CallbackError => "CALLBACK_ERROR",
        }
    }
}

struct RateLimitedLogger {
    /// Unix millis of the last emitted line, per category.
    last_log_times: [AtomicU64; ErrorCategory::COUNT],
}

impl RateLimitedLogger {
    const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            last_log_times: [ZERO; ErrorCategory::COUNT],
        }
    }

    fn try_log(&self, category: ErrorCategory, message: &str) -> bool {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let slot = &self.last_log_times[category.index()];
        let last = slot.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < RATE_LIMIT_INTERVAL_MS {
            return false;
        }
        if slot
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        warn(format!("[{}] {}", category.label(), message));
        true
    }
}

static RATE_LIMITER: RateLimitedLogger = RateLimitedLogger::new();

/// Logs at warn level unless `category` already logged within the last second.
/// Returns whether the line was emitted.
pub fn rate_limited_error(category: ErrorCategory, message: impl Into<String>) -> bool {
    RATE_LIMITER.try_log(category, &message.into())
}
