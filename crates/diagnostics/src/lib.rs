//! Logging for the arrows workspace
//!
//! A thin layer over `emit` so every crate logs the same way.
//!
//! The level comes from the `ARROWS_LOG` environment variable:
//! - `off` (default) - no logs
//! - `error` / `warn` - failures and recoverable problems only
//! - `info` - transfers, deletions, statements sent to the warehouse
//! - `debug` - generated SQL, object listings, token refreshes

use std::sync::Once;

// Re-export emit so macros can use it
pub use emit;

static INIT: Once = Once::new();

/// Name of the environment variable that selects the log level.
pub const LOG_ENV: &str = "ARROWS_LOG";

/// Parse an `ARROWS_LOG` value. `None` means logging is off.
///
/// Unknown values fall back to `Info`.
#[must_use]
pub fn parse_level(value: &str) -> Option<emit::Level> {
    match value.trim().to_ascii_lowercase().as_str() {
        "off" | "" => None,
        "debug" => Some(emit::Level::Debug),
        "warn" => Some(emit::Level::Warn),
        "error" => Some(emit::Level::Error),
        _ => Some(emit::Level::Info),
    }
}

/// Initialize logging from `ARROWS_LOG`.
///
/// Safe to call more than once; only the first call has any effect.
pub fn init_diagnostics() {
    let value = std::env::var(LOG_ENV).unwrap_or_else(|_| "off".to_string());
    if let Some(level) = parse_level(&value) {
        init_with_level(level);
    }
}

/// Initialize logging at an explicit minimum level, ignoring the environment.
pub fn init_with_level(level: emit::Level) {
    INIT.call_once(|| {
        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(level))
            .init();

        // The runtime must outlive every emitter in the process.
        std::mem::forget(rt);
    });
}

/// Log transfers and other operations a user would want to see.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Log generated SQL, listings and other internal detail.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Log recoverable problems, e.g. a cleanup step that failed.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Log a failed operation before its error is returned to the caller.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

pub use init_diagnostics as init;
