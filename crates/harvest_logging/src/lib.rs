#![deny(missing_docs)]
//! Shared logging utilities for the harvesting workspace.
//!
//! Every macro logs under the [`TARGET`] target so harvest output can be
//! filtered independently of HTTP and runtime noise. The optional
//! `snapshot = <id>;` prefix tags the line with the snapshot it belongs to.

use log::LevelFilter;

/// Log target shared by all `harvest_*` macros.
pub const TARGET: &str = "harvest";

/// Logs a trace-level message.
#[macro_export]
macro_rules! harvest_trace {
    (snapshot = $id:expr; $($arg:tt)*) => {{
        log::trace!(target: $crate::TARGET, "[snapshot {}] {}", $id, format_args!($($arg)*));
    }};
    ($($arg:tt)*) => {{
        log::trace!(target: $crate::TARGET, $($arg)*);
    }};
}

/// Logs a debug-level message.
#[macro_export]
macro_rules! harvest_debug {
    (snapshot = $id:expr; $($arg:tt)*) => {{
        log::debug!(target: $crate::TARGET, "[snapshot {}] {}", $id, format_args!($($arg)*));
    }};
    ($($arg:tt)*) => {{
        log::debug!(target: $crate::TARGET, $($arg)*);
    }};
}

/// Logs an info-level message.
#[macro_export]
macro_rules! harvest_info {
    (snapshot = $id:expr; $($arg:tt)*) => {{
        log::info!(target: $crate::TARGET, "[snapshot {}] {}", $id, format_args!($($arg)*));
    }};
    ($($arg:tt)*) => {{
        log::info!(target: $crate::TARGET, $($arg)*);
    }};
}

/// Logs a warn-level message.
#[macro_export]
macro_rules! harvest_warn {
    (snapshot = $id:expr; $($arg:tt)*) => {{
        log::warn!(target: $crate::TARGET, "[snapshot {}] {}", $id, format_args!($($arg)*));
    }};
    ($($arg:tt)*) => {{
        log::warn!(target: $crate::TARGET, $($arg)*);
    }};
}

/// Logs an error-level message.
#[macro_export]
macro_rules! harvest_error {
    (snapshot = $id:expr; $($arg:tt)*) => {{
        log::error!(target: $crate::TARGET, "[snapshot {}] {}", $id, format_args!($($arg)*));
    }};
    ($($arg:tt)*) => {{
        log::error!(target: $crate::TARGET, $($arg)*);
    }};
}

/// Level used by [`initialize_for_tests`]: debug in debug builds, info otherwise.
pub fn default_test_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Initializes a simple terminal logger for use in tests.
///
/// This safely no-ops if another logger has already been initialized.
pub fn initialize_for_tests() {
    use simplelog::{ColorChoice, CombinedLogger, ConfigBuilder, TermLogger, TerminalMode};

    let config = ConfigBuilder::new()
        .set_target_level(LevelFilter::Error)
        .add_filter_allow_str(TARGET)
        .build();

    // Ignore the error if a logger was already set by another test.
    let _ = CombinedLogger::init(vec![TermLogger::new(
        default_test_level(),
        config,
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )]);
}
