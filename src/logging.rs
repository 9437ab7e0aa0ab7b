//! Logging infrastructure for InputShare networking
//!
//! Library code only emits `tracing` events; binaries call [`init_logging`]
//! once at startup to install a subscriber.

use tracing_subscriber::{fmt, EnvFilter};

/// Log level configuration
#[derive(Debug, Clone, Copy, Default)]
pub enum LogLevel {
    /// Trace level - very verbose
    Trace,
    /// Debug level - per-step handshake status
    Debug,
    /// Info level - general information
    #[default]
    Info,
    /// Warn level - warnings
    Warn,
    /// Error level - errors only
    Error,
}

impl LogLevel {
    /// Converts LogLevel to tracing level filter string
    fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Builds the default filter directive for this crate
    fn directive(&self) -> String {
        format!("inputshare_net={}", self.as_filter_str())
    }
}

/// Initializes the logging system
///
/// Sets up a tracing subscriber with the specified log level.
/// Can be overridden by the RUST_LOG environment variable.
///
/// # Examples
///
/// ```no_run
/// use inputshare_net::logging::{init_logging, LogLevel};
///
/// init_logging(LogLevel::Debug);
/// ```
pub fn init_logging(level: LogLevel) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.directive()));

    // A subscriber may already be installed (e.g. by an embedding application)
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .try_init();
}

/// Initializes logging with default settings
pub fn init_default_logging() {
    init_logging(LogLevel::default());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_filter() {
        assert_eq!(LogLevel::Trace.as_filter_str(), "trace");
        assert_eq!(LogLevel::Debug.as_filter_str(), "debug");
        assert_eq!(LogLevel::Warn.as_filter_str(), "warn");
        assert_eq!(LogLevel::Error.as_filter_str(), "error");
    }

    #[test]
    fn test_default_directive() {
        assert_eq!(LogLevel::default().directive(), "inputshare_net=info");
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init_logging(LogLevel::Debug);
        init_default_logging();
    }
}
