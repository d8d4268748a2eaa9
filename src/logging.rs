//! Structured logging setup.
//!
//! Logs go to stderr so that JSON written to stdout stays parseable. The
//! filter comes from `LAYER_COMPILER_LOG`, then `RUST_LOG`, then the
//! configured level. Initialization happens once; later calls are ignored.

use std::env;
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Environment variable with a full `EnvFilter` directive string.
pub const LOG_ENV: &str = "LAYER_COMPILER_LOG";

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: Level,
    /// One JSON object per event instead of human-readable lines.
    pub json: bool,
    pub include_location: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json: false,
            include_location: false,
        }
    }
}

impl LogSettings {
    /// Settings for the CLI: `-q` wins over `-v`, and an explicit level over
    /// both.
    pub fn from_flags(level: Option<&str>, verbose: u8, quiet: bool, json: bool) -> Self {
        let level = match (level.and_then(parse_level), quiet, verbose) {
            (Some(level), _, _) => level,
            (None, true, _) => Level::ERROR,
            (None, false, 0) => Level::INFO,
            (None, false, 1) => Level::DEBUG,
            (None, false, _) => Level::TRACE,
        };
        Self {
            level,
            json,
            include_location: level == Level::TRACE,
        }
    }
}

/// Case-insensitive level name.
pub fn parse_level(name: &str) -> Option<Level> {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

fn filter_for(settings: &LogSettings) -> EnvFilter {
    if let Ok(directives) = env::var(LOG_ENV) {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return filter;
        }
    }
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.to_string().to_lowercase()))
}

pub fn init(settings: &LogSettings) {
    INIT.call_once(|| {
        let filter = filter_for(settings);
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(settings.include_location)
            .with_file(settings.include_location)
            .with_line_number(settings.include_location);
        if settings.json {
            tracing_subscriber::registry()
                .with(filter)
                .with(layer.json())
                .init();
        } else {
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("WARN"), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_flags_precedence() {
        assert_eq!(LogSettings::from_flags(None, 0, false, false).level, Level::INFO);
        assert_eq!(LogSettings::from_flags(None, 2, false, false).level, Level::TRACE);
        assert_eq!(LogSettings::from_flags(None, 2, true, false).level, Level::ERROR);
        assert_eq!(
            LogSettings::from_flags(Some("warn"), 2, true, false).level,
            Level::WARN
        );
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let settings = LogSettings::default();
        init(&settings);
        init(&settings);
    }
}
